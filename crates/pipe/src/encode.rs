//! Encode-time surface of pipelines.

use crate::{
    desc::{CullMode, DepthBias, FrontFace, PolygonMode, PrimitiveTopology, Rect, Viewport},
    native::{
        self, ComputePipelineState, DepthClipMode, DepthStencilDescriptor, IndexType,
        PrimitiveType, RenderPipelineState, Size, TriangleFillMode, Winding,
    },
    stage::ShaderStage,
};

/// Stage of a pipeline that draws and dispatches encode once each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EncodeStage {
    /// Vertex shader writing its outputs for tessellation.
    Vertex,

    /// Tessellation control compute pass.
    TessControl,

    /// Final render pass.
    Rasterization,

    Compute,
}

/// Current values of dynamic states recorded on the command encoder.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicStateValues {
    pub viewports: Vec<Viewport>,
    pub scissors: Vec<Rect>,
    pub depth_bias: Option<DepthBias>,
    pub blend_constants: [f32; 4],
    pub stencil_compare_mask: [u32; 2],
    pub stencil_write_mask: [u32; 2],
    pub stencil_reference: [u32; 2],
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub primitive_topology: PrimitiveTopology,
    pub depth_clamp: bool,
    pub polygon_mode: PolygonMode,
}

impl Default for DynamicStateValues {
    fn default() -> Self {
        DynamicStateValues {
            viewports: Vec::new(),
            scissors: Vec::new(),
            depth_bias: None,
            blend_constants: [0.0, 0.0, 0.0, 1.0],
            stencil_compare_mask: [!0; 2],
            stencil_write_mask: [!0; 2],
            stencil_reference: [0; 2],
            cull_mode: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            primitive_topology: PrimitiveTopology::TriangleList,
            depth_clamp: false,
            polygon_mode: PolygonMode::Fill,
        }
    }
}

/// Fixed-function state of the render encoder for one draw.
///
/// Front and back values are indexed `[front, back]`.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderEncoderState {
    pub viewports: Vec<native::Viewport>,
    pub scissors: Vec<native::ScissorRect>,
    pub blend_constants: [f32; 4],
    pub depth_bias: Option<DepthBias>,
    pub depth_clip_mode: DepthClipMode,
    pub cull_mode: native::CullMode,

    /// Both faces are culled, nothing is rasterized.
    pub cull_all: bool,
    pub front_facing_winding: Winding,
    pub triangle_fill_mode: TriangleFillMode,
    pub depth_stencil: DepthStencilDescriptor,
    pub stencil_reference: [u32; 2],
    pub primitive_type: PrimitiveType,
}

/// Command encoding layer the pipeline binds itself to.
pub trait CommandEncoder {
    fn dynamic_values(&self) -> &DynamicStateValues;

    /// Width of the bound index buffer, `None` for non-indexed draws.
    fn index_type(&self) -> Option<IndexType>;

    fn set_render_pipeline_state(&mut self, state: &RenderPipelineState);

    fn set_compute_pipeline_state(&mut self, state: &ComputePipelineState, threadgroup_size: Size);

    fn set_render_state(&mut self, state: &RenderEncoderState);

    /// Requests the auxiliary buffer for `stage` at `slot`.
    fn use_aux_buffer(&mut self, stage: ShaderStage, slot: u32);
}
