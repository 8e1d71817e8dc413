//! Portable pipeline descriptions.
//!
//! Every state block is optional so that derivative pipelines can inherit
//! omitted blocks from their parent with [`GraphicsPipelineDesc::merge_with_parent`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    converter::ShaderModule,
    format::{PixelFormat, VertexFormat},
    layout::PipelineLayout,
};

/// Value for one specialization constant of a shader.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecializationConstant {
    pub id: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ShaderStageDesc {
    pub module: Arc<ShaderModule>,
    pub entry: String,
    pub specialization: Vec<SpecializationConstant>,
}

impl ShaderStageDesc {
    pub fn new(module: Arc<ShaderModule>, entry: impl Into<String>) -> Self {
        ShaderStageDesc {
            module,
            entry: entry.into(),
            specialization: Vec::new(),
        }
    }

    pub fn with_constant(mut self, id: u32, data: impl Into<Vec<u8>>) -> Self {
        self.specialization.push(SpecializationConstant {
            id,
            data: data.into(),
        });
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexInputRate {
    Vertex,
    Instance { divisor: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub rate: VertexInputRate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexInputState {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
    PatchList,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InputAssemblyState {
    pub topology: PrimitiveTopology,
    pub primitive_restart: bool,
}

/// Origin of the tessellation domain coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TessDomainOrigin {
    #[default]
    UpperLeft,
    LowerLeft,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TessellationState {
    pub patch_control_points: u32,
    pub domain_origin: TessDomainOrigin,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewportState {
    pub viewports: Vec<Viewport>,
    pub scissors: Vec<Rect>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepthBias {
    pub constant: f32,
    pub clamp: f32,
    pub slope: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterizationState {
    pub depth_clamp: bool,
    pub discard: bool,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_bias: Option<DepthBias>,
    pub line_width: f32,
}

impl Default for RasterizationState {
    fn default() -> Self {
        RasterizationState {
            depth_clamp: false,
            discard: false,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            depth_bias: None,
            line_width: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MultisampleState {
    pub samples: u32,
    pub alpha_to_coverage: bool,
    pub alpha_to_one: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        MultisampleState {
            samples: 1,
            alpha_to_coverage: false,
            alpha_to_one: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    #[default]
    Always,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilOpState {
    pub fail: StencilOp,
    pub pass: StencilOp,
    pub depth_fail: StencilOp,
    pub compare: CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilOpState {
    fn default() -> Self {
        StencilOpState {
            fail: StencilOp::Keep,
            pass: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            compare: CompareOp::Always,
            compare_mask: !0,
            write_mask: !0,
            reference: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub stencil_test: bool,
    pub front: StencilOpState,
    pub back: StencilOpState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ColorComponents : u8 {
        const R = 0x1;
        const G = 0x2;
        const B = 0x4;
        const A = 0x8;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
    pub write_mask: ColorComponents,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        ColorBlendAttachment {
            blend_enable: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: ColorComponents::all(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColorBlendState {
    pub attachments: Vec<ColorBlendAttachment>,
    pub blend_constants: [f32; 4],
}

impl Default for ColorBlendState {
    fn default() -> Self {
        ColorBlendState {
            attachments: Vec::new(),
            blend_constants: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Formats of the attachments the pipeline renders into.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderTargets {
    pub colors: Vec<PixelFormat>,
    pub depth_stencil: Option<PixelFormat>,
}

/// Pipeline state that may be supplied at encode time instead of being baked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DynamicState {
    Viewport,
    Scissor,
    LineWidth,
    DepthBias,
    BlendConstants,
    DepthBounds,
    StencilCompareMask,
    StencilWriteMask,
    StencilReference,
    CullMode,
    FrontFace,
    PrimitiveTopology,
    DepthClampEnable,
    PolygonMode,
}

impl DynamicState {
    pub const COUNT: usize = 14;

    pub const ALL: [DynamicState; Self::COUNT] = [
        DynamicState::Viewport,
        DynamicState::Scissor,
        DynamicState::LineWidth,
        DynamicState::DepthBias,
        DynamicState::BlendConstants,
        DynamicState::DepthBounds,
        DynamicState::StencilCompareMask,
        DynamicState::StencilWriteMask,
        DynamicState::StencilReference,
        DynamicState::CullMode,
        DynamicState::FrontFace,
        DynamicState::PrimitiveTopology,
        DynamicState::DepthClampEnable,
        DynamicState::PolygonMode,
    ];
}

/// Set of enabled [`DynamicState`]s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DynamicStates {
    bits: u32,
}

impl DynamicStates {
    pub const NONE: Self = DynamicStates { bits: 0 };

    #[inline]
    pub fn insert(&mut self, state: DynamicState) {
        self.bits |= 1 << state as u32;
    }

    #[inline]
    pub fn contains(&self, state: DynamicState) -> bool {
        self.bits & (1 << state as u32) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = DynamicState> + '_ {
        DynamicState::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl FromIterator<DynamicState> for DynamicStates {
    fn from_iter<I: IntoIterator<Item = DynamicState>>(iter: I) -> Self {
        let mut states = DynamicStates::NONE;
        for state in iter {
            states.insert(state);
        }
        states
    }
}

impl<const N: usize> From<[DynamicState; N]> for DynamicStates {
    fn from(states: [DynamicState; N]) -> Self {
        states.into_iter().collect()
    }
}

/// Portable description of a graphics pipeline.
#[derive(Clone, Debug, Default)]
pub struct GraphicsPipelineDesc {
    pub label: Option<String>,
    pub vertex: Option<ShaderStageDesc>,
    pub tess_control: Option<ShaderStageDesc>,
    pub tess_evaluation: Option<ShaderStageDesc>,
    pub fragment: Option<ShaderStageDesc>,
    pub vertex_input: Option<VertexInputState>,
    pub input_assembly: Option<InputAssemblyState>,
    pub tessellation: Option<TessellationState>,
    pub viewport: Option<ViewportState>,
    pub rasterization: Option<RasterizationState>,
    pub multisample: Option<MultisampleState>,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_blend: Option<ColorBlendState>,
    pub targets: Option<RenderTargets>,
    pub dynamic_states: Option<DynamicStates>,
    pub layout: Option<Arc<PipelineLayout>>,
}

impl GraphicsPipelineDesc {
    fn has_shaders(&self) -> bool {
        self.vertex.is_some()
            || self.tess_control.is_some()
            || self.tess_evaluation.is_some()
            || self.fragment.is_some()
    }

    /// Fills every block `child` omits from `parent`.
    ///
    /// Shader stages are inherited as a group, and only when `child` declares none.
    pub fn merge_with_parent(child: Self, parent: &Self) -> Self {
        let (vertex, tess_control, tess_evaluation, fragment) = if child.has_shaders() {
            (
                child.vertex,
                child.tess_control,
                child.tess_evaluation,
                child.fragment,
            )
        } else {
            (
                parent.vertex.clone(),
                parent.tess_control.clone(),
                parent.tess_evaluation.clone(),
                parent.fragment.clone(),
            )
        };

        GraphicsPipelineDesc {
            label: child.label,
            vertex,
            tess_control,
            tess_evaluation,
            fragment,
            vertex_input: child.vertex_input.or_else(|| parent.vertex_input.clone()),
            input_assembly: child.input_assembly.or(parent.input_assembly),
            tessellation: child.tessellation.or(parent.tessellation),
            viewport: child.viewport.or_else(|| parent.viewport.clone()),
            rasterization: child.rasterization.or(parent.rasterization),
            multisample: child.multisample.or(parent.multisample),
            depth_stencil: child.depth_stencil.or(parent.depth_stencil),
            color_blend: child.color_blend.or_else(|| parent.color_blend.clone()),
            targets: child.targets.or_else(|| parent.targets.clone()),
            dynamic_states: child.dynamic_states.or(parent.dynamic_states),
            layout: child.layout.or_else(|| parent.layout.clone()),
        }
    }
}

/// Portable description of a compute pipeline.
#[derive(Clone, Debug, Default)]
pub struct ComputePipelineDesc {
    pub label: Option<String>,
    pub shader: Option<ShaderStageDesc>,
    pub layout: Option<Arc<PipelineLayout>>,
}

impl ComputePipelineDesc {
    pub fn merge_with_parent(child: Self, parent: &Self) -> Self {
        ComputePipelineDesc {
            label: child.label,
            shader: child.shader.or_else(|| parent.shader.clone()),
            layout: child.layout.or_else(|| parent.layout.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::ShaderLanguage;

    fn module(code: &str) -> Arc<ShaderModule> {
        Arc::new(ShaderModule::new(ShaderLanguage::Wgsl, code.as_bytes()))
    }

    #[test]
    fn dynamic_states_membership() {
        let states = DynamicStates::from([DynamicState::Viewport, DynamicState::StencilReference]);
        for state in DynamicState::ALL {
            let expected = matches!(state, DynamicState::Viewport | DynamicState::StencilReference);
            assert_eq!(states.contains(state), expected, "{state:?}");
        }
        assert_eq!(states.iter().count(), 2);
    }

    #[test]
    fn child_blocks_override_parent() {
        let parent = GraphicsPipelineDesc {
            vertex: Some(ShaderStageDesc::new(module("parent"), "vs")),
            rasterization: Some(RasterizationState {
                cull_mode: CullMode::Back,
                ..Default::default()
            }),
            multisample: Some(MultisampleState {
                samples: 4,
                ..Default::default()
            }),
            ..Default::default()
        };

        let child = GraphicsPipelineDesc {
            label: Some("child".to_owned()),
            rasterization: Some(RasterizationState::default()),
            ..Default::default()
        };

        let merged = GraphicsPipelineDesc::merge_with_parent(child, &parent);

        assert_eq!(merged.label.as_deref(), Some("child"));
        assert_eq!(merged.rasterization.unwrap().cull_mode, CullMode::None);
        assert_eq!(merged.multisample.unwrap().samples, 4);
        assert_eq!(merged.vertex.unwrap().entry, "vs");
    }

    #[test]
    fn shader_stages_are_inherited_as_a_group() {
        let parent = GraphicsPipelineDesc {
            vertex: Some(ShaderStageDesc::new(module("parent"), "vs")),
            fragment: Some(ShaderStageDesc::new(module("parent"), "fs")),
            ..Default::default()
        };
        let child = GraphicsPipelineDesc {
            vertex: Some(ShaderStageDesc::new(module("child"), "main")),
            ..Default::default()
        };

        let merged = GraphicsPipelineDesc::merge_with_parent(child, &parent);
        assert_eq!(merged.vertex.unwrap().entry, "main");
        assert!(merged.fragment.is_none());
    }
}
