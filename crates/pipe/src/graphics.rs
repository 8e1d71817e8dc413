//! Graphics pipelines.
//!
//! A pipeline without tessellation is one native render state.
//! Tessellation is emulated with three passes, compiled in this order:
//!
//! 1. the vertex shader alone, writing its outputs into the captured-output buffer;
//! 2. the tessellation control shader as a compute state, in one variant per index width;
//! 3. the tessellation evaluation shader as the vertex function of the final render state.

use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::{
    binding::{
        ImplicitBinding, TESS_CTL_INDEX_BUFFER_INDEX, TESS_CTL_INPUT_BUFFER_INDEX,
        TESS_EVAL_INPUT_BUFFER_INDEX, TESS_EVAL_LEVEL_BUFFER_INDEX,
        TESS_EVAL_PATCH_INPUT_BUFFER_INDEX,
    },
    cache::{PipelineCache, ShaderLibrary},
    converter::{
        tess_level_locations, ConverterContext, EntryPointInfo, ShaderOutput, TessPatchKind,
    },
    desc::{
        ColorBlendAttachment, CullMode, DepthStencilState, DynamicState, DynamicStates,
        GraphicsPipelineDesc, PolygonMode, PrimitiveTopology, RasterizationState,
        ShaderStageDesc, StencilOpState, TessDomainOrigin, VertexInputState,
    },
    device::Device,
    encode::{CommandEncoder, DynamicStateValues, EncodeStage, RenderEncoderState},
    format::{PixelFormat, VertexFormat},
    from::{IntoMetal, MetalFrom, TryIntoMetal, TryMetalFrom},
    layout::PipelineLayout,
    native::{
        self, ColorAttachmentDescriptor, ComputePipelineDescriptor, ComputePipelineState,
        DepthStencilDescriptor, IndexType, PrimitiveTopologyClass, RenderPipelineDescriptor,
        RenderPipelineState, Size, StageInputDescriptor, StencilDescriptor,
        TessellationControlPointIndexType, TessellationDescriptor, TessellationFactorStepFunction,
        VertexAttributeDescriptor, VertexBufferLayout, VertexDescriptor, VertexStepFunction,
    },
    pipeline::{CreatePipelineError, PipelineHeader},
    stage::{ShaderStage, StageMap},
};

pub const MAX_PATCH_CONTROL_POINTS: u32 = 32;

#[derive(Debug)]
struct TessControlStates {
    base: ComputePipelineState,
    index16: ComputePipelineState,
    index32: ComputePipelineState,
    threadgroup_size: Size,
}

impl TessControlStates {
    fn select(&self, index_type: Option<IndexType>) -> &ComputePipelineState {
        match index_type {
            None => &self.base,
            Some(IndexType::UInt16) => &self.index16,
            Some(IndexType::UInt32) => &self.index32,
        }
    }
}

#[derive(Debug)]
enum Shape {
    Simple {
        state: RenderPipelineState,
    },
    Tessellated {
        vertex: RenderPipelineState,
        tess_control: TessControlStates,
        rasterization: RenderPipelineState,
    },
}

/// Emulation buffers the converted stages access.
#[derive(Clone, Copy, Debug, Default)]
struct StageNeeds {
    aux_buffer: StageMap<bool>,
    vertex_output_buffer: bool,
    tess_ctl_output_buffer: bool,
    tess_ctl_patch_output_buffer: bool,
    tess_ctl_input: bool,
}

#[derive(Debug)]
pub struct GraphicsPipeline {
    header: PipelineHeader,
    desc: GraphicsPipelineDesc,
    shape: Shape,
    baked: RenderEncoderState,
    dynamic_states: DynamicStates,
    needs: StageNeeds,
    input_control_points: u32,
    output_control_points: u32,
}

impl GraphicsPipeline {
    pub(crate) fn new(
        device: &Device,
        cache: Option<&Arc<PipelineCache>>,
        desc: GraphicsPipelineDesc,
    ) -> Result<Self, CreatePipelineError> {
        let layout = desc.layout.clone().ok_or(CreatePipelineError::MissingLayout)?;
        let vertex = desc
            .vertex
            .as_ref()
            .ok_or(CreatePipelineError::MissingStage(ShaderStage::Vertex))?;

        let input_assembly = desc.input_assembly.unwrap_or_default();
        let rasterization = desc.rasterization.unwrap_or_default();
        let tessellation = desc.tessellation.unwrap_or_default();
        let topology = input_assembly.topology;

        let tess_stages = match (
            &desc.tess_control,
            &desc.tess_evaluation,
            tessellation.patch_control_points,
        ) {
            (None, None, 0) if topology != PrimitiveTopology::PatchList => None,
            (Some(control), Some(evaluation), 1..=MAX_PATCH_CONTROL_POINTS) => {
                Some((control, evaluation))
            }
            (Some(_), Some(_), count) if count > MAX_PATCH_CONTROL_POINTS => {
                return Err(CreatePipelineError::PatchControlPoints(count))
            }
            _ => return Err(CreatePipelineError::IncompleteTessellation),
        };

        let baked = baked_render_state(&desc, &rasterization)?;
        let vertex_input = desc.vertex_input.clone().unwrap_or_default();
        let vertex_layout = vertex_descriptor(&layout, &vertex_input)?;

        let header = PipelineHeader::new(device, cache, layout, desc.label.as_deref());
        let fragment = desc.fragment.as_ref().filter(|_| !rasterization.discard);

        let builder = Builder {
            device,
            header: &header,
            desc: &desc,
            rasterization: &rasterization,
            points: topology == PrimitiveTopology::PointList
                || rasterization.polygon_mode == PolygonMode::Point,
        };

        let mut needs = StageNeeds::default();
        let (shape, input_control_points, output_control_points) = match tess_stages {
            None => {
                let state = builder.simple(vertex, fragment, vertex_layout, &mut needs)?;
                (Shape::Simple { state }, 0, 0)
            }
            Some((control, evaluation)) => {
                let (shape, output_control_points) = builder.tessellated(
                    vertex,
                    control,
                    evaluation,
                    fragment,
                    vertex_layout,
                    tessellation.domain_origin,
                    tessellation.patch_control_points,
                    &mut needs,
                )?;
                (shape, tessellation.patch_control_points, output_control_points)
            }
        };

        tracing::debug!(
            "Graphics pipeline {:?} created with {} native states",
            header.label,
            match shape {
                Shape::Simple { .. } => 1,
                Shape::Tessellated { .. } => 5,
            }
        );

        Ok(GraphicsPipeline {
            dynamic_states: desc.dynamic_states.unwrap_or_default(),
            header,
            desc,
            shape,
            baked,
            needs,
            input_control_points,
            output_control_points,
        })
    }

    pub fn header(&self) -> &PipelineHeader {
        &self.header
    }

    /// Resolved description this pipeline was built from.
    pub fn desc(&self) -> &GraphicsPipelineDesc {
        &self.desc
    }

    /// Stages draws must encode, in this order.
    pub fn stages(&self) -> SmallVec<[EncodeStage; 3]> {
        match self.shape {
            Shape::Simple { .. } => smallvec![EncodeStage::Rasterization],
            Shape::Tessellated { .. } => smallvec![
                EncodeStage::Vertex,
                EncodeStage::TessControl,
                EncodeStage::Rasterization
            ],
        }
    }

    #[inline]
    pub fn is_tessellation_pipeline(&self) -> bool {
        matches!(self.shape, Shape::Tessellated { .. })
    }

    #[inline]
    pub fn supports_dynamic_state(&self, state: DynamicState) -> bool {
        self.dynamic_states.contains(state)
    }

    pub fn input_control_point_count(&self) -> u32 {
        self.input_control_points
    }

    pub fn output_control_point_count(&self) -> u32 {
        self.output_control_points
    }

    pub fn indirect_params_index(&self) -> &ImplicitBinding {
        self.header.layout.indirect_params_index()
    }

    pub fn output_buffer_index(&self) -> &ImplicitBinding {
        self.header.layout.output_buffer_index()
    }

    pub fn tess_ctl_patch_output_buffer_index(&self) -> Option<u32> {
        self.header.layout.tess_ctl_patch_output_buffer_index()
    }

    pub fn tess_ctl_level_buffer_index(&self) -> Option<u32> {
        self.header.layout.tess_ctl_level_buffer_index()
    }

    pub fn needs_vertex_aux_buffer(&self) -> bool {
        self.needs.aux_buffer[ShaderStage::Vertex]
    }

    pub fn needs_vertex_output_buffer(&self) -> bool {
        self.needs.vertex_output_buffer
    }

    pub fn needs_tess_ctl_aux_buffer(&self) -> bool {
        self.needs.aux_buffer[ShaderStage::TessControl]
    }

    pub fn needs_tess_ctl_output_buffer(&self) -> bool {
        self.needs.tess_ctl_output_buffer
    }

    pub fn needs_tess_ctl_patch_output_buffer(&self) -> bool {
        self.needs.tess_ctl_patch_output_buffer
    }

    pub fn needs_tess_ctl_input(&self) -> bool {
        self.needs.tess_ctl_input
    }

    pub fn needs_tess_eval_aux_buffer(&self) -> bool {
        self.needs.aux_buffer[ShaderStage::TessEvaluation]
    }

    pub fn needs_fragment_aux_buffer(&self) -> bool {
        self.needs.aux_buffer[ShaderStage::Fragment]
    }

    /// Binds the native state of `stage`.
    ///
    /// Rasterization also pushes the fixed-function state, taking values of
    /// dynamic states from the encoder.
    pub fn encode(&self, encoder: &mut impl CommandEncoder, stage: EncodeStage) {
        match (&self.shape, stage) {
            (Shape::Simple { state }, EncodeStage::Rasterization) => {
                encoder.set_render_pipeline_state(state);
                let render_state = self.render_state(encoder.dynamic_values());
                encoder.set_render_state(&render_state);
                self.use_aux_buffer(encoder, ShaderStage::Vertex);
                self.use_aux_buffer(encoder, ShaderStage::Fragment);
            }
            (Shape::Tessellated { vertex, .. }, EncodeStage::Vertex) => {
                encoder.set_render_pipeline_state(vertex);
                self.use_aux_buffer(encoder, ShaderStage::Vertex);
            }
            (Shape::Tessellated { tess_control, .. }, EncodeStage::TessControl) => {
                let state = tess_control.select(encoder.index_type());
                encoder.set_compute_pipeline_state(state, tess_control.threadgroup_size);
                self.use_aux_buffer(encoder, ShaderStage::TessControl);
            }
            (Shape::Tessellated { rasterization, .. }, EncodeStage::Rasterization) => {
                encoder.set_render_pipeline_state(rasterization);
                let render_state = self.render_state(encoder.dynamic_values());
                encoder.set_render_state(&render_state);
                self.use_aux_buffer(encoder, ShaderStage::TessEvaluation);
                self.use_aux_buffer(encoder, ShaderStage::Fragment);
            }
            (_, stage) => {
                tracing::warn!(
                    "Graphics pipeline {:?} has no {:?} stage to encode",
                    self.header.label,
                    stage
                );
            }
        }
    }

    fn use_aux_buffer(&self, encoder: &mut impl CommandEncoder, stage: ShaderStage) {
        if !self.needs.aux_buffer[stage] {
            return;
        }
        if let Some(slot) = self.header.aux_buffer_index.get(stage) {
            encoder.use_aux_buffer(stage, slot);
        }
    }

    /// Baked state with dynamic states replaced by the encoder's values.
    fn render_state(&self, values: &DynamicStateValues) -> RenderEncoderState {
        let mut state = self.baked.clone();

        for dynamic in self.dynamic_states.iter() {
            match dynamic {
                DynamicState::Viewport => {
                    state.viewports = values
                        .viewports
                        .iter()
                        .map(|&viewport| native::Viewport::metal_from(viewport))
                        .collect();
                }
                DynamicState::Scissor => {
                    state.scissors = values
                        .scissors
                        .iter()
                        .map(|&rect| native::ScissorRect::metal_from(rect))
                        .collect();
                }
                DynamicState::BlendConstants => state.blend_constants = values.blend_constants,
                DynamicState::DepthBias => state.depth_bias = values.depth_bias,
                DynamicState::DepthClampEnable => {
                    state.depth_clip_mode = values.depth_clamp.into_metal();
                }
                DynamicState::CullMode => {
                    state.cull_mode = values.cull_mode.into_metal();
                    state.cull_all = values.cull_mode == CullMode::FrontAndBack;
                }
                DynamicState::FrontFace => {
                    state.front_facing_winding = values.front_face.into_metal();
                }
                DynamicState::PolygonMode => {
                    state.triangle_fill_mode = values.polygon_mode.into_metal();
                }
                DynamicState::PrimitiveTopology if !self.is_tessellation_pipeline() => {
                    match native::PrimitiveType::try_metal_from(values.primitive_topology) {
                        Some(primitive_type) => state.primitive_type = primitive_type,
                        None => tracing::warn!(
                            "Primitive topology {:?} is not supported, keeping {:?}",
                            values.primitive_topology,
                            state.primitive_type
                        ),
                    }
                }
                DynamicState::StencilCompareMask => {
                    state.depth_stencil.front_face_stencil.read_mask =
                        values.stencil_compare_mask[0];
                    state.depth_stencil.back_face_stencil.read_mask =
                        values.stencil_compare_mask[1];
                }
                DynamicState::StencilWriteMask => {
                    state.depth_stencil.front_face_stencil.write_mask =
                        values.stencil_write_mask[0];
                    state.depth_stencil.back_face_stencil.write_mask =
                        values.stencil_write_mask[1];
                }
                DynamicState::StencilReference => {
                    state.stencil_reference = values.stencil_reference;
                }
                // No native counterpart.
                DynamicState::LineWidth
                | DynamicState::DepthBounds
                | DynamicState::PrimitiveTopology => {}
            }
        }

        state
    }
}

/// Native buffer slot of vertex buffer `binding`. Vertex buffers are packed from the top.
fn vertex_buffer_slot(binding: u32, max_buffers_per_stage: u32) -> Option<u32> {
    max_buffers_per_stage.checked_sub(1)?.checked_sub(binding)
}

fn vertex_descriptor(
    layout: &PipelineLayout,
    input: &VertexInputState,
) -> Result<VertexDescriptor, CreatePipelineError> {
    let max_buffers = layout.max_buffers_per_stage();
    let declared = layout.resource_counts()[ShaderStage::Vertex].buffers;
    let implicit = layout.implicit_bindings();
    let reserved = [
        implicit.aux_buffer.get(ShaderStage::Vertex),
        implicit.indirect_params.get(ShaderStage::Vertex),
        implicit.output_buffer.get(ShaderStage::Vertex),
    ];

    let mut descriptor = VertexDescriptor::default();

    for binding in &input.bindings {
        let slot = vertex_buffer_slot(binding.binding, max_buffers)
            .ok_or(CreatePipelineError::VertexBindingOutOfRange(binding.binding))?;

        if slot < declared || reserved.contains(&Some(slot)) {
            return Err(CreatePipelineError::VertexBufferCollision {
                binding: binding.binding,
                slot,
            });
        }

        let (step_function, step_rate): (VertexStepFunction, u32) = binding.rate.into_metal();
        descriptor.layouts.push(VertexBufferLayout {
            buffer_index: slot,
            stride: binding.stride,
            step_function,
            step_rate,
        });
    }

    for attribute in &input.attributes {
        let binding = input
            .bindings
            .iter()
            .find(|b| b.binding == attribute.binding)
            .ok_or(CreatePipelineError::UndeclaredVertexBinding {
                location: attribute.location,
                binding: attribute.binding,
            })?;

        if binding.stride > 0 && attribute.offset >= binding.stride {
            return Err(CreatePipelineError::VertexAttributeOffset {
                location: attribute.location,
                offset: attribute.offset,
                stride: binding.stride,
            });
        }

        descriptor.attributes.push(VertexAttributeDescriptor {
            location: attribute.location,
            format: attribute.format,
            offset: attribute.offset,
            buffer_index: vertex_buffer_slot(binding.binding, max_buffers)
                .ok_or(CreatePipelineError::VertexBindingOutOfRange(binding.binding))?,
        });
    }

    Ok(descriptor)
}

/// Drops attributes `entry` does not read and buffers left without attributes.
fn retain_consumed(descriptor: &mut VertexDescriptor, entry: &EntryPointInfo) {
    descriptor
        .attributes
        .retain(|attribute| entry.consumes_location(attribute.location));

    let attributes = &descriptor.attributes;
    descriptor
        .layouts
        .retain(|layout| attributes.iter().any(|a| a.buffer_index == layout.buffer_index));
}

/// Fetch layout of outputs a previous pass wrote into `buffer_index`.
///
/// Selected outputs are packed tightly in the order the producer reports them.
fn captured_layout(
    outputs: &[ShaderOutput],
    select: impl Fn(&ShaderOutput) -> bool,
    buffer_index: u32,
    step_function: VertexStepFunction,
    consumer: &EntryPointInfo,
) -> VertexDescriptor {
    let mut descriptor = VertexDescriptor::default();
    let mut offset = 0;

    for output in outputs.iter().filter(|&output| select(output)) {
        let Some(format) = output.format() else {
            tracing::warn!("Stage output {:?} has no vertex format and is skipped", output);
            continue;
        };

        if let Some(location) = output.location {
            if consumer.consumes_location(location) {
                descriptor.attributes.push(VertexAttributeDescriptor {
                    location,
                    format,
                    offset,
                    buffer_index,
                });
            }
        }
        offset += format.size();
    }

    if !descriptor.attributes.is_empty() {
        descriptor.layouts.push(VertexBufferLayout {
            buffer_index,
            stride: offset,
            step_function,
            step_rate: 1,
        });
    }

    descriptor
}

/// Fetch layout of the half-precision tessellation factors the control pass writes per patch.
///
/// Outer levels come first, inner levels follow them.
fn level_layout(patch_kind: TessPatchKind, locations: [u32; 2]) -> VertexDescriptor {
    let (outer, inner) = match patch_kind {
        TessPatchKind::Triangles => (VertexFormat::Float16x3, VertexFormat::Float16),
        TessPatchKind::Quads | TessPatchKind::Isolines => {
            (VertexFormat::Float16x4, VertexFormat::Float16x2)
        }
    };

    VertexDescriptor {
        layouts: vec![VertexBufferLayout {
            buffer_index: TESS_EVAL_LEVEL_BUFFER_INDEX,
            stride: outer.size() + inner.size(),
            step_function: VertexStepFunction::PerPatch,
            step_rate: 1,
        }],
        attributes: vec![
            VertexAttributeDescriptor {
                location: locations[0],
                format: outer,
                offset: 0,
                buffer_index: TESS_EVAL_LEVEL_BUFFER_INDEX,
            },
            VertexAttributeDescriptor {
                location: locations[1],
                format: inner,
                offset: outer.size(),
                buffer_index: TESS_EVAL_LEVEL_BUFFER_INDEX,
            },
        ],
    }
}

fn color_attachment(format: PixelFormat, blend: ColorBlendAttachment) -> ColorAttachmentDescriptor {
    ColorAttachmentDescriptor {
        format,
        blending_enabled: blend.blend_enable,
        source_rgb_blend_factor: blend.src_color.into_metal(),
        destination_rgb_blend_factor: blend.dst_color.into_metal(),
        rgb_blend_operation: blend.color_op.into_metal(),
        source_alpha_blend_factor: blend.src_alpha.into_metal(),
        destination_alpha_blend_factor: blend.dst_alpha.into_metal(),
        alpha_blend_operation: blend.alpha_op.into_metal(),
        write_mask: blend.write_mask.into_metal(),
    }
}

fn depth_stencil_descriptor(state: &DepthStencilState) -> DepthStencilDescriptor {
    let stencil = |face: StencilOpState| match state.stencil_test {
        true => StencilDescriptor::metal_from(face),
        false => StencilDescriptor::DISABLED,
    };

    DepthStencilDescriptor {
        depth_compare_function: match state.depth_test {
            true => state.depth_compare.into_metal(),
            false => native::CompareFunction::Always,
        },
        depth_write_enabled: state.depth_test && state.depth_write,
        front_face_stencil: stencil(state.front),
        back_face_stencil: stencil(state.back),
    }
}

/// Fixed-function state mapped once from the portable description.
fn baked_render_state(
    desc: &GraphicsPipelineDesc,
    rasterization: &RasterizationState,
) -> Result<RenderEncoderState, CreatePipelineError> {
    let topology = desc.input_assembly.unwrap_or_default().topology;
    let primitive_type: native::PrimitiveType = topology
        .try_into_metal()
        .ok_or(CreatePipelineError::UnsupportedTopology(topology))?;

    let viewport = desc.viewport.clone().unwrap_or_default();
    let depth_stencil = desc.depth_stencil.unwrap_or_default();

    Ok(RenderEncoderState {
        viewports: viewport
            .viewports
            .iter()
            .map(|&viewport| native::Viewport::metal_from(viewport))
            .collect(),
        scissors: viewport
            .scissors
            .iter()
            .map(|&rect| native::ScissorRect::metal_from(rect))
            .collect(),
        blend_constants: desc
            .color_blend
            .as_ref()
            .map_or([0.0, 0.0, 0.0, 1.0], |blend| blend.blend_constants),
        depth_bias: rasterization.depth_bias,
        depth_clip_mode: rasterization.depth_clamp.into_metal(),
        cull_mode: rasterization.cull_mode.into_metal(),
        cull_all: rasterization.cull_mode == CullMode::FrontAndBack,
        front_facing_winding: rasterization.front_face.into_metal(),
        triangle_fill_mode: rasterization.polygon_mode.into_metal(),
        depth_stencil: depth_stencil_descriptor(&depth_stencil),
        stencil_reference: [depth_stencil.front.reference, depth_stencil.back.reference],
        primitive_type,
    })
}

struct Builder<'a> {
    device: &'a Device,
    header: &'a PipelineHeader,
    desc: &'a GraphicsPipelineDesc,
    rasterization: &'a RasterizationState,
    points: bool,
}

impl Builder<'_> {
    fn library(
        &self,
        stage: ShaderStage,
        shader: &ShaderStageDesc,
        configure: impl FnOnce(&mut ConverterContext),
    ) -> Result<Arc<ShaderLibrary>, CreatePipelineError> {
        let mut context = self.header.stage_context(self.device, stage, shader);
        configure(&mut context);
        self.header.shader_library(self.device, &context, shader)
    }

    fn fragment_library(
        &self,
        fragment: Option<&ShaderStageDesc>,
    ) -> Result<Option<Arc<ShaderLibrary>>, CreatePipelineError> {
        fragment
            .map(|fragment| self.library(ShaderStage::Fragment, fragment, |_| {}))
            .transpose()
    }

    /// Descriptor with attachments, multisampling and rasterization set.
    fn render_descriptor(&self, label: String) -> RenderPipelineDescriptor {
        let mut descriptor = RenderPipelineDescriptor::new(label);

        let targets = self.desc.targets.clone().unwrap_or_default();
        let blend = self.desc.color_blend.clone().unwrap_or_default();
        descriptor.color_attachments = targets
            .colors
            .iter()
            .enumerate()
            .map(|(index, &format)| {
                color_attachment(
                    format,
                    blend.attachments.get(index).copied().unwrap_or_default(),
                )
            })
            .collect();
        descriptor.depth_attachment_format = targets.depth_stencil.filter(PixelFormat::is_depth);
        descriptor.stencil_attachment_format =
            targets.depth_stencil.filter(PixelFormat::is_stencil);

        let multisample = self.desc.multisample.unwrap_or_default();
        descriptor.sample_count = multisample.samples.max(1);
        descriptor.alpha_to_coverage_enabled = multisample.alpha_to_coverage;
        descriptor.alpha_to_one_enabled = multisample.alpha_to_one;
        descriptor.rasterization_enabled = !self.rasterization.discard;

        descriptor
    }

    fn attach_fragment(
        &self,
        descriptor: &mut RenderPipelineDescriptor,
        fragment: Option<&ShaderLibrary>,
    ) -> Result<(), CreatePipelineError> {
        if let Some(fragment) = fragment {
            descriptor.fragment_function =
                Some(self.header.function(self.device, ShaderStage::Fragment, fragment)?);
        }
        Ok(())
    }

    fn compile_render(
        &self,
        stage: ShaderStage,
        descriptor: &RenderPipelineDescriptor,
    ) -> Result<RenderPipelineState, CreatePipelineError> {
        self.device
            .compile_render_pipeline(descriptor)
            .map_err(CreatePipelineError::compile(stage))
    }

    fn simple(
        &self,
        vertex: &ShaderStageDesc,
        fragment: Option<&ShaderStageDesc>,
        mut vertex_layout: VertexDescriptor,
        needs: &mut StageNeeds,
    ) -> Result<RenderPipelineState, CreatePipelineError> {
        let vs = self.library(ShaderStage::Vertex, vertex, |context| {
            context.point_size_builtin = self.points;
            context.rasterization_enabled = !self.rasterization.discard;
        })?;
        let fs = self.fragment_library(fragment)?;

        needs.aux_buffer[ShaderStage::Vertex] = vs.entry_point().needs_aux_buffer;
        needs.aux_buffer[ShaderStage::Fragment] =
            fs.as_ref().is_some_and(|fs| fs.entry_point().needs_aux_buffer);

        retain_consumed(&mut vertex_layout, vs.entry_point());

        let topology = self.desc.input_assembly.unwrap_or_default().topology;
        let mut descriptor = self.render_descriptor(self.header.label.clone());
        descriptor.vertex_function =
            Some(self.header.function(self.device, ShaderStage::Vertex, &vs)?);
        self.attach_fragment(&mut descriptor, fs.as_deref())?;
        descriptor.vertex_descriptor = vertex_layout;
        descriptor.input_primitive_topology = match self.points {
            true => PrimitiveTopologyClass::Point,
            false => topology.into_metal(),
        };

        let stage = match fs {
            Some(_) => ShaderStage::Fragment,
            None => ShaderStage::Vertex,
        };
        self.compile_render(stage, &descriptor)
    }

    #[allow(clippy::too_many_arguments)]
    fn tessellated(
        &self,
        vertex: &ShaderStageDesc,
        control: &ShaderStageDesc,
        evaluation: &ShaderStageDesc,
        fragment: Option<&ShaderStageDesc>,
        mut vertex_layout: VertexDescriptor,
        domain_origin: TessDomainOrigin,
        input_control_points: u32,
        needs: &mut StageNeeds,
    ) -> Result<(Shape, u32), CreatePipelineError> {
        let label = &self.header.label;

        let reflection = self
            .device
            .converter()
            .reflect_tessellation(
                (&control.module, &control.entry),
                (&evaluation.module, &evaluation.entry),
            )
            .map_err(|source| CreatePipelineError::Convert {
                stage: ShaderStage::TessControl,
                source,
            })?;
        let points = self.points || reflection.point_mode;
        let output_control_points = reflection.output_control_points;

        // Vertex pass, captured into the output buffer.
        let vs = self.library(ShaderStage::Vertex, vertex, |context| {
            context.capture_output = true;
            context.rasterization_enabled = false;
        })?;
        retain_consumed(&mut vertex_layout, vs.entry_point());

        let mut descriptor = self.render_descriptor(format!("{label} (vertex)"));
        descriptor.vertex_function =
            Some(self.header.function(self.device, ShaderStage::Vertex, &vs)?);
        descriptor.vertex_descriptor = vertex_layout;
        descriptor.rasterization_enabled = false;
        descriptor.input_primitive_topology = PrimitiveTopologyClass::Point;
        let vertex_state = self.compile_render(ShaderStage::Vertex, &descriptor)?;

        // Tessellation control compute pass.
        let tcs = self.library(ShaderStage::TessControl, control, |context| {
            context.stage_inputs = vs.entry_point().outputs.clone();
            context.patch_control_points = input_control_points;
        })?;
        let function = self
            .header
            .function(self.device, ShaderStage::TessControl, &tcs)?;
        let stage_input = captured_layout(
            &vs.entry_point().outputs,
            |output| !output.per_patch,
            TESS_CTL_INPUT_BUFFER_INDEX,
            VertexStepFunction::ThreadPositionInGridX,
            tcs.entry_point(),
        );

        let compile_variant = |index_type: Option<IndexType>| {
            let mut layout = stage_input.clone();
            let suffix = match index_type {
                None => "",
                Some(IndexType::UInt16) => ", 16-bit indices",
                Some(IndexType::UInt32) => ", 32-bit indices",
            };
            if index_type.is_some() {
                for buffer in &mut layout.layouts {
                    buffer.step_function = VertexStepFunction::ThreadPositionInGridXIndexed;
                }
            }

            self.device
                .compile_compute_pipeline(&ComputePipelineDescriptor {
                    label: format!("{label} (tessellation control{suffix})"),
                    function: function.clone(),
                    stage_input: Some(StageInputDescriptor {
                        layout,
                        index_type,
                        index_buffer_index: TESS_CTL_INDEX_BUFFER_INDEX,
                    }),
                })
                .map_err(CreatePipelineError::compile(ShaderStage::TessControl))
        };

        let tess_control = TessControlStates {
            base: compile_variant(None)?,
            index16: compile_variant(Some(IndexType::UInt16))?,
            index32: compile_variant(Some(IndexType::UInt32))?,
            threadgroup_size: Size {
                width: output_control_points.max(1),
                height: 1,
                depth: 1,
            },
        };

        // Tessellation evaluation and fragment render pass.
        let tes = self.library(ShaderStage::TessEvaluation, evaluation, |context| {
            context.stage_inputs = tcs.entry_point().outputs.clone();
            context.patch_control_points = output_control_points;
            context.point_size_builtin = points;
            context.rasterization_enabled = !self.rasterization.discard;
        })?;
        let fs = self.fragment_library(fragment)?;

        let mut vertex_layout = captured_layout(
            &tcs.entry_point().outputs,
            |output| !output.per_patch,
            TESS_EVAL_INPUT_BUFFER_INDEX,
            VertexStepFunction::PerPatchControlPoint,
            tes.entry_point(),
        );
        let patch_layout = captured_layout(
            &tcs.entry_point().outputs,
            |output| output.per_patch,
            TESS_EVAL_PATCH_INPUT_BUFFER_INDEX,
            VertexStepFunction::PerPatch,
            tes.entry_point(),
        );
        let levels = level_layout(
            reflection.patch_kind,
            tess_level_locations(&tcs.entry_point().outputs),
        );
        for layout in [patch_layout, levels] {
            vertex_layout.layouts.extend(layout.layouts);
            vertex_layout.attributes.extend(layout.attributes);
        }

        let winding: native::Winding = reflection.output_winding.into_metal();
        let mut descriptor = self.render_descriptor(label.clone());
        descriptor.vertex_function =
            Some(self.header.function(self.device, ShaderStage::TessEvaluation, &tes)?);
        self.attach_fragment(&mut descriptor, fs.as_deref())?;
        descriptor.vertex_descriptor = vertex_layout;
        descriptor.input_primitive_topology = match (points, reflection.patch_kind) {
            (true, _) => PrimitiveTopologyClass::Point,
            (false, TessPatchKind::Isolines) => PrimitiveTopologyClass::Line,
            (false, _) => PrimitiveTopologyClass::Triangle,
        };
        descriptor.tessellation = Some(TessellationDescriptor {
            partition_mode: reflection.partition.into_metal(),
            factor_step_function: TessellationFactorStepFunction::PerPatch,
            control_point_index_type: TessellationControlPointIndexType::None,
            max_factor: self.device.config().max_tessellation_factor,
            output_winding: match domain_origin {
                TessDomainOrigin::UpperLeft => winding,
                TessDomainOrigin::LowerLeft => winding.flipped(),
            },
        });

        let stage = match fs {
            Some(_) => ShaderStage::Fragment,
            None => ShaderStage::TessEvaluation,
        };
        let rasterization = self.compile_render(stage, &descriptor)?;

        needs.aux_buffer[ShaderStage::Vertex] = vs.entry_point().needs_aux_buffer;
        needs.aux_buffer[ShaderStage::TessControl] = tcs.entry_point().needs_aux_buffer;
        needs.aux_buffer[ShaderStage::TessEvaluation] = tes.entry_point().needs_aux_buffer;
        needs.aux_buffer[ShaderStage::Fragment] =
            fs.as_ref().is_some_and(|fs| fs.entry_point().needs_aux_buffer);
        needs.vertex_output_buffer = tcs.entry_point().needs_input;
        needs.tess_ctl_output_buffer = tcs.entry_point().needs_output_buffer;
        needs.tess_ctl_patch_output_buffer = tcs.entry_point().needs_patch_output_buffer;
        needs.tess_ctl_input = tcs.entry_point().needs_input;

        let shape = Shape::Tessellated {
            vertex: vertex_state,
            tess_control,
            rasterization,
        };
        Ok((shape, output_control_points))
    }
}
