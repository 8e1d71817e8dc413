use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    binding::ImplicitBinding,
    cache::{LibraryError, PipelineCache, ShaderLibrary},
    compiler::CompileError,
    compute::ComputePipeline,
    converter::{ConvertError, ConverterContext},
    desc::{PrimitiveTopology, ShaderStageDesc},
    device::Device,
    encode::{CommandEncoder, EncodeStage},
    graphics::GraphicsPipeline,
    layout::PipelineLayout,
    native::NativeFunction,
    stage::ShaderStage,
};

#[derive(Debug, thiserror::Error)]
pub enum CreatePipelineError {
    #[error("pipeline layout is missing")]
    MissingLayout,

    #[error("{0} shader stage is missing")]
    MissingStage(ShaderStage),

    #[error("tessellation requires both tessellation shader stages and patch control points")]
    IncompleteTessellation,

    #[error("patch control point count {0} is out of range 1..=32")]
    PatchControlPoints(u32),

    #[error("primitive topology {0:?} is not supported")]
    UnsupportedTopology(PrimitiveTopology),

    #[error("vertex binding {0} has no native buffer slot")]
    VertexBindingOutOfRange(u32),

    #[error("vertex binding {binding} maps to buffer slot {slot} used by the pipeline layout")]
    VertexBufferCollision { binding: u32, slot: u32 },

    #[error("vertex attribute at location {location} refers to undeclared binding {binding}")]
    UndeclaredVertexBinding { location: u32, binding: u32 },

    #[error("vertex attribute at location {location} has offset {offset} not below binding stride {stride}")]
    VertexAttributeOffset {
        location: u32,
        offset: u32,
        stride: u32,
    },

    #[error("parent pipeline is of a different kind")]
    ParentKindMismatch,

    #[error("{stage} shader conversion failed: {source}")]
    Convert {
        stage: ShaderStage,
        #[source]
        source: ConvertError,
    },

    #[error("{stage} stage compile failed: {source}")]
    Compile {
        stage: ShaderStage,
        #[source]
        source: CompileError,
    },
}

impl CreatePipelineError {
    fn library(stage: ShaderStage, err: LibraryError) -> Self {
        match err {
            LibraryError::Convert(source) => CreatePipelineError::Convert { stage, source },
            LibraryError::Compile(source) => CreatePipelineError::Compile { stage, source },
        }
    }

    pub(crate) fn compile(stage: ShaderStage) -> impl FnOnce(CompileError) -> Self {
        move |source| CreatePipelineError::Compile { stage, source }
    }
}

/// State common to all pipelines.
#[derive(Debug)]
pub struct PipelineHeader {
    pub(crate) label: String,
    pub(crate) cache: Option<Arc<PipelineCache>>,
    pub(crate) layout: Arc<PipelineLayout>,
    pub(crate) aux_buffer_index: ImplicitBinding,
    pub(crate) full_image_view_swizzle: bool,
}

impl PipelineHeader {
    pub(crate) fn new(
        device: &Device,
        cache: Option<&Arc<PipelineCache>>,
        layout: Arc<PipelineLayout>,
        label: Option<&str>,
    ) -> Self {
        PipelineHeader {
            label: label.unwrap_or("<unnamed>").to_owned(),
            cache: cache.cloned(),
            aux_buffer_index: *layout.aux_buffer_index(),
            layout,
            full_image_view_swizzle: device.config().full_image_view_swizzle,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cache(&self) -> Option<&Arc<PipelineCache>> {
        self.cache.as_ref()
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn aux_buffer_index(&self) -> &ImplicitBinding {
        &self.aux_buffer_index
    }

    pub fn full_image_view_swizzle(&self) -> bool {
        self.full_image_view_swizzle
    }

    /// Converter context for `shader` running as `stage`, with this pipeline's slots.
    pub(crate) fn stage_context(
        &self,
        device: &Device,
        stage: ShaderStage,
        shader: &ShaderStageDesc,
    ) -> ConverterContext {
        let mut context = ConverterContext::new(stage, shader.entry.clone());
        context.specialization = shader.specialization.clone();
        context.msl_version = device.config().msl_version;
        context.full_image_view_swizzle = self.full_image_view_swizzle;
        self.layout.populate_converter_context(&mut context);
        context
    }

    pub(crate) fn shader_library(
        &self,
        device: &Device,
        context: &ConverterContext,
        shader: &ShaderStageDesc,
    ) -> Result<Arc<ShaderLibrary>, CreatePipelineError> {
        device
            .shader_library(self.cache.as_deref(), context, &shader.module)
            .map_err(|err| CreatePipelineError::library(context.stage, err))
    }

    pub(crate) fn function(
        &self,
        device: &Device,
        stage: ShaderStage,
        library: &ShaderLibrary,
    ) -> Result<NativeFunction, CreatePipelineError> {
        library
            .function(device)
            .map_err(CreatePipelineError::compile(stage))
    }
}

/// Compiled pipeline.
///
/// Immutable after creation and safe to encode from many threads.
#[derive(Debug)]
pub enum Pipeline {
    Graphics(GraphicsPipeline),
    Compute(ComputePipeline),
}

impl Pipeline {
    pub fn header(&self) -> &PipelineHeader {
        match self {
            Pipeline::Graphics(pipeline) => pipeline.header(),
            Pipeline::Compute(pipeline) => pipeline.header(),
        }
    }

    /// Stages draws and dispatches must encode, once each and in this order.
    pub fn stages(&self) -> SmallVec<[EncodeStage; 3]> {
        match self {
            Pipeline::Graphics(pipeline) => pipeline.stages(),
            Pipeline::Compute(_) => smallvec::smallvec![EncodeStage::Compute],
        }
    }

    pub fn encode(&self, encoder: &mut impl CommandEncoder, stage: EncodeStage) {
        match self {
            Pipeline::Graphics(pipeline) => pipeline.encode(encoder, stage),
            Pipeline::Compute(pipeline) => pipeline.encode(encoder),
        }
    }

    pub fn aux_buffer_index(&self) -> &ImplicitBinding {
        self.header().aux_buffer_index()
    }

    pub fn full_image_view_swizzle(&self) -> bool {
        self.header().full_image_view_swizzle()
    }

    pub fn as_graphics(&self) -> Option<&GraphicsPipeline> {
        match self {
            Pipeline::Graphics(pipeline) => Some(pipeline),
            Pipeline::Compute(_) => None,
        }
    }

    pub fn as_compute(&self) -> Option<&ComputePipeline> {
        match self {
            Pipeline::Compute(pipeline) => Some(pipeline),
            Pipeline::Graphics(_) => None,
        }
    }
}
