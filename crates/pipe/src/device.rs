use std::{fmt, sync::Arc, time::Instant};

use crate::{
    cache::{LibraryError, PipelineCache, ShaderLibrary},
    compiler::{CompileError, CompileStats, CompilerKind, MetalCompiler, NativeCompiler},
    compute::ComputePipeline,
    config::Config,
    converter::{
        ConvertError, ConvertedShader, ConverterContext, ShaderConverter, ShaderLanguage,
        ShaderModule,
    },
    desc::{ComputePipelineDesc, GraphicsPipelineDesc},
    graphics::GraphicsPipeline,
    layout::{DescriptorSetLayout, DescriptorSetLayoutBinding, PipelineLayout, PushConstantRange},
    native::{
        ComputePipelineDescriptor, ComputePipelineState, NativeLibrary, RenderPipelineDescriptor,
        RenderPipelineState,
    },
    pipeline::{CreatePipelineError, Pipeline},
};

/// Identity of the physical device. Serialized caches are only valid for an equal identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub vendor_id: u32,
    pub device_id: u32,
    pub cache_uuid: [u8; 16],
}

/// Factory of shader modules, layouts, caches and pipelines.
pub struct Device {
    config: Config,
    info: DeviceInfo,
    compiler: Box<dyn NativeCompiler>,
    converter: Box<dyn ShaderConverter>,
    stats: CompileStats,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("info", &self.info)
            .finish()
    }
}

impl Device {
    pub fn new(
        config: Config,
        info: DeviceInfo,
        compiler: impl NativeCompiler + 'static,
        converter: impl ShaderConverter + 'static,
    ) -> Self {
        Device {
            config,
            info,
            compiler: Box::new(compiler),
            converter: Box::new(converter),
            stats: CompileStats::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    #[inline]
    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    #[inline]
    pub fn converter(&self) -> &dyn ShaderConverter {
        &*self.converter
    }

    pub fn create_shader_module(
        &self,
        language: ShaderLanguage,
        code: impl Into<Box<[u8]>>,
    ) -> Arc<ShaderModule> {
        Arc::new(ShaderModule::new(language, code))
    }

    pub fn create_descriptor_set_layout(
        &self,
        bindings: Vec<DescriptorSetLayoutBinding>,
    ) -> Arc<DescriptorSetLayout> {
        Arc::new(DescriptorSetLayout::new(bindings))
    }

    pub fn create_pipeline_layout(
        &self,
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constants: Vec<PushConstantRange>,
    ) -> Arc<PipelineLayout> {
        Arc::new(PipelineLayout::new(set_layouts, push_constants, &self.config))
    }

    /// Creates a pipeline cache, seeded from data previously written by [`PipelineCache::write_data`].
    pub fn create_pipeline_cache(&self, initial_data: &[u8]) -> Arc<PipelineCache> {
        Arc::new(PipelineCache::new(self.info, initial_data))
    }

    /// Creates a graphics pipeline.
    ///
    /// When `parent` is a graphics pipeline, blocks `desc` omits are taken from it.
    pub fn create_graphics_pipeline(
        &self,
        cache: Option<&Arc<PipelineCache>>,
        parent: Option<&Pipeline>,
        desc: GraphicsPipelineDesc,
    ) -> Result<Pipeline, CreatePipelineError> {
        let desc = match parent {
            Some(Pipeline::Graphics(parent)) => {
                GraphicsPipelineDesc::merge_with_parent(desc, parent.desc())
            }
            Some(Pipeline::Compute(_)) => return Err(CreatePipelineError::ParentKindMismatch),
            None => desc,
        };

        GraphicsPipeline::new(self, cache, desc).map(Pipeline::Graphics)
    }

    pub fn create_compute_pipeline(
        &self,
        cache: Option<&Arc<PipelineCache>>,
        parent: Option<&Pipeline>,
        desc: ComputePipelineDesc,
    ) -> Result<Pipeline, CreatePipelineError> {
        let desc = match parent {
            Some(Pipeline::Compute(parent)) => {
                ComputePipelineDesc::merge_with_parent(desc, parent.desc())
            }
            Some(Pipeline::Graphics(_)) => return Err(CreatePipelineError::ParentKindMismatch),
            None => desc,
        };

        ComputePipeline::new(self, cache, desc).map(Pipeline::Compute)
    }

    /// Returns the library for `module` and `context`, through `cache` when there is one.
    pub(crate) fn shader_library(
        &self,
        cache: Option<&PipelineCache>,
        context: &ConverterContext,
        module: &ShaderModule,
    ) -> Result<Arc<ShaderLibrary>, LibraryError> {
        match cache {
            Some(cache) => cache.get_shader_library(self, context, module),
            None => Ok(Arc::new(ShaderLibrary::compile(self, context, module)?)),
        }
    }

    pub(crate) fn convert(
        &self,
        module: &ShaderModule,
        context: &ConverterContext,
    ) -> Result<ConvertedShader, ConvertError> {
        let start = Instant::now();
        match self.converter.convert(module, context) {
            Ok(shader) => {
                self.stats.record_conversion(start.elapsed());
                Ok(shader)
            }
            Err(err) => {
                tracing::error!(
                    "Failed to convert {} shader {:?} entry point {:?}: {}",
                    context.stage,
                    module.label().unwrap_or("<unnamed>"),
                    context.entry_point,
                    err
                );
                Err(err)
            }
        }
    }

    pub(crate) fn compile_library(
        &self,
        shader: &ConvertedShader,
    ) -> Result<NativeLibrary, CompileError> {
        MetalCompiler::new(
            CompilerKind::Library,
            shader.entry_point.name.clone(),
            self.config.compile_timeout(),
        )
        .with_stats(&self.stats)
        .compile(|completion| {
            self.compiler
                .new_library(shader, self.config.msl_version, completion)
        })
    }

    pub(crate) fn compile_render_pipeline(
        &self,
        desc: &RenderPipelineDescriptor,
    ) -> Result<RenderPipelineState, CompileError> {
        MetalCompiler::new(
            CompilerKind::RenderPipeline,
            desc.label.clone(),
            self.config.compile_timeout(),
        )
        .with_stats(&self.stats)
        .compile(|completion| self.compiler.new_render_pipeline_state(desc, completion))
    }

    pub(crate) fn compile_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> Result<ComputePipelineState, CompileError> {
        MetalCompiler::new(
            CompilerKind::ComputePipeline,
            desc.label.clone(),
            self.config.compile_timeout(),
        )
        .with_stats(&self.stats)
        .compile(|completion| self.compiler.new_compute_pipeline_state(desc, completion))
    }
}
