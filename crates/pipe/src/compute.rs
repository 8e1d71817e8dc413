use std::sync::Arc;

use crate::{
    cache::PipelineCache,
    desc::ComputePipelineDesc,
    device::Device,
    encode::CommandEncoder,
    native::{ComputePipelineDescriptor, ComputePipelineState, Size},
    pipeline::{CreatePipelineError, PipelineHeader},
    stage::ShaderStage,
};

#[derive(Debug)]
pub struct ComputePipeline {
    header: PipelineHeader,
    desc: ComputePipelineDesc,
    state: ComputePipelineState,
    threadgroup_size: Size,
    needs_aux_buffer: bool,
}

impl ComputePipeline {
    pub(crate) fn new(
        device: &Device,
        cache: Option<&Arc<PipelineCache>>,
        desc: ComputePipelineDesc,
    ) -> Result<Self, CreatePipelineError> {
        let layout = desc.layout.clone().ok_or(CreatePipelineError::MissingLayout)?;
        let shader = desc
            .shader
            .as_ref()
            .ok_or(CreatePipelineError::MissingStage(ShaderStage::Compute))?;

        let header = PipelineHeader::new(device, cache, layout, desc.label.as_deref());

        let context = header.stage_context(device, ShaderStage::Compute, shader);
        let library = header.shader_library(device, &context, shader)?;
        let entry = library.entry_point();

        let [width, height, depth] = entry.workgroup_size.map(|size| size.max(1));
        let threadgroup_size = Size {
            width,
            height,
            depth,
        };
        let needs_aux_buffer = entry.needs_aux_buffer;

        let state = device
            .compile_compute_pipeline(&ComputePipelineDescriptor {
                label: header.label.clone(),
                function: header.function(device, ShaderStage::Compute, &library)?,
                stage_input: None,
            })
            .map_err(CreatePipelineError::compile(ShaderStage::Compute))?;

        Ok(ComputePipeline {
            header,
            desc,
            state,
            threadgroup_size,
            needs_aux_buffer,
        })
    }

    pub fn header(&self) -> &PipelineHeader {
        &self.header
    }

    /// Resolved description this pipeline was built from.
    pub fn desc(&self) -> &ComputePipelineDesc {
        &self.desc
    }

    pub fn threadgroup_size(&self) -> Size {
        self.threadgroup_size
    }

    pub fn needs_aux_buffer(&self) -> bool {
        self.needs_aux_buffer
    }

    pub fn encode(&self, encoder: &mut impl CommandEncoder) {
        encoder.set_compute_pipeline_state(&self.state, self.threadgroup_size);
        if self.needs_aux_buffer {
            if let Some(slot) = self.header.aux_buffer_index.get(ShaderStage::Compute) {
                encoder.use_aux_buffer(ShaderStage::Compute, slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::{CompileError, CompilerKind},
        converter::ShaderLanguage,
        encode::EncodeStage,
        mock::{test_device, EncoderEvent, MockCompiler, MockConverter, RecordingEncoder},
        pipeline::Pipeline,
    };

    fn desc(device: &Device) -> ComputePipelineDesc {
        let module = device.create_shader_module(ShaderLanguage::Wgsl, b"compute".as_slice());
        ComputePipelineDesc {
            label: Some("dispatch".to_owned()),
            shader: Some(crate::desc::ShaderStageDesc::new(module, "main")),
            layout: Some(device.create_pipeline_layout(Vec::new(), Vec::new())),
        }
    }

    #[test]
    fn single_stage_with_workgroup_size() {
        let compiler = MockCompiler::new();
        let device = test_device(compiler.clone(), MockConverter::new());
        let pipeline = device
            .create_compute_pipeline(None, None, desc(&device))
            .unwrap();

        assert_eq!(pipeline.stages().as_slice(), &[EncodeStage::Compute]);
        let compute = pipeline.as_compute().unwrap();
        assert_eq!(
            compute.threadgroup_size(),
            Size {
                width: 8,
                height: 8,
                depth: 1
            }
        );
        assert_eq!(compiler.compute_compiles(), 1);

        let mut encoder = RecordingEncoder::default();
        pipeline.encode(&mut encoder, EncodeStage::Compute);
        assert_eq!(
            encoder.events[0],
            EncoderEvent::Compute {
                label: "dispatch".to_owned(),
                threadgroup_size: compute.threadgroup_size(),
            }
        );
    }

    #[test]
    fn compile_failure_produces_no_pipeline() {
        let compiler = MockCompiler::new().failing_on(CompilerKind::ComputePipeline);
        let device = test_device(compiler, MockConverter::new());

        let err = device
            .create_compute_pipeline(None, None, desc(&device))
            .unwrap_err();
        assert!(matches!(
            err,
            CreatePipelineError::Compile {
                stage: ShaderStage::Compute,
                source: CompileError::Failed { .. }
            }
        ));
    }

    #[test]
    fn compile_timeout_fails_creation() {
        let device = test_device(MockCompiler::new().hanging(), MockConverter::new());
        let err = device
            .create_compute_pipeline(None, None, desc(&device))
            .unwrap_err();
        assert!(matches!(
            err,
            CreatePipelineError::Compile {
                source: CompileError::TimedOut { .. },
                ..
            }
        ));
        assert_eq!(device.stats().snapshot().timeouts, 1);
    }

    #[test]
    fn derivative_inherits_shader() {
        let device = test_device(MockCompiler::new(), MockConverter::new());
        let parent = device
            .create_compute_pipeline(None, None, desc(&device))
            .unwrap();

        let child = ComputePipelineDesc {
            label: Some("child".to_owned()),
            ..Default::default()
        };
        let pipeline = device
            .create_compute_pipeline(None, Some(&parent), child)
            .unwrap();
        assert_eq!(pipeline.header().label(), "child");

        let as_graphics = device.create_graphics_pipeline(None, Some(&parent), Default::default());
        assert!(matches!(
            as_graphics,
            Err(CreatePipelineError::ParentKindMismatch)
        ));
    }

    #[test]
    fn missing_shader_is_a_configuration_error() {
        let device = test_device(MockCompiler::new(), MockConverter::new());
        let err = device
            .create_compute_pipeline(
                None,
                None,
                ComputePipelineDesc {
                    shader: None,
                    ..desc(&device)
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CreatePipelineError::MissingStage(ShaderStage::Compute)
        ));
    }
}
