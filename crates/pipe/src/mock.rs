//! Scripted collaborators for unit tests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    binding::{ResourceCounts, ResourceSlots},
    compiler::{Completion, CompilerKind, NativeCompiler},
    config::Config,
    converter::{
        ConvertError, ConvertedShader, ConverterContext, EntryPointInfo, ShaderConverter,
        ShaderModule, ShaderOutput, TessPartition, TessPatchKind, TessReflection,
    },
    desc::FrontFace,
    device::{Device, DeviceInfo},
    encode::{CommandEncoder, DynamicStateValues, RenderEncoderState},
    format::ScalarKind,
    layout::{DescriptorBinder, DescriptorKind, DescriptorSetLayout},
    native::{
        ComputePipelineDescriptor, ComputePipelineState, IndexType, NativeLibrary,
        RenderPipelineDescriptor, RenderPipelineState, Size,
    },
    stage::{ShaderStage, StageMap},
};

pub const TEST_DEVICE: DeviceInfo = DeviceInfo {
    vendor_id: 0x106b,
    device_id: 0xa0,
    cache_uuid: [7; 16],
};

/// Routes logs of the running test to its captured output. Filtered by `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Device with a short compile timeout.
pub fn test_device(compiler: MockCompiler, converter: MockConverter) -> Device {
    init_logging();
    let config = Config {
        compile_timeout_ms: 200,
        ..Config::default()
    };
    Device::new(config, TEST_DEVICE, compiler, converter)
}

/// Native object produced by [`MockCompiler`].
#[derive(Debug)]
pub struct MockState {
    pub label: String,
}

#[derive(Default)]
struct CompilerShared {
    library_compiles: AtomicUsize,
    render_compiles: AtomicUsize,
    compute_compiles: AtomicUsize,
    render_descriptors: Mutex<Vec<RenderPipelineDescriptor>>,
    compute_descriptors: Mutex<Vec<ComputePipelineDescriptor>>,
    parked: Mutex<Vec<Box<dyn Send>>>,
}

/// Native compiler that completes immediately, after a delay, with an error or never.
#[derive(Clone, Default)]
pub struct MockCompiler {
    delay: Option<Duration>,
    failing: Vec<CompilerKind>,
    hanging: bool,
    shared: Arc<CompilerShared>,
}

impl MockCompiler {
    pub fn new() -> Self {
        MockCompiler::default()
    }

    /// Completes from another thread after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = vec![
            CompilerKind::Library,
            CompilerKind::RenderPipeline,
            CompilerKind::ComputePipeline,
        ];
        self
    }

    pub fn failing_on(mut self, kind: CompilerKind) -> Self {
        self.failing.push(kind);
        self
    }

    /// Keeps every completion without ever firing it.
    pub fn hanging(mut self) -> Self {
        self.hanging = true;
        self
    }

    pub fn library_compiles(&self) -> usize {
        self.shared.library_compiles.load(Ordering::SeqCst)
    }

    pub fn render_compiles(&self) -> usize {
        self.shared.render_compiles.load(Ordering::SeqCst)
    }

    pub fn compute_compiles(&self) -> usize {
        self.shared.compute_compiles.load(Ordering::SeqCst)
    }

    pub fn render_descriptors(&self) -> Vec<RenderPipelineDescriptor> {
        self.shared.render_descriptors.lock().clone()
    }

    pub fn compute_descriptors(&self) -> Vec<ComputePipelineDescriptor> {
        self.shared.compute_descriptors.lock().clone()
    }

    fn finish<T>(&self, kind: CompilerKind, completion: Completion<T>, value: T)
    where
        T: Send + 'static,
    {
        if self.hanging {
            self.shared.parked.lock().push(Box::new(completion));
            return;
        }

        let result = match self.failing.contains(&kind) {
            true => Err(format!("{kind} rejected by mock compiler")),
            false => Ok(value),
        };

        match self.delay {
            Some(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    completion.complete(result);
                });
            }
            None => completion.complete(result),
        }
    }
}

impl NativeCompiler for MockCompiler {
    fn new_library(
        &self,
        shader: &ConvertedShader,
        _msl_version: [u8; 2],
        completion: Completion<NativeLibrary>,
    ) {
        self.shared.library_compiles.fetch_add(1, Ordering::SeqCst);
        let library = NativeLibrary::new(MockState {
            label: shader.entry_point.name.clone(),
        });
        self.finish(CompilerKind::Library, completion, library);
    }

    fn new_render_pipeline_state(
        &self,
        desc: &RenderPipelineDescriptor,
        completion: Completion<RenderPipelineState>,
    ) {
        self.shared.render_compiles.fetch_add(1, Ordering::SeqCst);
        self.shared.render_descriptors.lock().push(desc.clone());
        let state = RenderPipelineState::new(MockState {
            label: desc.label.clone(),
        });
        self.finish(CompilerKind::RenderPipeline, completion, state);
    }

    fn new_compute_pipeline_state(
        &self,
        desc: &ComputePipelineDescriptor,
        completion: Completion<ComputePipelineState>,
    ) {
        self.shared.compute_compiles.fetch_add(1, Ordering::SeqCst);
        self.shared.compute_descriptors.lock().push(desc.clone());
        let state = ComputePipelineState::new(MockState {
            label: desc.label.clone(),
        });
        self.finish(CompilerKind::ComputePipeline, completion, state);
    }
}

#[derive(Default)]
struct ConverterShared {
    conversions: AtomicUsize,
    contexts: Mutex<Vec<ConverterContext>>,
}

/// Converter that emits placeholder source with fixed reflection.
///
/// Every stage writes a `vec4<f32>` at location 0 and a `vec2<f32>` at location 1.
/// Tessellation control also writes a per-patch `vec4<f32>` at location 2,
/// which tessellation evaluation reads besides locations 0 and 1.
#[derive(Clone)]
pub struct MockConverter {
    input_locations: Vec<u32>,
    aux_buffer: bool,
    failing: Option<ShaderStage>,
    tessellation: TessReflection,
    shared: Arc<ConverterShared>,
}

impl MockConverter {
    pub const TESSELLATION: TessReflection = TessReflection {
        patch_kind: TessPatchKind::Triangles,
        partition: TessPartition::Equal,
        output_control_points: 3,
        output_winding: FrontFace::CounterClockwise,
        point_mode: false,
    };

    pub fn new() -> Self {
        MockConverter {
            input_locations: vec![0, 1],
            aux_buffer: false,
            failing: None,
            tessellation: Self::TESSELLATION,
            shared: Arc::default(),
        }
    }

    /// Every stage reports that it uses the auxiliary buffer.
    pub fn with_aux_buffer(mut self) -> Self {
        self.aux_buffer = true;
        self
    }

    pub fn with_tessellation(mut self, reflection: TessReflection) -> Self {
        self.tessellation = reflection;
        self
    }

    pub fn failing_on(mut self, stage: ShaderStage) -> Self {
        self.failing = Some(stage);
        self
    }

    pub fn conversions(&self) -> usize {
        self.shared.conversions.load(Ordering::SeqCst)
    }

    /// Contexts of every conversion, in call order.
    pub fn contexts(&self) -> Vec<ConverterContext> {
        self.shared.contexts.lock().clone()
    }
}

fn output(location: u32, components: u32, per_patch: bool) -> ShaderOutput {
    ShaderOutput {
        location: Some(location),
        kind: ScalarKind::Float,
        components,
        per_patch,
    }
}

impl ShaderConverter for MockConverter {
    fn convert(
        &self,
        module: &ShaderModule,
        context: &ConverterContext,
    ) -> Result<ConvertedShader, ConvertError> {
        self.shared.conversions.fetch_add(1, Ordering::SeqCst);
        self.shared.contexts.lock().push(context.clone());

        let stage = context.stage;
        if self.failing == Some(stage) {
            return Err(ConvertError::Translate(format!(
                "mock converter rejects {stage} shaders"
            )));
        }

        let mut outputs = vec![output(0, 4, false), output(1, 2, false)];
        if stage == ShaderStage::TessControl {
            outputs.push(output(2, 4, true));
        }

        Ok(ConvertedShader {
            msl: format!(
                "// {} {} {:016x}\n",
                stage,
                context.entry_point,
                module.key().hash
            ),
            entry_point: EntryPointInfo {
                name: context.entry_point.clone(),
                workgroup_size: match stage {
                    ShaderStage::Compute => [8, 8, 1],
                    _ => [1, 1, 1],
                },
                input_locations: match stage {
                    ShaderStage::TessEvaluation => {
                        self.input_locations.iter().copied().chain([2]).collect()
                    }
                    _ => self.input_locations.clone(),
                },
                outputs,
                needs_aux_buffer: self.aux_buffer,
                needs_output_buffer: context.capture_output || stage == ShaderStage::TessControl,
                needs_patch_output_buffer: stage == ShaderStage::TessControl,
                needs_input: stage == ShaderStage::TessControl,
            },
        })
    }

    fn reflect_tessellation(
        &self,
        _tess_control: (&ShaderModule, &str),
        _tess_evaluation: (&ShaderModule, &str),
    ) -> Result<TessReflection, ConvertError> {
        Ok(self.tessellation)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BinderEvent {
    Set {
        index: u32,
        name: String,
        dynamic_offsets: Vec<u32>,
    },
    Resource {
        stage: ShaderStage,
        kind: DescriptorKind,
        slots: ResourceSlots,
        resource: u32,
    },
}

/// Descriptor binder whose sets are names and resources are numbers.
#[derive(Debug, Default)]
pub struct RecordingBinder {
    pub events: Vec<BinderEvent>,
}

impl DescriptorBinder for RecordingBinder {
    type Set = str;
    type Resource = u32;

    fn bind_set(
        &mut self,
        index: u32,
        set: &str,
        _layout: &DescriptorSetLayout,
        _base: &StageMap<ResourceCounts>,
        dynamic_offsets: &[u32],
    ) {
        self.events.push(BinderEvent::Set {
            index,
            name: set.to_owned(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn bind_resource(
        &mut self,
        stage: ShaderStage,
        kind: DescriptorKind,
        slots: ResourceSlots,
        resource: &u32,
    ) {
        self.events.push(BinderEvent::Resource {
            stage,
            kind,
            slots,
            resource: *resource,
        });
    }
}

#[derive(Debug, PartialEq)]
pub enum EncoderEvent {
    Render { label: String },
    Compute { label: String, threadgroup_size: Size },
    RenderState(RenderEncoderState),
    AuxBuffer { stage: ShaderStage, slot: u32 },
}

/// Command encoder recording every call a pipeline makes.
#[derive(Debug, Default)]
pub struct RecordingEncoder {
    pub values: DynamicStateValues,
    pub index_type: Option<IndexType>,
    pub events: Vec<EncoderEvent>,
}

fn label_of(state: Option<&MockState>) -> String {
    state.map_or_else(String::new, |state| state.label.clone())
}

impl CommandEncoder for RecordingEncoder {
    fn dynamic_values(&self) -> &DynamicStateValues {
        &self.values
    }

    fn index_type(&self) -> Option<IndexType> {
        self.index_type
    }

    fn set_render_pipeline_state(&mut self, state: &RenderPipelineState) {
        self.events.push(EncoderEvent::Render {
            label: label_of(state.downcast_ref()),
        });
    }

    fn set_compute_pipeline_state(&mut self, state: &ComputePipelineState, threadgroup_size: Size) {
        self.events.push(EncoderEvent::Compute {
            label: label_of(state.downcast_ref()),
            threadgroup_size,
        });
    }

    fn set_render_state(&mut self, state: &RenderEncoderState) {
        self.events.push(EncoderEvent::RenderState(state.clone()));
    }

    fn use_aux_buffer(&mut self, stage: ShaderStage, slot: u32) {
        self.events.push(EncoderEvent::AuxBuffer { stage, slot });
    }
}
