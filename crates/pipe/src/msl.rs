//! [`ShaderConverter`] backed by `naga`.
//!
//! Handles vertex, fragment and compute stages that run natively.
//! Capture of vertex outputs and tessellation emulation need a converter
//! with compute-stage lowering and are reported as unsupported.

use std::collections::BTreeMap;

use codespan_reporting::{
    diagnostic::{Diagnostic, Label},
    files::SimpleFile,
    term::{self, termcolor::Buffer},
};
use naga::back::msl;

use crate::{
    converter::{
        ConvertError, ConvertedShader, ConverterContext, EntryPointInfo, ShaderConverter,
        ShaderLanguage, ShaderModule, ShaderOutput, TessReflection,
    },
    format::ScalarKind,
    stage::ShaderStage,
};

/// Name of the struct naga emits when an entry point reads runtime array lengths.
const BUFFER_SIZES: &str = "_buffer_sizes";

#[derive(Clone, Copy, Debug, Default)]
pub struct NagaConverter {
    adjust_coordinate_space: bool,
}

impl NagaConverter {
    pub fn new() -> Self {
        NagaConverter::default()
    }

    /// Flip Y of SPIR-V vertex positions to match the native clip space.
    pub fn with_adjust_coordinate_space(mut self, adjust: bool) -> Self {
        self.adjust_coordinate_space = adjust;
        self
    }

    fn parse(
        &self,
        module: &ShaderModule,
    ) -> Result<(naga::Module, naga::valid::ModuleInfo), ConvertError> {
        let code = module.code();
        let mut source = None;

        let parsed = match module.language() {
            ShaderLanguage::SpirV => naga::front::spv::parse_u8_slice(
                code,
                &naga::front::spv::Options {
                    adjust_coordinate_space: self.adjust_coordinate_space,
                    ..Default::default()
                },
            )
            .map_err(|err| ConvertError::Parse(err.to_string()))?,
            ShaderLanguage::Wgsl => {
                let code =
                    std::str::from_utf8(code).map_err(|err| ConvertError::Parse(err.to_string()))?;
                source = Some(code);
                naga::front::wgsl::parse_str(code)
                    .map_err(|err| ConvertError::Parse(err.emit_to_string(code)))?
            }
        };

        let flags = naga::valid::ValidationFlags::all();
        let caps = naga::valid::Capabilities::PUSH_CONSTANT;
        let info = naga::valid::Validator::new(flags, caps)
            .validate(&parsed)
            .map_err(|err| {
                let filename = module.label().unwrap_or("<unnamed>");
                emit_annotated_error(&err, source.map(|source| (filename, source)));
                ConvertError::Validation(err.as_inner().to_string())
            })?;

        Ok((parsed, info))
    }
}

impl ShaderConverter for NagaConverter {
    fn convert(
        &self,
        module: &ShaderModule,
        context: &ConverterContext,
    ) -> Result<ConvertedShader, ConvertError> {
        let naga_stage = match context.stage {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
            stage @ (ShaderStage::TessControl | ShaderStage::TessEvaluation) => {
                return Err(ConvertError::Unsupported(format!("{stage} shaders")));
            }
        };

        if context.capture_output {
            return Err(ConvertError::Unsupported(
                "capturing stage outputs into a buffer".to_owned(),
            ));
        }

        let (parsed, info) = self.parse(module)?;

        let index = parsed
            .entry_points
            .iter()
            .position(|ep| ep.name == context.entry_point && ep.stage == naga_stage)
            .ok_or_else(|| ConvertError::EntryPointNotFound {
                entry: context.entry_point.clone(),
                stage: context.stage,
            })?;

        let options = msl::Options {
            lang_version: (context.msl_version[0], context.msl_version[1]),
            per_entry_point_map: BTreeMap::from([(
                context.entry_point.clone(),
                entry_point_resources(context)?,
            )]),
            fake_missing_bindings: false,
            ..Default::default()
        };
        let pipeline_options = msl::PipelineOptions {
            allow_and_force_point_size: context.point_size_builtin,
            ..Default::default()
        };

        let (source, translation) = msl::write_string(&parsed, &info, &options, &pipeline_options)
            .map_err(|err| ConvertError::Translate(err.to_string()))?;

        let name = match translation.entry_point_names.get(index) {
            Some(Ok(name)) => name.clone(),
            Some(Err(err)) => return Err(ConvertError::Translate(err.to_string())),
            None => {
                return Err(ConvertError::Translate(format!(
                    "entry point {:?} was not emitted",
                    context.entry_point
                )))
            }
        };

        let entry = &parsed.entry_points[index];
        let entry_point = EntryPointInfo {
            name,
            workgroup_size: match naga_stage {
                naga::ShaderStage::Compute => entry.workgroup_size,
                _ => [1, 1, 1],
            },
            input_locations: entry_inputs(&parsed, entry)
                .iter()
                .filter_map(|input| input.location)
                .collect(),
            outputs: entry_outputs(&parsed, entry),
            needs_aux_buffer: source.contains(BUFFER_SIZES),
            needs_output_buffer: false,
            needs_patch_output_buffer: false,
            needs_input: false,
        };

        tracing::debug!(
            "Converted {} entry point {:?} into MSL {}.{}",
            context.stage,
            context.entry_point,
            context.msl_version[0],
            context.msl_version[1]
        );

        Ok(ConvertedShader {
            msl: source,
            entry_point,
        })
    }

    fn reflect_tessellation(
        &self,
        _tess_control: (&ShaderModule, &str),
        _tess_evaluation: (&ShaderModule, &str),
    ) -> Result<TessReflection, ConvertError> {
        Err(ConvertError::Unsupported(
            "tessellation execution modes".to_owned(),
        ))
    }
}

fn slot(index: u32) -> Result<msl::Slot, ConvertError> {
    msl::Slot::try_from(index).map_err(|_| ConvertError::SlotOutOfRange(index))
}

fn entry_point_resources(
    context: &ConverterContext,
) -> Result<msl::EntryPointResources, ConvertError> {
    let mut resources = msl::BindingMap::new();
    for binding in &context.resources {
        let target = msl::BindTarget {
            buffer: binding.slots.buffer.map(slot).transpose()?,
            texture: binding.slots.texture.map(slot).transpose()?,
            sampler: binding
                .slots
                .sampler
                .map(slot)
                .transpose()?
                .map(msl::BindSamplerTarget::Resource),
            ..Default::default()
        };

        resources.insert(
            naga::ResourceBinding {
                group: binding.set,
                binding: binding.binding,
            },
            target,
        );
    }

    Ok(msl::EntryPointResources {
        resources,
        push_constant_buffer: context.push_constant_buffer.map(slot).transpose()?,
        sizes_buffer: context.aux_buffer.map(slot).transpose()?,
    })
}

fn interface(
    module: &naga::Module,
    ty: naga::Handle<naga::Type>,
    binding: Option<&naga::Binding>,
    out: &mut Vec<ShaderOutput>,
) {
    let inner = &module.types[ty].inner;
    match binding {
        Some(binding) => {
            let (scalar, components) = match *inner {
                naga::TypeInner::Scalar(scalar) => (scalar, 1),
                naga::TypeInner::Vector { size, scalar } => (scalar, size as u32),
                _ => return,
            };
            let kind = match scalar.kind {
                naga::ScalarKind::Float | naga::ScalarKind::AbstractFloat => ScalarKind::Float,
                naga::ScalarKind::Sint | naga::ScalarKind::AbstractInt => ScalarKind::Sint,
                naga::ScalarKind::Uint | naga::ScalarKind::Bool => ScalarKind::Uint,
            };
            let location = match *binding {
                naga::Binding::Location { location, .. } => Some(location),
                naga::Binding::BuiltIn(_) => None,
            };
            out.push(ShaderOutput {
                location,
                kind,
                components,
                per_patch: false,
            });
        }
        None => {
            if let naga::TypeInner::Struct { ref members, .. } = *inner {
                for member in members {
                    interface(module, member.ty, member.binding.as_ref(), out);
                }
            }
        }
    }
}

fn entry_inputs(module: &naga::Module, entry: &naga::EntryPoint) -> Vec<ShaderOutput> {
    let mut inputs = Vec::new();
    for arg in &entry.function.arguments {
        interface(module, arg.ty, arg.binding.as_ref(), &mut inputs);
    }
    inputs
}

fn entry_outputs(module: &naga::Module, entry: &naga::EntryPoint) -> Vec<ShaderOutput> {
    let mut outputs = Vec::new();
    if let Some(result) = &entry.function.result {
        interface(module, result.ty, result.binding.as_ref(), &mut outputs);
    }
    outputs
}

fn emit_annotated_error<E: std::error::Error>(
    error: &naga::WithSpan<E>,
    file: Option<(&str, &str)>,
) {
    if let Some((filename, source)) = file {
        let files = SimpleFile::new(filename, source);
        let config = term::Config::default();
        let mut writer = Buffer::no_color();

        let diagnostic = Diagnostic::error().with_labels(
            error
                .spans()
                .filter_map(|(span, desc)| {
                    Some(Label::primary((), span.to_range()?).with_message(desc.to_owned()))
                })
                .collect(),
        );

        if term::emit(&mut writer, &config, &files, &diagnostic).is_ok() {
            if let Ok(s) = std::str::from_utf8(writer.as_slice()) {
                tracing::event!(
                    target: "naga",
                    tracing::Level::ERROR,
                    error = error.as_inner().to_string(),
                    diagnostic = s,
                );
                return;
            }
        }
    }

    tracing::event!(
        target: "naga",
        tracing::Level::ERROR,
        error = error.as_inner().to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{binding::ResourceSlots, converter::ResourceBinding};

    const COMPUTE: &str = r#"
struct Params {
    scale: u32,
}

@group(0) @binding(0) var<storage, read_write> data: array<u32>;
@group(1) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(4, 2, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&data)) {
        data[id.x] = data[id.x] * params.scale;
    }
}
"#;

    const RENDER: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec4<f32>,
    @location(1) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(2) color: vec4<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = vec4<f32>(position, 1.0);
    out.color = color;
    out.uv = position.xy;
    return out;
}

@fragment
fn fs_main(@location(0) color: vec4<f32>) -> @location(0) vec4<f32> {
    return color;
}
"#;

    fn wgsl(source: &str) -> ShaderModule {
        crate::mock::init_logging();
        ShaderModule::new(ShaderLanguage::Wgsl, source.as_bytes()).with_label("test.wgsl")
    }

    fn buffer(set: u32, binding: u32, slot: u32) -> ResourceBinding {
        ResourceBinding {
            set,
            binding,
            count: 1,
            slots: ResourceSlots {
                buffer: Some(slot),
                texture: None,
                sampler: None,
            },
        }
    }

    fn compute_context() -> ConverterContext {
        let mut context = ConverterContext::new(ShaderStage::Compute, "main");
        context.resources = vec![buffer(0, 0, 0), buffer(1, 3, 5)];
        context.aux_buffer = Some(30);
        context
    }

    #[test]
    fn compute_reflects_workgroup_size_and_bindings() {
        let shader = NagaConverter::new()
            .convert(&wgsl(COMPUTE), &compute_context())
            .unwrap();

        assert_eq!(shader.entry_point.workgroup_size, [4, 2, 1]);
        assert!(shader.msl.contains("[[buffer(5)]]"));
        assert!(shader.entry_point.needs_aux_buffer);
        assert!(shader.msl.contains(&shader.entry_point.name));
    }

    #[test]
    fn vertex_reflects_interface() {
        let context = ConverterContext::new(ShaderStage::Vertex, "vs_main");
        let shader = NagaConverter::new()
            .convert(&wgsl(RENDER), &context)
            .unwrap();

        let entry = &shader.entry_point;
        assert_eq!(entry.input_locations, [0, 2]);
        assert!(!entry.needs_aux_buffer);

        let locations: Vec<_> = entry.outputs.iter().map(|o| o.location).collect();
        assert_eq!(locations, [None, Some(0), Some(1)]);
        assert_eq!(entry.outputs[2].components, 2);
        assert_eq!(entry.outputs[2].kind, ScalarKind::Float);
    }

    #[test]
    fn stage_selects_entry_point() {
        let converter = NagaConverter::new();
        let err = converter
            .convert(
                &wgsl(RENDER),
                &ConverterContext::new(ShaderStage::Fragment, "vs_main"),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ConvertError::EntryPointNotFound {
                stage: ShaderStage::Fragment,
                ..
            }
        ));

        let shader = converter
            .convert(
                &wgsl(RENDER),
                &ConverterContext::new(ShaderStage::Fragment, "fs_main"),
            )
            .unwrap();
        assert_eq!(shader.entry_point.input_locations, [0]);
    }

    #[test]
    fn unmapped_binding_fails() {
        let mut context = compute_context();
        context.resources.pop();
        let err = NagaConverter::new()
            .convert(&wgsl(COMPUTE), &context)
            .unwrap_err();
        assert!(matches!(err, ConvertError::Translate(_)));
    }

    #[test]
    fn slot_beyond_native_range_fails() {
        let mut context = compute_context();
        context.resources[1] = buffer(1, 3, 300);
        let err = NagaConverter::new()
            .convert(&wgsl(COMPUTE), &context)
            .unwrap_err();
        assert!(matches!(err, ConvertError::SlotOutOfRange(300)));
    }

    #[test]
    fn malformed_source_fails_to_parse() {
        let err = NagaConverter::new()
            .convert(
                &wgsl("fn main( {"),
                &ConverterContext::new(ShaderStage::Compute, "main"),
            )
            .unwrap_err();
        assert!(matches!(err, ConvertError::Parse(_)));
    }

    #[test]
    fn emulated_stages_are_unsupported() {
        let converter = NagaConverter::new();
        let module = wgsl(RENDER);

        let tess = ConverterContext::new(ShaderStage::TessControl, "main");
        assert!(matches!(
            converter.convert(&module, &tess),
            Err(ConvertError::Unsupported(_))
        ));

        let mut capture = ConverterContext::new(ShaderStage::Vertex, "vs_main");
        capture.capture_output = true;
        assert!(matches!(
            converter.convert(&module, &capture),
            Err(ConvertError::Unsupported(_))
        ));

        assert!(matches!(
            converter.reflect_tessellation((&module, "tcs"), (&module, "tes")),
            Err(ConvertError::Unsupported(_))
        ));
    }
}
