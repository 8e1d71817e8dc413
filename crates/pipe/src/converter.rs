//! Shader modules and the bytecode to native shading language converter seam.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    binding::ResourceSlots,
    desc::{FrontFace, SpecializationConstant},
    format::{ScalarKind, VertexFormat},
    stage::ShaderStage,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderLanguage {
    SpirV,
    Wgsl,
}

impl ShaderLanguage {
    fn tag(self) -> u8 {
        match self {
            ShaderLanguage::SpirV => 0,
            ShaderLanguage::Wgsl => 1,
        }
    }
}

/// Leading 64 bits of SHA-256 over the language tag and the code.
///
/// Persisted in serialized caches, so it must not change between builds.
fn module_hash(language: ShaderLanguage, code: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update([language.tag()]);
    hasher.update(code);
    let digest = hasher.finalize();

    let mut prefix = [0; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

/// Identity of a shader module's code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShaderModuleKey {
    pub hash: u64,
    pub size: u64,
}

pub struct ShaderModule {
    key: ShaderModuleKey,
    language: ShaderLanguage,
    code: Box<[u8]>,
    label: Option<String>,
}

impl fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderModule")
            .field("key", &self.key)
            .field("language", &self.language)
            .field("label", &self.label)
            .finish()
    }
}

impl ShaderModule {
    pub fn new(language: ShaderLanguage, code: impl Into<Box<[u8]>>) -> Self {
        let code = code.into();
        let key = ShaderModuleKey {
            hash: module_hash(language, &code),
            size: code.len() as u64,
        };

        ShaderModule {
            key,
            language,
            code,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[inline]
    pub fn key(&self) -> ShaderModuleKey {
        self.key
    }

    #[inline]
    pub fn language(&self) -> ShaderLanguage {
        self.language
    }

    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[inline]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

/// Native slots of one descriptor binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceBinding {
    pub set: u32,
    pub binding: u32,
    pub count: u32,
    pub slots: ResourceSlots,
}

/// Interface variable written by a stage or read by the next one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShaderOutput {
    /// `None` for builtins.
    pub location: Option<u32>,
    pub kind: ScalarKind,
    pub components: u32,
    pub per_patch: bool,
}

impl ShaderOutput {
    #[inline]
    pub fn is_builtin(&self) -> bool {
        self.location.is_none()
    }

    pub fn format(&self) -> Option<VertexFormat> {
        VertexFormat::for_interface(self.kind, self.components)
    }
}

/// Everything besides the module that affects the generated native source.
///
/// Two conversions of one module with equal contexts produce the same result,
/// which makes the context part of the pipeline cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConverterContext {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub specialization: Vec<SpecializationConstant>,
    pub msl_version: [u8; 2],

    pub resources: Vec<ResourceBinding>,
    pub push_constant_buffer: Option<u32>,
    pub aux_buffer: Option<u32>,
    pub indirect_params_buffer: Option<u32>,
    pub output_buffer: Option<u32>,
    pub patch_output_buffer: Option<u32>,
    pub tess_level_buffer: Option<u32>,
    pub texture_count: u32,
    pub full_image_view_swizzle: bool,

    /// Stage writes its outputs into the output buffer instead of passing them on.
    pub capture_output: bool,
    pub rasterization_enabled: bool,
    pub point_size_builtin: bool,
    pub patch_control_points: u32,

    /// Outputs of the previous stage when it ran as a separate pass.
    pub stage_inputs: Vec<ShaderOutput>,
}

impl ConverterContext {
    pub fn new(stage: ShaderStage, entry_point: impl Into<String>) -> Self {
        ConverterContext {
            stage,
            entry_point: entry_point.into(),
            specialization: Vec::new(),
            msl_version: [2, 1],
            resources: Vec::new(),
            push_constant_buffer: None,
            aux_buffer: None,
            indirect_params_buffer: None,
            output_buffer: None,
            patch_output_buffer: None,
            tess_level_buffer: None,
            texture_count: 0,
            full_image_view_swizzle: false,
            capture_output: false,
            rasterization_enabled: true,
            point_size_builtin: false,
            patch_control_points: 0,
            stage_inputs: Vec::new(),
        }
    }

    pub fn resource(&self, set: u32, binding: u32) -> Option<&ResourceBinding> {
        self.resources
            .iter()
            .find(|r| r.set == set && r.binding == binding)
    }
}

/// Fetch locations of the outer and inner tessellation levels in the evaluation stage.
///
/// They follow the highest location among the outputs of the control stage.
pub fn tess_level_locations(stage_inputs: &[ShaderOutput]) -> [u32; 2] {
    let first = stage_inputs
        .iter()
        .filter_map(|input| input.location)
        .max()
        .map_or(0, |location| location + 1);
    [first, first + 1]
}

/// Reflection of the converted entry point.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryPointInfo {
    /// Function name in the native source.
    pub name: String,
    pub workgroup_size: [u32; 3],
    pub input_locations: Vec<u32>,
    pub outputs: Vec<ShaderOutput>,
    pub needs_aux_buffer: bool,
    pub needs_output_buffer: bool,
    pub needs_patch_output_buffer: bool,
    pub needs_input: bool,
}

impl EntryPointInfo {
    #[inline]
    pub fn consumes_location(&self, location: u32) -> bool {
        self.input_locations.contains(&location)
    }
}

/// Result of a conversion. This is what pipeline caches persist.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvertedShader {
    pub msl: String,
    pub entry_point: EntryPointInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TessPatchKind {
    Triangles,
    Quads,
    Isolines,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TessPartition {
    Equal,
    FractionalOdd,
    FractionalEven,
}

/// Execution modes declared by a tessellation shader pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TessReflection {
    pub patch_kind: TessPatchKind,
    pub partition: TessPartition,
    pub output_control_points: u32,
    pub output_winding: FrontFace,
    pub point_mode: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("failed to parse shader: {0}")]
    Parse(String),

    #[error("shader validation failed: {0}")]
    Validation(String),

    #[error("failed to generate native shader: {0}")]
    Translate(String),

    #[error("entry point {entry:?} for {stage} stage not found")]
    EntryPointNotFound { entry: String, stage: ShaderStage },

    #[error("native slot {0} is out of range")]
    SlotOutOfRange(u32),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Converts shader bytecode into native shading language.
pub trait ShaderConverter: Send + Sync {
    fn convert(
        &self,
        module: &ShaderModule,
        context: &ConverterContext,
    ) -> Result<ConvertedShader, ConvertError>;

    /// Reads execution modes of the tessellation stages.
    fn reflect_tessellation(
        &self,
        tess_control: (&ShaderModule, &str),
        tess_evaluation: (&ShaderModule, &str),
    ) -> Result<TessReflection, ConvertError>;
}
