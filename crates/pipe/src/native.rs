//! Native-side objects and descriptors.
//!
//! Compiled objects are opaque handles produced by a [`NativeCompiler`](crate::NativeCompiler).
//! Descriptors mirror what the native framework consumes when compiling
//! render and compute pipeline states.

use std::{any::Any, fmt, sync::Arc};

use crate::format::{PixelFormat, VertexFormat};

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            raw: Arc<dyn Any + Send + Sync>,
        }

        impl $name {
            pub fn new<T>(raw: T) -> Self
            where
                T: Any + Send + Sync,
            {
                $name { raw: Arc::new(raw) }
            }

            /// Returns the native object if it is of type `T`.
            #[inline]
            pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
                self.raw.downcast_ref()
            }

            /// Returns `true` if both handles refer to the same native object.
            #[inline]
            pub fn same(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.raw, &other.raw)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:p})", stringify!($name), Arc::as_ptr(&self.raw))
            }
        }
    };
}

native_handle! {
    /// Compiled native shader library.
    NativeLibrary
}

native_handle! {
    RenderPipelineState
}

native_handle! {
    ComputePipelineState
}

/// Function from a native library.
#[derive(Clone, Debug)]
pub struct NativeFunction {
    pub library: NativeLibrary,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Point,
    Line,
    LineStrip,
    Triangle,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveTopologyClass {
    Unspecified,
    Point,
    Line,
    Triangle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Winding {
    Clockwise,
    CounterClockwise,
}

impl Winding {
    #[inline]
    pub fn flipped(self) -> Self {
        match self {
            Winding::Clockwise => Winding::CounterClockwise,
            Winding::CounterClockwise => Winding::Clockwise,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriangleFillMode {
    Fill,
    Lines,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepthClipMode {
    Clip,
    Clamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StencilOperation {
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SourceColor,
    OneMinusSourceColor,
    SourceAlpha,
    OneMinusSourceAlpha,
    DestinationColor,
    OneMinusDestinationColor,
    DestinationAlpha,
    OneMinusDestinationAlpha,
    SourceAlphaSaturated,
    BlendColor,
    OneMinusBlendColor,
    BlendAlpha,
    OneMinusBlendAlpha,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask : u8 {
        const RED = 0x8;
        const GREEN = 0x4;
        const BLUE = 0x2;
        const ALPHA = 0x1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexStepFunction {
    Constant,
    PerVertex,
    PerInstance,
    PerPatch,
    PerPatchControlPoint,

    /// Compute stage input fetched by thread position.
    ThreadPositionInGridX,

    /// Compute stage input fetched through the index buffer.
    ThreadPositionInGridXIndexed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    UInt16,
    UInt32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TessellationPartitionMode {
    Pow2,
    Integer,
    FractionalOdd,
    FractionalEven,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TessellationFactorStepFunction {
    Constant,
    PerPatch,
    PerInstance,
    PerPatchAndPerInstance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TessellationControlPointIndexType {
    None,
    UInt16,
    UInt32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub origin_x: f64,
    pub origin_y: f64,
    pub width: f64,
    pub height: f64,
    pub znear: f64,
    pub zfar: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub buffer_index: u32,
    pub stride: u32,
    pub step_function: VertexStepFunction,
    pub step_rate: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttributeDescriptor {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
    pub buffer_index: u32,
}

/// Vertex fetch layout of a render pipeline or stage input of a compute pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexDescriptor {
    pub layouts: Vec<VertexBufferLayout>,
    pub attributes: Vec<VertexAttributeDescriptor>,
}

impl VertexDescriptor {
    pub fn layout(&self, buffer_index: u32) -> Option<&VertexBufferLayout> {
        self.layouts.iter().find(|l| l.buffer_index == buffer_index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorAttachmentDescriptor {
    pub format: PixelFormat,
    pub blending_enabled: bool,
    pub source_rgb_blend_factor: BlendFactor,
    pub destination_rgb_blend_factor: BlendFactor,
    pub rgb_blend_operation: BlendOperation,
    pub source_alpha_blend_factor: BlendFactor,
    pub destination_alpha_blend_factor: BlendFactor,
    pub alpha_blend_operation: BlendOperation,
    pub write_mask: ColorWriteMask,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TessellationDescriptor {
    pub partition_mode: TessellationPartitionMode,
    pub factor_step_function: TessellationFactorStepFunction,
    pub control_point_index_type: TessellationControlPointIndexType,
    pub max_factor: u32,
    pub output_winding: Winding,
}

#[derive(Clone, Debug)]
pub struct RenderPipelineDescriptor {
    pub label: String,
    pub vertex_function: Option<NativeFunction>,
    pub fragment_function: Option<NativeFunction>,
    pub vertex_descriptor: VertexDescriptor,
    pub color_attachments: Vec<ColorAttachmentDescriptor>,
    pub depth_attachment_format: Option<PixelFormat>,
    pub stencil_attachment_format: Option<PixelFormat>,
    pub sample_count: u32,
    pub alpha_to_coverage_enabled: bool,
    pub alpha_to_one_enabled: bool,
    pub rasterization_enabled: bool,
    pub input_primitive_topology: PrimitiveTopologyClass,
    pub tessellation: Option<TessellationDescriptor>,
}

impl RenderPipelineDescriptor {
    pub fn new(label: impl Into<String>) -> Self {
        RenderPipelineDescriptor {
            label: label.into(),
            vertex_function: None,
            fragment_function: None,
            vertex_descriptor: VertexDescriptor::default(),
            color_attachments: Vec::new(),
            depth_attachment_format: None,
            stencil_attachment_format: None,
            sample_count: 1,
            alpha_to_coverage_enabled: false,
            alpha_to_one_enabled: false,
            rasterization_enabled: true,
            input_primitive_topology: PrimitiveTopologyClass::Unspecified,
            tessellation: None,
        }
    }
}

/// Per-thread input fetched by a compute stage, like vertex fetch for render pipelines.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct StageInputDescriptor {
    pub layout: VertexDescriptor,
    pub index_type: Option<IndexType>,
    pub index_buffer_index: u32,
}

#[derive(Clone, Debug)]
pub struct ComputePipelineDescriptor {
    pub label: String,
    pub function: NativeFunction,
    pub stage_input: Option<StageInputDescriptor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilDescriptor {
    pub compare_function: CompareFunction,
    pub stencil_failure: StencilOperation,
    pub depth_failure: StencilOperation,
    pub depth_stencil_pass: StencilOperation,
    pub read_mask: u32,
    pub write_mask: u32,
}

impl StencilDescriptor {
    pub const DISABLED: Self = StencilDescriptor {
        compare_function: CompareFunction::Always,
        stencil_failure: StencilOperation::Keep,
        depth_failure: StencilOperation::Keep,
        depth_stencil_pass: StencilOperation::Keep,
        read_mask: !0,
        write_mask: !0,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilDescriptor {
    pub depth_compare_function: CompareFunction,
    pub depth_write_enabled: bool,
    pub front_face_stencil: StencilDescriptor,
    pub back_face_stencil: StencilDescriptor,
}

impl DepthStencilDescriptor {
    pub const DISABLED: Self = DepthStencilDescriptor {
        depth_compare_function: CompareFunction::Always,
        depth_write_enabled: false,
        front_face_stencil: StencilDescriptor::DISABLED,
        back_face_stencil: StencilDescriptor::DISABLED,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Size {
    pub const ONE: Self = Size {
        width: 1,
        height: 1,
        depth: 1,
    };
}
