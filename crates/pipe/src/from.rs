use crate::{
    desc::{
        BlendFactor, BlendOp, ColorComponents, CompareOp, CullMode, FrontFace, PolygonMode,
        PrimitiveTopology, Rect, StencilOp, StencilOpState, VertexInputRate, Viewport,
    },
    converter::TessPartition,
    native,
};

pub trait MetalFrom<T> {
    fn metal_from(t: T) -> Self;
}

pub trait IntoMetal<T> {
    fn into_metal(self) -> T;
}

impl<T, U> IntoMetal<U> for T
where
    U: MetalFrom<T>,
{
    #[inline(always)]
    fn into_metal(self) -> U {
        U::metal_from(self)
    }
}

pub trait TryMetalFrom<T>: Sized {
    fn try_metal_from(t: T) -> Option<Self>;
}

pub trait TryIntoMetal<T> {
    fn try_into_metal(self) -> Option<T>;
}

impl<T, U> TryIntoMetal<U> for T
where
    U: TryMetalFrom<T>,
{
    #[inline(always)]
    fn try_into_metal(self) -> Option<U> {
        U::try_metal_from(self)
    }
}

impl TryMetalFrom<PrimitiveTopology> for native::PrimitiveType {
    /// Triangle fans have no native primitive.
    #[inline(always)]
    fn try_metal_from(t: PrimitiveTopology) -> Option<Self> {
        Some(match t {
            PrimitiveTopology::PointList => native::PrimitiveType::Point,
            PrimitiveTopology::LineList => native::PrimitiveType::Line,
            PrimitiveTopology::LineStrip => native::PrimitiveType::LineStrip,
            PrimitiveTopology::TriangleList => native::PrimitiveType::Triangle,
            PrimitiveTopology::TriangleStrip => native::PrimitiveType::TriangleStrip,
            PrimitiveTopology::TriangleFan => return None,
            // Patches are drawn by the emulation passes.
            PrimitiveTopology::PatchList => native::PrimitiveType::Point,
        })
    }
}

impl MetalFrom<PrimitiveTopology> for native::PrimitiveTopologyClass {
    #[inline(always)]
    fn metal_from(t: PrimitiveTopology) -> Self {
        match t {
            PrimitiveTopology::PointList => native::PrimitiveTopologyClass::Point,
            PrimitiveTopology::LineList | PrimitiveTopology::LineStrip => {
                native::PrimitiveTopologyClass::Line
            }
            PrimitiveTopology::TriangleList
            | PrimitiveTopology::TriangleStrip
            | PrimitiveTopology::TriangleFan => native::PrimitiveTopologyClass::Triangle,
            PrimitiveTopology::PatchList => native::PrimitiveTopologyClass::Unspecified,
        }
    }
}

impl MetalFrom<FrontFace> for native::Winding {
    #[inline(always)]
    fn metal_from(t: FrontFace) -> Self {
        match t {
            FrontFace::Clockwise => native::Winding::Clockwise,
            FrontFace::CounterClockwise => native::Winding::CounterClockwise,
        }
    }
}

impl MetalFrom<CullMode> for native::CullMode {
    /// Culling both faces is emulated by disabling rasterization.
    #[inline(always)]
    fn metal_from(t: CullMode) -> Self {
        match t {
            CullMode::None | CullMode::FrontAndBack => native::CullMode::None,
            CullMode::Front => native::CullMode::Front,
            CullMode::Back => native::CullMode::Back,
        }
    }
}

impl MetalFrom<PolygonMode> for native::TriangleFillMode {
    #[inline(always)]
    fn metal_from(t: PolygonMode) -> Self {
        match t {
            PolygonMode::Fill | PolygonMode::Point => native::TriangleFillMode::Fill,
            PolygonMode::Line => native::TriangleFillMode::Lines,
        }
    }
}

impl MetalFrom<bool> for native::DepthClipMode {
    /// Maps the depth clamp flag.
    #[inline(always)]
    fn metal_from(clamp: bool) -> Self {
        match clamp {
            true => native::DepthClipMode::Clamp,
            false => native::DepthClipMode::Clip,
        }
    }
}

impl MetalFrom<CompareOp> for native::CompareFunction {
    #[inline(always)]
    fn metal_from(t: CompareOp) -> Self {
        match t {
            CompareOp::Never => native::CompareFunction::Never,
            CompareOp::Less => native::CompareFunction::Less,
            CompareOp::Equal => native::CompareFunction::Equal,
            CompareOp::LessOrEqual => native::CompareFunction::LessEqual,
            CompareOp::Greater => native::CompareFunction::Greater,
            CompareOp::NotEqual => native::CompareFunction::NotEqual,
            CompareOp::GreaterOrEqual => native::CompareFunction::GreaterEqual,
            CompareOp::Always => native::CompareFunction::Always,
        }
    }
}

impl MetalFrom<StencilOp> for native::StencilOperation {
    #[inline(always)]
    fn metal_from(t: StencilOp) -> Self {
        match t {
            StencilOp::Keep => native::StencilOperation::Keep,
            StencilOp::Zero => native::StencilOperation::Zero,
            StencilOp::Replace => native::StencilOperation::Replace,
            StencilOp::IncrementAndClamp => native::StencilOperation::IncrementClamp,
            StencilOp::DecrementAndClamp => native::StencilOperation::DecrementClamp,
            StencilOp::Invert => native::StencilOperation::Invert,
            StencilOp::IncrementAndWrap => native::StencilOperation::IncrementWrap,
            StencilOp::DecrementAndWrap => native::StencilOperation::DecrementWrap,
        }
    }
}

impl MetalFrom<StencilOpState> for native::StencilDescriptor {
    #[inline(always)]
    fn metal_from(t: StencilOpState) -> Self {
        native::StencilDescriptor {
            compare_function: t.compare.into_metal(),
            stencil_failure: t.fail.into_metal(),
            depth_failure: t.depth_fail.into_metal(),
            depth_stencil_pass: t.pass.into_metal(),
            read_mask: t.compare_mask,
            write_mask: t.write_mask,
        }
    }
}

impl MetalFrom<BlendOp> for native::BlendOperation {
    #[inline(always)]
    fn metal_from(t: BlendOp) -> Self {
        match t {
            BlendOp::Add => native::BlendOperation::Add,
            BlendOp::Subtract => native::BlendOperation::Subtract,
            BlendOp::ReverseSubtract => native::BlendOperation::ReverseSubtract,
            BlendOp::Min => native::BlendOperation::Min,
            BlendOp::Max => native::BlendOperation::Max,
        }
    }
}

impl MetalFrom<BlendFactor> for native::BlendFactor {
    #[inline(always)]
    fn metal_from(t: BlendFactor) -> Self {
        match t {
            BlendFactor::Zero => native::BlendFactor::Zero,
            BlendFactor::One => native::BlendFactor::One,
            BlendFactor::SrcColor => native::BlendFactor::SourceColor,
            BlendFactor::OneMinusSrcColor => native::BlendFactor::OneMinusSourceColor,
            BlendFactor::SrcAlpha => native::BlendFactor::SourceAlpha,
            BlendFactor::OneMinusSrcAlpha => native::BlendFactor::OneMinusSourceAlpha,
            BlendFactor::DstColor => native::BlendFactor::DestinationColor,
            BlendFactor::OneMinusDstColor => native::BlendFactor::OneMinusDestinationColor,
            BlendFactor::DstAlpha => native::BlendFactor::DestinationAlpha,
            BlendFactor::OneMinusDstAlpha => native::BlendFactor::OneMinusDestinationAlpha,
            BlendFactor::SrcAlphaSaturate => native::BlendFactor::SourceAlphaSaturated,
            BlendFactor::ConstantColor => native::BlendFactor::BlendColor,
            BlendFactor::OneMinusConstantColor => native::BlendFactor::OneMinusBlendColor,
            BlendFactor::ConstantAlpha => native::BlendFactor::BlendAlpha,
            BlendFactor::OneMinusConstantAlpha => native::BlendFactor::OneMinusBlendAlpha,
        }
    }
}

impl MetalFrom<ColorComponents> for native::ColorWriteMask {
    #[inline(always)]
    fn metal_from(t: ColorComponents) -> Self {
        let mut mask = native::ColorWriteMask::empty();
        if t.contains(ColorComponents::R) {
            mask |= native::ColorWriteMask::RED;
        }
        if t.contains(ColorComponents::G) {
            mask |= native::ColorWriteMask::GREEN;
        }
        if t.contains(ColorComponents::B) {
            mask |= native::ColorWriteMask::BLUE;
        }
        if t.contains(ColorComponents::A) {
            mask |= native::ColorWriteMask::ALPHA;
        }
        mask
    }
}

impl MetalFrom<VertexInputRate> for (native::VertexStepFunction, u32) {
    /// Returns step function and step rate.
    #[inline(always)]
    fn metal_from(t: VertexInputRate) -> Self {
        match t {
            VertexInputRate::Vertex => (native::VertexStepFunction::PerVertex, 1),
            VertexInputRate::Instance { divisor: 0 } => (native::VertexStepFunction::Constant, 0),
            VertexInputRate::Instance { divisor } => {
                (native::VertexStepFunction::PerInstance, divisor)
            }
        }
    }
}

impl MetalFrom<TessPartition> for native::TessellationPartitionMode {
    #[inline(always)]
    fn metal_from(t: TessPartition) -> Self {
        match t {
            TessPartition::Equal => native::TessellationPartitionMode::Integer,
            TessPartition::FractionalOdd => native::TessellationPartitionMode::FractionalOdd,
            TessPartition::FractionalEven => native::TessellationPartitionMode::FractionalEven,
        }
    }
}

impl MetalFrom<Viewport> for native::Viewport {
    #[inline(always)]
    fn metal_from(t: Viewport) -> Self {
        native::Viewport {
            origin_x: t.x.into(),
            origin_y: t.y.into(),
            width: t.width.into(),
            height: t.height.into(),
            znear: t.min_depth.into(),
            zfar: t.max_depth.into(),
        }
    }
}

impl MetalFrom<Rect> for native::ScissorRect {
    /// Negative offsets are clamped to the render target origin.
    #[inline(always)]
    fn metal_from(t: Rect) -> Self {
        let x = t.x.max(0);
        let y = t.y.max(0);
        native::ScissorRect {
            x: x as u32,
            y: y as u32,
            width: t.width.saturating_sub(x.abs_diff(t.x)),
            height: t.height.saturating_sub(y.abs_diff(t.y)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_tables() {
        let strip: Option<native::PrimitiveType> = PrimitiveTopology::TriangleStrip.try_into_metal();
        assert_eq!(strip, Some(native::PrimitiveType::TriangleStrip));
        let fan: Option<native::PrimitiveType> = PrimitiveTopology::TriangleFan.try_into_metal();
        assert_eq!(fan, None);
        let class: native::PrimitiveTopologyClass = PrimitiveTopology::LineStrip.into_metal();
        assert_eq!(class, native::PrimitiveTopologyClass::Line);
    }

    #[test]
    fn instance_divisor_zero_is_constant() {
        let (step, rate): (native::VertexStepFunction, u32) =
            VertexInputRate::Instance { divisor: 0 }.into_metal();
        assert_eq!(step, native::VertexStepFunction::Constant);
        assert_eq!(rate, 0);
    }

    #[test]
    fn scissor_clamps_negative_origin() {
        let rect: native::ScissorRect = Rect {
            x: -10,
            y: 5,
            width: 100,
            height: 20,
        }
        .into_metal();
        assert_eq!(
            rect,
            native::ScissorRect {
                x: 0,
                y: 5,
                width: 90,
                height: 20,
            }
        );
    }

    #[test]
    fn write_mask_bits() {
        let mask: native::ColorWriteMask = (ColorComponents::R | ColorComponents::A).into_metal();
        assert_eq!(mask, native::ColorWriteMask::RED | native::ColorWriteMask::ALPHA);
    }
}
