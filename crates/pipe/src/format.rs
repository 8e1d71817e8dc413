use serde::{Deserialize, Serialize};

/// Format of a render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    R8Unorm,
    R8Snorm,
    R8Uint,
    R8Sint,
    R16Uint,
    R16Sint,
    R16Float,
    R32Uint,
    R32Sint,
    R32Float,
    Rg8Unorm,
    Rg16Float,
    Rg32Float,
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba8Uint,
    Rgba16Float,
    Rgba32Float,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgb10a2Unorm,
    D16Unorm,
    D32Float,
    S8Uint,
    D24UnormS8Uint,
    D32FloatS8Uint,
}

impl PixelFormat {
    #[inline]
    pub fn is_color(&self) -> bool {
        !self.is_depth() && !self.is_stencil()
    }

    #[inline]
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            PixelFormat::D16Unorm
                | PixelFormat::D32Float
                | PixelFormat::D24UnormS8Uint
                | PixelFormat::D32FloatS8Uint
        )
    }

    #[inline]
    pub fn is_stencil(&self) -> bool {
        matches!(
            self,
            PixelFormat::S8Uint | PixelFormat::D24UnormS8Uint | PixelFormat::D32FloatS8Uint
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexFormat {
    Uint8x2,
    Uint8x4,
    Sint8x2,
    Sint8x4,
    Unorm8x2,
    Unorm8x4,
    Snorm8x2,
    Snorm8x4,
    Uint16x2,
    Uint16x4,
    Sint16x2,
    Sint16x4,
    Unorm16x2,
    Unorm16x4,
    Snorm16x2,
    Snorm16x4,
    Float16,
    Float16x2,
    Float16x3,
    Float16x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    /// Size of one element in bytes.
    pub fn size(&self) -> u32 {
        match self {
            VertexFormat::Uint8x2
            | VertexFormat::Sint8x2
            | VertexFormat::Unorm8x2
            | VertexFormat::Snorm8x2
            | VertexFormat::Float16 => 2,
            VertexFormat::Float16x3 => 6,
            VertexFormat::Uint8x4
            | VertexFormat::Sint8x4
            | VertexFormat::Unorm8x4
            | VertexFormat::Snorm8x4
            | VertexFormat::Uint16x2
            | VertexFormat::Sint16x2
            | VertexFormat::Unorm16x2
            | VertexFormat::Snorm16x2
            | VertexFormat::Float16x2
            | VertexFormat::Uint32
            | VertexFormat::Sint32
            | VertexFormat::Float32 => 4,
            VertexFormat::Uint16x4
            | VertexFormat::Sint16x4
            | VertexFormat::Unorm16x4
            | VertexFormat::Snorm16x4
            | VertexFormat::Float16x4
            | VertexFormat::Uint32x2
            | VertexFormat::Sint32x2
            | VertexFormat::Float32x2 => 8,
            VertexFormat::Uint32x3 | VertexFormat::Sint32x3 | VertexFormat::Float32x3 => 12,
            VertexFormat::Uint32x4 | VertexFormat::Sint32x4 | VertexFormat::Float32x4 => 16,
        }
    }

    /// 32-bit format that holds a shader interface variable with `components` components.
    pub fn for_interface(kind: ScalarKind, components: u32) -> Option<Self> {
        Some(match (kind, components) {
            (ScalarKind::Float, 1) => VertexFormat::Float32,
            (ScalarKind::Float, 2) => VertexFormat::Float32x2,
            (ScalarKind::Float, 3) => VertexFormat::Float32x3,
            (ScalarKind::Float, 4) => VertexFormat::Float32x4,
            (ScalarKind::Uint, 1) => VertexFormat::Uint32,
            (ScalarKind::Uint, 2) => VertexFormat::Uint32x2,
            (ScalarKind::Uint, 3) => VertexFormat::Uint32x3,
            (ScalarKind::Uint, 4) => VertexFormat::Uint32x4,
            (ScalarKind::Sint, 1) => VertexFormat::Sint32,
            (ScalarKind::Sint, 2) => VertexFormat::Sint32x2,
            (ScalarKind::Sint, 3) => VertexFormat::Sint32x3,
            (ScalarKind::Sint, 4) => VertexFormat::Sint32x4,
            _ => return None,
        })
    }
}

/// Scalar type of a shader interface variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Float,
    Uint,
    Sint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_stencil_classification() {
        assert!(PixelFormat::D24UnormS8Uint.is_depth());
        assert!(PixelFormat::D24UnormS8Uint.is_stencil());
        assert!(!PixelFormat::D32Float.is_stencil());
        assert!(PixelFormat::Bgra8Unorm.is_color());
        assert!(!PixelFormat::S8Uint.is_color());
    }

    #[test]
    fn interface_formats() {
        assert_eq!(
            VertexFormat::for_interface(ScalarKind::Float, 4),
            Some(VertexFormat::Float32x4)
        );
        assert_eq!(VertexFormat::for_interface(ScalarKind::Sint, 5), None);
        assert_eq!(VertexFormat::Float32x3.size(), 12);
    }
}
