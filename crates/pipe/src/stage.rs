use std::{
    fmt,
    ops::{Index, IndexMut},
};

use serde::{Deserialize, Serialize};

/// Programmable stage of a portable pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShaderStage {
    Vertex,
    TessControl,
    TessEvaluation,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const COUNT: usize = 5;

    pub const ALL: [ShaderStage; Self::COUNT] = [
        ShaderStage::Vertex,
        ShaderStage::TessControl,
        ShaderStage::TessEvaluation,
        ShaderStage::Fragment,
        ShaderStage::Compute,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline(always)]
    pub const fn bit(self) -> ShaderStages {
        ShaderStages::from_bits_truncate(1 << self as u32)
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "vertex"),
            ShaderStage::TessControl => write!(f, "tessellation control"),
            ShaderStage::TessEvaluation => write!(f, "tessellation evaluation"),
            ShaderStage::Fragment => write!(f, "fragment"),
            ShaderStage::Compute => write!(f, "compute"),
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderStages : u32 {
        const VERTEX = 1 << ShaderStage::Vertex as u32;
        const TESS_CONTROL = 1 << ShaderStage::TessControl as u32;
        const TESS_EVALUATION = 1 << ShaderStage::TessEvaluation as u32;
        const FRAGMENT = 1 << ShaderStage::Fragment as u32;
        const COMPUTE = 1 << ShaderStage::Compute as u32;

        const ALL_GRAPHICS = Self::VERTEX.bits()
            | Self::TESS_CONTROL.bits()
            | Self::TESS_EVALUATION.bits()
            | Self::FRAGMENT.bits();
    }
}

impl ShaderStages {
    #[inline]
    pub fn has(&self, stage: ShaderStage) -> bool {
        self.contains(stage.bit())
    }
}

/// Fixed table with one value per [`ShaderStage`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StageMap<T>(pub [T; ShaderStage::COUNT]);

impl<T> StageMap<T> {
    #[inline]
    pub fn from_fn(mut f: impl FnMut(ShaderStage) -> T) -> Self {
        StageMap(ShaderStage::ALL.map(|stage| f(stage)))
    }

    #[inline]
    pub fn splat(value: T) -> Self
    where
        T: Copy,
    {
        StageMap([value; ShaderStage::COUNT])
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShaderStage, &T)> + '_ {
        ShaderStage::ALL.into_iter().zip(self.0.iter())
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> StageMap<U> {
        StageMap::from_fn(|stage| f(&self[stage]))
    }
}

impl<T> Index<ShaderStage> for StageMap<T> {
    type Output = T;

    #[inline(always)]
    fn index(&self, stage: ShaderStage) -> &T {
        &self.0[stage.index()]
    }
}

impl<T> IndexMut<ShaderStage> for StageMap<T> {
    #[inline(always)]
    fn index_mut(&mut self, stage: ShaderStage) -> &mut T {
        &mut self.0[stage.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_bits_match_enum_order() {
        for stage in ShaderStage::ALL {
            assert!(stage.bit().has(stage));
            assert_eq!(stage.bit().bits().count_ones(), 1);
        }
        assert!(!ShaderStages::ALL_GRAPHICS.has(ShaderStage::Compute));
    }

    #[test]
    fn stage_map_indexing() {
        let mut map = StageMap::splat(0u32);
        map[ShaderStage::Fragment] = 7;
        assert_eq!(map.0[3], 7);
        let doubled = map.map(|v| v * 2);
        assert_eq!(doubled[ShaderStage::Fragment], 14);
        assert_eq!(map.iter().filter(|(_, v)| **v != 0).count(), 1);
    }
}
