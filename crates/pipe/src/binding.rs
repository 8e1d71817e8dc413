//! Native resource slot bookkeeping.
//!
//! Metal addresses buffers, textures and samplers of each stage through three
//! independent flat index spaces. Portable descriptor sets are packed into them
//! set after set, and the emulation machinery claims a few more buffer slots
//! on top of whatever the user declared.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::stage::{ShaderStage, StageMap};

/// Tessellation control stage reads captured vertex output from this slot.
pub const TESS_CTL_INPUT_BUFFER_INDEX: u32 = 30;

/// Tessellation control stage reads the index buffer from this slot.
pub const TESS_CTL_INDEX_BUFFER_INDEX: u32 = 29;

/// Tessellation evaluation stage reads per-control-point input from this slot.
pub const TESS_EVAL_INPUT_BUFFER_INDEX: u32 = 30;

/// Tessellation evaluation stage reads per-patch input from this slot.
pub const TESS_EVAL_PATCH_INPUT_BUFFER_INDEX: u32 = 29;

/// Tessellation evaluation stage reads tessellation levels from this slot.
pub const TESS_EVAL_LEVEL_BUFFER_INDEX: u32 = 28;

/// Number of native resources of each category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub buffers: u32,
    pub textures: u32,
    pub samplers: u32,
}

impl ResourceCounts {
    pub const ZERO: Self = ResourceCounts {
        buffers: 0,
        textures: 0,
        samplers: 0,
    };

    pub const BUFFER: Self = ResourceCounts {
        buffers: 1,
        ..Self::ZERO
    };

    pub const TEXTURE: Self = ResourceCounts {
        textures: 1,
        ..Self::ZERO
    };

    pub const SAMPLER: Self = ResourceCounts {
        samplers: 1,
        ..Self::ZERO
    };

    #[inline]
    pub const fn scaled(self, count: u32) -> Self {
        ResourceCounts {
            buffers: self.buffers * count,
            textures: self.textures * count,
            samplers: self.samplers * count,
        }
    }

    #[inline]
    pub fn max(self, other: Self) -> Self {
        ResourceCounts {
            buffers: self.buffers.max(other.buffers),
            textures: self.textures.max(other.textures),
            samplers: self.samplers.max(other.samplers),
        }
    }

    /// Returns `true` if every category fits into `limits`.
    #[inline]
    pub fn fits(&self, limits: &ResourceCounts) -> bool {
        self.buffers <= limits.buffers
            && self.textures <= limits.textures
            && self.samplers <= limits.samplers
    }
}

impl Add for ResourceCounts {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        ResourceCounts {
            buffers: self.buffers + rhs.buffers,
            textures: self.textures + rhs.textures,
            samplers: self.samplers + rhs.samplers,
        }
    }
}

impl AddAssign for ResourceCounts {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Native slots of one descriptor in one stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSlots {
    pub buffer: Option<u32>,
    pub texture: Option<u32>,
    pub sampler: Option<u32>,
}

impl ResourceSlots {
    /// Slots of a descriptor of `kind` starting at `base`.
    pub fn at(base: ResourceCounts, kind: ResourceCounts) -> Self {
        ResourceSlots {
            buffer: (kind.buffers > 0).then_some(base.buffers),
            texture: (kind.textures > 0).then_some(base.textures),
            sampler: (kind.samplers > 0).then_some(base.samplers),
        }
    }
}

/// Per-stage slot of one implicit resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImplicitBinding {
    pub stages: StageMap<u32>,
}

impl ImplicitBinding {
    pub const UNUSED: u32 = u32::MAX;

    pub const fn unused() -> Self {
        ImplicitBinding {
            stages: StageMap([Self::UNUSED; ShaderStage::COUNT]),
        }
    }

    #[inline]
    pub fn get(&self, stage: ShaderStage) -> Option<u32> {
        match self.stages[stage] {
            Self::UNUSED => None,
            slot => Some(slot),
        }
    }
}

impl Default for ImplicitBinding {
    fn default() -> Self {
        ImplicitBinding::unused()
    }
}

/// All slots the emulation machinery claims in addition to user bindings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ImplicitBindings {
    /// Swizzle constants and buffer sizes.
    pub aux_buffer: ImplicitBinding,
    pub indirect_params: ImplicitBinding,
    pub output_buffer: ImplicitBinding,
    pub tess_ctl_patch_output: Option<u32>,
    pub tess_ctl_level: Option<u32>,
}

/// Highest buffer slot count available to implicit bindings of `stage`.
pub(crate) fn implicit_buffer_limit(stage: ShaderStage, max_buffers_per_stage: u32) -> u32 {
    match stage {
        ShaderStage::TessControl => max_buffers_per_stage.min(TESS_CTL_INDEX_BUFFER_INDEX),
        ShaderStage::TessEvaluation => max_buffers_per_stage.min(TESS_EVAL_LEVEL_BUFFER_INDEX),
        _ => max_buffers_per_stage,
    }
}

struct SlotAllocator {
    next: u32,
    limit: u32,
    stage: ShaderStage,
}

impl SlotAllocator {
    fn take(&mut self, what: &str) -> u32 {
        if self.next >= self.limit {
            tracing::warn!(
                "No buffer slot left for {what} in {} stage, {} slots are in use",
                self.stage,
                self.next
            );
            return ImplicitBinding::UNUSED;
        }
        let slot = self.next;
        self.next += 1;
        slot
    }
}

/// Assigns implicit slots past the user-declared buffers of every stage.
///
/// Order within a stage is fixed: auxiliary buffer, indirect parameters,
/// captured output, then the tessellation control patch output and level buffers.
/// Identical totals always produce identical slots, which keeps converter
/// contexts and therefore pipeline cache keys stable.
pub fn allocate_implicit_bindings(
    totals: &StageMap<ResourceCounts>,
    max_buffers_per_stage: u32,
) -> ImplicitBindings {
    let mut bindings = ImplicitBindings::default();

    for stage in ShaderStage::ALL {
        let mut slots = SlotAllocator {
            next: totals[stage].buffers,
            limit: implicit_buffer_limit(stage, max_buffers_per_stage),
            stage,
        };

        bindings.aux_buffer.stages[stage] = slots.take("auxiliary buffer");

        if matches!(stage, ShaderStage::Vertex | ShaderStage::TessControl) {
            bindings.indirect_params.stages[stage] = slots.take("indirect parameters");
            bindings.output_buffer.stages[stage] = slots.take("captured output");
        }

        if stage == ShaderStage::TessControl {
            let patch = slots.take("patch output");
            let level = slots.take("tessellation levels");
            bindings.tess_ctl_patch_output = (patch != ImplicitBinding::UNUSED).then_some(patch);
            bindings.tess_ctl_level = (level != ImplicitBinding::UNUSED).then_some(level);
        }
    }

    bindings
}
