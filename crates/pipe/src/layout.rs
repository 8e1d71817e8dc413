//! Pipeline layouts map portable `(set, binding)` pairs onto native slots.
//!
//! Each stage packs its descriptor sets one after another into the native
//! buffer, texture and sampler index spaces. Push constants take one buffer
//! slot after all sets and the implicit emulation buffers follow.

use std::sync::Arc;

use crate::{
    binding::{
        allocate_implicit_bindings, ImplicitBinding, ImplicitBindings, ResourceCounts,
        ResourceSlots, TESS_EVAL_LEVEL_BUFFER_INDEX,
    },
    config::Config,
    converter::{ConverterContext, ResourceBinding},
    stage::{ShaderStage, ShaderStages, StageMap},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    InputAttachment,
}

impl DescriptorKind {
    /// Native resources one descriptor of this kind occupies.
    pub fn resources(self) -> ResourceCounts {
        match self {
            DescriptorKind::Sampler => ResourceCounts::SAMPLER,
            DescriptorKind::CombinedImageSampler => ResourceCounts::TEXTURE + ResourceCounts::SAMPLER,
            DescriptorKind::SampledImage
            | DescriptorKind::StorageImage
            | DescriptorKind::UniformTexelBuffer
            | DescriptorKind::StorageTexelBuffer
            | DescriptorKind::InputAttachment => ResourceCounts::TEXTURE,
            DescriptorKind::UniformBuffer
            | DescriptorKind::StorageBuffer
            | DescriptorKind::UniformBufferDynamic
            | DescriptorKind::StorageBufferDynamic => ResourceCounts::BUFFER,
        }
    }

    #[inline]
    pub fn is_dynamic(self) -> bool {
        matches!(
            self,
            DescriptorKind::UniformBufferDynamic | DescriptorKind::StorageBufferDynamic
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Binding of a set layout with its offsets inside the set.
#[derive(Clone, Debug)]
pub struct LayoutBinding {
    pub desc: DescriptorSetLayoutBinding,

    /// First native slot of this binding relative to the set, per stage.
    pub offsets: StageMap<ResourceCounts>,

    /// Index of the first dynamic offset consumed by this binding.
    pub dynamic_offset_index: u32,
}

#[derive(Clone, Debug)]
pub struct DescriptorSetLayout {
    bindings: Vec<LayoutBinding>,
    counts: StageMap<ResourceCounts>,
    dynamic_offset_count: u32,
}

impl DescriptorSetLayout {
    pub fn new(mut bindings: Vec<DescriptorSetLayoutBinding>) -> Self {
        bindings.sort_by_key(|b| b.binding);

        let mut counts = StageMap::splat(ResourceCounts::ZERO);
        let mut dynamic_offset_count = 0;

        let bindings = bindings
            .into_iter()
            .map(|desc| {
                let offsets = counts;
                let size = desc.kind.resources().scaled(desc.count);
                for stage in ShaderStage::ALL {
                    if desc.stages.has(stage) {
                        counts[stage] += size;
                    }
                }

                let dynamic_offset_index = dynamic_offset_count;
                if desc.kind.is_dynamic() {
                    dynamic_offset_count += desc.count;
                }

                LayoutBinding {
                    desc,
                    offsets,
                    dynamic_offset_index,
                }
            })
            .collect();

        DescriptorSetLayout {
            bindings,
            counts,
            dynamic_offset_count,
        }
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.bindings
            .binary_search_by_key(&binding, |b| b.desc.binding)
            .ok()
            .map(|idx| &self.bindings[idx])
    }

    /// Native resources the set occupies in each stage.
    pub fn resource_counts(&self) -> &StageMap<ResourceCounts> {
        &self.counts
    }

    pub fn dynamic_offset_count(&self) -> u32 {
        self.dynamic_offset_count
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

/// Update of consecutive array elements of one binding.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorWrite<'a, R> {
    pub binding: u32,
    pub array_element: u32,
    pub resources: &'a [R],
}

/// Entry of a [`DescriptorUpdateTemplate`].
///
/// Element `i` of the entry is read from `data[offset + i * stride]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TemplateEntry {
    pub binding: u32,
    pub array_element: u32,
    pub count: u32,
    pub offset: usize,
    pub stride: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorUpdateTemplate {
    pub entries: Vec<TemplateEntry>,
}

/// Descriptor-binding layer that receives resolved native slots.
pub trait DescriptorBinder {
    type Set: ?Sized;
    type Resource;

    /// Binds a whole descriptor set whose native slots in each stage start at `base`.
    fn bind_set(
        &mut self,
        index: u32,
        set: &Self::Set,
        layout: &DescriptorSetLayout,
        base: &StageMap<ResourceCounts>,
        dynamic_offsets: &[u32],
    );

    /// Binds one resource to native slots of `stage`.
    fn bind_resource(
        &mut self,
        stage: ShaderStage,
        kind: DescriptorKind,
        slots: ResourceSlots,
        resource: &Self::Resource,
    );
}

#[derive(Debug)]
pub struct PipelineLayout {
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    set_offsets: Vec<StageMap<ResourceCounts>>,
    push_constants: Vec<PushConstantRange>,
    push_constant_buffer: StageMap<Option<u32>>,
    totals: StageMap<ResourceCounts>,
    implicit: ImplicitBindings,
    max_buffers_per_stage: u32,
}

impl PipelineLayout {
    pub fn new(
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constants: Vec<PushConstantRange>,
        config: &Config,
    ) -> Self {
        let mut totals = StageMap::splat(ResourceCounts::ZERO);

        let set_offsets = set_layouts
            .iter()
            .map(|layout| {
                let offsets = totals;
                for stage in ShaderStage::ALL {
                    totals[stage] += layout.resource_counts()[stage];
                }
                offsets
            })
            .collect();

        let push_stages = push_constants
            .iter()
            .fold(ShaderStages::empty(), |acc, range| acc | range.stages);

        let push_constant_buffer = StageMap::from_fn(|stage| {
            if push_stages.has(stage) {
                let slot = totals[stage].buffers;
                totals[stage] += ResourceCounts::BUFFER;
                Some(slot)
            } else {
                None
            }
        });

        let limits = ResourceCounts {
            buffers: config.max_buffers_per_stage,
            textures: config.max_textures_per_stage,
            samplers: config.max_samplers_per_stage,
        };
        for (stage, counts) in totals.iter() {
            if !counts.fits(&limits) {
                tracing::warn!(
                    "Pipeline layout uses {:?} in {} stage which exceeds {:?}",
                    counts,
                    stage,
                    limits
                );
            }
        }

        let implicit = allocate_implicit_bindings(&totals, config.max_buffers_per_stage);

        PipelineLayout {
            set_layouts,
            set_offsets,
            push_constants,
            push_constant_buffer,
            totals,
            implicit,
            max_buffers_per_stage: config.max_buffers_per_stage,
        }
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    /// Native slot offsets of each set, per stage.
    pub fn set_offsets(&self) -> &[StageMap<ResourceCounts>] {
        &self.set_offsets
    }

    pub fn push_constants(&self) -> &[PushConstantRange] {
        &self.push_constants
    }

    pub fn push_constant_buffer(&self, stage: ShaderStage) -> Option<u32> {
        self.push_constant_buffer[stage]
    }

    /// Native resources declared by sets and push constants, per stage.
    pub fn resource_counts(&self) -> &StageMap<ResourceCounts> {
        &self.totals
    }

    pub fn max_buffers_per_stage(&self) -> u32 {
        self.max_buffers_per_stage
    }

    pub fn implicit_bindings(&self) -> &ImplicitBindings {
        &self.implicit
    }

    pub fn aux_buffer_index(&self) -> &ImplicitBinding {
        &self.implicit.aux_buffer
    }

    pub fn indirect_params_index(&self) -> &ImplicitBinding {
        &self.implicit.indirect_params
    }

    pub fn output_buffer_index(&self) -> &ImplicitBinding {
        &self.implicit.output_buffer
    }

    pub fn tess_ctl_patch_output_buffer_index(&self) -> Option<u32> {
        self.implicit.tess_ctl_patch_output
    }

    pub fn tess_ctl_level_buffer_index(&self) -> Option<u32> {
        self.implicit.tess_ctl_level
    }

    /// Largest number of textures used by any stage.
    /// Sizes the swizzle table of the auxiliary buffer.
    pub fn texture_count(&self) -> u32 {
        self.totals
            .iter()
            .map(|(_, counts)| counts.textures)
            .max()
            .unwrap_or(0)
    }

    fn slots(
        &self,
        set: usize,
        binding: &LayoutBinding,
        stage: ShaderStage,
        element: u32,
    ) -> ResourceSlots {
        let size = binding.desc.kind.resources();
        let base = self.set_offsets[set][stage] + binding.offsets[stage] + size.scaled(element);
        ResourceSlots::at(base, size)
    }

    /// Binds `sets` starting at set index `first_set`.
    ///
    /// Dynamic offsets are consumed in set order, each set taking as many as it declares.
    pub fn bind_descriptor_sets<B>(
        &self,
        binder: &mut B,
        sets: &[&B::Set],
        first_set: u32,
        dynamic_offsets: &[u32],
    ) where
        B: DescriptorBinder,
    {
        let mut remaining = dynamic_offsets;

        for (set, index) in sets.iter().zip(first_set..) {
            let Some(layout) = self.set_layouts.get(index as usize) else {
                tracing::warn!(
                    "Descriptor set {} is out of range of pipeline layout with {} sets",
                    index,
                    self.set_layouts.len()
                );
                return;
            };

            let count = (layout.dynamic_offset_count() as usize).min(remaining.len());
            let (offsets, rest) = remaining.split_at(count);
            remaining = rest;

            binder.bind_set(
                index,
                set,
                layout,
                &self.set_offsets[index as usize],
                offsets,
            );
        }
    }

    /// Binds resources of set `set` without a descriptor set object.
    pub fn push_descriptor_set<B>(
        &self,
        binder: &mut B,
        writes: &[DescriptorWrite<'_, B::Resource>],
        set: u32,
    ) where
        B: DescriptorBinder,
    {
        for write in writes {
            for (resource, element) in write.resources.iter().zip(write.array_element..) {
                self.push_resource(binder, set, write.binding, element, resource);
            }
        }
    }

    /// Binds resources of set `set` read from `data` through `template`.
    pub fn push_descriptor_set_with_template<B>(
        &self,
        binder: &mut B,
        template: &DescriptorUpdateTemplate,
        set: u32,
        data: &[B::Resource],
    ) where
        B: DescriptorBinder,
    {
        for entry in &template.entries {
            for i in 0..entry.count {
                let idx = entry.offset + i as usize * entry.stride;
                let Some(resource) = data.get(idx) else {
                    tracing::warn!(
                        "Template entry for binding {} reads past the end of update data",
                        entry.binding
                    );
                    break;
                };
                self.push_resource(binder, set, entry.binding, entry.array_element + i, resource);
            }
        }
    }

    fn push_resource<B>(
        &self,
        binder: &mut B,
        set: u32,
        binding: u32,
        element: u32,
        resource: &B::Resource,
    ) where
        B: DescriptorBinder,
    {
        let Some(layout) = self.set_layouts.get(set as usize) else {
            tracing::warn!("Push to descriptor set {} which is not in the layout", set);
            return;
        };

        let Some(layout_binding) = layout.binding(binding) else {
            tracing::warn!("Binding {} is not declared in descriptor set {}", binding, set);
            return;
        };

        if element >= layout_binding.desc.count {
            tracing::warn!(
                "Array element {} is out of range of binding {} in set {}",
                element,
                binding,
                set
            );
            return;
        }

        for stage in ShaderStage::ALL {
            if layout_binding.desc.stages.has(stage) {
                let slots = self.slots(set as usize, layout_binding, stage, element);
                binder.bind_resource(stage, layout_binding.desc.kind, slots, resource);
            }
        }
    }

    /// Exports native slots of every resource visible to `context.stage`.
    ///
    /// Must be called before a shader using this layout is converted.
    pub fn populate_converter_context(&self, context: &mut ConverterContext) {
        let stage = context.stage;

        context.resources.clear();
        for (set, layout) in self.set_layouts.iter().enumerate() {
            for binding in layout.bindings() {
                if !binding.desc.stages.has(stage) {
                    continue;
                }
                context.resources.push(ResourceBinding {
                    set: set as u32,
                    binding: binding.desc.binding,
                    count: binding.desc.count,
                    slots: self.slots(set, binding, stage, 0),
                });
            }
        }

        context.push_constant_buffer = self.push_constant_buffer[stage];
        context.aux_buffer = self.implicit.aux_buffer.get(stage);
        context.indirect_params_buffer = self.implicit.indirect_params.get(stage);
        context.output_buffer = self.implicit.output_buffer.get(stage);
        (context.patch_output_buffer, context.tess_level_buffer) = match stage {
            ShaderStage::TessControl => (
                self.implicit.tess_ctl_patch_output,
                self.implicit.tess_ctl_level,
            ),
            ShaderStage::TessEvaluation => (None, Some(TESS_EVAL_LEVEL_BUFFER_INDEX)),
            _ => (None, None),
        };
        context.texture_count = self.texture_count();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BinderEvent, RecordingBinder};

    fn set_layout(bindings: &[(u32, DescriptorKind, u32, ShaderStages)]) -> Arc<DescriptorSetLayout> {
        Arc::new(DescriptorSetLayout::new(
            bindings
                .iter()
                .map(|&(binding, kind, count, stages)| DescriptorSetLayoutBinding {
                    binding,
                    kind,
                    count,
                    stages,
                })
                .collect(),
        ))
    }

    fn layout() -> PipelineLayout {
        let all = ShaderStages::VERTEX | ShaderStages::FRAGMENT;
        let set0 = set_layout(&[
            (0, DescriptorKind::UniformBuffer, 1, all),
            (1, DescriptorKind::CombinedImageSampler, 2, ShaderStages::FRAGMENT),
        ]);
        let set1 = set_layout(&[
            (3, DescriptorKind::StorageBufferDynamic, 2, ShaderStages::VERTEX),
            (0, DescriptorKind::SampledImage, 1, all),
        ]);

        PipelineLayout::new(
            vec![set0, set1],
            vec![PushConstantRange {
                stages: ShaderStages::VERTEX,
                offset: 0,
                size: 16,
            }],
            &Config::default(),
        )
    }

    #[test]
    fn set_offsets_are_monotonic() {
        let layout = layout();
        let offsets = layout.set_offsets();

        for stage in ShaderStage::ALL {
            for pair in offsets.windows(2) {
                assert!(pair[0][stage].buffers <= pair[1][stage].buffers);
                assert!(pair[0][stage].textures <= pair[1][stage].textures);
                assert!(pair[0][stage].samplers <= pair[1][stage].samplers);
            }
        }

        assert_eq!(
            offsets[1][ShaderStage::Fragment],
            ResourceCounts {
                buffers: 1,
                textures: 2,
                samplers: 2
            }
        );
    }

    #[test]
    fn push_constants_and_implicit_buffers_follow_sets() {
        let layout = layout();

        // Vertex: 1 uniform buffer in set 0, 2 storage buffers in set 1.
        assert_eq!(layout.push_constant_buffer(ShaderStage::Vertex), Some(3));
        assert_eq!(layout.push_constant_buffer(ShaderStage::Fragment), None);
        assert_eq!(layout.aux_buffer_index().get(ShaderStage::Vertex), Some(4));
        assert_eq!(layout.indirect_params_index().get(ShaderStage::Vertex), Some(5));
        assert_eq!(layout.output_buffer_index().get(ShaderStage::Vertex), Some(6));
        assert_eq!(layout.aux_buffer_index().get(ShaderStage::Fragment), Some(1));
        assert_eq!(layout.texture_count(), 3);
    }

    #[test]
    fn converter_context_gets_global_slots() {
        let layout = layout();
        let mut context = ConverterContext::new(ShaderStage::Fragment, "main");
        layout.populate_converter_context(&mut context);

        let sampled = context
            .resources
            .iter()
            .find(|r| r.set == 1 && r.binding == 0)
            .unwrap();
        assert_eq!(
            sampled.slots,
            ResourceSlots {
                buffer: None,
                texture: Some(2),
                sampler: None
            }
        );
        assert!(context.resources.iter().all(|r| !(r.set == 1 && r.binding == 3)));
        assert_eq!(context.aux_buffer, Some(1));
        assert_eq!(context.push_constant_buffer, None);
        assert_eq!(context.texture_count, 3);
    }

    #[test]
    fn tessellation_stages_get_level_buffers() {
        let layout = layout();

        let mut control = ConverterContext::new(ShaderStage::TessControl, "main");
        layout.populate_converter_context(&mut control);
        assert_eq!(control.tess_level_buffer, layout.tess_ctl_level_buffer_index());
        assert_eq!(
            control.patch_output_buffer,
            layout.tess_ctl_patch_output_buffer_index()
        );

        let mut evaluation = ConverterContext::new(ShaderStage::TessEvaluation, "main");
        layout.populate_converter_context(&mut evaluation);
        assert_eq!(evaluation.tess_level_buffer, Some(TESS_EVAL_LEVEL_BUFFER_INDEX));
        assert_eq!(evaluation.patch_output_buffer, None);

        let mut fragment = ConverterContext::new(ShaderStage::Fragment, "main");
        layout.populate_converter_context(&mut fragment);
        assert_eq!(fragment.tess_level_buffer, None);
    }

    #[test]
    fn bind_descriptor_sets_splits_dynamic_offsets() {
        let layout = layout();
        let mut binder = RecordingBinder::default();

        layout.bind_descriptor_sets(&mut binder, &["a", "b"], 0, &[16, 32, 48]);

        assert_eq!(
            binder.events,
            vec![
                BinderEvent::Set {
                    index: 0,
                    name: "a".to_owned(),
                    dynamic_offsets: vec![],
                },
                BinderEvent::Set {
                    index: 1,
                    name: "b".to_owned(),
                    dynamic_offsets: vec![16, 32],
                },
            ]
        );
    }

    #[test]
    fn push_descriptors_translate_slots() {
        let layout = layout();
        let mut binder = RecordingBinder::default();

        layout.push_descriptor_set(
            &mut binder,
            &[DescriptorWrite {
                binding: 1,
                array_element: 1,
                resources: &[7],
            }],
            0,
        );

        assert_eq!(
            binder.events,
            vec![BinderEvent::Resource {
                stage: ShaderStage::Fragment,
                kind: DescriptorKind::CombinedImageSampler,
                slots: ResourceSlots {
                    buffer: None,
                    texture: Some(1),
                    sampler: Some(1)
                },
                resource: 7,
            }]
        );
    }

    #[test]
    fn template_push_reads_strided_data() {
        let layout = layout();
        let mut binder = RecordingBinder::default();

        let template = DescriptorUpdateTemplate {
            entries: vec![TemplateEntry {
                binding: 3,
                array_element: 0,
                count: 2,
                offset: 1,
                stride: 2,
            }],
        };
        layout.push_descriptor_set_with_template(&mut binder, &template, 1, &[0, 10, 0, 11]);

        let slots: Vec<_> = binder
            .events
            .iter()
            .map(|e| match e {
                BinderEvent::Resource {
                    slots, resource, ..
                } => (slots.buffer, *resource),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(slots, vec![(Some(1), 10), (Some(2), 11)]);
    }
}
