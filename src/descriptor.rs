// Descriptor arena
//
// One arena per shader set: bindings are declared up front, layouts are
// materialized in one pass, sets are allocated from a single pool sized
// from the declared resources. Set numbers index the layout array densely,
// with an empty placeholder layout filling gaps.

use anyhow::{Context, Result};
use ash::vk;

use crate::device::RenderDevice;
use crate::handle::{Handle, HandleRegistry};

/// One declared binding within a set layout
#[derive(Debug, Clone, Copy)]
pub struct BindingDesc {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub flags: vk::DescriptorBindingFlags,
}

#[derive(Default)]
pub struct DescriptorLayoutData {
    pub name: String,
    pub bindings: Vec<BindingDesc>,
    pub layout_flags: vk::DescriptorSetLayoutCreateFlags,
    pub layout: vk::DescriptorSetLayout,
}

/// Resources backing one binding slot of a set, in layout order
#[derive(Default, Clone)]
pub struct DescriptorResourceInfo {
    pub buffer_infos: Vec<vk::DescriptorBufferInfo>,
    pub image_infos: Vec<vk::DescriptorImageInfo>,
    pub texel_buffer_views: Vec<vk::BufferView>,
}

impl DescriptorResourceInfo {
    fn descriptor_count(&self) -> u32 {
        (self.buffer_infos.len() + self.image_infos.len() + self.texel_buffer_views.len()) as u32
    }
}

pub struct DescriptorSetData {
    pub name: String,
    pub layout_handle: Handle<DescriptorLayoutData>,
    pub set: vk::DescriptorSet,
    pub resources: Vec<DescriptorResourceInfo>,
}

#[derive(Default)]
pub struct DescriptorArena {
    // Indexed by set number; gaps resolve to the empty placeholder layout
    layout_data: Vec<DescriptorLayoutData>,
    empty_layout: vk::DescriptorSetLayout,
    sets: HandleRegistry<DescriptorSetData>,
    pool: vk::DescriptorPool,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    pool_flags: vk::DescriptorPoolCreateFlags,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl DescriptorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a binding for a set number. The first binding declared for a
    /// set number claims its layout name; later bindings must repeat it.
    #[allow(clippy::too_many_arguments)]
    pub fn add_binding(
        &mut self,
        layout_name: &str,
        set_number: u32,
        binding: u32,
        ty: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
        binding_flags: vk::DescriptorBindingFlags,
        layout_flags: vk::DescriptorSetLayoutCreateFlags,
        pool_flags: vk::DescriptorPoolCreateFlags,
    ) -> Result<()> {
        let index = set_number as usize;
        if self.layout_data.len() <= index {
            self.layout_data
                .resize_with(index + 1, DescriptorLayoutData::default);
        }

        let data = &mut self.layout_data[index];
        if data.name.is_empty() {
            data.name = layout_name.to_string();
        } else if data.name != layout_name {
            log::error!(
                "Set {} already belongs to layout '{}', rejecting binding for '{}'",
                set_number,
                data.name,
                layout_name
            );
            anyhow::bail!(
                "Set {} already belongs to layout '{}'",
                set_number,
                data.name
            );
        }

        data.layout_flags |= layout_flags;
        data.bindings.push(BindingDesc {
            binding,
            ty,
            count,
            stages,
            flags: binding_flags,
        });
        self.pool_flags |= pool_flags;
        Ok(())
    }

    /// Materialize every declared layout. Duplicate layout names and empty
    /// binding lists resolve to a shared empty placeholder so the layout
    /// array stays densely indexed by set number.
    pub fn create_layouts(&mut self, device: &RenderDevice) -> Result<()> {
        let empty_info = vk::DescriptorSetLayoutCreateInfo::builder();
        self.empty_layout = unsafe {
            device
                .device
                .create_descriptor_set_layout(&empty_info, None)
        }
        .context("Failed to create placeholder descriptor set layout")?;

        let mut seen_names: Vec<String> = Vec::new();
        for (set_number, data) in self.layout_data.iter_mut().enumerate() {
            if data.bindings.is_empty() {
                data.layout = self.empty_layout;
                continue;
            }
            if seen_names.contains(&data.name) {
                log::error!(
                    "Duplicate descriptor layout name '{}' at set {}, using empty layout",
                    data.name,
                    set_number
                );
                data.layout = self.empty_layout;
                continue;
            }
            seen_names.push(data.name.clone());

            let bindings: Vec<vk::DescriptorSetLayoutBinding> = data
                .bindings
                .iter()
                .map(|b| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(b.binding)
                        .descriptor_type(b.ty)
                        .descriptor_count(b.count)
                        .stage_flags(b.stages)
                        .build()
                })
                .collect();
            let flags: Vec<vk::DescriptorBindingFlags> =
                data.bindings.iter().map(|b| b.flags).collect();

            let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
                .binding_flags(&flags);
            let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
                .bindings(&bindings)
                .flags(data.layout_flags)
                .push_next(&mut flags_info);

            data.layout = unsafe {
                device
                    .device
                    .create_descriptor_set_layout(&layout_info, None)
            }
            .with_context(|| format!("Failed to create descriptor layout '{}'", data.name))?;
        }
        Ok(())
    }

    /// Dense layout array for pipeline-layout creation, indexed by set number
    pub fn layouts(&self) -> Vec<vk::DescriptorSetLayout> {
        self.layout_data.iter().map(|d| d.layout).collect()
    }

    pub fn layout_handle_by_name(&self, name: &str) -> Handle<DescriptorLayoutData> {
        match self
            .layout_data
            .iter()
            .position(|d| d.name == name)
        {
            Some(index) => Handle::from_index(index),
            None => {
                log::error!("No descriptor layout named '{}'", name);
                Handle::NONE
            }
        }
    }

    fn layout(&self, handle: Handle<DescriptorLayoutData>) -> Option<&DescriptorLayoutData> {
        let index = handle.id() as usize;
        if handle.is_none() || index >= self.layout_data.len() {
            log::error!("Invalid descriptor layout handle {:?}", handle);
            return None;
        }
        Some(&self.layout_data[index])
    }

    /// Stage a set against a layout, validating that each resource block is
    /// compatible with its binding. Any violation logs and returns NONE.
    pub fn add_set(
        &mut self,
        layout_handle: Handle<DescriptorLayoutData>,
        resources: Vec<DescriptorResourceInfo>,
        name: &str,
    ) -> Handle<DescriptorSetData> {
        // Copy the binding list out so the layout borrow ends before the
        // pool sizes are accumulated.
        let bindings: Vec<BindingDesc> = match self.layout(layout_handle) {
            Some(layout) => layout.bindings.clone(),
            None => return Handle::NONE,
        };

        if resources.len() != bindings.len() {
            log::error!(
                "Set '{}' supplies {} resource blocks for {} bindings",
                name,
                resources.len(),
                bindings.len()
            );
            return Handle::NONE;
        }

        for (resource, binding) in resources.iter().zip(&bindings) {
            if !Self::are_resources_compatible(resource, binding) {
                log::error!(
                    "Set '{}' binding {} resources are incompatible with type {:?}",
                    name,
                    binding.binding,
                    binding.ty
                );
                return Handle::NONE;
            }
        }

        for (resource, binding) in resources.iter().zip(&bindings) {
            self.pool_sizes.push(vk::DescriptorPoolSize {
                ty: binding.ty,
                descriptor_count: resource.descriptor_count(),
            });
        }

        self.sets.insert_with_name(
            name,
            DescriptorSetData {
                name: name.to_string(),
                layout_handle,
                set: vk::DescriptorSet::null(),
                resources,
            },
        )
    }

    fn are_resources_compatible(resource: &DescriptorResourceInfo, binding: &BindingDesc) -> bool {
        match binding.ty {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::SAMPLER
            | vk::DescriptorType::INPUT_ATTACHMENT => {
                !resource.image_infos.is_empty()
                    && resource.image_infos.len() as u32 <= binding.count
            }
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER
            | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
                !resource.texel_buffer_views.is_empty()
            }
            vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => !resource.buffer_infos.is_empty(),
            other => {
                log::error!("Unhandled descriptor type {:?}", other);
                false
            }
        }
    }

    /// Create the pool and allocate every staged set in one batch, then
    /// perform the initial writes.
    pub fn create_sets(&mut self, device: &RenderDevice) -> Result<()> {
        anyhow::ensure!(!self.sets.is_empty(), "No descriptor sets staged");

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&self.pool_sizes)
            .max_sets(self.sets.len() as u32)
            .flags(self.pool_flags);
        self.pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let mut set_layouts = Vec::with_capacity(self.sets.len());
        let mut variable_counts = Vec::with_capacity(self.sets.len());
        for set_data in self.sets.iter() {
            let layout = self
                .layout(set_data.layout_handle)
                .context("Set references a missing layout")?;
            set_layouts.push(layout.layout);
            // Variable-length arrays are only legal on the last binding
            variable_counts.push(
                set_data
                    .resources
                    .last()
                    .map(DescriptorResourceInfo::descriptor_count)
                    .unwrap_or(0),
            );
        }

        let mut count_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder()
            .descriptor_counts(&variable_counts);
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&set_layouts)
            .push_next(&mut count_info);

        let allocated = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        for (set_data, set) in self.sets.iter_mut().zip(allocated) {
            set_data.set = set;
        }

        for index in 0..self.sets.len() {
            self.write_set(device, Handle::from_index(index))?;
        }
        Ok(())
    }

    fn write_set(&self, device: &RenderDevice, handle: Handle<DescriptorSetData>) -> Result<()> {
        let set_data = self.sets.get(handle).context("Missing descriptor set")?;
        let layout = self
            .layout(set_data.layout_handle)
            .context("Set references a missing layout")?;

        let mut writes = Vec::with_capacity(set_data.resources.len());
        for (resource, binding) in set_data.resources.iter().zip(&layout.bindings) {
            writes.push(Self::build_write(set_data.set, binding, resource, 0));
        }
        unsafe { device.device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    fn build_write(
        set: vk::DescriptorSet,
        binding: &BindingDesc,
        resource: &DescriptorResourceInfo,
        array_element: u32,
    ) -> vk::WriteDescriptorSet {
        let mut write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding.binding)
            .dst_array_element(array_element)
            .descriptor_type(binding.ty);
        if !resource.buffer_infos.is_empty() {
            write = write.buffer_info(&resource.buffer_infos);
        }
        if !resource.image_infos.is_empty() {
            write = write.image_info(&resource.image_infos);
        }
        if !resource.texel_buffer_views.is_empty() {
            write = write.texel_buffer_view(&resource.texel_buffer_views);
        }
        write.build()
    }

    /// Live single-binding write, no reallocation. Used for per-draw resource
    /// swaps such as rebinding an albedo texture.
    pub fn update_set(
        &mut self,
        device: &RenderDevice,
        resource: DescriptorResourceInfo,
        handle: Handle<DescriptorSetData>,
        binding_index: usize,
        array_element: u32,
    ) -> Result<()> {
        let layout_handle = {
            let set_data = self.sets.get(handle).context("Missing descriptor set")?;
            anyhow::ensure!(
                binding_index < set_data.resources.len(),
                "Binding index {} out of range for set '{}'",
                binding_index,
                set_data.name
            );
            set_data.layout_handle
        };
        let binding = {
            let layout = self
                .layout(layout_handle)
                .context("Set references a missing layout")?;
            layout.bindings[binding_index]
        };

        let set_data = self.sets.get_mut(handle).context("Missing descriptor set")?;
        set_data.resources[binding_index] = resource;
        let write = Self::build_write(
            set_data.set,
            &binding,
            &set_data.resources[binding_index],
            array_element,
        );
        unsafe { device.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Append a push-constant range; offsets are packed cumulatively
    pub fn add_push_constant(&mut self, stages: vk::ShaderStageFlags, size: u32) {
        let offset = self
            .push_constant_ranges
            .iter()
            .map(|r| r.size)
            .sum::<u32>();
        self.push_constant_ranges.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
    }

    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }

    pub fn set_handle_by_name(&self, name: &str) -> Handle<DescriptorSetData> {
        self.sets.handle_by_name(name)
    }

    pub fn set_data(&self, handle: Handle<DescriptorSetData>) -> Option<&DescriptorSetData> {
        self.sets.get(handle)
    }

    pub fn raw_set(&self, handle: Handle<DescriptorSetData>) -> Option<vk::DescriptorSet> {
        self.sets.get(handle).map(|s| s.set)
    }

    pub fn destroy(&mut self, device: &RenderDevice) {
        unsafe {
            if self.pool != vk::DescriptorPool::null() {
                device.device.destroy_descriptor_pool(self.pool, None);
                self.pool = vk::DescriptorPool::null();
            }
            for data in &mut self.layout_data {
                // Placeholder-backed entries share one layout, freed below
                if data.layout != vk::DescriptorSetLayout::null()
                    && data.layout != self.empty_layout
                {
                    device.device.destroy_descriptor_set_layout(data.layout, None);
                }
                data.layout = vk::DescriptorSetLayout::null();
            }
            if self.empty_layout != vk::DescriptorSetLayout::null() {
                device
                    .device
                    .destroy_descriptor_set_layout(self.empty_layout, None);
                self.empty_layout = vk::DescriptorSetLayout::null();
            }
        }
        self.sets.drain();
        self.layout_data.clear();
        self.pool_sizes.clear();
        self.push_constant_ranges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_binding(arena: &mut DescriptorArena, layout_name: &str, set: u32) -> Result<()> {
        arena.add_binding(
            layout_name,
            set,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::VERTEX,
            vk::DescriptorBindingFlags::empty(),
            vk::DescriptorSetLayoutCreateFlags::empty(),
            vk::DescriptorPoolCreateFlags::empty(),
        )
    }

    #[test]
    fn first_binding_claims_layout_name() {
        let mut arena = DescriptorArena::new();
        uniform_binding(&mut arena, "globals", 0).unwrap();
        uniform_binding(&mut arena, "globals", 0).unwrap();
        assert_eq!(arena.layout_data[0].bindings.len(), 2);
    }

    #[test]
    fn mismatched_layout_name_rejected_without_mutation() {
        let mut arena = DescriptorArena::new();
        uniform_binding(&mut arena, "globals", 0).unwrap();
        assert!(uniform_binding(&mut arena, "materials", 0).is_err());
        assert_eq!(arena.layout_data[0].name, "globals");
        assert_eq!(arena.layout_data[0].bindings.len(), 1);
    }

    #[test]
    fn set_numbers_grow_layout_array_densely() {
        let mut arena = DescriptorArena::new();
        uniform_binding(&mut arena, "materials", 2).unwrap();
        assert_eq!(arena.layout_data.len(), 3);
        assert!(arena.layout_data[0].bindings.is_empty());
        assert!(arena.layout_data[1].bindings.is_empty());
    }

    #[test]
    fn image_binding_rejects_empty_image_infos() {
        let mut arena = DescriptorArena::new();
        arena
            .add_binding(
                "materials",
                0,
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                1,
                vk::ShaderStageFlags::FRAGMENT,
                vk::DescriptorBindingFlags::empty(),
                vk::DescriptorSetLayoutCreateFlags::empty(),
                vk::DescriptorPoolCreateFlags::empty(),
            )
            .unwrap();
        let handle = arena.add_set(
            Handle::from_index(0),
            vec![DescriptorResourceInfo::default()],
            "material set",
        );
        assert!(handle.is_none());
    }

    #[test]
    fn image_binding_rejects_count_overflow() {
        let mut arena = DescriptorArena::new();
        arena
            .add_binding(
                "materials",
                0,
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                1,
                vk::ShaderStageFlags::FRAGMENT,
                vk::DescriptorBindingFlags::empty(),
                vk::DescriptorSetLayoutCreateFlags::empty(),
                vk::DescriptorPoolCreateFlags::empty(),
            )
            .unwrap();
        let resource = DescriptorResourceInfo {
            image_infos: vec![vk::DescriptorImageInfo::default(); 2],
            ..Default::default()
        };
        assert!(arena
            .add_set(Handle::from_index(0), vec![resource], "material set")
            .is_none());
    }

    #[test]
    fn buffer_binding_accepts_buffer_infos() {
        let mut arena = DescriptorArena::new();
        uniform_binding(&mut arena, "globals", 0).unwrap();
        let resource = DescriptorResourceInfo {
            buffer_infos: vec![vk::DescriptorBufferInfo::default()],
            ..Default::default()
        };
        let handle = arena.add_set(Handle::from_index(0), vec![resource], "global set");
        assert!(!handle.is_none());
    }

    #[test]
    fn accepted_sets_accumulate_pool_sizes() {
        let mut arena = DescriptorArena::new();
        uniform_binding(&mut arena, "globals", 0).unwrap();
        let resource = DescriptorResourceInfo {
            buffer_infos: vec![vk::DescriptorBufferInfo::default()],
            ..Default::default()
        };
        arena.add_set(Handle::from_index(0), vec![resource.clone()], "set a");
        arena.add_set(Handle::from_index(0), vec![resource], "set b");
        assert_eq!(arena.pool_sizes.len(), 2);
        assert!(arena
            .pool_sizes
            .iter()
            .all(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER && s.descriptor_count == 1));
    }

    #[test]
    fn duplicate_set_name_returns_none() {
        let mut arena = DescriptorArena::new();
        uniform_binding(&mut arena, "globals", 0).unwrap();
        let resource = DescriptorResourceInfo {
            buffer_infos: vec![vk::DescriptorBufferInfo::default()],
            ..Default::default()
        };
        let first = arena.add_set(Handle::from_index(0), vec![resource.clone()], "global set");
        assert!(!first.is_none());
        assert!(arena
            .add_set(Handle::from_index(0), vec![resource], "global set")
            .is_none());
    }

    #[test]
    fn resource_count_mismatch_returns_none() {
        let mut arena = DescriptorArena::new();
        uniform_binding(&mut arena, "globals", 0).unwrap();
        assert!(arena
            .add_set(Handle::from_index(0), vec![], "global set")
            .is_none());
    }

    #[test]
    fn push_constant_offsets_pack_cumulatively() {
        let mut arena = DescriptorArena::new();
        arena.add_push_constant(vk::ShaderStageFlags::VERTEX, 64);
        arena.add_push_constant(vk::ShaderStageFlags::FRAGMENT, 16);
        let ranges = arena.push_constant_ranges();
        assert_eq!(ranges[0].offset, 0);
        assert_eq!(ranges[0].size, 64);
        assert_eq!(ranges[1].offset, 64);
        assert_eq!(ranges[1].size, 16);
    }
}
