//! Descriptor set layouts and the pool they're allocated from. Set 0 is
//! the per-frame camera/view-projection UBO; set 1 is per-material PBR
//! textures (spec §4.10/§4.11).

use ash::vk;

use crate::error::AllocatorError;

pub const FRAME_SET_INDEX: u32 = 0;
pub const MATERIAL_SET_INDEX: u32 = 1;

pub struct DescriptorLayouts {
    pub frame_layout: vk::DescriptorSetLayout,
    pub material_layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
}

impl DescriptorLayouts {
    /// # Safety
    /// `device` must be a valid logical device.
    pub unsafe fn create(
        device: &ash::Device,
        max_materials: u32,
    ) -> Result<DescriptorLayouts, AllocatorError> {
        let frame_bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)];
        let frame_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&frame_bindings);
        let frame_layout = device
            .create_descriptor_set_layout(&frame_layout_info, None)
            .map_err(AllocatorError::CreateFailed)?;

        // base color, metallic-roughness, normal, occlusion, emissive.
        let material_bindings: Vec<_> = (0..5)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            })
            .collect();
        let material_layout_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&material_bindings);
        let material_layout = match device.create_descriptor_set_layout(&material_layout_info, None) {
            Ok(l) => l,
            Err(e) => {
                device.destroy_descriptor_set_layout(frame_layout, None);
                return Err(AllocatorError::CreateFailed(e));
            }
        };

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(8),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(max_materials * 5),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_materials + 8)
            .pool_sizes(&pool_sizes);
        let pool = match device.create_descriptor_pool(&pool_info, None) {
            Ok(p) => p,
            Err(e) => {
                device.destroy_descriptor_set_layout(frame_layout, None);
                device.destroy_descriptor_set_layout(material_layout, None);
                return Err(AllocatorError::CreateFailed(e));
            }
        };

        Ok(DescriptorLayouts {
            frame_layout,
            material_layout,
            pool,
        })
    }

    /// # Safety
    /// `device` must own `self.pool` and the descriptor sets allocated
    /// from it must not be in use.
    pub unsafe fn allocate_material_set(
        &self,
        device: &ash::Device,
    ) -> Result<vk::DescriptorSet, AllocatorError> {
        let layouts = [self.material_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = device
            .allocate_descriptor_sets(&alloc_info)
            .map_err(AllocatorError::CreateFailed)?;
        Ok(sets[0])
    }

    /// # Safety
    /// `device` must own these objects and they must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
        device.destroy_descriptor_set_layout(self.frame_layout, None);
        device.destroy_descriptor_set_layout(self.material_layout, None);
    }
}
