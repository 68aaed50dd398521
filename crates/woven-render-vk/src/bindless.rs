// SPDX-License-Identifier: CEPL-1.0
//! The one update-after-bind descriptor set every shader sees, and the
//! pipeline layout built around it.

use std::sync::Arc;

use ash::vk;
use tracing::info;
use woven_render::{BackendError, BindlessCapacities, BindlessCategory, DescriptorSink, PUSH_CONSTANT_BYTES};

use crate::device::{DescriptorLimits, GpuDevice};
use crate::vk_call;

/// A descriptor that can be written into one table slot.
#[derive(Clone, Copy, Debug)]
pub enum BindlessResource {
    SampledImage { view: vk::ImageView, layout: vk::ImageLayout },
    Sampler(vk::Sampler),
    StorageBuffer { buffer: vk::Buffer, offset: u64, range: u64 },
    UniformBuffer { buffer: vk::Buffer, offset: u64, range: u64 },
    /// Storage images are always accessed in the GENERAL layout.
    StorageImage(vk::ImageView),
}

pub(crate) const fn descriptor_type(category: BindlessCategory) -> vk::DescriptorType {
    match category {
        BindlessCategory::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        BindlessCategory::Sampler => vk::DescriptorType::SAMPLER,
        BindlessCategory::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindlessCategory::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindlessCategory::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

const fn limit_for(limits: &DescriptorLimits, category: BindlessCategory) -> u32 {
    match category {
        BindlessCategory::SampledImage => limits.sampled_images,
        BindlessCategory::Sampler => limits.samplers,
        BindlessCategory::StorageBuffer => limits.storage_buffers,
        BindlessCategory::UniformBuffer => limits.uniform_buffers,
        BindlessCategory::StorageImage => limits.storage_images,
    }
}

pub(crate) fn binding_flags(category: BindlessCategory) -> vk::DescriptorBindingFlags {
    let base = vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
        | vk::DescriptorBindingFlags::PARTIALLY_BOUND
        | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
    if category.has_variable_count() {
        base | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
    } else {
        base
    }
}

pub(crate) const fn push_range() -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::ALL,
        offset: 0,
        size: PUSH_CONSTANT_BYTES,
    }
}

pub struct VkDescriptorSink {
    gpu: Arc<GpuDevice>,
    pool: vk::DescriptorPool,
    set_layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
}

impl VkDescriptorSink {
    pub fn new(gpu: Arc<GpuDevice>, capacities: &BindlessCapacities) -> Result<Self, BackendError> {
        for category in BindlessCategory::ALL {
            let limit = limit_for(&gpu.limits, category);
            if capacities.get(category) > limit {
                tracing::error!(
                    category = category.name(),
                    requested = capacities.get(category),
                    limit,
                    "bindless capacity exceeds the device limit"
                );
                return Err(BackendError::Unsupported("bindless capacity"));
            }
        }

        let mut sink = Self {
            gpu,
            pool: vk::DescriptorPool::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            set: vk::DescriptorSet::null(),
            pipeline_layout: vk::PipelineLayout::null(),
        };
        unsafe { sink.build(capacities) }?;
        info!(
            sampled_images = capacities.sampled_images,
            samplers = capacities.samplers,
            storage_buffers = capacities.storage_buffers,
            uniform_buffers = capacities.uniform_buffers,
            storage_images = capacities.storage_images,
            "bindless table created"
        );
        Ok(sink)
    }

    // Partially built state is cleaned up by Drop.
    unsafe fn build(&mut self, capacities: &BindlessCapacities) -> Result<(), BackendError> {
        let device = &self.gpu.device;

        let bindings = BindlessCategory::ALL.map(|c| vk::DescriptorSetLayoutBinding {
            binding: c.binding(),
            descriptor_type: descriptor_type(c),
            descriptor_count: capacities.get(c),
            stage_flags: vk::ShaderStageFlags::ALL,
            ..Default::default()
        });
        let flags = BindlessCategory::ALL.map(binding_flags);
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        self.set_layout = vk_call!(
            "vkCreateDescriptorSetLayout",
            device.create_descriptor_set_layout(&layout_info, None)
        )?;

        let sizes = BindlessCategory::ALL.map(|c| vk::DescriptorPoolSize {
            ty: descriptor_type(c),
            descriptor_count: capacities.get(c),
        });
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&sizes);
        self.pool = vk_call!("vkCreateDescriptorPool", device.create_descriptor_pool(&pool_info, None))?;

        let counts = [capacities.sampled_images];
        let mut variable = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
        let alloc = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(std::slice::from_ref(&self.set_layout))
            .push_next(&mut variable);
        self.set = vk_call!("vkAllocateDescriptorSets", device.allocate_descriptor_sets(&alloc))?
            .into_iter()
            .next()
            .ok_or(BackendError::Unsupported("descriptor set"))?;

        let ranges = [push_range()];
        let pl_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&self.set_layout))
            .push_constant_ranges(&ranges);
        self.pipeline_layout = vk_call!(
            "vkCreatePipelineLayout",
            device.create_pipeline_layout(&pl_info, None)
        )?;
        Ok(())
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }
}

impl DescriptorSink for VkDescriptorSink {
    type Resource = BindlessResource;
    type Recorder = vk::CommandBuffer;

    fn category_of(resource: &BindlessResource) -> BindlessCategory {
        match resource {
            BindlessResource::SampledImage { .. } => BindlessCategory::SampledImage,
            BindlessResource::Sampler(_) => BindlessCategory::Sampler,
            BindlessResource::StorageBuffer { .. } => BindlessCategory::StorageBuffer,
            BindlessResource::UniformBuffer { .. } => BindlessCategory::UniformBuffer,
            BindlessResource::StorageImage(_) => BindlessCategory::StorageImage,
        }
    }

    fn write_descriptor(
        &mut self,
        category: BindlessCategory,
        index: u32,
        resource: &BindlessResource,
    ) -> Result<(), BackendError> {
        let image_info = match *resource {
            BindlessResource::SampledImage { view, layout } => vk::DescriptorImageInfo {
                image_view: view,
                image_layout: layout,
                ..Default::default()
            },
            BindlessResource::Sampler(sampler) => vk::DescriptorImageInfo {
                sampler,
                ..Default::default()
            },
            BindlessResource::StorageImage(view) => vk::DescriptorImageInfo {
                image_view: view,
                image_layout: vk::ImageLayout::GENERAL,
                ..Default::default()
            },
            _ => vk::DescriptorImageInfo::default(),
        };
        let buffer_info = match *resource {
            BindlessResource::StorageBuffer { buffer, offset, range }
            | BindlessResource::UniformBuffer { buffer, offset, range } => vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            },
            _ => vk::DescriptorBufferInfo::default(),
        };

        let mut write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: self.set,
            dst_binding: category.binding(),
            dst_array_element: index,
            descriptor_count: 1,
            descriptor_type: descriptor_type(category),
            ..Default::default()
        };
        match category {
            BindlessCategory::StorageBuffer | BindlessCategory::UniformBuffer => {
                write.p_buffer_info = &buffer_info;
            }
            _ => write.p_image_info = &image_info,
        }
        unsafe { self.gpu.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn bind_table(&mut self, cmd: &vk::CommandBuffer) -> Result<(), BackendError> {
        for bind_point in [vk::PipelineBindPoint::GRAPHICS, vk::PipelineBindPoint::COMPUTE] {
            unsafe {
                self.gpu.device.cmd_bind_descriptor_sets(
                    *cmd,
                    bind_point,
                    self.pipeline_layout,
                    0,
                    &[self.set],
                    &[],
                );
            }
        }
        Ok(())
    }
}

impl Drop for VkDescriptorSink {
    fn drop(&mut self) {
        let device = &self.gpu.device;
        unsafe {
            let _ = device.device_wait_idle();
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            // The set goes with its pool.
            if self.pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.pool, None);
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.set_layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sampled_images_have_variable_count() {
        for category in BindlessCategory::ALL {
            let flags = binding_flags(category);
            assert!(flags.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND));
            assert!(flags.contains(vk::DescriptorBindingFlags::PARTIALLY_BOUND));
            assert_eq!(
                flags.contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT),
                category == BindlessCategory::SampledImage
            );
        }
    }

    #[test]
    fn resources_report_their_category() {
        let res = BindlessResource::StorageBuffer {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        };
        assert_eq!(VkDescriptorSink::category_of(&res), BindlessCategory::StorageBuffer);
        assert_eq!(
            VkDescriptorSink::category_of(&BindlessResource::StorageImage(vk::ImageView::null())),
            BindlessCategory::StorageImage
        );
        for category in BindlessCategory::ALL {
            assert_ne!(descriptor_type(category), vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        }
    }

    #[test]
    fn push_range_covers_block() {
        let range = push_range();
        assert_eq!(range.size, 128);
        assert!(std::mem::size_of::<woven_render::PushBlock>() as u32 <= range.size);
    }
}
