// SPDX-License-Identifier: CEPL-1.0
//! Tracked image states to synchronization2 barriers.

use ash::vk;
use woven_render::image_state::{Access, ImageAspect, ImageBarrier, ImageLayout, PipelineStages};

pub(crate) fn layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthAttachment => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

const STAGES: [(PipelineStages, vk::PipelineStageFlags2); 12] = [
    (PipelineStages::TOP_OF_PIPE, vk::PipelineStageFlags2::TOP_OF_PIPE),
    (PipelineStages::TASK_SHADER, vk::PipelineStageFlags2::TASK_SHADER_EXT),
    (PipelineStages::MESH_SHADER, vk::PipelineStageFlags2::MESH_SHADER_EXT),
    (PipelineStages::VERTEX_SHADER, vk::PipelineStageFlags2::VERTEX_SHADER),
    (PipelineStages::FRAGMENT_SHADER, vk::PipelineStageFlags2::FRAGMENT_SHADER),
    (PipelineStages::EARLY_FRAGMENT_TESTS, vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS),
    (PipelineStages::LATE_FRAGMENT_TESTS, vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS),
    (PipelineStages::COLOR_ATTACHMENT_OUTPUT, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT),
    (PipelineStages::COMPUTE_SHADER, vk::PipelineStageFlags2::COMPUTE_SHADER),
    (PipelineStages::TRANSFER, vk::PipelineStageFlags2::ALL_TRANSFER),
    (PipelineStages::BOTTOM_OF_PIPE, vk::PipelineStageFlags2::BOTTOM_OF_PIPE),
    (PipelineStages::ALL_COMMANDS, vk::PipelineStageFlags2::ALL_COMMANDS),
];

const ACCESS: [(Access, vk::AccessFlags2); 8] = [
    (Access::SHADER_READ, vk::AccessFlags2::SHADER_READ),
    (Access::SHADER_WRITE, vk::AccessFlags2::SHADER_WRITE),
    (Access::COLOR_ATTACHMENT_READ, vk::AccessFlags2::COLOR_ATTACHMENT_READ),
    (Access::COLOR_ATTACHMENT_WRITE, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE),
    (Access::DEPTH_STENCIL_READ, vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ),
    (Access::DEPTH_STENCIL_WRITE, vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE),
    (Access::TRANSFER_READ, vk::AccessFlags2::TRANSFER_READ),
    (Access::TRANSFER_WRITE, vk::AccessFlags2::TRANSFER_WRITE),
];

pub(crate) fn stages(stages: PipelineStages) -> vk::PipelineStageFlags2 {
    STAGES
        .iter()
        .filter(|(ours, _)| stages.contains(*ours))
        .fold(vk::PipelineStageFlags2::empty(), |acc, (_, theirs)| acc | *theirs)
}

pub(crate) fn access(access: Access) -> vk::AccessFlags2 {
    ACCESS
        .iter()
        .filter(|(ours, _)| access.contains(*ours))
        .fold(vk::AccessFlags2::empty(), |acc, (_, theirs)| acc | *theirs)
}

pub(crate) fn aspect(aspect: ImageAspect) -> vk::ImageAspectFlags {
    match aspect {
        ImageAspect::Color => vk::ImageAspectFlags::COLOR,
        ImageAspect::Depth => vk::ImageAspectFlags::DEPTH,
    }
}

pub(crate) fn image_barrier(b: &ImageBarrier<vk::Image>) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2 {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
        src_stage_mask: stages(b.src.stages),
        src_access_mask: access(b.src.access),
        dst_stage_mask: stages(b.dst.stages),
        dst_access_mask: access(b.dst.access),
        old_layout: layout(b.src.layout),
        new_layout: layout(b.dst.layout),
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image: b.image,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: aspect(b.aspect),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    }
}

pub(crate) unsafe fn record(device: &ash::Device, cmd: vk::CommandBuffer, b: &ImageBarrier<vk::Image>) {
    let barrier = image_barrier(b);
    let dep = vk::DependencyInfo {
        s_type: vk::StructureType::DEPENDENCY_INFO,
        image_memory_barrier_count: 1,
        p_image_memory_barriers: &barrier,
        ..Default::default()
    };
    device.cmd_pipeline_barrier2(cmd, &dep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use woven_render::image_state::ImageState;
    use woven_render::ImageUsage;

    #[test]
    fn every_stage_bit_maps() {
        assert_eq!(stages(PipelineStages::all()).as_raw().count_ones() as usize, STAGES.len());
        assert_eq!(access(Access::all()).as_raw().count_ones() as usize, ACCESS.len());
    }

    #[test]
    fn present_to_transfer_dst() {
        let b = ImageBarrier {
            image: vk::Image::null(),
            aspect: ImageAspect::Color,
            src: ImageUsage::Presented.state(),
            dst: ImageUsage::TransferDst.state(),
        };
        let vk_b = image_barrier(&b);
        assert_eq!(vk_b.old_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(vk_b.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(vk_b.src_stage_mask, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(vk_b.src_access_mask, vk::AccessFlags2::empty());
        assert_eq!(vk_b.dst_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(vk_b.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn depth_from_undefined() {
        let b = ImageBarrier {
            image: vk::Image::null(),
            aspect: ImageAspect::Depth,
            src: ImageState::UNDEFINED,
            dst: ImageUsage::DepthAttachment.state(),
        };
        let vk_b = image_barrier(&b);
        assert_eq!(vk_b.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            vk_b.dst_stage_mask,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
        );
        assert_eq!(vk_b.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
    }
}
