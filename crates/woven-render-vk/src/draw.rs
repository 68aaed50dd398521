// SPDX-License-Identifier: CEPL-1.0
//! Command recording for the demo pass: dynamic rendering into the HDR
//! target, the dynamic state shader objects need, and the final blit.

use ash::vk;
use woven_render::RenderSize;

use crate::device::GpuDevice;
use crate::swapchain::to_extent;

fn full_rect(extent: RenderSize) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: to_extent(extent),
    }
}

pub(crate) unsafe fn begin_rendering(
    gpu: &GpuDevice,
    cmd: vk::CommandBuffer,
    extent: RenderSize,
    color_view: vk::ImageView,
    depth_view: vk::ImageView,
    clear: [f32; 4],
) {
    let color_att = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_view: color_view,
        image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        clear_value: vk::ClearValue {
            color: vk::ClearColorValue { float32: clear },
        },
        ..Default::default()
    };

    // Depth is only needed inside the pass.
    let depth_att = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_view: depth_view,
        image_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        clear_value: vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
        ..Default::default()
    };

    let rendering_info = vk::RenderingInfo {
        s_type: vk::StructureType::RENDERING_INFO,
        render_area: full_rect(extent),
        layer_count: 1,
        color_attachment_count: 1,
        p_color_attachments: &color_att,
        p_depth_attachment: &depth_att,
        ..Default::default()
    };
    gpu.device.cmd_begin_rendering(cmd, &rendering_info);
}

/// With shader objects there is no pipeline to bake state into, so every
/// piece of state the bound stages read is set here, every frame.
pub(crate) unsafe fn set_draw_state(gpu: &GpuDevice, cmd: vk::CommandBuffer, extent: RenderSize) {
    let device = &gpu.device;
    let so = &gpu.shader_object;

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    device.cmd_set_viewport_with_count(cmd, &[viewport]);
    device.cmd_set_scissor_with_count(cmd, &[full_rect(extent)]);

    device.cmd_set_rasterizer_discard_enable(cmd, false);
    device.cmd_set_cull_mode(cmd, vk::CullModeFlags::NONE);
    device.cmd_set_front_face(cmd, vk::FrontFace::COUNTER_CLOCKWISE);
    device.cmd_set_depth_bias_enable(cmd, false);

    device.cmd_set_depth_test_enable(cmd, true);
    device.cmd_set_depth_write_enable(cmd, true);
    device.cmd_set_depth_compare_op(cmd, vk::CompareOp::LESS_OR_EQUAL);
    device.cmd_set_depth_bounds_test_enable(cmd, false);
    device.cmd_set_stencil_test_enable(cmd, false);

    so.cmd_set_polygon_mode(cmd, vk::PolygonMode::FILL);
    so.cmd_set_rasterization_samples(cmd, vk::SampleCountFlags::TYPE_1);
    so.cmd_set_sample_mask(cmd, vk::SampleCountFlags::TYPE_1, &[u32::MAX]);
    so.cmd_set_alpha_to_coverage_enable(cmd, false);
    so.cmd_set_color_blend_enable(cmd, 0, &[vk::FALSE]);
    so.cmd_set_color_write_mask(cmd, 0, &[vk::ColorComponentFlags::RGBA]);
}

fn subresource_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn far_corner(extent: RenderSize) -> vk::Offset3D {
    vk::Offset3D {
        x: i32::try_from(extent.width).unwrap_or(i32::MAX),
        y: i32::try_from(extent.height).unwrap_or(i32::MAX),
        z: 1,
    }
}

/// Copies the HDR target onto the swapchain image, converting format. Both
/// must already be in their transfer layouts.
pub(crate) unsafe fn blit_to_present(
    gpu: &GpuDevice,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    extent: RenderSize,
) {
    let corners = [vk::Offset3D::default(), far_corner(extent)];
    let region = vk::ImageBlit2 {
        s_type: vk::StructureType::IMAGE_BLIT_2,
        src_subresource: subresource_layers(),
        src_offsets: corners,
        dst_subresource: subresource_layers(),
        dst_offsets: corners,
        ..Default::default()
    };
    let info = vk::BlitImageInfo2 {
        s_type: vk::StructureType::BLIT_IMAGE_INFO_2,
        src_image: src,
        src_image_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        dst_image: dst,
        dst_image_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        region_count: 1,
        p_regions: &region,
        filter: vk::Filter::NEAREST,
        ..Default::default()
    };
    gpu.device.cmd_blit_image2(cmd, &info);
}
