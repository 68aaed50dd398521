// SPDX-License-Identifier: CEPL-1.0
//! Compiled stages turned into unlinked `VK_EXT_shader_object` handles.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, error};
use woven_render::shader::{CompiledShader, ShaderStage};
use woven_render::BackendError;

use crate::bindless::push_range;
use crate::device::GpuDevice;

pub(crate) const fn stage_flags(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Task => vk::ShaderStageFlags::TASK_EXT,
        ShaderStage::Mesh => vk::ShaderStageFlags::MESH_EXT,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

/// Graphics stages bound on every draw. Stages without a shader get a null
/// handle so nothing from an earlier bind leaks in.
const GRAPHICS_STAGES: [ShaderStage; 4] = [
    ShaderStage::Vertex,
    ShaderStage::Task,
    ShaderStage::Mesh,
    ShaderStage::Fragment,
];

pub(crate) fn create_flags(stage: ShaderStage, has_task: bool) -> vk::ShaderCreateFlagsEXT {
    if stage == ShaderStage::Mesh && !has_task {
        vk::ShaderCreateFlagsEXT::NO_TASK_SHADER
    } else {
        vk::ShaderCreateFlagsEXT::empty()
    }
}

pub struct ShaderObjects {
    gpu: Arc<GpuDevice>,
    shaders: Vec<(ShaderStage, vk::ShaderEXT)>,
}

impl ShaderObjects {
    /// Creates one shader object per compiled stage against the bindless set
    /// layout and the shared push range.
    pub fn new(
        gpu: Arc<GpuDevice>,
        compiled: &[CompiledShader],
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<Self, BackendError> {
        let has_task = compiled.iter().any(|s| s.stage == ShaderStage::Task);
        let names = compiled
            .iter()
            .map(|s| CString::new(s.exposed_name()).map_err(|e| BackendError::call("vkCreateShadersEXT", e)))
            .collect::<Result<Vec<_>, _>>()?;
        let ranges = [push_range()];
        let layouts = [set_layout];

        let infos: Vec<vk::ShaderCreateInfoEXT<'_>> = compiled
            .iter()
            .zip(&names)
            .map(|(shader, name)| {
                let bytes = shader.bytecode.as_bytes();
                vk::ShaderCreateInfoEXT {
                    s_type: vk::StructureType::SHADER_CREATE_INFO_EXT,
                    flags: create_flags(shader.stage, has_task),
                    stage: stage_flags(shader.stage),
                    next_stage: shader
                        .stage
                        .next_stage()
                        .map(stage_flags)
                        .unwrap_or_default(),
                    code_type: vk::ShaderCodeTypeEXT::SPIRV,
                    code_size: bytes.len(),
                    p_code: bytes.as_ptr().cast(),
                    p_name: name.as_ptr(),
                    set_layout_count: layouts.len() as u32,
                    p_set_layouts: layouts.as_ptr(),
                    push_constant_range_count: ranges.len() as u32,
                    p_push_constant_ranges: ranges.as_ptr(),
                    ..Default::default()
                }
            })
            .collect();

        let handles = match unsafe { gpu.shader_object.create_shaders(&infos, None) } {
            Ok(handles) => handles,
            Err((partial, err)) => {
                for handle in partial {
                    if handle != vk::ShaderEXT::null() {
                        unsafe { gpu.shader_object.destroy_shader(handle, None) };
                    }
                }
                error!(stages = compiled.len(), "vkCreateShadersEXT failed: {err}");
                return Err(crate::map_vk_error("vkCreateShadersEXT", err));
            }
        };

        let shaders: Vec<_> = compiled.iter().map(|s| s.stage).zip(handles).collect();
        for shader in compiled {
            debug!(
                module = %shader.module,
                entry = %shader.entry_point,
                stage = %shader.stage,
                "shader object created"
            );
        }
        Ok(Self { gpu, shaders })
    }

    pub fn get(&self, stage: ShaderStage) -> Option<vk::ShaderEXT> {
        self.shaders
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, handle)| *handle)
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    pub unsafe fn bind_graphics(&self, cmd: vk::CommandBuffer) {
        let stages = GRAPHICS_STAGES.map(stage_flags);
        let handles = GRAPHICS_STAGES.map(|s| self.get(s).unwrap_or_default());
        self.gpu.shader_object.cmd_bind_shaders(cmd, &stages, &handles);
    }
}

impl Drop for ShaderObjects {
    fn drop(&mut self) {
        for (_, handle) in self.shaders.drain(..) {
            unsafe { self.gpu.shader_object.destroy_shader(handle, None) };
        }
    }
}
