use std::io::Cursor;

use anyhow::Result;
use ash::util::read_spv;
use ash::vk;
use flex_render::Vertex;

use crate::error::{RenderError, VkResultExt};

/// Size of the per-draw push constant block: one column-major mat4.
pub const PUSH_CONSTANT_SIZE: u32 = 64;

static MESH_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv"));
/// Fragment stage per shader id.
static FRAGMENT_SHADERS: [&[u8]; 2] = [
  include_bytes!(concat!(env!("OUT_DIR"), "/color.frag.spv")),
  include_bytes!(concat!(env!("OUT_DIR"), "/depth.frag.spv")),
];

/// Pipeline slot for a mesh's shader id. Unknown ids, including the unset sentinel,
/// map to slot 0.
pub fn pipeline_index(shader_id: u32, pipeline_count: usize) -> usize {
  let id = shader_id as usize;
  if id < pipeline_count {
    id
  } else {
    0
  }
}

pub fn transform_bytes(transform: &[f32; 16]) -> &[u8] {
  bytemuck::cast_slice(transform)
}

/// Color + depth, both cleared. Color ends presentable.
pub unsafe fn create_render_pass(
  device: &ash::Device,
  color_format: vk::Format,
  depth_format: vk::Format,
) -> Result<vk::RenderPass> {
  let attachments = [
    vk::AttachmentDescription {
      format: color_format,
      samples: vk::SampleCountFlags::TYPE_1,
      load_op: vk::AttachmentLoadOp::CLEAR,
      store_op: vk::AttachmentStoreOp::STORE,
      stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
      stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
      initial_layout: vk::ImageLayout::UNDEFINED,
      final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
      ..Default::default()
    },
    vk::AttachmentDescription {
      format: depth_format,
      samples: vk::SampleCountFlags::TYPE_1,
      load_op: vk::AttachmentLoadOp::CLEAR,
      store_op: vk::AttachmentStoreOp::DONT_CARE,
      stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
      stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
      initial_layout: vk::ImageLayout::UNDEFINED,
      final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
      ..Default::default()
    },
  ];
  let color_ref = vk::AttachmentReference {
    attachment: 0,
    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
  };
  let depth_ref = vk::AttachmentReference {
    attachment: 1,
    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
  };
  let subpass = vk::SubpassDescription {
    pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
    color_attachment_count: 1,
    p_color_attachments: &color_ref,
    p_depth_stencil_attachment: &depth_ref,
    ..Default::default()
  };
  // Wait for the acquired image (and the previous frame's depth use) before writing.
  let dependency = vk::SubpassDependency {
    src_subpass: vk::SUBPASS_EXTERNAL,
    dst_subpass: 0,
    src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
      | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
    dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
      | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
    src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
    dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
      | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
    ..Default::default()
  };
  let info = vk::RenderPassCreateInfo {
    s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
    attachment_count: attachments.len() as u32,
    p_attachments: attachments.as_ptr(),
    subpass_count: 1,
    p_subpasses: &subpass,
    dependency_count: 1,
    p_dependencies: &dependency,
    ..Default::default()
  };
  Ok(device
    .create_render_pass(&info, None)
    .vk_call("vkCreateRenderPass")?)
}

unsafe fn shader_module(device: &ash::Device, bytes: &[u8]) -> Result<vk::ShaderModule> {
  let code = read_spv(&mut Cursor::new(bytes))?;
  let ci = vk::ShaderModuleCreateInfo {
    s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
    p_code: code.as_ptr(),
    code_size: code.len() * 4,
    ..Default::default()
  };
  Ok(device
    .create_shader_module(&ci, None)
    .vk_call("vkCreateShaderModule")?)
}

/// One graphics pipeline per shader id, sharing a layout with a vertex-stage push constant.
pub struct Pipelines {
  pub layout: vk::PipelineLayout,
  pipelines: Vec<vk::Pipeline>,
}

impl Pipelines {
  pub unsafe fn create(device: &ash::Device, render_pass: vk::RenderPass) -> Result<Self> {
    let push_range = vk::PushConstantRange {
      stage_flags: vk::ShaderStageFlags::VERTEX,
      offset: 0,
      size: PUSH_CONSTANT_SIZE,
    };
    let layout_info = vk::PipelineLayoutCreateInfo {
      s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
      push_constant_range_count: 1,
      p_push_constant_ranges: &push_range,
      ..Default::default()
    };
    let layout = device
      .create_pipeline_layout(&layout_info, None)
      .vk_call("vkCreatePipelineLayout")?;

    let mut out = Self {
      layout,
      pipelines: Vec::with_capacity(FRAGMENT_SHADERS.len()),
    };
    let vs = shader_module(device, MESH_VERT)?;
    for fs_bytes in FRAGMENT_SHADERS {
      let built = shader_module(device, fs_bytes).and_then(|fs| {
        let p = create_mesh_pipeline(device, render_pass, layout, vs, fs);
        device.destroy_shader_module(fs, None);
        p
      });
      match built {
        Ok(p) => out.pipelines.push(p),
        Err(e) => {
          device.destroy_shader_module(vs, None);
          out.destroy(device);
          return Err(e);
        }
      }
    }
    device.destroy_shader_module(vs, None);
    Ok(out)
  }

  pub fn select(&self, shader_id: u32) -> vk::Pipeline {
    self.pipelines[pipeline_index(shader_id, self.pipelines.len())]
  }

  pub unsafe fn destroy(&mut self, device: &ash::Device) {
    for p in self.pipelines.drain(..) {
      device.destroy_pipeline(p, None);
    }
    if self.layout != vk::PipelineLayout::null() {
      device.destroy_pipeline_layout(self.layout, None);
      self.layout = vk::PipelineLayout::null();
    }
  }
}

unsafe fn create_mesh_pipeline(
  device: &ash::Device,
  render_pass: vk::RenderPass,
  layout: vk::PipelineLayout,
  vs: vk::ShaderModule,
  fs: vk::ShaderModule,
) -> Result<vk::Pipeline> {
  let entry = c"main";
  let stages = [
    vk::PipelineShaderStageCreateInfo {
      s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
      stage: vk::ShaderStageFlags::VERTEX,
      module: vs,
      p_name: entry.as_ptr(),
      ..Default::default()
    },
    vk::PipelineShaderStageCreateInfo {
      s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
      stage: vk::ShaderStageFlags::FRAGMENT,
      module: fs,
      p_name: entry.as_ptr(),
      ..Default::default()
    },
  ];

  // Vertex input: binding 0 with Vertex { position, uvw }
  let vb = vk::VertexInputBindingDescription {
    binding: 0,
    stride: std::mem::size_of::<Vertex>() as u32,
    input_rate: vk::VertexInputRate::VERTEX,
  };
  let va = [
    vk::VertexInputAttributeDescription {
      location: 0,
      binding: 0,
      format: vk::Format::R32G32B32_SFLOAT,
      offset: std::mem::offset_of!(Vertex, position) as u32,
    },
    vk::VertexInputAttributeDescription {
      location: 1,
      binding: 0,
      format: vk::Format::R32G32B32_SFLOAT,
      offset: std::mem::offset_of!(Vertex, uvw) as u32,
    },
  ];
  let vertex_input = vk::PipelineVertexInputStateCreateInfo {
    s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
    vertex_binding_description_count: 1,
    p_vertex_binding_descriptions: &vb,
    vertex_attribute_description_count: va.len() as u32,
    p_vertex_attribute_descriptions: va.as_ptr(),
    ..Default::default()
  };
  let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
    s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
    topology: vk::PrimitiveTopology::TRIANGLE_LIST,
    ..Default::default()
  };
  let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
  let dynamic_state = vk::PipelineDynamicStateCreateInfo {
    s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
    dynamic_state_count: dyn_states.len() as u32,
    p_dynamic_states: dyn_states.as_ptr(),
    ..Default::default()
  };
  let viewport_state = vk::PipelineViewportStateCreateInfo {
    s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
    viewport_count: 1,
    scissor_count: 1,
    ..Default::default()
  };
  // No culling: mesh winding is not normalized.
  let raster = vk::PipelineRasterizationStateCreateInfo {
    s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
    polygon_mode: vk::PolygonMode::FILL,
    cull_mode: vk::CullModeFlags::NONE,
    front_face: vk::FrontFace::COUNTER_CLOCKWISE,
    line_width: 1.0,
    ..Default::default()
  };
  let multisample = vk::PipelineMultisampleStateCreateInfo {
    s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
    rasterization_samples: vk::SampleCountFlags::TYPE_1,
    ..Default::default()
  };
  let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
    s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
    depth_test_enable: vk::TRUE,
    depth_write_enable: vk::TRUE,
    depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
    ..Default::default()
  };
  let color_blend_att = vk::PipelineColorBlendAttachmentState {
    color_write_mask: vk::ColorComponentFlags::R
      | vk::ColorComponentFlags::G
      | vk::ColorComponentFlags::B
      | vk::ColorComponentFlags::A,
    blend_enable: vk::FALSE,
    ..Default::default()
  };
  let color_blend = vk::PipelineColorBlendStateCreateInfo {
    s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
    attachment_count: 1,
    p_attachments: &color_blend_att,
    ..Default::default()
  };

  let pipeline_info = vk::GraphicsPipelineCreateInfo {
    s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
    stage_count: stages.len() as u32,
    p_stages: stages.as_ptr(),
    p_vertex_input_state: &vertex_input,
    p_input_assembly_state: &input_assembly,
    p_viewport_state: &viewport_state,
    p_rasterization_state: &raster,
    p_multisample_state: &multisample,
    p_depth_stencil_state: &depth_stencil,
    p_color_blend_state: &color_blend,
    p_dynamic_state: &dynamic_state,
    layout,
    render_pass,
    subpass: 0,
    ..Default::default()
  };

  match device.create_graphics_pipelines(
    vk::PipelineCache::null(),
    std::slice::from_ref(&pipeline_info),
    None,
  ) {
    Ok(p) => Ok(p[0]),
    Err((_, err)) => Err(RenderError::from_vk("vkCreateGraphicsPipelines", err).into()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_shader_ids_fall_back_to_first_pipeline() {
    assert_eq!(pipeline_index(1, 2), 1);
    assert_eq!(pipeline_index(0, 2), 0);
    assert_eq!(pipeline_index(7, 2), 0);
    assert_eq!(pipeline_index(flex_render::DEFAULT_SHADER_ID, 2), 0);
  }

  #[test]
  fn transform_fills_push_constant_block() {
    let m = [0.0f32; 16];
    assert_eq!(transform_bytes(&m).len() as u32, PUSH_CONSTANT_SIZE);
  }

  #[test]
  fn vertex_attributes_are_packed_vec3s() {
    assert_eq!(std::mem::offset_of!(Vertex, position), 0);
    assert_eq!(std::mem::offset_of!(Vertex, uvw), 12);
    assert_eq!(std::mem::size_of::<Vertex>(), 24);
  }

  #[test]
  fn embedded_spirv_is_word_aligned() {
    assert_eq!(MESH_VERT.len() % 4, 0);
    for fs in FRAGMENT_SHADERS {
      assert!(read_spv(&mut Cursor::new(fs)).is_ok());
    }
  }
}
