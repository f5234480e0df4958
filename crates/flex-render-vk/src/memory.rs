//! Buffer and image memory through gpu-allocator, plus the blocking upload path.

use anyhow::Result;
use ash::vk;
use flex_render::{BufferUsage, Mesh};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use tracing::{debug, info, warn};

use crate::context::{DeviceContext, ResolvedFamilies};
use crate::error::{RenderError, VkResultExt};

/// Preference order for the depth attachment.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 4] = [
  vk::Format::D32_SFLOAT,
  vk::Format::D24_UNORM_S8_UINT,
  vk::Format::D32_SFLOAT_S8_UINT,
  vk::Format::D16_UNORM,
];

pub struct GpuBuffer {
  pub handle: vk::Buffer,
  allocation: Option<Allocation>,
  pub size: vk::DeviceSize,
  pub usage: BufferUsage,
  pub location: MemoryLocation,
}

impl GpuBuffer {
  pub fn is_host_visible(&self) -> bool {
    self.allocation.as_ref().is_some_and(|a| a.mapped_ptr().is_some())
  }

  /// Mapped bytes, trimmed to the requested size. `None` for device-only memory.
  fn mapped_mut(&mut self) -> Option<&mut [u8]> {
    let size = self.size as usize;
    self.allocation
      .as_mut()
      .and_then(|a| a.mapped_slice_mut())
      .map(|s| {
        let n = size.min(s.len());
        &mut s[..n]
      })
  }
}

pub struct GpuImage {
  pub handle: vk::Image,
  pub view: vk::ImageView,
  allocation: Option<Allocation>,
  pub format: vk::Format,
  pub extent: vk::Extent2D,
  pub aspect: vk::ImageAspectFlags,
}

/// Byte ranges of one mesh inside its buffer: indices first, vertices right after.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshLayout {
  pub index_offset: vk::DeviceSize,
  pub index_bytes: vk::DeviceSize,
  pub vertex_offset: vk::DeviceSize,
  pub vertex_bytes: vk::DeviceSize,
}

impl MeshLayout {
  pub fn of(mesh: &Mesh) -> Self {
    let index_bytes = mesh.indices_size() as vk::DeviceSize;
    Self {
      index_offset: 0,
      index_bytes,
      vertex_offset: index_bytes,
      vertex_bytes: mesh.vertices_size() as vk::DeviceSize,
    }
  }

  pub fn total(&self) -> vk::DeviceSize {
    self.index_bytes + self.vertex_bytes
  }

  /// Whether `mesh` fits in the ranges fixed by this layout.
  pub fn holds(&self, mesh: &Mesh) -> bool {
    mesh.indices_size() as vk::DeviceSize <= self.index_bytes
      && mesh.vertices_size() as vk::DeviceSize <= self.vertex_bytes
  }

  /// `(bytes, destination offset)` for each upload, indices first.
  pub fn uploads<'m>(&self, mesh: &'m Mesh) -> [(&'m [u8], vk::DeviceSize); 2] {
    [
      (mesh.index_bytes(), self.index_offset),
      (mesh.vertex_bytes(), self.vertex_offset),
    ]
  }
}

/// A buffer holding one mesh, with the ranges fixed at creation.
pub struct MeshBuffer {
  pub buffer: GpuBuffer,
  pub layout: MeshLayout,
}

/// Bounds-checked copy of `src[src_offset..][..byte_count]` into `dst[dst_offset..]`.
pub fn copy_into_mapped(
  dst: &mut [u8],
  src: &[u8],
  byte_count: usize,
  src_offset: usize,
  dst_offset: usize,
) -> Result<(), RenderError> {
  let src_end = src_offset.checked_add(byte_count).filter(|&e| e <= src.len());
  let dst_end = dst_offset.checked_add(byte_count).filter(|&e| e <= dst.len());
  match (src_end, dst_end) {
    (Some(src_end), Some(dst_end)) => {
      dst[dst_offset..dst_end].copy_from_slice(&src[src_offset..src_end]);
      Ok(())
    }
    _ => Err(RenderError::Allocation(format!(
      "copy of {byte_count} bytes (src+{src_offset} of {}, dst+{dst_offset} of {}) is out of range",
      src.len(),
      dst.len()
    ))),
  }
}

fn check_upload_range(
  byte_count: vk::DeviceSize,
  dst_offset: vk::DeviceSize,
  dst_size: vk::DeviceSize,
) -> Result<(), RenderError> {
  match dst_offset.checked_add(byte_count) {
    Some(end) if end <= dst_size => Ok(()),
    _ => Err(RenderError::Allocation(format!(
      "upload of {byte_count} bytes at {dst_offset} exceeds buffer of {dst_size}"
    ))),
  }
}

/// The host-visible branch of an upload: `mapped` is the whole destination buffer.
pub fn upload_mapped(
  mapped: &mut [u8],
  host: &[u8],
  byte_count: vk::DeviceSize,
  src_offset: vk::DeviceSize,
  dst_offset: vk::DeviceSize,
) -> Result<(), RenderError> {
  if byte_count == 0 {
    return Ok(());
  }
  check_upload_range(byte_count, dst_offset, mapped.len() as vk::DeviceSize)?;
  copy_into_mapped(
    mapped,
    host,
    byte_count as usize,
    src_offset as usize,
    dst_offset as usize,
  )
}

/// Place every range of `mesh` into a mapped mesh buffer.
pub fn write_mesh_mapped(mapped: &mut [u8], layout: &MeshLayout, mesh: &Mesh) -> Result<(), RenderError> {
  for (bytes, offset) in layout.uploads(mesh) {
    upload_mapped(mapped, bytes, bytes.len() as vk::DeviceSize, 0, offset)?;
  }
  Ok(())
}

/// Whether a copy on the transfer family must hand the buffer over to the graphics family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipTransfer {
  None,
  ReleaseAcquire { src: u32, dst: u32 },
}

pub fn ownership_transfer(transfer_family: u32, graphics_family: u32) -> OwnershipTransfer {
  if transfer_family == graphics_family {
    OwnershipTransfer::None
  } else {
    OwnershipTransfer::ReleaseAcquire {
      src: transfer_family,
      dst: graphics_family,
    }
  }
}

pub fn usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
  let mut flags = vk::BufferUsageFlags::empty();
  if usage.contains(BufferUsage::VERTEX) {
    flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
  }
  if usage.contains(BufferUsage::INDEX) {
    flags |= vk::BufferUsageFlags::INDEX_BUFFER;
  }
  if usage.contains(BufferUsage::STAGING) {
    flags |= vk::BufferUsageFlags::TRANSFER_SRC;
  }
  if usage.contains(BufferUsage::TRANSFER) {
    flags |= vk::BufferUsageFlags::TRANSFER_DST;
  }
  flags
}

pub fn select_depth_format(
  candidates: &[vk::Format],
  optimal_features: impl Fn(vk::Format) -> vk::FormatFeatureFlags,
) -> Option<vk::Format> {
  candidates.iter().copied().find(|&f| {
    optimal_features(f).contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
  })
}

pub struct MemoryManager {
  device: ash::Device,
  allocator: Option<Allocator>,
  families: ResolvedFamilies,
  transfer_queue: vk::Queue,
  graphics_queue: vk::Queue,
  transfer_pool: vk::CommandPool,
  transfer_cmd: vk::CommandBuffer,
  // Acquire side of a queue family handover.
  graphics_pool: vk::CommandPool,
  graphics_cmd: vk::CommandBuffer,
  upload_fence: vk::Fence,
  handover: vk::Semaphore,
  depth_format: vk::Format,
}

unsafe fn one_shot_pool(device: &ash::Device, family: u32) -> Result<(vk::CommandPool, vk::CommandBuffer)> {
  let pool_ci = vk::CommandPoolCreateInfo {
    s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
    queue_family_index: family,
    flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER | vk::CommandPoolCreateFlags::TRANSIENT,
    ..Default::default()
  };
  let pool = device
    .create_command_pool(&pool_ci, None)
    .vk_call("vkCreateCommandPool")?;
  let ai = vk::CommandBufferAllocateInfo {
    s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
    command_pool: pool,
    level: vk::CommandBufferLevel::PRIMARY,
    command_buffer_count: 1,
    ..Default::default()
  };
  let cmd = device
    .allocate_command_buffers(&ai)
    .vk_call("vkAllocateCommandBuffers")?[0];
  Ok((pool, cmd))
}

unsafe fn begin_one_shot(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<(), RenderError> {
  device
    .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
    .vk_call("vkResetCommandBuffer")?;
  let bi = vk::CommandBufferBeginInfo {
    s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
    ..Default::default()
  };
  device
    .begin_command_buffer(cmd, &bi)
    .vk_call("vkBeginCommandBuffer")
}

impl MemoryManager {
  pub unsafe fn new(ctx: &DeviceContext) -> Result<Self> {
    let mut debug_settings = AllocatorDebugSettings::default();
    debug_settings.log_memory_information = cfg!(debug_assertions);
    debug_settings.log_leaks_on_shutdown = true;
    let allocator = Allocator::new(&AllocatorCreateDesc {
      instance: ctx.instance.clone(),
      device: ctx.device.clone(),
      physical_device: ctx.physical_device,
      debug_settings,
      buffer_device_address: false,
      allocation_sizes: Default::default(),
    })
    .map_err(RenderError::from)?;

    let depth_format = select_depth_format(&DEPTH_FORMAT_CANDIDATES, |f| {
      ctx.instance
        .get_physical_device_format_properties(ctx.physical_device, f)
        .optimal_tiling_features
    })
    .ok_or_else(|| RenderError::Configuration("no depth attachment format supported".into()))?;

    let device = ctx.device.clone();
    let (transfer_pool, transfer_cmd) = one_shot_pool(&device, ctx.families.transfer)?;
    let (graphics_pool, graphics_cmd) = one_shot_pool(&device, ctx.families.graphics)?;
    let upload_fence = device
      .create_fence(&vk::FenceCreateInfo::default(), None)
      .vk_call("vkCreateFence")?;
    let handover = device
      .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
      .vk_call("vkCreateSemaphore")?;

    info!(
      "memory manager ready (depth {:?}, transfer family {}{})",
      depth_format,
      ctx.families.transfer,
      if ctx.families.transfer != ctx.families.graphics { ", dedicated" } else { "" }
    );

    Ok(Self {
      device,
      allocator: Some(allocator),
      families: ctx.families,
      transfer_queue: ctx.queues.transfer,
      graphics_queue: ctx.queues.graphics,
      transfer_pool,
      transfer_cmd,
      graphics_pool,
      graphics_cmd,
      upload_fence,
      handover,
      depth_format,
    })
  }

  pub fn depth_format(&self) -> vk::Format {
    self.depth_format
  }

  fn allocator(&mut self) -> Result<&mut Allocator, RenderError> {
    self.allocator
      .as_mut()
      .ok_or_else(|| RenderError::Allocation("memory manager already destroyed".into()))
  }

  pub unsafe fn build_buffer(
    &mut self,
    size: vk::DeviceSize,
    usage: BufferUsage,
    location: MemoryLocation,
  ) -> Result<GpuBuffer> {
    if size == 0 {
      return Err(RenderError::Configuration("cannot create an empty buffer".into()).into());
    }
    let info = vk::BufferCreateInfo {
      s_type: vk::StructureType::BUFFER_CREATE_INFO,
      size,
      usage: usage_flags(usage),
      sharing_mode: vk::SharingMode::EXCLUSIVE,
      ..Default::default()
    };
    let handle = self
      .device
      .create_buffer(&info, None)
      .vk_call("vkCreateBuffer")?;
    let requirements = self.device.get_buffer_memory_requirements(handle);

    let name = if usage.contains(BufferUsage::STAGING) { "staging" } else { "buffer" };
    let allocation = match self.allocator()?.allocate(&AllocationCreateDesc {
      name,
      requirements,
      location,
      linear: true,
      allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    }) {
      Ok(a) => a,
      Err(e) => {
        self.device.destroy_buffer(handle, None);
        return Err(RenderError::from(e).into());
      }
    };

    if let Err(e) = self
      .device
      .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
      .vk_call("vkBindBufferMemory")
    {
      self.device.destroy_buffer(handle, None);
      self.allocator()?.free(allocation).map_err(RenderError::from)?;
      return Err(e.into());
    }

    debug!("buffer {size} bytes {usage:?} in {location:?}");
    Ok(GpuBuffer {
      handle,
      allocation: Some(allocation),
      size,
      usage,
      location,
    })
  }

  /// Copy `byte_count` bytes of `host` starting at `src_offset` into `dst` at
  /// `dst_offset`. Blocks until the data is visible to vertex input on the graphics queue.
  pub unsafe fn upload_to_buffer(
    &mut self,
    host: &[u8],
    dst: &mut GpuBuffer,
    byte_count: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
  ) -> Result<()> {
    if byte_count == 0 {
      return Ok(());
    }
    check_upload_range(byte_count, dst_offset, dst.size)?;

    if let Some(mapped) = dst.mapped_mut() {
      upload_mapped(mapped, host, byte_count, src_offset, dst_offset)?;
      return Ok(());
    }

    let mut staging =
      self.build_buffer(byte_count, BufferUsage::STAGING, MemoryLocation::CpuToGpu)?;
    let staged = match staging.mapped_mut() {
      Some(mapped) => copy_into_mapped(mapped, host, byte_count as usize, src_offset as usize, 0),
      None => Err(RenderError::Allocation("staging buffer is not host visible".into())),
    };
    let copied = match staged {
      Ok(()) => self.submit_copy(staging.handle, dst.handle, byte_count, dst_offset),
      Err(e) => Err(e.into()),
    };
    self.destroy_buffer(staging)?;
    copied
  }

  unsafe fn submit_copy(
    &mut self,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
  ) -> Result<()> {
    let d = &self.device;
    let cmd = self.transfer_cmd;
    begin_one_shot(d, cmd)?;

    let region = vk::BufferCopy {
      src_offset: 0,
      dst_offset,
      size,
    };
    d.cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region));

    let handover = ownership_transfer(self.families.transfer, self.families.graphics);
    let (src_family, dst_family) = match handover {
      OwnershipTransfer::None => (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
      OwnershipTransfer::ReleaseAcquire { src, dst } => (src, dst),
    };
    let barrier = vk::BufferMemoryBarrier {
      s_type: vk::StructureType::BUFFER_MEMORY_BARRIER,
      src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
      dst_access_mask: vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ,
      src_queue_family_index: src_family,
      dst_queue_family_index: dst_family,
      buffer: dst,
      offset: dst_offset,
      size,
      ..Default::default()
    };

    match handover {
      OwnershipTransfer::None => {
        d.cmd_pipeline_barrier(
          cmd,
          vk::PipelineStageFlags::TRANSFER,
          vk::PipelineStageFlags::VERTEX_INPUT,
          vk::DependencyFlags::empty(),
          &[],
          std::slice::from_ref(&barrier),
          &[],
        );
        d.end_command_buffer(cmd).vk_call("vkEndCommandBuffer")?;

        let si = vk::SubmitInfo {
          s_type: vk::StructureType::SUBMIT_INFO,
          command_buffer_count: 1,
          p_command_buffers: &cmd,
          ..Default::default()
        };
        self.submit_and_wait(self.transfer_queue, &si)?;
      }
      OwnershipTransfer::ReleaseAcquire { .. } => {
        // Release: destination access is ignored on the releasing queue.
        let release = vk::BufferMemoryBarrier {
          dst_access_mask: vk::AccessFlags::empty(),
          ..barrier
        };
        d.cmd_pipeline_barrier(
          cmd,
          vk::PipelineStageFlags::TRANSFER,
          vk::PipelineStageFlags::BOTTOM_OF_PIPE,
          vk::DependencyFlags::empty(),
          &[],
          std::slice::from_ref(&release),
          &[],
        );
        d.end_command_buffer(cmd).vk_call("vkEndCommandBuffer")?;

        let release_si = vk::SubmitInfo {
          s_type: vk::StructureType::SUBMIT_INFO,
          command_buffer_count: 1,
          p_command_buffers: &cmd,
          signal_semaphore_count: 1,
          p_signal_semaphores: &self.handover,
          ..Default::default()
        };
        d.queue_submit(self.transfer_queue, std::slice::from_ref(&release_si), vk::Fence::null())
          .vk_call("vkQueueSubmit")?;

        // Acquire on the graphics queue, after the release signalled.
        let acquired = (|| -> Result<(), RenderError> {
          let gcmd = self.graphics_cmd;
          begin_one_shot(d, gcmd)?;
          let acquire = vk::BufferMemoryBarrier {
            src_access_mask: vk::AccessFlags::empty(),
            ..barrier
          };
          d.cmd_pipeline_barrier(
            gcmd,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::DependencyFlags::empty(),
            &[],
            std::slice::from_ref(&acquire),
            &[],
          );
          d.end_command_buffer(gcmd).vk_call("vkEndCommandBuffer")?;

          let wait_stage = vk::PipelineStageFlags::VERTEX_INPUT;
          let acquire_si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &self.handover,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &gcmd,
            ..Default::default()
          };
          self.submit_and_wait(self.graphics_queue, &acquire_si)
        })();
        if let Err(e) = acquired {
          // The release may have signalled the semaphore with nobody left to wait on it.
          if let Err(reset) = self.reset_handover() {
            warn!("handover semaphore reset: {reset}");
          }
          return Err(e.into());
        }
      }
    }
    Ok(())
  }

  /// Drain the device and replace the handover semaphore with an unsignalled one.
  unsafe fn reset_handover(&mut self) -> Result<(), RenderError> {
    self.device.device_wait_idle().vk_call("vkDeviceWaitIdle")?;
    self.device.destroy_semaphore(self.handover, None);
    self.handover = vk::Semaphore::null();
    self.handover = self
      .device
      .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
      .vk_call("vkCreateSemaphore")?;
    Ok(())
  }

  unsafe fn submit_and_wait(&self, queue: vk::Queue, si: &vk::SubmitInfo<'_>) -> Result<(), RenderError> {
    let d = &self.device;
    d.reset_fences(&[self.upload_fence]).vk_call("vkResetFences")?;
    d.queue_submit(queue, std::slice::from_ref(si), self.upload_fence)
      .vk_call("vkQueueSubmit")?;
    d.wait_for_fences(&[self.upload_fence], true, u64::MAX)
      .vk_call("vkWaitForFences")
  }

  /// Device-local buffer holding `mesh`, indices at offset 0 and vertices after them.
  pub unsafe fn build_mesh_buffer(&mut self, mesh: &Mesh) -> Result<MeshBuffer> {
    let layout = MeshLayout::of(mesh);
    let mut buffer = self.build_buffer(layout.total(), BufferUsage::MESH, MemoryLocation::GpuOnly)?;
    if let Err(e) = self.write_mesh(&mut buffer, &layout, mesh) {
      self.destroy_buffer(buffer)?;
      return Err(e);
    }
    debug!(
      "mesh buffer: {} indices, {} vertices, {} bytes",
      mesh.indices.len(),
      mesh.vertices.len(),
      layout.total()
    );
    Ok(MeshBuffer { buffer, layout })
  }

  /// Rewrite a mesh buffer in place. The new data must fit the ranges fixed at creation.
  pub unsafe fn update_mesh_buffer(&mut self, target: &mut MeshBuffer, mesh: &Mesh) -> Result<()> {
    if !target.layout.holds(mesh) {
      let need = MeshLayout::of(mesh);
      return Err(RenderError::Allocation(format!(
        "mesh needs {}+{} bytes, buffer ranges are {}+{}",
        need.index_bytes, need.vertex_bytes, target.layout.index_bytes, target.layout.vertex_bytes
      ))
      .into());
    }
    let layout = target.layout;
    self.write_mesh(&mut target.buffer, &layout, mesh)
  }

  unsafe fn write_mesh(&mut self, buffer: &mut GpuBuffer, layout: &MeshLayout, mesh: &Mesh) -> Result<()> {
    if let Some(mapped) = buffer.mapped_mut() {
      write_mesh_mapped(mapped, layout, mesh)?;
      return Ok(());
    }
    for (bytes, offset) in layout.uploads(mesh) {
      self.upload_to_buffer(bytes, buffer, bytes.len() as vk::DeviceSize, 0, offset)?;
    }
    Ok(())
  }

  pub unsafe fn create_image(
    &mut self,
    extent: vk::Extent2D,
    format: vk::Format,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
  ) -> Result<GpuImage> {
    let img_ci = vk::ImageCreateInfo {
      s_type: vk::StructureType::IMAGE_CREATE_INFO,
      image_type: vk::ImageType::TYPE_2D,
      format,
      extent: vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: 1,
      },
      mip_levels: 1,
      array_layers: 1,
      samples: vk::SampleCountFlags::TYPE_1,
      tiling,
      usage,
      sharing_mode: vk::SharingMode::EXCLUSIVE,
      initial_layout: vk::ImageLayout::UNDEFINED,
      ..Default::default()
    };
    let handle = self
      .device
      .create_image(&img_ci, None)
      .vk_call("vkCreateImage")?;
    let requirements = self.device.get_image_memory_requirements(handle);

    let allocation = match self.allocator()?.allocate(&AllocationCreateDesc {
      name: "image",
      requirements,
      location: MemoryLocation::GpuOnly,
      linear: tiling == vk::ImageTiling::LINEAR,
      allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    }) {
      Ok(a) => a,
      Err(e) => {
        self.device.destroy_image(handle, None);
        return Err(RenderError::from(e).into());
      }
    };

    let mut image = GpuImage {
      handle,
      view: vk::ImageView::null(),
      allocation: Some(allocation),
      format,
      extent,
      aspect,
    };

    let bound = match image.allocation.as_ref() {
      Some(a) => self
        .device
        .bind_image_memory(handle, a.memory(), a.offset())
        .vk_call("vkBindImageMemory"),
      None => Ok(()),
    };
    let view = bound.and_then(|()| {
      let view_ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image: handle,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: vk::ImageSubresourceRange {
          aspect_mask: aspect,
          base_mip_level: 0,
          level_count: 1,
          base_array_layer: 0,
          layer_count: 1,
        },
        ..Default::default()
      };
      self.device
        .create_image_view(&view_ci, None)
        .vk_call("vkCreateImageView")
    });

    match view {
      Ok(view) => {
        image.view = view;
        Ok(image)
      }
      Err(e) => {
        self.destroy_image(image)?;
        Err(e.into())
      }
    }
  }

  /// Depth attachment sized to the swapchain.
  pub unsafe fn create_depth_buffer_image(&mut self, extent: vk::Extent2D) -> Result<GpuImage> {
    self.create_image(
      extent,
      self.depth_format,
      vk::ImageTiling::OPTIMAL,
      vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
      vk::ImageAspectFlags::DEPTH,
    )
  }

  pub unsafe fn destroy_buffer(&mut self, mut buffer: GpuBuffer) -> Result<()> {
    self.device.destroy_buffer(buffer.handle, None);
    if let Some(allocation) = buffer.allocation.take() {
      self.allocator()?.free(allocation).map_err(RenderError::from)?;
    }
    Ok(())
  }

  pub unsafe fn destroy_mesh_buffer(&mut self, mesh: MeshBuffer) -> Result<()> {
    self.destroy_buffer(mesh.buffer)
  }

  pub unsafe fn destroy_image(&mut self, mut image: GpuImage) -> Result<()> {
    if image.view != vk::ImageView::null() {
      self.device.destroy_image_view(image.view, None);
    }
    self.device.destroy_image(image.handle, None);
    if let Some(allocation) = image.allocation.take() {
      self.allocator()?.free(allocation).map_err(RenderError::from)?;
    }
    Ok(())
  }

  /// Upload objects, then the allocator. Every buffer and image must already be freed.
  pub unsafe fn destroy(&mut self) {
    let d = &self.device;
    d.destroy_semaphore(self.handover, None);
    d.destroy_fence(self.upload_fence, None);
    d.destroy_command_pool(self.graphics_pool, None);
    d.destroy_command_pool(self.transfer_pool, None);
    drop(self.allocator.take());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flex_render::Vertex;

  fn tri() -> Mesh {
    Mesh::new(
      vec![0, 1, 2],
      vec![
        Vertex::new([0.0, 0.5, 0.0], [1.0, 0.0, 0.0]),
        Vertex::new([-0.5, -0.5, 0.0], [0.0, 1.0, 0.0]),
        Vertex::new([0.5, -0.5, 0.0], [0.0, 0.0, 1.0]),
      ],
    )
  }

  #[test]
  fn layout_puts_vertices_after_indices() {
    let mesh = tri();
    let layout = MeshLayout::of(&mesh);
    assert_eq!(layout.index_offset, 0);
    assert_eq!(layout.index_bytes, 12);
    assert_eq!(layout.vertex_offset, 12);
    assert_eq!(layout.vertex_bytes, 72);
    assert_eq!(layout.total(), mesh.required_buffer_size() as u64);
  }

  #[test]
  fn mapped_uploads_round_trip() {
    let mesh = Mesh::cube();
    let layout = MeshLayout::of(&mesh);
    let mut memory = vec![0u8; layout.total() as usize];
    for (bytes, offset) in layout.uploads(&mesh) {
      copy_into_mapped(&mut memory, bytes, bytes.len(), 0, offset as usize).unwrap();
    }
    let (idx, vtx) = memory.split_at(layout.vertex_offset as usize);
    assert_eq!(bytemuck::cast_slice::<u8, u32>(idx), mesh.indices.as_slice());
    assert_eq!(bytemuck::cast_slice::<u8, Vertex>(vtx), mesh.vertices.as_slice());
  }

  #[test]
  fn mapped_mesh_write_places_indices_then_vertices() {
    let mesh = Mesh::cube();
    let layout = MeshLayout::of(&mesh);
    let mut mapped = vec![0xAAu8; layout.total() as usize];
    write_mesh_mapped(&mut mapped, &layout, &mesh).unwrap();
    let (idx, vtx) = mapped.split_at(layout.vertex_offset as usize);
    assert_eq!(bytemuck::cast_slice::<u8, u32>(idx), mesh.indices.as_slice());
    assert_eq!(bytemuck::cast_slice::<u8, Vertex>(vtx), mesh.vertices.as_slice());

    // A smaller mesh rewritten into the same ranges leaves the tail alone.
    let small = tri();
    assert!(layout.holds(&small));
    write_mesh_mapped(&mut mapped, &layout, &small).unwrap();
    let (idx, vtx) = mapped.split_at(layout.vertex_offset as usize);
    assert_eq!(bytemuck::cast_slice::<u8, u32>(&idx[..12]), small.indices.as_slice());
    assert_eq!(&idx[12..], &bytemuck::cast_slice::<u32, u8>(&mesh.indices)[12..]);
    assert_eq!(bytemuck::cast_slice::<u8, Vertex>(&vtx[..72]), small.vertices.as_slice());
  }

  #[test]
  fn mapped_upload_checks_destination_range() {
    let mut mapped = [0u8; 8];
    assert!(matches!(
      upload_mapped(&mut mapped, &[1; 8], 4, 0, 6),
      Err(RenderError::Allocation(_))
    ));
    assert!(upload_mapped(&mut mapped, &[1; 8], 4, 0, u64::MAX).is_err());
    assert!(upload_mapped(&mut mapped, &[], 0, 0, 100).is_ok());
    upload_mapped(&mut mapped, &[1, 2, 3, 4], 2, 2, 6).unwrap();
    assert_eq!(mapped, [0, 0, 0, 0, 0, 0, 3, 4]);

    let layout = MeshLayout::of(&Mesh::cube());
    let mut short = vec![0u8; layout.total() as usize - 1];
    assert!(write_mesh_mapped(&mut short, &layout, &Mesh::cube()).is_err());
  }

  #[test]
  fn copy_honours_offsets() {
    let src = [1u8, 2, 3, 4, 5];
    let mut dst = [0u8; 6];
    copy_into_mapped(&mut dst, &src, 3, 1, 2).unwrap();
    assert_eq!(dst, [0, 0, 2, 3, 4, 0]);
  }

  #[test]
  fn copy_out_of_range_is_rejected() {
    let src = [0u8; 4];
    let mut dst = [0u8; 4];
    assert!(copy_into_mapped(&mut dst, &src, 4, 1, 0).is_err());
    assert!(copy_into_mapped(&mut dst, &src, 4, 0, 1).is_err());
    assert!(copy_into_mapped(&mut dst, &src, usize::MAX, 0, 0).is_err());
    assert!(copy_into_mapped(&mut dst, &src, 0, 4, 4).is_ok());
  }

  #[test]
  fn update_must_fit_creation_ranges() {
    let layout = MeshLayout::of(&Mesh::cube());
    let mut moved = Mesh::cube();
    moved.transform = glam::Mat4::from_rotation_y(1.0);
    assert!(layout.holds(&moved));
    assert!(layout.holds(&tri()));

    let mut bigger = Mesh::cube();
    bigger.vertices.push(Vertex::default());
    assert!(!layout.holds(&bigger));
  }

  #[test]
  fn handover_only_between_distinct_families() {
    assert_eq!(ownership_transfer(0, 0), OwnershipTransfer::None);
    assert_eq!(
      ownership_transfer(2, 0),
      OwnershipTransfer::ReleaseAcquire { src: 2, dst: 0 }
    );
  }

  #[test]
  fn mesh_usage_maps_to_vertex_index_and_transfer_dst() {
    let flags = usage_flags(BufferUsage::MESH);
    assert!(flags.contains(
      vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
        | vk::BufferUsageFlags::TRANSFER_DST
    ));
    assert!(!flags.contains(vk::BufferUsageFlags::TRANSFER_SRC));
    assert_eq!(usage_flags(BufferUsage::STAGING), vk::BufferUsageFlags::TRANSFER_SRC);
  }

  #[test]
  fn depth_format_follows_preference() {
    let supported = |f: vk::Format| {
      if f == vk::Format::D24_UNORM_S8_UINT || f == vk::Format::D16_UNORM {
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
      } else {
        vk::FormatFeatureFlags::empty()
      }
    };
    assert_eq!(
      select_depth_format(&DEPTH_FORMAT_CANDIDATES, supported),
      Some(vk::Format::D24_UNORM_S8_UINT)
    );
    assert_eq!(
      select_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| vk::FormatFeatureFlags::empty()),
      None
    );
  }
}
