use anyhow::{Context, Result};
use ash::{prelude::VkResult, vk};
use flex_render::{Mesh, RenderSize, RenderWindow, Renderer};
use tracing::{info, warn};

mod config;
mod context;
mod error;
mod frame;
mod memory;
mod pipeline;
mod swapchain;

pub use config::{RendererConfig, VkVsyncMode, MAX_FRAMES_IN_FLIGHT};
pub use error::RenderError;
pub use frame::{FrameOp, FramePhase};
pub use memory::{GpuBuffer, GpuImage, MeshBuffer, MeshLayout};

use context::DeviceContext;
use error::VkResultExt;
use frame::{FrameRing, FrameSync};
use memory::MemoryManager;
use pipeline::Pipelines;
use swapchain::Swapchain;

/// Frame-loop bookkeeping for the slot currently being worked on.
#[derive(Debug, Default)]
struct FrameState {
  phase: FramePhase,
  image_index: u32,
  /// Rebuild the swapchain at the next frame boundary.
  resize_pending: bool,
  drawable: RenderSize,
}

/// What `acquire_next_frame` does before touching the swapchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AcquireGate {
  /// Nothing to draw into; report a skipped frame.
  Skip,
  /// Rebuild the swapchain and skip this frame.
  Rebuild,
  Proceed,
}

impl FrameState {
  fn check(&self, op: FrameOp) -> Result<FramePhase, RenderError> {
    self.phase.transition(op)
  }

  /// Record a new drawable size. Returns true when the window went to or from 0x0.
  fn resize(&mut self, size: RenderSize) -> bool {
    let toggled = size.is_empty() != self.drawable.is_empty();
    self.drawable = size;
    self.resize_pending = true;
    toggled
  }

  fn gate(&self) -> Result<AcquireGate, RenderError> {
    if self.phase == FramePhase::Invalid {
      return Ok(if self.drawable.is_empty() {
        AcquireGate::Skip
      } else {
        AcquireGate::Rebuild
      });
    }
    self.check(FrameOp::Acquire)?;
    Ok(if self.drawable.is_empty() {
      AcquireGate::Skip
    } else if self.resize_pending {
      AcquireGate::Rebuild
    } else {
      AcquireGate::Proceed
    })
  }

  /// Fold the result of `vkAcquireNextImageKHR` in. `None` means the surface is out of
  /// date and the frame is dropped; suboptimal images are still drawn.
  fn on_acquire(&mut self, acquired: VkResult<(u32, bool)>) -> Result<Option<u32>, RenderError> {
    match acquired {
      Ok((index, suboptimal)) => {
        self.phase = self.check(FrameOp::Acquire)?;
        self.image_index = index;
        self.resize_pending |= suboptimal;
        Ok(Some(index))
      }
      Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
        self.phase = self.check(FrameOp::Invalidate)?;
        self.resize_pending = true;
        Ok(None)
      }
      Err(e) => Err(RenderError::from_vk("vkAcquireNextImageKHR", e)),
    }
  }

  /// Fold the result of `vkQueuePresentKHR` in and finish the frame. Returns whether the
  /// swapchain must be rebuilt now.
  fn on_present(&mut self, presented: VkResult<bool>) -> Result<bool, RenderError> {
    let stale = match presented {
      Ok(suboptimal) => suboptimal,
      Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
      Err(e) => return Err(RenderError::from_vk("vkQueuePresentKHR", e)),
    };
    self.phase = self.check(FrameOp::Present)?;
    self.phase = self.check(FrameOp::Finish)?;
    if stale {
      warn!("vk: surface stale on present, rebuilding");
      self.resize_pending = true;
    }
    Ok(self.resize_pending)
  }

  /// The swapchain now matches `drawable`.
  fn rebuilt(&mut self) -> Result<(), RenderError> {
    self.phase = self.check(FrameOp::Recover)?;
    self.resize_pending = false;
    Ok(())
  }
}

pub struct VkRenderer {
  ctx: DeviceContext,
  memory: MemoryManager,
  swapchain: Swapchain,
  render_pass: vk::RenderPass,
  pipelines: Pipelines,
  cmd_pool: vk::CommandPool,
  frames: Vec<FrameSync>,
  ring: FrameRing,
  state: FrameState,
  cfg: RendererConfig,
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle()
// - Per-frame semaphores/fences, then the command pool (frees its buffers)
// - Framebuffers, views, swapchain, depth image
// - Pipelines/layout, then the render pass they were built against
// - Memory manager (upload objects, allocator) BEFORE device
// - Device, surface, debug messenger; instance last.
impl Drop for VkRenderer {
  fn drop(&mut self) {
    unsafe {
      self.ctx.device.device_wait_idle().ok();

      frame::destroy_frame_syncs(&self.ctx.device, &mut self.frames);
      self.ctx.device.destroy_command_pool(self.cmd_pool, None);

      if let Err(e) = self.swapchain.destroy(&self.ctx, &mut self.memory) {
        warn!("swapchain teardown: {e:#}");
      }
      self.pipelines.destroy(&self.ctx.device);
      self.ctx.device.destroy_render_pass(self.render_pass, None);

      self.memory.destroy();
      self.ctx.destroy();
    }
    info!("vk renderer destroyed");
  }
}

impl VkRenderer {
  pub fn with_config(window: &dyn RenderWindow, cfg: RendererConfig) -> Result<Self> {
    unsafe { build_renderer(window, cfg) }
  }

  pub fn config(&self) -> &RendererConfig {
    &self.cfg
  }

  pub fn phase(&self) -> FramePhase {
    self.state.phase
  }

  fn current_frame(&self) -> FrameSync {
    self.frames[self.ring.current()]
  }

  // STRICT ORDER:
  // 1) device_wait_idle (no frame may still reference the old images)
  // 2) Swapchain::handle_resize (new chain from old, depth, framebuffers, old chain destroyed)
  // 3) Forget image -> slot associations of the old chain
  unsafe fn recreate_swapchain(&mut self) -> Result<()> {
    if self.state.drawable.is_empty() {
      // Minimized: keep the request until there is something to draw into.
      return Ok(());
    }
    self.ctx.wait_idle()?;
    self.swapchain
      .handle_resize(
        &self.ctx,
        &mut self.memory,
        self.render_pass,
        self.state.drawable,
        self.cfg.vsync_mode,
      )
      .context("handle_resize")?;
    self.ring.reset_images(self.swapchain.images.len());
    self.state.rebuilt()?;
    Ok(())
  }
}

unsafe fn create_command_pool(device: &ash::Device, family: u32) -> Result<vk::CommandPool> {
  let pool_ci = vk::CommandPoolCreateInfo {
    s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
    queue_family_index: family,
    flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
    ..Default::default()
  };
  Ok(device
    .create_command_pool(&pool_ci, None)
    .vk_call("vkCreateCommandPool")?)
}

unsafe fn build_renderer(window: &dyn RenderWindow, cfg: RendererConfig) -> Result<VkRenderer> {
  let drawable = window.drawable_size();

  // 1) Instance, surface, device, queues
  let ctx = DeviceContext::new(window, &cfg)?;

  // 2) Allocator + upload path
  let mut memory = MemoryManager::new(&ctx)?;

  // 3) Swapchain, depth, render pass, pipelines, framebuffers
  let mut swapchain = Swapchain::create(&ctx, drawable, cfg.vsync_mode)?;
  let depth = memory.create_depth_buffer_image(swapchain.extent())?;
  swapchain.attach_depth(depth);
  let render_pass =
    pipeline::create_render_pass(&ctx.device, swapchain.plan.format, memory.depth_format())?;
  let pipelines = Pipelines::create(&ctx.device, render_pass)?;
  swapchain.create_frame_buffers(&ctx.device, render_pass)?;

  // 4) Per-slot command buffers and sync
  let cmd_pool = create_command_pool(&ctx.device, ctx.families.graphics)?;
  let frames = frame::create_frame_syncs(&ctx.device, cmd_pool, MAX_FRAMES_IN_FLIGHT)?;
  let ring = FrameRing::new(MAX_FRAMES_IN_FLIGHT, swapchain.images.len());

  info!(
    "vk renderer ready: {}x{}, {} frames in flight, vsync {:?}",
    swapchain.extent().width,
    swapchain.extent().height,
    MAX_FRAMES_IN_FLIGHT,
    cfg.vsync_mode
  );

  Ok(VkRenderer {
    ctx,
    memory,
    swapchain,
    render_pass,
    pipelines,
    cmd_pool,
    frames,
    ring,
    state: FrameState {
      drawable,
      ..Default::default()
    },
    cfg,
  })
}

impl Renderer for VkRenderer {
  type MeshBuffer = MeshBuffer;

  fn new(window: &dyn RenderWindow) -> Result<Self> {
    Self::with_config(window, RendererConfig::from_env())
  }

  fn resize(&mut self, size: RenderSize) {
    if self.state.resize(size) {
      info!(
        "vk: resize to {}x{} → paused={}",
        size.width,
        size.height,
        size.is_empty()
      );
    }
  }

  fn create_mesh_buffer(&mut self, mesh: &Mesh) -> Result<MeshBuffer> {
    unsafe { self.memory.build_mesh_buffer(mesh) }
  }

  fn update_mesh_buffer(&mut self, buffer: &mut MeshBuffer, mesh: &Mesh) -> Result<()> {
    // The buffer may still be read by a frame in flight.
    unsafe {
      self.ctx.wait_idle()?;
      self.memory.update_mesh_buffer(buffer, mesh)
    }
  }

  fn destroy_mesh_buffer(&mut self, buffer: MeshBuffer) -> Result<()> {
    unsafe { self.memory.destroy_mesh_buffer(buffer) }
  }

  // STRICT PER-FRAME ORDER:
  // 1) wait this slot's fence (its previous submit is done)
  // 2) acquire_next_image (signals this slot's image_available)
  // 3) wait the fence of any other slot still rendering into the acquired image
  fn acquire_next_frame(&mut self) -> Result<bool> {
    match self.state.gate()? {
      AcquireGate::Skip => return Ok(false),
      AcquireGate::Rebuild => {
        unsafe { self.recreate_swapchain()? };
        return Ok(false);
      }
      AcquireGate::Proceed => {}
    }

    let frame = self.current_frame();
    unsafe {
      self.ctx
        .device
        .wait_for_fences(&[frame.in_flight], true, u64::MAX)
        .vk_call("vkWaitForFences")?;

      let acquired = self.ctx.swapchain_loader.acquire_next_image(
        self.swapchain.handle,
        self.cfg.acquire_timeout_ns,
        frame.image_available,
        vk::Fence::null(),
      );
      let Some(image_index) = self.state.on_acquire(acquired)? else {
        warn!("vk: swapchain out of date on acquire, rebuilding");
        self.recreate_swapchain()?;
        return Ok(false);
      };

      if let Some(owner) = self.ring.claim_image(image_index as usize) {
        self.ctx
          .device
          .wait_for_fences(&[self.frames[owner].in_flight], true, u64::MAX)
          .vk_call("vkWaitForFences")?;
      }
    }
    Ok(true)
  }

  fn start_draw(&mut self) -> Result<()> {
    let next = self.state.check(FrameOp::StartDraw)?;
    let cmd = self.current_frame().command_buffer;
    let extent = self.swapchain.extent();
    let framebuffer = self.swapchain.framebuffers[self.state.image_index as usize];
    let d = &self.ctx.device;

    unsafe {
      d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        .vk_call("vkResetCommandBuffer")?;
      let bi = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
      };
      d.begin_command_buffer(cmd, &bi)
        .vk_call("vkBeginCommandBuffer")?;

      let clears = [
        vk::ClearValue {
          color: vk::ClearColorValue {
            float32: self.cfg.clear_color,
          },
        },
        vk::ClearValue {
          depth_stencil: vk::ClearDepthStencilValue {
            depth: 1.0,
            stencil: 0,
          },
        },
      ];
      let rp_begin = vk::RenderPassBeginInfo {
        s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
        render_pass: self.render_pass,
        framebuffer,
        render_area: vk::Rect2D {
          offset: vk::Offset2D { x: 0, y: 0 },
          extent,
        },
        clear_value_count: clears.len() as u32,
        p_clear_values: clears.as_ptr(),
        ..Default::default()
      };
      d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);

      let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
      };
      let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
      };
      d.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
      d.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));
    }
    self.state.phase = next;
    Ok(())
  }

  fn draw_mesh(&mut self, mesh: &Mesh, buffer: &MeshBuffer) -> Result<()> {
    let next = self.state.check(FrameOp::DrawMesh)?;
    if !buffer.layout.holds(mesh) {
      return Err(RenderError::Configuration(
        "mesh has outgrown the buffer it is drawn from".into(),
      )
      .into());
    }
    let cmd = self.current_frame().command_buffer;
    let d = &self.ctx.device;
    let transform = mesh.transform.to_cols_array();

    unsafe {
      d.cmd_bind_pipeline(
        cmd,
        vk::PipelineBindPoint::GRAPHICS,
        self.pipelines.select(mesh.shader_id),
      );
      d.cmd_push_constants(
        cmd,
        self.pipelines.layout,
        vk::ShaderStageFlags::VERTEX,
        0,
        pipeline::transform_bytes(&transform),
      );
      d.cmd_bind_vertex_buffers(cmd, 0, &[buffer.buffer.handle], &[buffer.layout.vertex_offset]);
      d.cmd_bind_index_buffer(
        cmd,
        buffer.buffer.handle,
        buffer.layout.index_offset,
        vk::IndexType::UINT32,
      );
      d.cmd_draw_indexed(cmd, mesh.indices.len() as u32, 1, 0, 0, 0);
    }
    self.state.phase = next;
    Ok(())
  }

  fn end_draw(&mut self) -> Result<()> {
    let next = self.state.check(FrameOp::EndDraw)?;
    let cmd = self.current_frame().command_buffer;
    unsafe {
      self.ctx.device.cmd_end_render_pass(cmd);
      self.ctx
        .device
        .end_command_buffer(cmd)
        .vk_call("vkEndCommandBuffer")?;
    }
    self.state.phase = next;
    Ok(())
  }

  // STRICT ORDER:
  // 1) reset this slot's fence only now that work is about to be submitted
  // 2) queue_submit (waits image_available at color output, signals render_finished)
  // 3) queue_present (waits render_finished)
  // 4) advance the slot; rebuild if the surface went stale
  fn present(&mut self) -> Result<()> {
    let submitted = self.state.check(FrameOp::Submit)?;
    let frame = self.current_frame();
    let image_index = self.state.image_index;

    let presented = unsafe {
      let d = &self.ctx.device;
      d.reset_fences(&[frame.in_flight]).vk_call("vkResetFences")?;

      let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
      let submit = vk::SubmitInfo {
        s_type: vk::StructureType::SUBMIT_INFO,
        wait_semaphore_count: 1,
        p_wait_semaphores: &frame.image_available,
        p_wait_dst_stage_mask: wait_stages.as_ptr(),
        command_buffer_count: 1,
        p_command_buffers: &frame.command_buffer,
        signal_semaphore_count: 1,
        p_signal_semaphores: &frame.render_finished,
        ..Default::default()
      };
      d.queue_submit(
        self.ctx.queues.graphics,
        std::slice::from_ref(&submit),
        frame.in_flight,
      )
      .vk_call("vkQueueSubmit")?;
      self.state.phase = submitted;

      let present = vk::PresentInfoKHR {
        s_type: vk::StructureType::PRESENT_INFO_KHR,
        wait_semaphore_count: 1,
        p_wait_semaphores: &frame.render_finished,
        swapchain_count: 1,
        p_swapchains: &self.swapchain.handle,
        p_image_indices: &image_index,
        ..Default::default()
      };
      self.ctx
        .swapchain_loader
        .queue_present(self.ctx.queues.present, &present)
    };

    self.ring.advance();
    if self.state.on_present(presented)? {
      unsafe { self.recreate_swapchain()? };
    }
    Ok(())
  }

  fn stop(&mut self) -> Result<()> {
    unsafe { self.ctx.wait_idle()? };
    info!("vk: device idle");
    Ok(())
  }

  fn set_clear_color(&mut self, rgba: [f32; 4]) {
    self.cfg.clear_color = rgba;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn drawable(width: u32, height: u32) -> FrameState {
    FrameState {
      drawable: RenderSize { width, height },
      ..Default::default()
    }
  }

  fn finish_frame(state: &mut FrameState) {
    for op in [FrameOp::StartDraw, FrameOp::EndDraw, FrameOp::Submit] {
      state.phase = state.check(op).unwrap();
    }
  }

  #[test]
  fn minimized_window_skips_without_rebuilding() {
    let mut state = drawable(800, 600);
    assert!(state.resize(RenderSize { width: 0, height: 0 }));
    assert_eq!(state.gate().unwrap(), AcquireGate::Skip);
    assert_eq!(state.phase, FramePhase::Idle);
    assert!(state.resize_pending);

    assert!(state.resize(RenderSize { width: 640, height: 480 }));
    assert_eq!(state.gate().unwrap(), AcquireGate::Rebuild);
  }

  #[test]
  fn pending_resize_rebuilds_then_proceeds() {
    let mut state = drawable(800, 600);
    assert!(!state.resize(RenderSize { width: 1024, height: 768 }));
    assert_eq!(state.gate().unwrap(), AcquireGate::Rebuild);
    state.rebuilt().unwrap();
    assert!(!state.resize_pending);
    assert_eq!(state.gate().unwrap(), AcquireGate::Proceed);
  }

  #[test]
  fn suboptimal_image_is_drawn_then_rebuilt_after_present() {
    let mut state = drawable(800, 600);
    assert_eq!(state.on_acquire(Ok((2, true))).unwrap(), Some(2));
    assert_eq!(state.phase, FramePhase::FrameAcquired);
    assert_eq!(state.image_index, 2);

    finish_frame(&mut state);
    assert!(state.on_present(Ok(false)).unwrap());
    assert_eq!(state.phase, FramePhase::Idle);
    state.rebuilt().unwrap();
    assert_eq!(state.gate().unwrap(), AcquireGate::Proceed);
  }

  #[test]
  fn out_of_date_acquire_goes_invalid_until_rebuilt() {
    let mut state = drawable(800, 600);
    let acquired = state.on_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap();
    assert_eq!(acquired, None);
    assert_eq!(state.phase, FramePhase::Invalid);
    assert!(state.check(FrameOp::StartDraw).is_err());

    // Minimized while invalid: nothing to rebuild into yet.
    state.resize(RenderSize { width: 0, height: 0 });
    assert_eq!(state.gate().unwrap(), AcquireGate::Skip);
    assert_eq!(state.phase, FramePhase::Invalid);

    state.resize(RenderSize { width: 800, height: 600 });
    assert_eq!(state.gate().unwrap(), AcquireGate::Rebuild);
    state.rebuilt().unwrap();
    assert_eq!(state.phase, FramePhase::Idle);
    assert_eq!(state.gate().unwrap(), AcquireGate::Proceed);
  }

  #[test]
  fn stale_present_requests_rebuild() {
    let mut state = drawable(800, 600);
    state.on_acquire(Ok((0, false))).unwrap();
    finish_frame(&mut state);
    assert!(state.on_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap());
    assert_eq!(state.phase, FramePhase::Idle);

    let mut clean = drawable(800, 600);
    clean.on_acquire(Ok((1, false))).unwrap();
    finish_frame(&mut clean);
    assert!(!clean.on_present(Ok(false)).unwrap());
  }

  #[test]
  fn hard_failures_propagate() {
    let mut state = drawable(800, 600);
    let err = state.on_acquire(Err(vk::Result::TIMEOUT)).unwrap_err();
    assert!(matches!(err, RenderError::SynchronizationTimeout));
    assert_eq!(state.phase, FramePhase::Idle);

    state.on_acquire(Ok((0, false))).unwrap();
    finish_frame(&mut state);
    let err = state.on_present(Err(vk::Result::ERROR_DEVICE_LOST)).unwrap_err();
    assert!(matches!(err, RenderError::Device { .. }));
  }

  #[test]
  fn acquire_out_of_order_is_rejected() {
    let mut state = drawable(800, 600);
    state.on_acquire(Ok((0, false))).unwrap();
    assert!(matches!(
      state.gate(),
      Err(RenderError::FrameOrder { op: FrameOp::Acquire, .. })
    ));
  }
}
