use anyhow::Result;
use ash::vk;

use crate::error::{RenderError, VkResultExt};

/// Where the renderer is within one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FramePhase {
  #[default]
  Idle,
  FrameAcquired,
  Recording,
  Recorded,
  Submitted,
  Presented,
  /// Acquire hit a stale surface; the swapchain must be rebuilt before the next frame.
  Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOp {
  Acquire,
  StartDraw,
  DrawMesh,
  EndDraw,
  Submit,
  Present,
  Finish,
  Invalidate,
  Recover,
}

impl FramePhase {
  pub fn after(self, op: FrameOp) -> Option<FramePhase> {
    use FrameOp as O;
    use FramePhase as P;
    Some(match (self, op) {
      (P::Idle, O::Acquire) => P::FrameAcquired,
      (P::Idle, O::Invalidate) => P::Invalid,
      (P::Invalid, O::Recover) | (P::Idle, O::Recover) => P::Idle,
      (P::FrameAcquired, O::StartDraw) => P::Recording,
      (P::Recording, O::DrawMesh) => P::Recording,
      (P::Recording, O::EndDraw) => P::Recorded,
      (P::Recorded, O::Submit) => P::Submitted,
      (P::Submitted, O::Present) => P::Presented,
      (P::Presented, O::Finish) => P::Idle,
      _ => return None,
    })
  }

  /// Next phase, or `FrameOrder` if `op` is not legal here.
  pub fn transition(self, op: FrameOp) -> Result<FramePhase, RenderError> {
    self.after(op)
      .ok_or(RenderError::FrameOrder { op, phase: self })
  }
}

/// Ring of frame slots plus the image -> slot table that keeps two slots from
/// rendering into the same swapchain image.
#[derive(Debug)]
pub struct FrameRing {
  current: usize,
  frames: usize,
  images_in_flight: Vec<Option<usize>>,
}

impl FrameRing {
  pub fn new(frames: usize, image_count: usize) -> Self {
    Self {
      current: 0,
      frames: frames.max(1),
      images_in_flight: vec![None; image_count],
    }
  }

  pub fn current(&self) -> usize {
    self.current
  }

  /// Mark `image` as owned by the current slot. Returns the other slot whose fence must
  /// be waited before reusing the image, if any.
  pub fn claim_image(&mut self, image: usize) -> Option<usize> {
    if image >= self.images_in_flight.len() {
      self.images_in_flight.resize(image + 1, None);
    }
    let previous = self.images_in_flight[image].replace(self.current);
    previous.filter(|&slot| slot != self.current)
  }

  pub fn advance(&mut self) {
    self.current = (self.current + 1) % self.frames;
  }

  /// New swapchain, new images: forget every association.
  pub fn reset_images(&mut self, image_count: usize) {
    self.images_in_flight.clear();
    self.images_in_flight.resize(image_count, None);
  }
}

/// Per-slot synchronization and recording state.
#[derive(Clone, Copy, Debug)]
pub struct FrameSync {
  pub image_available: vk::Semaphore,
  pub render_finished: vk::Semaphore,
  pub in_flight: vk::Fence,
  pub command_buffer: vk::CommandBuffer,
}

/// Fences start signaled so the first wait on every slot returns immediately.
pub unsafe fn create_frame_syncs(
  device: &ash::Device,
  pool: vk::CommandPool,
  count: usize,
) -> Result<Vec<FrameSync>> {
  let alloc_info = vk::CommandBufferAllocateInfo {
    s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
    command_pool: pool,
    level: vk::CommandBufferLevel::PRIMARY,
    command_buffer_count: count as u32,
    ..Default::default()
  };
  let cmd_bufs = device
    .allocate_command_buffers(&alloc_info)
    .vk_call("vkAllocateCommandBuffers")?;

  let sem_info = vk::SemaphoreCreateInfo {
    s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
    ..Default::default()
  };
  let fence_info = vk::FenceCreateInfo {
    s_type: vk::StructureType::FENCE_CREATE_INFO,
    flags: vk::FenceCreateFlags::SIGNALED,
    ..Default::default()
  };

  let mut out = Vec::with_capacity(count);
  for command_buffer in cmd_bufs {
    out.push(FrameSync {
      image_available: device
        .create_semaphore(&sem_info, None)
        .vk_call("vkCreateSemaphore")?,
      render_finished: device
        .create_semaphore(&sem_info, None)
        .vk_call("vkCreateSemaphore")?,
      in_flight: device
        .create_fence(&fence_info, None)
        .vk_call("vkCreateFence")?,
      command_buffer,
    });
  }
  Ok(out)
}

/// Command buffers go with their pool.
pub unsafe fn destroy_frame_syncs(device: &ash::Device, frames: &mut Vec<FrameSync>) {
  for f in frames.drain(..) {
    device.destroy_semaphore(f.image_available, None);
    device.destroy_semaphore(f.render_finished, None);
    device.destroy_fence(f.in_flight, None);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn full_frame_walks_back_to_idle() {
    let ops = [
      FrameOp::Acquire,
      FrameOp::StartDraw,
      FrameOp::DrawMesh,
      FrameOp::DrawMesh,
      FrameOp::EndDraw,
      FrameOp::Submit,
      FrameOp::Present,
      FrameOp::Finish,
    ];
    let mut phase = FramePhase::Idle;
    for op in ops {
      phase = phase.transition(op).unwrap();
    }
    assert_eq!(phase, FramePhase::Idle);
  }

  #[test]
  fn out_of_order_calls_are_rejected() {
    let err = FramePhase::Idle.transition(FrameOp::StartDraw).unwrap_err();
    assert!(matches!(
      err,
      RenderError::FrameOrder { op: FrameOp::StartDraw, phase: FramePhase::Idle }
    ));
    assert!(FramePhase::FrameAcquired.after(FrameOp::DrawMesh).is_none());
    assert!(FramePhase::Recorded.after(FrameOp::DrawMesh).is_none());
    assert!(FramePhase::Recording.after(FrameOp::Submit).is_none());
    assert!(FramePhase::FrameAcquired.after(FrameOp::Acquire).is_none());
  }

  #[test]
  fn invalid_only_leaves_through_recover() {
    let phase = FramePhase::Idle.transition(FrameOp::Invalidate).unwrap();
    assert_eq!(phase, FramePhase::Invalid);
    assert!(phase.after(FrameOp::Acquire).is_none());
    assert_eq!(phase.after(FrameOp::Recover), Some(FramePhase::Idle));
  }

  #[test]
  fn ring_wraps_over_slots() {
    let mut ring = FrameRing::new(2, 3);
    assert_eq!(ring.current(), 0);
    ring.advance();
    assert_eq!(ring.current(), 1);
    ring.advance();
    assert_eq!(ring.current(), 0);
  }

  #[test]
  fn claiming_an_image_reports_the_other_owner() {
    let mut ring = FrameRing::new(2, 2);
    assert_eq!(ring.claim_image(0), None);
    ring.advance();
    assert_eq!(ring.claim_image(0), Some(0));
    assert_eq!(ring.claim_image(1), None);
    ring.reset_images(2);
    assert_eq!(ring.claim_image(0), None);
  }

  // Simulated GPU: a fence tracks the frame last submitted on its slot and signals
  // when waited. Frame k must never be submitted before frame k-2 has completed.
  fn simulate(image_order: impl Fn(u64) -> usize, image_count: usize, frames: u64) {
    let mut ring = FrameRing::new(2, image_count);
    let mut fence: [Option<u64>; 2] = [None; 2];
    let mut completed = HashSet::new();

    for k in 0..frames {
      let slot = ring.current();
      if let Some(f) = fence[slot].take() {
        completed.insert(f);
      }
      if let Some(owner) = ring.claim_image(image_order(k)) {
        if let Some(f) = fence[owner].take() {
          completed.insert(f);
        }
      }
      assert!(k < 2 || completed.contains(&(k - 2)), "frame {k} overtook {}", k - 2);
      fence[slot] = Some(k);
      ring.advance();
    }
  }

  #[test]
  fn two_frames_in_flight_never_overlap_three_images() {
    simulate(|k| (k % 3) as usize, 3, 2 * 50);
  }

  #[test]
  fn two_frames_in_flight_with_out_of_order_images() {
    // Presentation engine hands back images in an irregular order.
    let order = [0usize, 1, 1, 0, 2, 2, 1, 0];
    simulate(|k| order[(k % order.len() as u64) as usize], 3, 2 * 40);
  }
}
