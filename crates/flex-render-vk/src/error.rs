use ash::vk;
use thiserror::Error;

use crate::frame::{FrameOp, FramePhase};

#[derive(Debug, Error)]
pub enum RenderError {
  /// Missing queue family, wrong window API, unsupported device. Fatal at construction.
  #[error("configuration error: {0}")]
  Configuration(String),

  #[error("allocation failed: {0}")]
  Allocation(String),

  /// Out-of-date or suboptimal surface. Recovered by rebuilding the swapchain.
  #[error("surface is stale")]
  SurfaceStale,

  #[error("timed out waiting for the presentation engine")]
  SynchronizationTimeout,

  #[error("{call} failed: {result:?}")]
  Device {
    call: &'static str,
    result: vk::Result,
  },

  #[error("{op:?} called in phase {phase:?}")]
  FrameOrder { op: FrameOp, phase: FramePhase },
}

impl RenderError {
  /// Classify a native result code returned by `call`.
  pub fn from_vk(call: &'static str, result: vk::Result) -> Self {
    match result {
      vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
        Self::Allocation(format!("{call}: {result:?}"))
      }
      vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => Self::SurfaceStale,
      vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::SynchronizationTimeout,
      _ => Self::Device { call, result },
    }
  }

  pub fn is_surface_stale(&self) -> bool {
    matches!(self, Self::SurfaceStale)
  }
}

impl From<gpu_allocator::AllocationError> for RenderError {
  fn from(e: gpu_allocator::AllocationError) -> Self {
    Self::Allocation(e.to_string())
  }
}

/// Attach a call name to a raw `VkResult`, producing a classified error.
pub(crate) trait VkResultExt<T> {
  fn vk_call(self, call: &'static str) -> Result<T, RenderError>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
  fn vk_call(self, call: &'static str) -> Result<T, RenderError> {
    self.map_err(|e| RenderError::from_vk(call, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn memory_codes_are_allocation_errors() {
    for code in [
      vk::Result::ERROR_OUT_OF_HOST_MEMORY,
      vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
    ] {
      assert!(matches!(
        RenderError::from_vk("vkCreateBuffer", code),
        RenderError::Allocation(_)
      ));
    }
  }

  #[test]
  fn stale_and_timeout_codes() {
    assert!(RenderError::from_vk("acquire", vk::Result::ERROR_OUT_OF_DATE_KHR).is_surface_stale());
    assert!(RenderError::from_vk("present", vk::Result::SUBOPTIMAL_KHR).is_surface_stale());
    assert!(matches!(
      RenderError::from_vk("acquire", vk::Result::TIMEOUT),
      RenderError::SynchronizationTimeout
    ));
  }

  #[test]
  fn other_codes_keep_call_name() {
    let err = RenderError::from_vk("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);
    match &err {
      RenderError::Device { call, result } => {
        assert_eq!(*call, "vkQueueSubmit");
        assert_eq!(*result, vk::Result::ERROR_DEVICE_LOST);
      }
      other => panic!("unexpected {other:?}"),
    }
    assert!(err.to_string().contains("vkQueueSubmit"));
  }

  #[test]
  fn downcasts_through_anyhow() {
    let err: anyhow::Error = RenderError::SurfaceStale.into();
    assert!(err
      .downcast_ref::<RenderError>()
      .is_some_and(RenderError::is_surface_stale));
  }
}
