use ash::vk;

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VkVsyncMode {
  Fifo, // Target monitor refresh rate
  #[default]
  Mailbox, // Smart vsync, fps uncapped
  Immediate, // Tearing allowed
}

impl VkVsyncMode {
  /// Present modes to try, best first. FIFO is the implicit fallback and never listed.
  pub fn preferred_present_modes(self) -> &'static [vk::PresentModeKHR] {
    match self {
      VkVsyncMode::Mailbox => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE],
      VkVsyncMode::Immediate => &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX],
      VkVsyncMode::Fifo => &[],
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "fifo" => Some(Self::Fifo),
      "mailbox" => Some(Self::Mailbox),
      "immediate" => Some(Self::Immediate),
      _ => None,
    }
  }
}

#[derive(Clone, Copy, Debug)]
pub struct RendererConfig {
  pub vsync_mode: VkVsyncMode,
  /// Enable the Khronos validation layer and route its messages into tracing.
  pub validation: bool,
  /// Upper bound on a single swapchain image acquisition.
  pub acquire_timeout_ns: u64,
  pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
  fn default() -> Self {
    Self {
      vsync_mode: VkVsyncMode::default(),
      validation: cfg!(debug_assertions),
      acquire_timeout_ns: 1_000_000_000,
      clear_color: [0.02, 0.02, 0.04, 1.0],
    }
  }
}

impl RendererConfig {
  /// Defaults, overridden by `FLEX_VALIDATION=0|1` and `FLEX_VSYNC=fifo|mailbox|immediate`.
  pub fn from_env() -> Self {
    Self::default().with_env()
  }

  /// Apply the `FLEX_*` environment overrides on top of `self`.
  pub fn with_env(self) -> Self {
    self.with_env_overrides(
      std::env::var("FLEX_VALIDATION").ok().as_deref(),
      std::env::var("FLEX_VSYNC").ok().as_deref(),
    )
  }

  fn with_env_overrides(mut self, validation: Option<&str>, vsync: Option<&str>) -> Self {
    match validation {
      Some("1") => self.validation = true,
      Some("0") => self.validation = false,
      _ => {}
    }
    if let Some(mode) = vsync.and_then(VkVsyncMode::parse) {
      self.vsync_mode = mode;
    }
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fifo_mode_prefers_nothing() {
    assert!(VkVsyncMode::Fifo.preferred_present_modes().is_empty());
    assert_eq!(
      VkVsyncMode::Mailbox.preferred_present_modes()[0],
      vk::PresentModeKHR::MAILBOX
    );
  }

  #[test]
  fn env_overrides_apply() {
    let cfg = RendererConfig::default().with_env_overrides(Some("0"), Some("FIFO"));
    assert!(!cfg.validation);
    assert_eq!(cfg.vsync_mode, VkVsyncMode::Fifo);

    let untouched = RendererConfig::default().with_env_overrides(Some("yes"), Some("vsync"));
    assert_eq!(untouched.validation, cfg!(debug_assertions));
    assert_eq!(untouched.vsync_mode, VkVsyncMode::Mailbox);
  }
}
