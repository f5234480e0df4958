use anyhow::Result;
use ash::khr::surface;
use ash::vk;
use flex_render::RenderSize;
use tracing::info;

use crate::config::VkVsyncMode;
use crate::context::{DeviceContext, ResolvedFamilies};
use crate::error::{RenderError, VkResultExt};
use crate::memory::{GpuImage, MemoryManager};

/// `currentExtent` value meaning the surface size follows the swapchain.
pub const UNDEFINED_EXTENT: u32 = u32::MAX;

/// B8G8R8A8_SRGB with sRGB-nonlinear when offered, else whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR, RenderError> {
  formats
    .iter()
    .copied()
    .find(|f| {
      f.format == vk::Format::B8G8R8A8_SRGB
        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    })
    .or_else(|| formats.first().copied())
    .ok_or_else(|| RenderError::Configuration("surface reports no formats".into()))
}

/// First preferred mode the surface offers; FIFO otherwise (always available).
pub fn choose_present_mode(
  available: &[vk::PresentModeKHR],
  preferred: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
  preferred
    .iter()
    .copied()
    .find(|m| available.contains(m))
    .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, drawable: RenderSize) -> vk::Extent2D {
  if caps.current_extent.width != UNDEFINED_EXTENT {
    caps.current_extent
  } else {
    vk::Extent2D {
      width: drawable
        .width
        .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
      height: drawable
        .height
        .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
  }
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub fn min_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
  let wanted = caps.min_image_count + 1;
  if caps.max_image_count == 0 {
    wanted
  } else {
    wanted.min(caps.max_image_count)
  }
}

/// Graphics and present on different families need concurrent access to the images.
pub fn image_sharing(families: &ResolvedFamilies) -> (vk::SharingMode, Vec<u32>) {
  if families.graphics != families.present {
    (vk::SharingMode::CONCURRENT, vec![families.graphics, families.present])
  } else {
    (vk::SharingMode::EXCLUSIVE, Vec::new())
  }
}

/// Surface properties queried for one (physical device, surface) pair.
#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
  pub caps: vk::SurfaceCapabilitiesKHR,
  pub formats: Vec<vk::SurfaceFormatKHR>,
  pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
  pub unsafe fn query(
    loader: &surface::Instance,
    phys: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
  ) -> Result<Self, RenderError> {
    Ok(Self {
      caps: loader
        .get_physical_device_surface_capabilities(phys, surface)
        .vk_call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
      formats: loader
        .get_physical_device_surface_formats(phys, surface)
        .vk_call("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
      present_modes: loader
        .get_physical_device_surface_present_modes(phys, surface)
        .vk_call("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
    })
  }
}

/// Every decision that goes into a swapchain, made before any handle exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainPlan {
  pub format: vk::Format,
  pub color_space: vk::ColorSpaceKHR,
  pub present_mode: vk::PresentModeKHR,
  pub extent: vk::Extent2D,
  pub min_image_count: u32,
  pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
  pub fn new(support: &SurfaceSupport, drawable: RenderSize, vsync: VkVsyncMode) -> Result<Self, RenderError> {
    let surface_format = choose_surface_format(&support.formats)?;
    let caps = &support.caps;
    let pre_transform = if caps
      .supported_transforms
      .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
      vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
      caps.current_transform
    };
    Ok(Self {
      format: surface_format.format,
      color_space: surface_format.color_space,
      present_mode: choose_present_mode(&support.present_modes, vsync.preferred_present_modes()),
      extent: choose_extent(caps, drawable),
      min_image_count: min_image_count(caps),
      pre_transform,
    })
  }
}

/// One object per input. If any creation fails, the ones already made are destroyed
/// before the error is returned.
fn create_each<I, T, E>(
  inputs: impl IntoIterator<Item = I>,
  mut create: impl FnMut(I) -> Result<T, E>,
  mut destroy: impl FnMut(T),
) -> Result<Vec<T>, E> {
  let mut made = Vec::new();
  for input in inputs {
    match create(input) {
      Ok(obj) => made.push(obj),
      Err(e) => {
        made.into_iter().for_each(&mut destroy);
        return Err(e);
      }
    }
  }
  Ok(made)
}

/// Run `rebuild`, then `retire` whether or not the rebuild succeeded.
fn rebuild_then_retire<T>(rebuild: impl FnOnce() -> Result<T>, retire: impl FnOnce()) -> Result<T> {
  let out = rebuild();
  retire();
  out
}

pub struct Swapchain {
  pub handle: vk::SwapchainKHR,
  pub images: Vec<vk::Image>,
  pub image_views: Vec<vk::ImageView>,
  pub framebuffers: Vec<vk::Framebuffer>,
  pub plan: SwapchainPlan,
  pub depth: Option<GpuImage>,
}

unsafe fn build_chain(
  ctx: &DeviceContext,
  plan: &SwapchainPlan,
  old_swapchain: vk::SwapchainKHR,
) -> Result<(vk::SwapchainKHR, Vec<vk::Image>, Vec<vk::ImageView>)> {
  let (image_sharing_mode, family_indices) = image_sharing(&ctx.families);

  let swap_info = vk::SwapchainCreateInfoKHR {
    s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
    surface: ctx.surface,
    min_image_count: plan.min_image_count,
    image_format: plan.format,
    image_color_space: plan.color_space,
    image_extent: plan.extent,
    image_array_layers: 1,
    image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
    image_sharing_mode,
    queue_family_index_count: family_indices.len() as u32,
    p_queue_family_indices: family_indices.as_ptr(),
    pre_transform: plan.pre_transform,
    composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
    present_mode: plan.present_mode,
    clipped: vk::TRUE,
    old_swapchain,
    ..Default::default()
  };

  let handle = ctx
    .swapchain_loader
    .create_swapchain(&swap_info, None)
    .vk_call("vkCreateSwapchainKHR")?;
  let images = match ctx.swapchain_loader.get_swapchain_images(handle) {
    Ok(images) => images,
    Err(e) => {
      ctx.swapchain_loader.destroy_swapchain(handle, None);
      return Err(RenderError::from_vk("vkGetSwapchainImagesKHR", e).into());
    }
  };

  let views = create_each(
    images.iter().copied(),
    |image| {
      let iv_info = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format: plan.format,
        subresource_range: vk::ImageSubresourceRange {
          aspect_mask: vk::ImageAspectFlags::COLOR,
          base_mip_level: 0,
          level_count: 1,
          base_array_layer: 0,
          layer_count: 1,
        },
        ..Default::default()
      };
      ctx.device
        .create_image_view(&iv_info, None)
        .vk_call("vkCreateImageView")
    },
    |view| ctx.device.destroy_image_view(view, None),
  );
  let views = match views {
    Ok(views) => views,
    Err(e) => {
      ctx.swapchain_loader.destroy_swapchain(handle, None);
      return Err(e.into());
    }
  };

  Ok((handle, images, views))
}

impl Swapchain {
  /// Chain plus color views. Depth and framebuffers are attached afterwards.
  pub unsafe fn create(ctx: &DeviceContext, drawable: RenderSize, vsync: VkVsyncMode) -> Result<Self> {
    let support = SurfaceSupport::query(&ctx.surface_loader, ctx.physical_device, ctx.surface)?;
    let plan = SwapchainPlan::new(&support, drawable, vsync)?;
    let (handle, images, image_views) = build_chain(ctx, &plan, vk::SwapchainKHR::null())?;

    info!(
      "swapchain: {:?} / {:?}, {:?}, {}x{}, {} images (min {})",
      plan.format,
      plan.color_space,
      plan.present_mode,
      plan.extent.width,
      plan.extent.height,
      images.len(),
      plan.min_image_count
    );

    Ok(Self {
      handle,
      images,
      image_views,
      framebuffers: Vec::new(),
      plan,
      depth: None,
    })
  }

  pub fn extent(&self) -> vk::Extent2D {
    self.plan.extent
  }

  pub fn attach_depth(&mut self, depth: GpuImage) {
    self.depth = Some(depth);
  }

  /// One framebuffer per image view, sharing the depth attachment when present.
  pub unsafe fn create_frame_buffers(&mut self, device: &ash::Device, render_pass: vk::RenderPass) -> Result<()> {
    let depth_view = self.depth.as_ref().map(|d| d.view);
    let extent = self.plan.extent;
    let framebuffers = create_each(
      self.image_views.iter().copied(),
      |view| {
        let attachments: Vec<vk::ImageView> = std::iter::once(view).chain(depth_view).collect();
        let fb_info = vk::FramebufferCreateInfo {
          s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
          render_pass,
          attachment_count: attachments.len() as u32,
          p_attachments: attachments.as_ptr(),
          width: extent.width,
          height: extent.height,
          layers: 1,
          ..Default::default()
        };
        device
          .create_framebuffer(&fb_info, None)
          .vk_call("vkCreateFramebuffer")
      },
      |fb| device.destroy_framebuffer(fb, None),
    )?;
    self.framebuffers = framebuffers;
    Ok(())
  }

  unsafe fn destroy_views(&mut self, device: &ash::Device) {
    for fb in self.framebuffers.drain(..) {
      device.destroy_framebuffer(fb, None);
    }
    for view in self.image_views.drain(..) {
      device.destroy_image_view(view, None);
    }
  }

  /// Rebuild against the current surface. The caller has already drained the device.
  ///
  /// The new chain is created from the old one, then depth and framebuffers are rebuilt,
  /// and only then is the old handle destroyed. A failed chain creation leaves `self`
  /// untouched.
  pub unsafe fn handle_resize(
    &mut self,
    ctx: &DeviceContext,
    memory: &mut MemoryManager,
    render_pass: vk::RenderPass,
    drawable: RenderSize,
    vsync: VkVsyncMode,
  ) -> Result<()> {
    let support = SurfaceSupport::query(&ctx.surface_loader, ctx.physical_device, ctx.surface)?;
    let plan = SwapchainPlan::new(&support, drawable, vsync)?;
    if plan.format != self.plan.format {
      return Err(RenderError::Configuration(format!(
        "surface format changed from {:?} to {:?}",
        self.plan.format, plan.format
      ))
      .into());
    }

    let (handle, images, image_views) = build_chain(ctx, &plan, self.handle)?;
    self.destroy_views(&ctx.device);
    let old = std::mem::replace(&mut self.handle, handle);
    self.images = images;
    self.image_views = image_views;
    self.plan = plan;

    rebuild_then_retire(
      || {
        if let Some(depth) = self.depth.take() {
          memory.destroy_image(depth)?;
          self.depth = Some(memory.create_depth_buffer_image(plan.extent)?);
        }
        self.create_frame_buffers(&ctx.device, render_pass)
      },
      || ctx.swapchain_loader.destroy_swapchain(old, None),
    )?;

    info!(
      "swapchain rebuilt: {}x{}, {:?}, {} images",
      plan.extent.width,
      plan.extent.height,
      plan.present_mode,
      self.images.len()
    );
    Ok(())
  }

  /// Framebuffers, then views, then the chain itself, then depth.
  pub unsafe fn destroy(&mut self, ctx: &DeviceContext, memory: &mut MemoryManager) -> Result<()> {
    self.destroy_views(&ctx.device);
    if self.handle != vk::SwapchainKHR::null() {
      ctx.swapchain_loader.destroy_swapchain(self.handle, None);
      self.handle = vk::SwapchainKHR::null();
    }
    self.images.clear();
    if let Some(depth) = self.depth.take() {
      memory.destroy_image(depth)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
      min_image_count: min,
      max_image_count: max,
      current_extent: vk::Extent2D { width: 800, height: 600 },
      min_image_extent: vk::Extent2D { width: 1, height: 1 },
      max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
      supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
      current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
      ..Default::default()
    }
  }

  fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
    vk::SurfaceFormatKHR { format, color_space }
  }

  #[test]
  fn image_count_is_min_plus_one_capped() {
    assert_eq!(min_image_count(&caps(2, 3)), 3);
    assert_eq!(min_image_count(&caps(2, 2)), 2);
    assert_eq!(min_image_count(&caps(3, 0)), 4);
  }

  #[test]
  fn present_mode_prefers_listed_then_fifo() {
    let fifo_only = [vk::PresentModeKHR::FIFO];
    let both = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
    let mailbox = VkVsyncMode::Mailbox.preferred_present_modes();
    assert_eq!(choose_present_mode(&fifo_only, mailbox), vk::PresentModeKHR::FIFO);
    assert_eq!(choose_present_mode(&both, mailbox), vk::PresentModeKHR::MAILBOX);
    assert_eq!(
      choose_present_mode(&both, VkVsyncMode::Fifo.preferred_present_modes()),
      vk::PresentModeKHR::FIFO
    );
  }

  #[test]
  fn srgb_bgra_is_preferred() {
    let formats = [
      fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
      fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
    ];
    assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::B8G8R8A8_SRGB);

    let other = [fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
    assert_eq!(choose_surface_format(&other).unwrap().format, vk::Format::R8G8B8A8_UNORM);
  }

  #[test]
  fn no_formats_is_a_configuration_error() {
    assert!(matches!(choose_surface_format(&[]), Err(RenderError::Configuration(_))));
  }

  #[test]
  fn extent_uses_current_or_clamps_drawable() {
    let fixed = caps(2, 3);
    let drawable = RenderSize { width: 1920, height: 1080 };
    assert_eq!(choose_extent(&fixed, drawable).width, 800);

    let mut free = caps(2, 3);
    free.current_extent = vk::Extent2D { width: UNDEFINED_EXTENT, height: UNDEFINED_EXTENT };
    free.max_image_extent = vk::Extent2D { width: 1600, height: 1200 };
    let e = choose_extent(&free, drawable);
    assert_eq!((e.width, e.height), (1600, 1080));

    let e = choose_extent(&free, RenderSize { width: 0, height: 0 });
    assert_eq!((e.width, e.height), (1, 1));
  }

  #[test]
  fn sharing_is_concurrent_only_across_families() {
    let same = ResolvedFamilies { graphics: 0, present: 0, transfer: 1 };
    assert_eq!(image_sharing(&same), (vk::SharingMode::EXCLUSIVE, vec![]));
    let split = ResolvedFamilies { graphics: 0, present: 2, transfer: 0 };
    assert_eq!(image_sharing(&split), (vk::SharingMode::CONCURRENT, vec![0, 2]));
  }

  #[test]
  fn failed_creation_destroys_what_was_made() {
    let mut destroyed = Vec::new();
    let out = create_each(
      [1, 2, 3, 4],
      |n| if n == 3 { Err("third") } else { Ok(n * 10) },
      |obj| destroyed.push(obj),
    );
    assert_eq!(out, Err("third"));
    assert_eq!(destroyed, vec![10, 20]);

    let mut destroyed = Vec::new();
    let out: Result<Vec<u32>, &str> = create_each([1, 2], |n| Ok(n), |obj| destroyed.push(obj));
    assert_eq!(out, Ok(vec![1, 2]));
    assert!(destroyed.is_empty());
  }

  #[test]
  fn old_chain_is_retired_after_attachments() {
    use std::cell::RefCell;

    let log = RefCell::new(Vec::new());
    rebuild_then_retire(
      || {
        log.borrow_mut().push("depth");
        log.borrow_mut().push("framebuffers");
        Ok(())
      },
      || log.borrow_mut().push("destroy old"),
    )
    .unwrap();
    assert_eq!(*log.borrow(), ["depth", "framebuffers", "destroy old"]);

    log.borrow_mut().clear();
    let failed: Result<()> = rebuild_then_retire(
      || {
        log.borrow_mut().push("depth");
        Err(RenderError::Allocation("depth image".into()).into())
      },
      || log.borrow_mut().push("destroy old"),
    );
    assert!(failed.is_err());
    assert_eq!(*log.borrow(), ["depth", "destroy old"]);
  }

  #[test]
  fn plan_is_stable_for_unchanged_surface() {
    let support = SurfaceSupport {
      caps: caps(2, 3),
      formats: vec![fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
      present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    };
    let size = RenderSize { width: 800, height: 600 };
    let first = SwapchainPlan::new(&support, size, VkVsyncMode::Mailbox).unwrap();
    let second = SwapchainPlan::new(&support, size, VkVsyncMode::Mailbox).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.min_image_count, 3);
    assert_eq!(first.present_mode, vk::PresentModeKHR::MAILBOX);
    assert_eq!(first.pre_transform, vk::SurfaceTransformFlagsKHR::IDENTITY);
  }
}
