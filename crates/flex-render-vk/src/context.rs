use std::ffi::{c_char, c_void, CStr};

use anyhow::{Context, Result};
use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use flex_render::{RenderApi, RenderWindow};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use tracing::{debug, error, info, warn};

use crate::config::RendererConfig;
use crate::error::{RenderError, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Queue family indices as discovered on one physical device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
  pub graphics: Option<u32>,
  pub present: Option<u32>,
  pub transfer: Option<u32>,
}

/// Queue family indices once every role is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedFamilies {
  pub graphics: u32,
  pub present: u32,
  pub transfer: u32,
}

impl QueueFamilyIndices {
  /// Graphics: first GRAPHICS family. Present: the graphics family when it can present,
  /// else the first family that can. Transfer: a dedicated TRANSFER family (no GRAPHICS)
  /// when one exists, else the graphics family.
  pub fn find(families: &[vk::QueueFamilyProperties], can_present: impl Fn(u32) -> bool) -> Self {
    let graphics = families
      .iter()
      .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
      .map(|i| i as u32);

    let present = match graphics {
      Some(g) if can_present(g) => Some(g),
      _ => (0..families.len() as u32)
        .find(|&i| families[i as usize].queue_count > 0 && can_present(i)),
    };

    let transfer = families
      .iter()
      .position(|f| {
        f.queue_count > 0
          && f.queue_flags.contains(vk::QueueFlags::TRANSFER)
          && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
      })
      .map(|i| i as u32)
      .or(graphics);

    Self {
      graphics,
      present,
      transfer,
    }
  }

  pub fn is_complete(&self) -> bool {
    self.graphics.is_some() && self.present.is_some() && self.transfer.is_some()
  }

  pub fn resolve(&self) -> Result<ResolvedFamilies, RenderError> {
    let missing = |role: &str| RenderError::Configuration(format!("no {role} queue family"));
    Ok(ResolvedFamilies {
      graphics: self.graphics.ok_or_else(|| missing("graphics"))?,
      present: self.present.ok_or_else(|| missing("present"))?,
      transfer: self.transfer.ok_or_else(|| missing("transfer"))?,
    })
  }
}

impl ResolvedFamilies {
  /// Distinct family indices, ascending.
  pub fn unique(&self) -> Vec<u32> {
    let mut v = vec![self.graphics, self.present, self.transfer];
    v.sort_unstable();
    v.dedup();
    v
  }
}

/// What device selection knows about one candidate.
#[derive(Clone, Copy, Debug)]
pub struct DeviceTraits {
  pub device_type: vk::PhysicalDeviceType,
  pub max_image_dimension_2d: u32,
  pub has_swapchain_ext: bool,
  pub has_surface_formats: bool,
  pub has_present_modes: bool,
  pub families_complete: bool,
}

/// 0 means unusable.
pub fn rate_device(t: &DeviceTraits) -> u32 {
  if !(t.has_swapchain_ext && t.has_surface_formats && t.has_present_modes && t.families_complete)
  {
    return 0;
  }
  let mut score = 1 + t.max_image_dimension_2d;
  if t.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
    score += 100_000;
  }
  score
}

pub struct Queues {
  pub graphics: vk::Queue,
  pub present: vk::Queue,
  pub transfer: vk::Queue,
}

/// Instance, surface, logical device and its queues. Created once per renderer.
pub struct DeviceContext {
  _entry: Entry,
  pub instance: Instance,
  debug: Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>,
  pub surface_loader: surface::Instance,
  pub surface: vk::SurfaceKHR,
  pub physical_device: vk::PhysicalDevice,
  pub device: ash::Device,
  pub families: ResolvedFamilies,
  pub queues: Queues,
  pub swapchain_loader: swapchain::Device,
}

unsafe extern "system" fn debug_callback(
  severity: vk::DebugUtilsMessageSeverityFlagsEXT,
  _types: vk::DebugUtilsMessageTypeFlagsEXT,
  data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
  _user: *mut c_void,
) -> vk::Bool32 {
  if data.is_null() || (*data).p_message.is_null() {
    return vk::FALSE;
  }
  let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
  if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
    error!(target: "vulkan", "{msg}");
  } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
    warn!(target: "vulkan", "{msg}");
  } else {
    debug!(target: "vulkan", "{msg}");
  }
  vk::FALSE
}

unsafe fn validation_available(entry: &Entry) -> bool {
  entry
    .enumerate_instance_layer_properties()
    .unwrap_or_default()
    .iter()
    .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER)
}

/// Instance extensions the window system needs to create a presentable surface.
pub fn required_instance_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
  Ok(ash_window::enumerate_required_extensions(display)
    .context("enumerate_required_extensions")?
    .to_vec())
}

unsafe fn create_instance(entry: &Entry, display: RawDisplayHandle, validation: bool) -> Result<Instance> {
  let app_name = c"Flex Engine";
  let app_info = vk::ApplicationInfo {
    s_type: vk::StructureType::APPLICATION_INFO,
    p_application_name: app_name.as_ptr(),
    application_version: vk::make_api_version(0, 1, 0, 0),
    p_engine_name: app_name.as_ptr(),
    engine_version: vk::make_api_version(0, 0, 1, 0),
    api_version: vk::API_VERSION_1_0,
    ..Default::default()
  };

  let mut ext_vec = required_instance_extensions(display)?;
  if validation {
    ext_vec.push(ext_debug::NAME.as_ptr());
  }
  let layers = [VALIDATION_LAYER.as_ptr()];
  let (enabled_layer_count, pp_enabled_layer_names) = if validation {
    (layers.len() as u32, layers.as_ptr())
  } else {
    (0, std::ptr::null())
  };

  let create_info = vk::InstanceCreateInfo {
    s_type: vk::StructureType::INSTANCE_CREATE_INFO,
    p_application_info: &app_info,
    enabled_extension_count: ext_vec.len() as u32,
    pp_enabled_extension_names: ext_vec.as_ptr(),
    enabled_layer_count,
    pp_enabled_layer_names,
    ..Default::default()
  };

  Ok(entry
    .create_instance(&create_info, None)
    .vk_call("vkCreateInstance")?)
}

unsafe fn create_debug_messenger(
  entry: &Entry,
  instance: &Instance,
) -> Result<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)> {
  let loader = ext_debug::Instance::new(entry, instance);
  let ci = vk::DebugUtilsMessengerCreateInfoEXT {
    s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
      | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
      | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
      | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
      | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
    pfn_user_callback: Some(debug_callback),
    ..Default::default()
  };
  let messenger = loader
    .create_debug_utils_messenger(&ci, None)
    .vk_call("vkCreateDebugUtilsMessengerEXT")?;
  Ok((loader, messenger))
}

unsafe fn supports_swapchain(instance: &Instance, phys: vk::PhysicalDevice) -> bool {
  instance
    .enumerate_device_extension_properties(phys)
    .unwrap_or_default()
    .iter()
    .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME)
}

unsafe fn select_physical_device(
  instance: &Instance,
  surface_loader: &surface::Instance,
  surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, ResolvedFamilies)> {
  let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilyIndices)> = None;

  for phys in instance
    .enumerate_physical_devices()
    .vk_call("vkEnumeratePhysicalDevices")?
  {
    let props = instance.get_physical_device_properties(phys);
    let qprops = instance.get_physical_device_queue_family_properties(phys);
    let indices = QueueFamilyIndices::find(&qprops, |i| {
      surface_loader
        .get_physical_device_surface_support(phys, i, surface)
        .unwrap_or(false)
    });

    let has_swapchain_ext = supports_swapchain(instance, phys);
    let (has_surface_formats, has_present_modes) = if has_swapchain_ext {
      (
        !surface_loader
          .get_physical_device_surface_formats(phys, surface)
          .unwrap_or_default()
          .is_empty(),
        !surface_loader
          .get_physical_device_surface_present_modes(phys, surface)
          .unwrap_or_default()
          .is_empty(),
      )
    } else {
      (false, false)
    };

    let score = rate_device(&DeviceTraits {
      device_type: props.device_type,
      max_image_dimension_2d: props.limits.max_image_dimension2_d,
      has_swapchain_ext,
      has_surface_formats,
      has_present_modes,
      families_complete: indices.is_complete(),
    });
    let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
    debug!("candidate device {name} ({:?}): score {score}", props.device_type);

    if score > 0 && best.map_or(true, |(s, _, _)| score > s) {
      best = Some((score, phys, indices));
    }
  }

  let (_, phys, indices) = best.ok_or_else(|| {
    RenderError::Configuration("no physical device can render and present to this surface".into())
  })?;
  Ok((phys, indices.resolve()?))
}

unsafe fn create_logical_device(
  instance: &Instance,
  phys: vk::PhysicalDevice,
  families: &ResolvedFamilies,
) -> Result<ash::Device> {
  let priorities = [1.0_f32];
  let qinfos: Vec<vk::DeviceQueueCreateInfo> = families
    .unique()
    .into_iter()
    .map(|family| vk::DeviceQueueCreateInfo {
      s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
      queue_family_index: family,
      queue_count: 1,
      p_queue_priorities: priorities.as_ptr(),
      ..Default::default()
    })
    .collect();

  let device_exts = [swapchain::NAME.as_ptr()];
  let features = vk::PhysicalDeviceFeatures::default();
  let dinfo = vk::DeviceCreateInfo {
    s_type: vk::StructureType::DEVICE_CREATE_INFO,
    queue_create_info_count: qinfos.len() as u32,
    p_queue_create_infos: qinfos.as_ptr(),
    enabled_extension_count: device_exts.len() as u32,
    pp_enabled_extension_names: device_exts.as_ptr(),
    p_enabled_features: &features,
    ..Default::default()
  };

  Ok(instance
    .create_device(phys, &dinfo, None)
    .vk_call("vkCreateDevice")?)
}

impl DeviceContext {
  // STRICT ORDER:
  // 1) Instance (window WSI extensions + optional debug utils)
  // 2) Surface from THIS instance
  // 3) Physical device + queue families rated AGAINST this surface
  // 4) Logical device with one queue per distinct family
  pub unsafe fn new(window: &dyn RenderWindow, cfg: &RendererConfig) -> Result<Self> {
    if window.render_api() != RenderApi::Vulkan {
      return Err(RenderError::Configuration(format!(
        "window was created for {:?}, not Vulkan",
        window.render_api()
      ))
      .into());
    }

    let dh = window
      .display_handle()
      .map_err(|e| RenderError::Configuration(format!("display handle: {e}")))?
      .as_raw();
    let wh = window
      .window_handle()
      .map_err(|e| RenderError::Configuration(format!("window handle: {e}")))?
      .as_raw();

    let entry = Entry::linked();
    let validation = cfg.validation && validation_available(&entry);
    if cfg.validation && !validation {
      warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
    }

    let instance = create_instance(&entry, dh, validation).context("create_instance")?;
    let debug = if validation {
      match create_debug_messenger(&entry, &instance) {
        Ok(messenger) => Some(messenger),
        Err(e) => {
          instance.destroy_instance(None);
          return Err(e);
        }
      }
    } else {
      None
    };

    let surface_loader = surface::Instance::new(&entry, &instance);
    let (surface, physical_device, families, device) =
      match attach_device(&entry, &instance, &surface_loader, dh, wh) {
        Ok(attached) => attached,
        Err(e) => {
          destroy_instance_objects(&instance, debug);
          return Err(e);
        }
      };

    let queues = Queues {
      graphics: device.get_device_queue(families.graphics, 0),
      present: device.get_device_queue(families.present, 0),
      transfer: device.get_device_queue(families.transfer, 0),
    };
    let swapchain_loader = swapchain::Device::new(&instance, &device);

    let props = instance.get_physical_device_properties(physical_device);
    info!(
      "device {} ready (graphics={}, present={}, transfer={}, validation={})",
      CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy(),
      families.graphics,
      families.present,
      families.transfer,
      validation
    );

    Ok(Self {
      _entry: entry,
      instance,
      debug,
      surface_loader,
      surface,
      physical_device,
      device,
      families,
      queues,
      swapchain_loader,
    })
  }

  pub unsafe fn wait_idle(&self) -> Result<(), RenderError> {
    self.device.device_wait_idle().vk_call("vkDeviceWaitIdle")
  }

  /// Device first, then surface, instance last. Everything created from the device
  /// must already be gone.
  pub unsafe fn destroy(&mut self) {
    self.device.destroy_device(None);
    self.surface_loader.destroy_surface(self.surface, None);
    destroy_instance_objects(&self.instance, self.debug.take());
  }
}

/// Surface for the window, then the best device for it. The surface is destroyed again
/// when no device fits.
unsafe fn attach_device(
  entry: &Entry,
  instance: &Instance,
  surface_loader: &surface::Instance,
  dh: RawDisplayHandle,
  wh: RawWindowHandle,
) -> Result<(vk::SurfaceKHR, vk::PhysicalDevice, ResolvedFamilies, ash::Device)> {
  let surface = ash_window::create_surface(entry, instance, dh, wh, None)
    .vk_call("vkCreateSurfaceKHR")?;
  let picked = select_physical_device(instance, surface_loader, surface).and_then(|(phys, families)| {
    let device = create_logical_device(instance, phys, &families)?;
    Ok((phys, families, device))
  });
  match picked {
    Ok((phys, families, device)) => Ok((surface, phys, families, device)),
    Err(e) => {
      surface_loader.destroy_surface(surface, None);
      Err(e)
    }
  }
}

/// Debug messenger, then the instance.
unsafe fn destroy_instance_objects(
  instance: &Instance,
  debug: Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>,
) {
  if let Some((loader, messenger)) = debug {
    loader.destroy_debug_utils_messenger(messenger, None);
  }
  instance.destroy_instance(None);
}

#[cfg(test)]
mod tests {
  use super::*;

  fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
    vk::QueueFamilyProperties {
      queue_flags: flags,
      queue_count: 1,
      ..Default::default()
    }
  }

  #[test]
  fn single_universal_family_fills_every_role() {
    let fams = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
    let idx = QueueFamilyIndices::find(&fams, |_| true);
    let resolved = idx.resolve().unwrap();
    assert_eq!(resolved, ResolvedFamilies { graphics: 0, present: 0, transfer: 0 });
    assert_eq!(resolved.unique(), vec![0]);
  }

  #[test]
  fn dedicated_transfer_family_is_preferred() {
    let fams = [
      family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
      family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
      family(vk::QueueFlags::TRANSFER),
    ];
    let idx = QueueFamilyIndices::find(&fams, |i| i == 0);
    assert_eq!(idx.graphics, Some(0));
    assert_eq!(idx.present, Some(0));
    assert_eq!(idx.transfer, Some(1));
  }

  #[test]
  fn present_falls_back_to_another_family() {
    let fams = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::COMPUTE)];
    let idx = QueueFamilyIndices::find(&fams, |i| i == 1);
    assert_eq!(idx.present, Some(1));
    assert_eq!(idx.resolve().unwrap().unique(), vec![0, 1]);
  }

  #[test]
  fn missing_present_is_a_configuration_error() {
    let fams = [family(vk::QueueFlags::GRAPHICS)];
    let idx = QueueFamilyIndices::find(&fams, |_| false);
    assert!(!idx.is_complete());
    assert!(matches!(idx.resolve(), Err(RenderError::Configuration(_))));
  }

  #[test]
  fn empty_families_are_skipped() {
    let mut empty = family(vk::QueueFlags::GRAPHICS);
    empty.queue_count = 0;
    let fams = [empty, family(vk::QueueFlags::GRAPHICS)];
    assert_eq!(QueueFamilyIndices::find(&fams, |_| true).graphics, Some(1));
  }

  fn traits(device_type: vk::PhysicalDeviceType, dim: u32) -> DeviceTraits {
    DeviceTraits {
      device_type,
      max_image_dimension_2d: dim,
      has_swapchain_ext: true,
      has_surface_formats: true,
      has_present_modes: true,
      families_complete: true,
    }
  }

  #[test]
  fn discrete_gpu_outranks_integrated() {
    let discrete = rate_device(&traits(vk::PhysicalDeviceType::DISCRETE_GPU, 8192));
    let integrated = rate_device(&traits(vk::PhysicalDeviceType::INTEGRATED_GPU, 16384));
    assert!(discrete > integrated);
    assert!(integrated > 0);
  }

  #[test]
  fn unusable_devices_score_zero() {
    let mut t = traits(vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
    t.has_swapchain_ext = false;
    assert_eq!(rate_device(&t), 0);

    let mut t = traits(vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
    t.has_present_modes = false;
    assert_eq!(rate_device(&t), 0);

    let mut t = traits(vk::PhysicalDeviceType::CPU, 4096);
    t.families_complete = false;
    assert_eq!(rate_device(&t), 0);
  }
}
