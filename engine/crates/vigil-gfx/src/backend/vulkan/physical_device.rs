use std::ffi::CStr;

use ash::vk;
use itertools::Itertools;

use crate::config::GfxConfig;
use crate::error::{GfxError, GfxResult};

/// 选中的物理设备以及用于提交的 queue family
pub(crate) struct PhysicalDevice {
    pub(crate) handle: vk::PhysicalDevice,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    /// 同时支持 graphics、compute 和 transfer
    pub(crate) queue_family_index: u32,
}

impl PhysicalDevice {
    /// 选择满足需求的物理设备
    ///
    /// 必须支持 Vulkan 1.3 以及 timeline semaphore、synchronization2、dynamic rendering、buffer device address；
    /// 需要呈现时还必须支持 swapchain extension
    pub(crate) fn select(instance: &ash::Instance, config: &GfxConfig, need_swapchain: bool) -> GfxResult<Self> {
        let pdevices = unsafe { instance.enumerate_physical_devices()? };

        let mut rejected = vec![];
        let candidates = pdevices
            .into_iter()
            .filter_map(|pdevice| match Self::check(instance, pdevice, need_swapchain) {
                Ok(candidate) => Some(candidate),
                Err(reason) => {
                    rejected.push(reason);
                    None
                }
            })
            .collect_vec();

        let prefer_type = if config.prefer_discrete_gpu {
            vk::PhysicalDeviceType::DISCRETE_GPU
        } else {
            vk::PhysicalDeviceType::INTEGRATED_GPU
        };
        let selected = candidates
            .into_iter()
            .max_by_key(|candidate| candidate.properties.device_type == prefer_type)
            .ok_or_else(|| GfxError::NoSuitableDevice(rejected.join("; ")))?;

        log::info!(
            "physical device: {:?}, type: {:?}, api version: {}.{}.{}, queue family: {}",
            selected.properties.device_name_as_c_str().unwrap_or_default(),
            selected.properties.device_type,
            vk::api_version_major(selected.properties.api_version),
            vk::api_version_minor(selected.properties.api_version),
            vk::api_version_patch(selected.properties.api_version),
            selected.queue_family_index,
        );

        Ok(selected)
    }

    /// 不满足时返回原因
    fn check(instance: &ash::Instance, pdevice: vk::PhysicalDevice, need_swapchain: bool) -> Result<Self, String> {
        let properties = unsafe { instance.get_physical_device_properties(pdevice) };
        let name = properties.device_name_as_c_str().unwrap_or_default().to_string_lossy().into_owned();

        if properties.api_version < vk::API_VERSION_1_3 {
            return Err(format!("{name}: vulkan 1.3 is not supported"));
        }

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features12).push_next(&mut features13);
        unsafe { instance.get_physical_device_features2(pdevice, &mut features2) };

        let missing_features = [
            ("timelineSemaphore", features12.timeline_semaphore),
            ("bufferDeviceAddress", features12.buffer_device_address),
            ("synchronization2", features13.synchronization2),
            ("dynamicRendering", features13.dynamic_rendering),
        ]
        .into_iter()
        .filter(|(_, supported)| *supported != vk::TRUE)
        .map(|(feature, _)| feature)
        .collect_vec();
        if !missing_features.is_empty() {
            return Err(format!("{name}: missing features {}", missing_features.join(", ")));
        }

        if need_swapchain {
            let exts = unsafe { instance.enumerate_device_extension_properties(pdevice) }
                .map_err(|e| format!("{name}: {e:?}"))?;
            let swapchain_supported = exts
                .iter()
                .any(|p| p.extension_name_as_c_str().is_ok_and(|ext| ext == ash::khr::swapchain::NAME));
            if !swapchain_supported {
                return Err(format!("{name}: swapchain extension is not supported"));
            }
        }

        let queue_family_index = unsafe { instance.get_physical_device_queue_family_properties(pdevice) }
            .iter()
            .position(|props| {
                props.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)
            })
            .ok_or_else(|| format!("{name}: no graphics queue family"))? as u32;

        Ok(Self {
            handle: pdevice,
            properties,
            queue_family_index,
        })
    }

    /// 必要的 device extensions
    pub(crate) fn required_exts(need_swapchain: bool) -> Vec<&'static CStr> {
        let mut exts = vec![];
        if need_swapchain {
            exts.push(ash::khr::swapchain::NAME);
        }
        exts
    }
}
