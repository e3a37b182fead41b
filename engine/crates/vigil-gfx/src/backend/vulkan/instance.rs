use std::ffi::{CStr, CString, c_char};

use ash::vk;
use itertools::Itertools;
use raw_window_handle::RawDisplayHandle;

use crate::config::GfxConfig;
use crate::error::{GfxError, GfxResult};

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan instance 以及可选的 debug messenger
pub(crate) struct VulkanInstance {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    /// 只有在 instance 支持 debug utils 时才有值，用于对象命名和 debug label
    pub(crate) debug_utils_enabled: bool,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    pub(crate) fn new(config: &GfxConfig, display: Option<RawDisplayHandle>) -> GfxResult<Self> {
        let _span = tracy_client::span!("VulkanInstance::new");

        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new(config.app_name.as_str()).unwrap_or_else(|_| c"vigil".to_owned());
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"vigil")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        let available_exts = unsafe { entry.enumerate_instance_extension_properties(None)? };
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let ext_supported = |name: &CStr| {
            available_exts.iter().any(|p| p.extension_name_as_c_str().is_ok_and(|ext| ext == name))
        };

        let mut exts: Vec<*const c_char> = vec![];
        if let Some(display) = display {
            exts.extend_from_slice(ash_window::enumerate_required_extensions(display)?);
        }
        let debug_utils_enabled = ext_supported(ash::ext::debug_utils::NAME);
        if debug_utils_enabled {
            exts.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        // 检查必须的 extension 是否都被支持
        for ext in &exts {
            let ext = unsafe { CStr::from_ptr(*ext) };
            if !ext_supported(ext) {
                return Err(GfxError::NoSuitableDevice(format!("instance extension {ext:?} is not supported")));
            }
        }

        let mut layers: Vec<*const c_char> = vec![];
        if config.enable_validation {
            let layer_supported = available_layers
                .iter()
                .any(|p| p.layer_name_as_c_str().is_ok_and(|layer| layer == VALIDATION_LAYER_NAME));
            if layer_supported {
                layers.push(VALIDATION_LAYER_NAME.as_ptr());
            } else {
                log::warn!("validation layer is not available, continue without it");
            }
        }

        log::info!(
            "instance exts: {}\ninstance layers: {}",
            exts.iter().map(|e| format!("\n\t{:?}", unsafe { CStr::from_ptr(*e) })).join(""),
            layers.iter().map(|l| format!("\n\t{:?}", unsafe { CStr::from_ptr(*l) })).join(""),
        );

        let create_debug_messenger = config.enable_validation && debug_utils_enabled;
        // 让 instance 的创建和销毁过程也能输出 validation 信息
        let mut debug_ci = debug_utils_messenger_ci();
        let mut instance_ci =
            vk::InstanceCreateInfo::default().application_info(&app_info).enabled_extension_names(&exts).enabled_layer_names(&layers);
        if create_debug_messenger {
            instance_ci = instance_ci.push_next(&mut debug_ci);
        }

        let instance = unsafe { entry.create_instance(&instance_ci, None)? };

        let debug_messenger = if create_debug_messenger {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            match unsafe { loader.create_debug_utils_messenger(&debug_utils_messenger_ci(), None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils_enabled,
            debug_messenger,
        })
    }

    /// 需要在 device 销毁之后调用
    pub(crate) fn destroy(&mut self) {
        log::info!("destroying instance");
        unsafe {
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// debug messenger 的回调函数
///
/// # Safety
/// 由 validation layer 调用，`p_callback_data` 在回调期间有效
unsafe extern "system" fn vk_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let msg = if p_callback_data.is_null() || unsafe { (*p_callback_data).p_message.is_null() } {
        std::borrow::Cow::from("")
    } else {
        unsafe { CStr::from_ptr((*p_callback_data).p_message).to_string_lossy() }
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[{:?}]\n{}", message_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[{:?}]\n{}", message_type, msg),
        _ => log::info!("[{:?}]\n{}", message_type, msg),
    };

    // 只有 layer developer 才需要返回 True
    vk::FALSE
}

fn debug_utils_messenger_ci() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vk_debug_callback))
}
