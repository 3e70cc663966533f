use std::ffi::{c_char, c_void, CStr, CString};
use ash::vk;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use crate::backend::device::Device;
use crate::config::BootstrapConfig;

/// Loads Vulkan and keeps the instance alive for a headless context.
pub struct Instance {
    pub instance: ash::Instance,
    debug_utils: Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    _entry: ash::Entry,
}

impl Instance {
    const VALIDATION_LAYER: &'static CStr = c"VK_LAYER_KHRONOS_validation";

    pub fn new(config: &BootstrapConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .wrap_err("Failed to load the Vulkan loader")?;

        let enable_validation = config.enable_validation
            && Self::validation_layer_supported(&entry)?;
        if config.enable_validation && !enable_validation {
            log::warn!("Validation layer {:?} not available, continuing without it", Self::VALIDATION_LAYER);
        }

        let instance = Self::create_instance(&entry, config, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::create_debug_utils_messenger(&entry, &instance)?)
        } else {
            None
        };

        Ok(Self {
            instance,
            debug_utils,
            _entry: entry,
        })
    }

    pub fn create_device(&self) -> Result<Device> {
        Device::new(&self.instance)
    }

    fn create_instance(
        entry: &ash::Entry,
        config: &BootstrapConfig,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let application_name = CString::new(config.application_name.as_str())?;
        let application_info = vk::ApplicationInfo::default()
            .application_name(&application_name)
            .api_version(vk::API_VERSION_1_1);

        let enabled_layer_names = if enable_validation {
            vec![Self::VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };
        let enabled_extension_names: Vec<*const c_char> = if enable_validation {
            vec![ash::ext::debug_utils::NAME.as_ptr()]
        } else {
            Vec::new()
        };

        let mut debug_info = debug_utils_messenger_create_info();
        let mut instance_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_layer_names(&enabled_layer_names)
            .enabled_extension_names(&enabled_extension_names);
        if enable_validation {
            instance_info = instance_info.push_next(&mut debug_info);
        }

        Ok(unsafe {
            entry.create_instance(&instance_info, None)?
        })
    }

    fn create_debug_utils_messenger(
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)> {
        let debug_utils_loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let debug_utils_info = debug_utils_messenger_create_info();
        let debug_utils_messenger = unsafe {
            debug_utils_loader.create_debug_utils_messenger(&debug_utils_info, None)?
        };
        Ok((debug_utils_messenger, debug_utils_loader))
    }

    fn validation_layer_supported(entry: &ash::Entry) -> Result<bool> {
        let supported_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        Ok(supported_layers
            .iter()
            .filter_map(|props| props.layer_name_as_c_str().ok())
            .any(|layer| layer == Self::VALIDATION_LAYER))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((messenger, loader)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn debug_utils_messenger_create_info(
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    let message_severity = vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
    let message_type = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(message_severity)
        .message_type(message_type)
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let msg_type = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let msg = unsafe {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => log::trace!("{} {}", msg_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("{} {}", msg_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("{} {}", msg_type, msg),
        _ => log::error!("{} {}", msg_type, msg),
    }

    vk::FALSE
}
