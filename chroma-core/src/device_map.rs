use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use tracing::{info, warn};

/// Which device the pipeline runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    /// Accelerator with this ordinal, falling back to the CPU when none is available.
    Ordinal(usize),
}

impl DeviceMap {
    pub fn from_cpu_flag(cpu: bool) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::default()
        }
    }

    /// Open the device, preferring CUDA over Metal.
    ///
    /// An accelerator request on a build without one compiled in runs on the CPU with a
    /// warning naming the feature to enable.
    pub fn open(self) -> candle_core::Result<Device> {
        let device = match self {
            Self::ForceCpu => Device::Cpu,
            Self::Ordinal(ordinal) if cuda_is_available() => Device::new_cuda(ordinal)?,
            Self::Ordinal(ordinal) if metal_is_available() => Device::new_metal(ordinal)?,
            Self::Ordinal(_) => {
                let feature = if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
                    "metal"
                } else {
                    "cuda"
                };
                warn!("No accelerator available, running on CPU. Build with `--features {feature}` to use the GPU.");
                Device::Cpu
            }
        };
        info!("Running on {:?}", device.location());
        Ok(device)
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_flag_forces_cpu() {
        assert_eq!(DeviceMap::from_cpu_flag(true), DeviceMap::ForceCpu);
        assert_eq!(DeviceMap::from_cpu_flag(false), DeviceMap::Ordinal(0));
        assert!(DeviceMap::ForceCpu.open().unwrap().is_cpu());
    }

    #[test]
    fn missing_accelerator_falls_back_to_cpu() {
        if cuda_is_available() || metal_is_available() {
            return;
        }
        assert!(DeviceMap::default().open().unwrap().is_cpu());
    }
}
