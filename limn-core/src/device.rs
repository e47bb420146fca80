use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use tracing::warn;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            warn!("no gpu available, falling back to cpu");
            Ok(Device::Cpu)
        }
    }
}

/// Reduced precision on gpu, full precision on cpu.
pub fn dtype_for(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_cpu_always_selects_cpu() {
        let device = select_best_device(DeviceMap::ForceCpu).unwrap();
        assert!(device.is_cpu());
        assert_eq!(dtype_for(&device), DType::F32);
    }
}
