//! Accelerator selection and device metadata.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Upper bound on CUDA ordinals probed when counting devices
const MAX_PROBED_DEVICES: usize = 8;

/// Requested device, as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelection {
    /// First available accelerator, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

impl DeviceKind {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }
}

/// A resolved device the weights are placed on
#[derive(Debug, Clone)]
pub struct DevicePlacement {
    pub device: Device,
    pub kind: DeviceKind,
    pub ordinal: usize,
}

impl DevicePlacement {
    /// Resolve a configured selection to a concrete device.
    ///
    /// `Auto` falls back to the CPU; explicit accelerator requests fail when
    /// the accelerator cannot be opened.
    pub fn select(selection: DeviceSelection, ordinal: usize) -> Result<Self> {
        let placement = match selection {
            DeviceSelection::Cpu => Self::cpu(),
            DeviceSelection::Cuda => Self::cuda(ordinal)?,
            DeviceSelection::Metal => Self::metal(ordinal)?,
            DeviceSelection::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Self::cuda(ordinal).unwrap_or_else(|e| {
                        warn!("CUDA reported available but failed to open: {}", e);
                        Self::cpu()
                    })
                } else if candle_core::utils::metal_is_available() {
                    Self::metal(ordinal).unwrap_or_else(|e| {
                        warn!("Metal reported available but failed to open: {}", e);
                        Self::cpu()
                    })
                } else {
                    Self::cpu()
                }
            }
        };
        info!("Using device {}", placement.label());
        Ok(placement)
    }

    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
            ordinal: 0,
        }
    }

    fn cuda(ordinal: usize) -> Result<Self> {
        let device = Device::new_cuda(ordinal)?;
        Ok(Self {
            device,
            kind: DeviceKind::Cuda,
            ordinal,
        })
    }

    fn metal(ordinal: usize) -> Result<Self> {
        let device = Device::new_metal(ordinal)?;
        Ok(Self {
            device,
            kind: DeviceKind::Metal,
            ordinal,
        })
    }

    /// Weight dtype for a load. Reduced precision only pays off on
    /// accelerators; the CPU path always computes in F32.
    pub fn weight_dtype(&self, quantize: bool) -> DType {
        let dtype = match (self.kind, quantize) {
            (DeviceKind::Cuda, true) => DType::BF16,
            (DeviceKind::Metal, true) => DType::F16,
            _ => DType::F32,
        };
        debug!("Selected dtype {:?} for {} (quantize: {})", dtype, self.label(), quantize);
        dtype
    }

    pub fn label(&self) -> String {
        match self.kind {
            DeviceKind::Cpu => "cpu".to_string(),
            DeviceKind::Cuda => format!("cuda:{}", self.ordinal),
            DeviceKind::Metal => format!("metal:{}", self.ordinal),
        }
    }

    /// Allocate a small tensor on the device and read it back.
    pub fn smoke_test(&self) -> Result<Vec<f32>> {
        let tensor = Tensor::new(&[1.0f32, 2.0], &self.device)?;
        let doubled = (tensor * 2.0)?;
        Ok(doubled.to_vec1::<f32>()?)
    }
}

/// Accelerator metadata reported by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub available: bool,
    pub device_count: usize,
    pub current_device: Option<usize>,
    pub device_name: Option<String>,
}

impl AcceleratorInfo {
    /// Probe the accelerators compiled into this build. Never fails;
    /// anything that cannot be queried reports as unavailable.
    pub fn probe() -> Self {
        if candle_core::utils::cuda_is_available() {
            let device_count = (0..MAX_PROBED_DEVICES)
                .take_while(|ordinal| Device::new_cuda(*ordinal).is_ok())
                .count();
            if device_count > 0 {
                return Self {
                    available: true,
                    device_count,
                    current_device: Some(0),
                    device_name: Some("cuda:0".to_string()),
                };
            }
        }

        if candle_core::utils::metal_is_available() && Device::new_metal(0).is_ok() {
            return Self {
                available: true,
                device_count: 1,
                current_device: Some(0),
                device_name: Some("metal:0".to_string()),
            };
        }

        Self::unavailable()
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            device_count: 0,
            current_device: None,
            device_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_always_uses_f32() {
        let cpu = DevicePlacement::cpu();
        assert_eq!(cpu.weight_dtype(true), DType::F32);
        assert_eq!(cpu.weight_dtype(false), DType::F32);
        assert_eq!(cpu.label(), "cpu");
        assert!(!cpu.kind.is_accelerator());
    }

    #[test]
    fn test_explicit_cpu_selection() {
        let placement = DevicePlacement::select(DeviceSelection::Cpu, 3).unwrap();
        assert_eq!(placement.kind, DeviceKind::Cpu);
        assert_eq!(placement.smoke_test().unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_probe_is_consistent() {
        let info = AcceleratorInfo::probe();
        assert_eq!(info.available, info.device_count > 0);
        assert_eq!(info.available, info.device_name.is_some());
    }
}
