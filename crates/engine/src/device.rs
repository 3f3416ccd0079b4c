//! Execution device and precision selection
//!
//! Hardware probing is kept apart from the selection logic so the decision
//! can be exercised without an accelerator present.

use candle_core::{DType, Device};
use chatserve_common::config::{DevicePreference, PrecisionPreference};
use chatserve_common::{ChatServeError, Result};
use std::fmt;

/// Compute device a model is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// General-purpose processor
    Cpu,

    /// CUDA device by ordinal
    Cuda(usize),

    /// Metal device by ordinal
    Metal(usize),
}

impl DeviceKind {
    /// Whether this is an accelerated compute device
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }

    /// Open the candle device
    pub fn open(&self) -> Result<Device> {
        match *self {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal)
                .map_err(|e| ChatServeError::load(format!("Failed to open cuda:{}: {}", ordinal, e))),
            DeviceKind::Metal(ordinal) => Device::new_metal(ordinal)
                .map_err(|e| ChatServeError::load(format!("Failed to open metal:{}: {}", ordinal, e))),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceKind::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

/// Numeric precision of model weights and activations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    F16,
    Bf16,
    F32,
}

impl Precision {
    /// Candle dtype for this precision
    pub fn dtype(&self) -> DType {
        match self {
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F32 => DType::F32,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::F16 => "f16",
            Precision::Bf16 => "bf16",
            Precision::F32 => "f32",
        };
        f.write_str(name)
    }
}

/// Accelerators compiled in and present on this host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub cuda: bool,
    pub metal: bool,
}

impl Capabilities {
    /// Query the runtime for available accelerators
    pub fn probe() -> Self {
        Self {
            cuda: candle_core::utils::cuda_is_available(),
            metal: candle_core::utils::metal_is_available(),
        }
    }

    /// A host with no accelerators
    pub fn cpu_only() -> Self {
        Self::default()
    }
}

/// Device placement and precision chosen for a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub device: DeviceKind,
    pub precision: Precision,
}

/// Choose device and precision from the host capabilities and configured preferences
///
/// `auto` device prefers CUDA, then Metal, then CPU. `auto` precision is F16
/// on an accelerator and F32 on CPU. Requesting an accelerator the host does
/// not have is an error.
pub fn detect_execution_config(
    capabilities: Capabilities,
    device: DevicePreference,
    precision: PrecisionPreference,
) -> Result<ExecutionConfig> {
    let device = match device {
        DevicePreference::Auto if capabilities.cuda => DeviceKind::Cuda(0),
        DevicePreference::Auto if capabilities.metal => DeviceKind::Metal(0),
        DevicePreference::Auto | DevicePreference::Cpu => DeviceKind::Cpu,
        DevicePreference::Cuda if capabilities.cuda => DeviceKind::Cuda(0),
        DevicePreference::Metal if capabilities.metal => DeviceKind::Metal(0),
        DevicePreference::Cuda | DevicePreference::Metal => {
            return Err(ChatServeError::load(format!(
                "Requested device {:?} is not available on this host",
                device
            )));
        }
    };

    let precision = match precision {
        PrecisionPreference::Auto if device.is_accelerator() => Precision::F16,
        PrecisionPreference::Auto => Precision::F32,
        PrecisionPreference::F16 => Precision::F16,
        PrecisionPreference::Bf16 => Precision::Bf16,
        PrecisionPreference::F32 => Precision::F32,
    };

    Ok(ExecutionConfig { device, precision })
}
