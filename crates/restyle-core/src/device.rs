//! Compute device selection.

use std::fmt;
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Device the model weights and activations live on.
///
/// Parsed from `cpu`, `cuda`, `cuda:N` or `metal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceType {
    #[default]
    Cpu,
    Cuda(usize),
    Metal,
}

impl DeviceType {
    /// Open the candle device for this selection.
    pub fn device(self) -> Result<Device> {
        let device = match self {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceType::Metal => Device::new_metal(0)?,
        };
        Ok(device)
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "cuda" => Ok(DeviceType::Cuda(0)),
            "metal" | "mps" => Ok(DeviceType::Metal),
            _ => match s.strip_prefix("cuda:") {
                Some(ordinal) => ordinal
                    .parse()
                    .map(DeviceType::Cuda)
                    .map_err(|_| Error::Config(format!("invalid cuda ordinal in device '{}'", s))),
                None => Err(Error::Config(format!("unknown device '{}'", s))),
            },
        }
    }
}

impl TryFrom<String> for DeviceType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DeviceType> for String {
    fn from(d: DeviceType) -> Self {
        d.to_string()
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceType::Metal => write!(f, "metal"),
        }
    }
}
