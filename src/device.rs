use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The kind of device a hash map lives on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceType {
    /// Host memory, processed by the CPU thread pool.
    #[default]
    Cpu,
    /// A CUDA device.
    Cuda,
}

impl DeviceType {
    fn as_str(self) -> &'static str {
        match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Cuda => "CUDA",
        }
    }
}

/// A device, identified by its kind and an integer id.
///
/// Devices are written as `"CPU:0"` or `"CUDA:<id>"`. There is exactly one CPU device,
/// with id 0.
///
/// # Examples
///
/// ```
/// use slabhash::{Device, DeviceType};
///
/// let device: Device = "CUDA:1".parse().unwrap();
/// assert_eq!(device.kind(), DeviceType::Cuda);
/// assert_eq!(device.id(), 1);
/// assert_eq!(device.to_string(), "CUDA:1");
/// assert!("CPU:1".parse::<Device>().is_err());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Device {
    kind: DeviceType,
    id: u32,
}

impl Device {
    /// The host device.
    pub const CPU: Device = Device {
        kind: DeviceType::Cpu,
        id: 0,
    };

    /// Creates a device, rejecting CPU ids other than 0.
    pub fn new(kind: DeviceType, id: u32) -> Result<Device> {
        if kind == DeviceType::Cpu && id != 0 {
            return Err(Error::Device(format!(
                "CPU has device id 0, but got {}",
                id
            )));
        }

        Ok(Device { kind, id })
    }

    /// Returns the host device.
    pub const fn cpu() -> Device {
        Device::CPU
    }

    /// Returns the CUDA device with the given id.
    pub const fn cuda(id: u32) -> Device {
        Device {
            kind: DeviceType::Cuda,
            id,
        }
    }

    /// Returns the kind of this device.
    pub fn kind(&self) -> DeviceType {
        self.kind
    }

    /// Returns the id of this device.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns `true` if this is the host device.
    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceType::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Device> {
        let malformed = || {
            Error::Device(format!(
                "invalid device string {:?}, expected e.g. \"CPU:0\" or \"CUDA:0\"",
                s
            ))
        };

        let (kind, id) = s.split_once(':').ok_or_else(malformed)?;
        let kind = match kind.to_ascii_uppercase().as_str() {
            "CPU" => DeviceType::Cpu,
            "CUDA" => DeviceType::Cuda,
            _ => return Err(malformed()),
        };
        let id = id.trim().parse::<u32>().map_err(|_| malformed())?;

        Device::new(kind, id)
    }
}

impl TryFrom<String> for Device {
    type Error = Error;

    fn try_from(s: String) -> Result<Device> {
        s.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> String {
        device.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!("CPU:0".parse::<Device>().unwrap(), Device::CPU);
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::cuda(3));
        assert!("CPU".parse::<Device>().is_err());
        assert!("TPU:0".parse::<Device>().is_err());
        assert!("CUDA:x".parse::<Device>().is_err());
        assert!(matches!("CPU:2".parse::<Device>(), Err(Error::Device(_))));
    }

    #[test]
    fn serde() {
        let json = serde_json::to_string(&Device::cuda(2)).unwrap();
        assert_eq!(json, "\"CUDA:2\"");
        let device: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(device, Device::cuda(2));
        assert!(serde_json::from_str::<Device>("\"CPU:7\"").is_err());
    }
}
