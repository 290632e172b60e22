//! # Input Device Detection and Selection
//!
//! Enumerates microphones on the default cpal host and resolves the
//! configured selection to a device.
//!
//! ## Selection Forms:
//! - `default`: the host's default input device
//! - `3`: the device at that index in [`DeviceManager::list_input_devices`]
//! - `USB Microphone`: a device name, exact match first, then a
//!   case-insensitive substring match

use crate::error::{AppResult, CaptureError};
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

/// Which input device to open.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelection {
    #[default]
    Default,
    Index(usize),
    Name(String),
}

impl std::str::FromStr for DeviceSelection {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("default") {
            return Ok(DeviceSelection::Default);
        }
        if let Ok(index) = s.parse::<usize>() {
            return Ok(DeviceSelection::Index(index));
        }
        Ok(DeviceSelection::Name(s.to_string()))
    }
}

impl fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelection::Default => write!(f, "default"),
            DeviceSelection::Index(index) => write!(f, "{}", index),
            DeviceSelection::Name(name) => write!(f, "{}", name),
        }
    }
}

/// One entry of the device listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputDeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
}

/// Input device enumeration on the default audio host.
pub struct DeviceManager {
    host: cpal::Host,
}

impl DeviceManager {
    pub fn new() -> Self {
        let host = cpal::default_host();
        debug!("Using audio host {:?}", host.id());
        Self { host }
    }

    /// List every input device, in host order.
    pub fn list_input_devices(&self) -> AppResult<Vec<InputDeviceInfo>> {
        let default_name = self
            .host
            .default_input_device()
            .and_then(|d| d.name().ok());

        let devices = self
            .host
            .input_devices()?
            .enumerate()
            .map(|(index, device)| {
                let name = device.name().unwrap_or_else(|_| format!("input device {}", index));
                InputDeviceInfo {
                    index,
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    name,
                }
            })
            .collect();

        Ok(devices)
    }

    /// Resolve a selection to an openable device.
    ///
    /// ## Errors:
    /// A selection that matches nothing is a device error, as is a host with
    /// no default input.
    pub fn select(&self, selection: &DeviceSelection) -> AppResult<cpal::Device> {
        let device = match selection {
            DeviceSelection::Default => self
                .host
                .default_input_device()
                .ok_or_else(|| {
                    CaptureError::Device("no default input device available".to_string())
                })?,
            _ => {
                let mut devices: Vec<cpal::Device> = self.host.input_devices()?.collect();
                let names: Vec<String> = devices
                    .iter()
                    .enumerate()
                    .map(|(i, d)| d.name().unwrap_or_else(|_| format!("input device {}", i)))
                    .collect();
                let index = resolve_selection(&names, selection).ok_or_else(|| {
                    CaptureError::Device(format!("input device '{}' not found", selection))
                })?;
                devices.swap_remove(index)
            }
        };

        info!(
            "Selected input device '{}' ({})",
            selection,
            device.name().unwrap_or_else(|_| "unnamed".to_string())
        );
        Ok(device)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Index into `names` for a non-default selection.
fn resolve_selection(names: &[String], selection: &DeviceSelection) -> Option<usize> {
    match selection {
        DeviceSelection::Default => None,
        DeviceSelection::Index(index) => (*index < names.len()).then_some(*index),
        DeviceSelection::Name(wanted) => names.iter().position(|n| n == wanted).or_else(|| {
            let wanted = wanted.to_lowercase();
            names.iter().position(|n| n.to_lowercase().contains(&wanted))
        }),
    }
}
