//! [`BusId`] and the wire-visible [`DeviceId`] derived from it
//! (spec.md §3 "BusId" / "DeviceId").

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `(bus, port)`, both 1-based, rendered as `"<bus>-<port>"`. Ordered
/// lexicographically by `(bus, port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusId {
    bus: u16,
    port: u16,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusIdParseError {
    #[error("bus-id {0:?} is not in \"<bus>-<port>\" form")]
    Malformed(String),
    #[error("bus-id component must be a nonzero 16-bit integer, got {0:?}")]
    InvalidComponent(String),
}

impl BusId {
    /// Returns `None` if either component is zero (bus-ids are 1-based).
    pub fn new(bus: u16, port: u16) -> Option<Self> {
        if bus == 0 || port == 0 {
            return None;
        }
        Some(Self { bus, port })
    }

    pub fn bus(self) -> u16 {
        self.bus
    }

    pub fn port(self) -> u16 {
        self.port
    }

    /// The wire-visible 32-bit composite `(bus << 16) | port`.
    pub fn device_id(self) -> u32 {
        ((self.bus as u32) << 16) | self.port as u32
    }

    pub fn from_device_id(devid: u32) -> Option<Self> {
        Self::new((devid >> 16) as u16, (devid & 0xFFFF) as u16)
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.port)
    }
}

impl FromStr for BusId {
    type Err = BusIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus_str, port_str) = s
            .split_once('-')
            .ok_or_else(|| BusIdParseError::Malformed(s.to_string()))?;
        let parse_component = |c: &str| -> Result<u16, BusIdParseError> {
            c.parse::<u16>()
                .ok()
                .filter(|&v| v != 0)
                .ok_or_else(|| BusIdParseError::InvalidComponent(c.to_string()))
        };
        let bus = parse_component(bus_str)?;
        let port = parse_component(port_str)?;
        Ok(BusId { bus, port })
    }
}
