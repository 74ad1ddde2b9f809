use serde::{Deserialize, Serialize};

pub const MAX_DEVICE_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    InvalidDeviceName { name: String, reason: &'static str },
    InvalidAddress { address: String, reason: &'static str },
    MissingDevice { name: String },
    EmptyStateChange { name: String },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDeviceName { .. }
            | Self::InvalidAddress { .. }
            | Self::EmptyStateChange { .. } => "invalid_request",
            Self::MissingDevice { .. } => "not_found",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDeviceName { name, reason } => {
                write!(f, "invalid device name: {name:?} ({reason})")
            }
            Self::InvalidAddress { address, reason } => {
                write!(f, "invalid device address: {address:?} ({reason})")
            }
            Self::MissingDevice { name } => write!(f, "device not found: {name}"),
            Self::EmptyStateChange { name } => {
                write!(f, "state change for {name} sets neither rgb nor power")
            }
        }
    }
}

impl std::error::Error for DomainError {}

pub fn validate_device_name(name: &str) -> Result<(), DomainError> {
    let invalid = |reason| {
        Err(DomainError::InvalidDeviceName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("must not be empty");
    }
    if name.chars().count() > MAX_DEVICE_NAME_LEN {
        return invalid("longer than 64 characters");
    }
    if name.contains('/') {
        return invalid("must not contain '/'");
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return invalid("must not contain whitespace or control characters");
    }
    Ok(())
}

/// Accepts a bare host (`10.0.0.7`, `desk-strip.local`) or `host:port`. The transport decides
/// the scheme and path, so neither may be present here.
pub fn validate_address(address: &str) -> Result<(), DomainError> {
    let invalid = |reason| {
        Err(DomainError::InvalidAddress {
            address: address.to_string(),
            reason,
        })
    };
    if address.is_empty() {
        return invalid("must not be empty");
    }
    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return invalid("must not contain whitespace");
    }
    if address.contains("://") {
        return invalid("must not include a scheme");
    }
    if address.contains('/') {
        return invalid("must not include a path");
    }
    Ok(())
}

/// Desired color, one 8-bit intensity per channel. Serialized as `[r, g, b]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }
}

impl From<Rgb> for [u8; 3] {
    fn from(value: Rgb) -> Self {
        [value.r, value.g, value.b]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(rename = "rgb", default)]
    pub color: Rgb,
    #[serde(default)]
    pub power: bool,
}

impl Device {
    /// A freshly registered device starts dark and powered off.
    pub fn new(name: String, address: String) -> Result<Self, DomainError> {
        validate_device_name(&name)?;
        validate_address(&address)?;
        Ok(Self {
            name,
            address,
            color: Rgb::OFF,
            power: false,
        })
    }
}

/// Body pushed to a device's `/leds` endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedPayload {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub power: bool,
}

impl From<&Device> for LedPayload {
    fn from(device: &Device) -> Self {
        Self {
            r: device.color.r,
            g: device.color.g,
            b: device.color.b,
            power: device.power,
        }
    }
}
