use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::domain::{Device, DomainError, Rgb, validate_address, validate_device_name};

pub const SCHEMA_VERSION: u32 = 1;

const DEVICES_FILE: &str = "devices.json";

#[derive(Debug, Clone)]
pub struct StoreInit {
    pub data_dir: PathBuf,
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    Domain(DomainError),
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::Domain(e) => write!(f, "{e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::Domain(e) => Some(e),
            Self::SchemaVersionMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub schema_version: u32,
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
}

impl PersistedState {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            devices: BTreeMap::new(),
        }
    }
}

/// Outcome of a device announcing itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created(Device),
    /// The name was already known; only the address was refreshed.
    Updated(Device),
}

impl Registration {
    pub fn device(&self) -> &Device {
        match self {
            Self::Created(device) | Self::Updated(device) => device,
        }
    }
}

/// Device registry persisted as a single JSON snapshot. Every mutation rewrites the snapshot
/// before returning, so a successful call is durable.
pub struct JsonSnapshotStore {
    state_path: PathBuf,
    state: PersistedState,
}

impl JsonSnapshotStore {
    pub fn load_or_init(init: StoreInit) -> Result<Self, StoreError> {
        fs::create_dir_all(&init.data_dir)?;

        let state_path = init.data_dir.join(DEVICES_FILE);
        let (state, is_new_state) = if state_path.exists() {
            let bytes = fs::read(&state_path)?;
            let state: PersistedState = serde_json::from_slice(&bytes)?;
            if state.schema_version != SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got: state.schema_version,
                });
            }
            (state, false)
        } else {
            (PersistedState::empty(), true)
        };

        let store = Self { state_path, state };
        if is_new_state {
            store.save()?;
        }

        Ok(store)
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.state_path, &bytes)?;
        Ok(())
    }

    pub fn get_device(&self, name: &str) -> Option<Device> {
        self.state.devices.get(name).cloned()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.state.devices.values().cloned().collect()
    }

    pub fn create_device(&mut self, name: String, address: String) -> Result<Device, StoreError> {
        let device = Device::new(name, address)?;
        self.state
            .devices
            .insert(device.name.clone(), device.clone());
        self.save()?;
        Ok(device)
    }

    pub fn update_device_address(
        &mut self,
        name: &str,
        address: String,
    ) -> Result<Device, StoreError> {
        validate_address(&address)?;
        let device = self
            .state
            .devices
            .get_mut(name)
            .ok_or_else(|| DomainError::MissingDevice {
                name: name.to_string(),
            })?;
        device.address = address;
        let device = device.clone();
        self.save()?;
        Ok(device)
    }

    pub fn update_device_state(
        &mut self,
        name: &str,
        color: Rgb,
        power: bool,
    ) -> Result<Device, StoreError> {
        let device = self
            .state
            .devices
            .get_mut(name)
            .ok_or_else(|| DomainError::MissingDevice {
                name: name.to_string(),
            })?;
        device.color = color;
        device.power = power;
        let device = device.clone();
        self.save()?;
        Ok(device)
    }

    /// Creates the device on first contact; on re-registration only the address changes.
    pub fn register_device(
        &mut self,
        name: String,
        address: String,
    ) -> Result<Registration, StoreError> {
        validate_device_name(&name)?;
        if self.state.devices.contains_key(&name) {
            return self
                .update_device_address(&name, address)
                .map(Registration::Updated);
        }
        self.create_device(name, address).map(Registration::Created)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        let _ = file.sync_all();
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
