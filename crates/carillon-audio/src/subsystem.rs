//! Process-level audio context.
//!
//! Owns every open device and the set of sounds that failed to decode. The
//! set is created with the first device and emptied again when the last one
//! closes.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::BTreeMap;
use std::sync::Arc;

use carillon_core::{Backend, DeviceConfig, DeviceId, Result, Vfs};
use tracing::{debug, info};

use crate::device::{Device, FailedSounds};
use crate::output;

/// Entry point of the engine. Create one per process.
pub struct AudioSubsystem {
    vfs: Arc<dyn Vfs>,
    devices: BTreeMap<DeviceId, Device>,
    next_device_id: u32,
    failed: FailedSounds,
}

impl AudioSubsystem {
    /// Create a subsystem that opens every sound through `vfs`.
    pub fn new(vfs: Arc<dyn Vfs>) -> Self {
        Self {
            vfs,
            devices: BTreeMap::new(),
            next_device_id: 0,
            failed: FailedSounds::default(),
        }
    }

    /// Open a device and return its id. Nothing is kept if opening fails.
    pub fn open_device(&mut self, config: &DeviceConfig) -> Result<DeviceId> {
        let id = DeviceId(self.next_device_id);
        let device = Device::open(id, config, Arc::clone(&self.vfs), Arc::clone(&self.failed))?;
        self.next_device_id = self.next_device_id.wrapping_add(1);
        self.devices.insert(id, device);
        debug!("{} audio device(s) open", self.devices.len());
        Ok(id)
    }

    /// Open a device at 48000 Hz with a 1024 byte buffer on the default
    /// soundcard.
    pub fn open_default_device(&mut self) -> Result<DeviceId> {
        self.open_device(&DeviceConfig::default())
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(&id)
    }

    /// Close a device. Returns false for an unknown or already closed id.
    pub fn destroy_device(&mut self, id: DeviceId) -> bool {
        let Some(mut device) = self.devices.remove(&id) else {
            return false;
        };
        device.destroy();
        if self.devices.is_empty() {
            self.failed.lock().clear();
            info!("Last audio device closed");
        }
        true
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Number of soundcards `backend` can open.
    pub fn soundcard_count(&self, backend: Backend) -> usize {
        output::soundcard_names(backend).len()
    }

    /// Names of the soundcards `backend` can open.
    pub fn soundcard_names(&self, backend: Backend) -> Vec<String> {
        output::soundcard_names(backend)
    }
}

impl Drop for AudioSubsystem {
    fn drop(&mut self) {
        let ids: Vec<_> = self.devices.keys().copied().collect();
        for id in ids {
            self.destroy_device(id);
        }
    }
}
