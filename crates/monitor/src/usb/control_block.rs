//! Opened device handle
//!
//! A [`ControlBlock`] exclusively owns one native connection plus the
//! interfaces claimed on it. Closing is idempotent: the first close releases
//! everything, later closes observe an empty handle and do nothing. A closed
//! block is inert and never handed out again by the registry.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use common::{DeviceDescriptor, DeviceIdentity, DeviceInfo, InterfaceDescriptor, UsbConnection};
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::session::worker::{WorkerCommand, WorkerHandle};
use crate::usb::registry::RegistryInner;

struct BlockState {
    connection: Option<Box<dyn UsbConnection>>,
    interfaces: HashMap<(u8, u8), InterfaceDescriptor>,
    claimed: BTreeSet<u8>,
}

pub struct ControlBlock {
    id: u64,
    identity: DeviceIdentity,
    device: DeviceDescriptor,
    info: DeviceInfo,
    state: Mutex<BlockState>,
    owner: Weak<RegistryInner>,
    notifier: Option<WorkerHandle>,
}

impl ControlBlock {
    pub(crate) fn new(
        id: u64,
        identity: DeviceIdentity,
        device: DeviceDescriptor,
        info: DeviceInfo,
        connection: Box<dyn UsbConnection>,
        owner: Weak<RegistryInner>,
        notifier: Option<WorkerHandle>,
    ) -> Self {
        Self {
            id,
            identity,
            device,
            info,
            state: Mutex::new(BlockState {
                connection: Some(connection),
                interfaces: HashMap::new(),
                claimed: BTreeSet::new(),
            }),
            owner,
            notifier,
        }
    }

    fn state(&self) -> MutexGuard<'_, BlockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registry-unique id, never reused
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Device snapshot taken when the block was opened
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number
    }

    pub fn device_number(&self) -> u8 {
        self.device.device_address
    }

    pub fn is_open(&self) -> bool {
        self.state().connection.is_some()
    }

    /// Identity key including the serial read from the opened device
    pub fn key_name_with_serial(&self) -> String {
        self.identity
            .clone()
            .with_serial(self.info.serial.as_deref())
            .key_name()
    }

    /// Close the block
    ///
    /// Releases claimed interfaces, closes the native handle, drops the
    /// registry entry and reports the disconnect through the worker. A
    /// second call is a no-op.
    pub fn close(self: &Arc<Self>) {
        if !self.release() {
            return;
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.remove_if_same(&self.identity, self.id);
        }

        if let Some(notifier) = &self.notifier
            && !notifier.send(WorkerCommand::Disconnected(Arc::clone(self)))
        {
            debug!("Worker gone, disconnect of block {} not reported", self.id);
        }
    }

    /// Release native resources without touching the registry or emitting
    ///
    /// Returns true only for the call that actually released the handle.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.state();
        let Some(mut connection) = state.connection.take() else {
            return false;
        };

        let claimed = std::mem::take(&mut state.claimed);
        for interface in claimed {
            if let Err(e) = connection.release_interface(interface) {
                warn!(
                    "Failed to release interface {} on {}: {}",
                    interface, self.device.name, e
                );
            }
        }
        state.interfaces.clear();
        connection.close();

        debug!("Closed control block {} ({})", self.id, self.device.name);
        true
    }

    /// Interface descriptor for an interface number and alternate setting
    ///
    /// Lookups are memoized per block.
    pub fn get_interface(&self, id: u8, alt_setting: u8) -> Result<InterfaceDescriptor> {
        let mut state = self.state();
        if state.connection.is_none() {
            return Err(MonitorError::AlreadyClosed);
        }

        if let Some(interface) = state.interfaces.get(&(id, alt_setting)) {
            return Ok(interface.clone());
        }

        let interface = self
            .device
            .interface(id, alt_setting)
            .cloned()
            .ok_or_else(|| {
                MonitorError::InvalidArgument(format!(
                    "no interface {} alt {} on {}",
                    id, alt_setting, self.device.name
                ))
            })?;
        state.interfaces.insert((id, alt_setting), interface.clone());
        Ok(interface)
    }

    /// Number of memoized interface lookups
    pub fn cached_interface_count(&self) -> usize {
        self.state().interfaces.len()
    }

    /// Claim an interface; claiming twice is a no-op
    pub fn claim_interface(&self, interface: u8, force: bool) -> Result<()> {
        let mut state = self.state();
        let BlockState {
            connection,
            claimed,
            ..
        } = &mut *state;
        let connection = connection.as_mut().ok_or(MonitorError::AlreadyClosed)?;

        if claimed.contains(&interface) {
            return Ok(());
        }
        connection.claim_interface(interface, force)?;
        claimed.insert(interface);
        debug!("Claimed interface {} on {}", interface, self.device.name);
        Ok(())
    }

    /// Release an interface; releasing one not claimed is a no-op
    pub fn release_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.state();
        let BlockState {
            connection,
            claimed,
            ..
        } = &mut *state;
        let Some(connection) = connection.as_mut() else {
            return Ok(());
        };

        if !claimed.remove(&interface) {
            return Ok(());
        }
        connection.release_interface(interface)?;
        debug!("Released interface {} on {}", interface, self.device.name);
        Ok(())
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.state().claimed.iter().copied().collect()
    }

    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let state = self.state();
        let connection = state.connection.as_ref().ok_or(MonitorError::AlreadyClosed)?;
        Ok(connection.control_transfer(request_type, request, value, index, buf, timeout)?)
    }

    /// Native file descriptor; `None` once closed
    pub fn file_descriptor(&self) -> Option<i32> {
        self.state()
            .connection
            .as_ref()
            .and_then(|c| c.file_descriptor())
    }

    /// Raw descriptor bytes; `None` once closed
    pub fn raw_descriptors(&self) -> Option<Vec<u8>> {
        self.state().connection.as_ref().map(|c| c.raw_descriptors())
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("id", &self.id)
            .field("device", &self.device.name)
            .field("identity", &self.identity.key_name())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for ControlBlock {
    fn drop(&mut self) {
        if self.release() {
            debug!("Control block {} released on drop", self.id);
        }
    }
}
