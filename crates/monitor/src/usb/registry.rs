//! Control block registry
//!
//! Holds at most one live [`ControlBlock`] per device identity. Concurrent
//! opens of one identity perform a single native open: the first caller
//! marks the slot `Opening` and everyone else waits on a condition variable
//! for the outcome. The map lock is never held across the native open or a
//! retry backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use common::{DeviceDescriptor, DeviceIdentity, UsbConnection, UsbPlatform};
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};
use crate::session::worker::WorkerHandle;
use crate::usb::control_block::ControlBlock;
use crate::usb::device_info::read_device_info;

/// Bounded retry for native opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Added to the delay for every further retry
    pub delay_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            delay_step: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (zero-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay + self.delay_step * retry
    }
}

enum Slot {
    /// A native open for this identity is in flight
    Opening,
    Open(Arc<ControlBlock>),
}

pub(crate) struct RegistryInner {
    slots: Mutex<HashMap<DeviceIdentity, Slot>>,
    opened: Condvar,
    next_id: AtomicU64,
    shut: AtomicBool,
}

impl RegistryInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<DeviceIdentity, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop the entry for `identity` if it still holds block `id`
    pub(crate) fn remove_if_same(&self, identity: &DeviceIdentity, id: u64) -> bool {
        let mut slots = self.slots();
        let same = matches!(slots.get(identity), Some(Slot::Open(block)) if block.id() == id);
        if same {
            slots.remove(identity);
        }
        same
    }
}

/// Identity-keyed registry of open control blocks
#[derive(Clone)]
pub struct ControlBlockRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ControlBlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlockRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: Mutex::new(HashMap::new()),
                opened: Condvar::new(),
                next_id: AtomicU64::new(1),
                shut: AtomicBool::new(false),
            }),
        }
    }

    /// Return the live block for the identity, opening one if needed
    ///
    /// The flag is true only for the caller whose native open created the
    /// block. Permission is the caller's responsibility.
    pub fn open(
        &self,
        platform: &dyn UsbPlatform,
        device: &DeviceDescriptor,
        identity: &DeviceIdentity,
        policy: &RetryPolicy,
        notifier: Option<&WorkerHandle>,
    ) -> Result<(Arc<ControlBlock>, bool)> {
        {
            let mut slots = self.inner.slots();
            loop {
                if self.inner.shut.load(Ordering::SeqCst) {
                    return Err(MonitorError::AlreadyDestroyed);
                }
                match slots.get(identity) {
                    Some(Slot::Open(block)) => {
                        debug!("Reusing control block {} for {}", block.id(), device.name);
                        return Ok((Arc::clone(block), false));
                    }
                    Some(Slot::Opening) => {
                        slots = self
                            .inner
                            .opened
                            .wait(slots)
                            .unwrap_or_else(|e| e.into_inner());
                    }
                    None => {
                        slots.insert(identity.clone(), Slot::Opening);
                        break;
                    }
                }
            }
        }

        // Clears the Opening slot on every exit but success, unwinds included
        let mut pending = PendingOpen {
            inner: &self.inner,
            identity,
            armed: true,
        };

        let mut connection = open_with_retry(platform, device, policy)?;
        let info = read_device_info(device, Some(connection.as_ref()));

        let mut slots = self.inner.slots();
        if self.inner.shut.load(Ordering::SeqCst) {
            drop(slots);
            connection.close();
            return Err(MonitorError::AlreadyDestroyed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let block = Arc::new(ControlBlock::new(
            id,
            identity.clone(),
            device.clone(),
            info,
            connection,
            Arc::downgrade(&self.inner),
            notifier.cloned(),
        ));
        slots.insert(identity.clone(), Slot::Open(Arc::clone(&block)));
        pending.armed = false;
        drop(slots);
        self.inner.opened.notify_all();

        info!("Opened {} as control block {}", device.name, id);
        Ok((block, true))
    }

    /// Live block for an identity
    pub fn get(&self, identity: &DeviceIdentity) -> Option<Arc<ControlBlock>> {
        match self.inner.slots().get(identity) {
            Some(Slot::Open(block)) => Some(Arc::clone(block)),
            _ => None,
        }
    }

    /// Remove and return the live block for an identity
    pub fn take(&self, identity: &DeviceIdentity) -> Option<Arc<ControlBlock>> {
        let mut slots = self.inner.slots();
        match slots.remove(identity) {
            Some(Slot::Open(block)) => Some(block),
            Some(Slot::Opening) => {
                // In-flight open keeps its slot
                slots.insert(identity.clone(), Slot::Opening);
                None
            }
            None => None,
        }
    }

    /// Drop the entry for `identity` if it still holds block `id`
    pub fn remove_if_same(&self, identity: &DeviceIdentity, id: u64) -> bool {
        self.inner.remove_if_same(identity, id)
    }

    /// Shut the registry down and release every live block
    ///
    /// Returns the blocks this call actually released. Later opens fail
    /// with [`MonitorError::AlreadyDestroyed`].
    pub fn close_all(&self) -> Vec<Arc<ControlBlock>> {
        let drained: Vec<Slot> = {
            let mut slots = self.inner.slots();
            self.inner.shut.store(true, Ordering::SeqCst);
            slots.drain().map(|(_, slot)| slot).collect()
        };
        self.inner.opened.notify_all();

        drained
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Open(block) => Some(block),
                Slot::Opening => None,
            })
            .filter(|block| block.release())
            .collect()
    }

    /// Number of live blocks
    pub fn len(&self) -> usize {
        self.inner
            .slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Open(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut(&self) -> bool {
        self.inner.shut.load(Ordering::SeqCst)
    }
}

/// Owner of an `Opening` slot while the native open runs
struct PendingOpen<'a> {
    inner: &'a RegistryInner,
    identity: &'a DeviceIdentity,
    armed: bool,
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut slots = self.inner.slots();
            if matches!(slots.get(self.identity), Some(Slot::Opening)) {
                slots.remove(self.identity);
            }
        }
        self.inner.opened.notify_all();
    }
}

/// Native open with bounded backoff on transient errors
fn open_with_retry(
    platform: &dyn UsbPlatform,
    device: &DeviceDescriptor,
    policy: &RetryPolicy,
) -> Result<Box<dyn UsbConnection>> {
    let max_retries = platform.open_retry_budget().unwrap_or(policy.max_retries);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match platform.open(device) {
            Ok(connection) => {
                if attempts > 1 {
                    info!("Opened {} after {} attempts", device.name, attempts);
                }
                return Ok(connection);
            }
            Err(e) if e.is_transient() && attempts <= max_retries => {
                let delay = policy.delay_for(attempts - 1);
                warn!(
                    "Open of {} failed ({}), retrying in {:?} ({}/{})",
                    device.name, e, delay, attempts, max_retries
                );
                std::thread::sleep(delay);
            }
            Err(e) => {
                warn!("Open of {} failed after {} attempt(s): {}", device.name, attempts, e);
                return Err(MonitorError::OpenFailed {
                    device: device.name.clone(),
                    attempts,
                    source: e,
                });
            }
        }
    }
}
