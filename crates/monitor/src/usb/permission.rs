//! Last-known permission state per device identity

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use common::{DeviceDescriptor, DeviceIdentity, UsbPlatform};
use tracing::{debug, warn};

/// Cached permission entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRecord {
    pub identity: DeviceIdentity,
    pub granted: bool,
    pub last_checked: Instant,
}

/// Result of [`PermissionCache::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChange {
    Unchanged,
    Granted,
    Revoked,
}

/// Identity-keyed permission cache
///
/// Only granted entries are stored: a revocation removes the record, so
/// the cache size equals the number of devices believed accessible.
/// Platform queries run outside the lock; a grant learned from one is only
/// recorded if no revocation landed while it was in flight.
#[derive(Debug, Default)]
pub struct PermissionCache {
    state: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    records: HashMap<DeviceIdentity, PermissionRecord>,
    /// Bumped by every revocation, removal and clear
    revocations: u64,
}

impl CacheState {
    fn revoke(&mut self, identity: &DeviceIdentity) -> bool {
        self.revocations += 1;
        self.records.remove(identity).is_some()
    }

    fn grant(&mut self, identity: &DeviceIdentity) -> PermissionChange {
        match self.records.get_mut(identity) {
            Some(record) => {
                record.last_checked = Instant::now();
                PermissionChange::Unchanged
            }
            None => {
                self.records.insert(
                    identity.clone(),
                    PermissionRecord {
                        identity: identity.clone(),
                        granted: true,
                        last_checked: Instant::now(),
                    },
                );
                PermissionChange::Granted
            }
        }
    }
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the device is currently accessible
    ///
    /// A cached grant is re-validated against the platform; on mismatch the
    /// entry is evicted and `false` returned without further platform calls.
    /// A miss queries the platform and records the answer.
    pub fn has_permission(
        &self,
        platform: &dyn UsbPlatform,
        device: &DeviceDescriptor,
        identity: &DeviceIdentity,
    ) -> bool {
        let (cached, seen) = {
            let state = self.state();
            (state.records.contains_key(identity), state.revocations)
        };

        let granted = platform_has_permission(platform, device);

        let mut state = self.state();
        if !granted {
            if cached {
                debug!("Permission for {} revoked externally, evicting", device.name);
                state.revoke(identity);
            }
            return false;
        }

        if state.revocations != seen {
            // Revoked while the platform was answering; keep the revocation
            debug!("Permission for {} changed during check, not caching", device.name);
            return state.records.contains_key(identity);
        }
        state.grant(identity);
        true
    }

    /// Record a permission state; repeated identical updates are `Unchanged`
    pub fn update(&self, identity: &DeviceIdentity, granted: bool) -> PermissionChange {
        let mut state = self.state();
        if granted {
            state.grant(identity)
        } else if state.revoke(identity) {
            PermissionChange::Revoked
        } else {
            PermissionChange::Unchanged
        }
    }

    /// Drop the entry for an identity; returns whether one existed
    pub fn remove(&self, identity: &DeviceIdentity) -> bool {
        self.state().revoke(identity)
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.revocations += 1;
        state.records.clear();
    }

    /// Number of identities believed accessible
    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    pub fn record(&self, identity: &DeviceIdentity) -> Option<PermissionRecord> {
        self.state().records.get(identity).cloned()
    }

    /// Cached state without asking the platform
    pub fn is_cached_granted(&self, identity: &DeviceIdentity) -> bool {
        self.state().records.contains_key(identity)
    }
}

/// Platform permission query; a panicking platform degrades to `false`
fn platform_has_permission(platform: &dyn UsbPlatform, device: &DeviceDescriptor) -> bool {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        platform.has_permission(device)
    })) {
        Ok(granted) => granted,
        Err(_) => {
            warn!("Platform permission query for {} failed", device.name);
            false
        }
    }
}
