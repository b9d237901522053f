//! Periodic re-enumeration for platforms with unreliable attach notifications
//!
//! The poller itself is pure bookkeeping: the worker enumerates, filters and
//! re-validates permissions, then hands the observation to [`HotplugPoller::tick`]
//! which decides which devices to report as attached and when to tick next.
//! The poller never reports detaches; those come from the platform.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use common::DeviceDescriptor;
use tracing::trace;

use crate::config::{DiffPolicy, PollingSettings};

/// Result of one poll
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Devices to report through `on_attach`
    pub attached: Vec<DeviceDescriptor>,
    /// Whether topology or permissions moved since the previous tick
    pub changed: bool,
}

#[derive(Debug)]
pub struct HotplugPoller {
    policy: DiffPolicy,
    initial_delay: Duration,
    fast_interval: Duration,
    slow_interval: Duration,
    next_tick: Option<Instant>,
    /// Node name -> permitted, as of the last tick
    seen: HashMap<String, bool>,
    device_count: usize,
    permission_count: usize,
}

impl HotplugPoller {
    pub fn new(settings: &PollingSettings) -> Self {
        Self {
            policy: settings.diff_policy,
            initial_delay: settings.initial_delay(),
            fast_interval: settings.fast_interval(),
            slow_interval: settings.slow_interval(),
            next_tick: None,
            seen: HashMap::new(),
            device_count: 0,
            permission_count: 0,
        }
    }

    pub fn policy(&self) -> DiffPolicy {
        self.policy
    }

    /// Arm the first tick; the snapshot starts empty so it reports everything
    pub fn start(&mut self, now: Instant) {
        self.seen.clear();
        self.device_count = 0;
        self.permission_count = 0;
        self.next_tick = Some(now + self.initial_delay);
    }

    pub fn stop(&mut self) {
        self.next_tick = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_tick.is_some_and(|t| t <= now)
    }

    /// Compare an observation against the previous tick and replace the snapshot
    ///
    /// `observed` holds the filtered devices with their re-validated permission,
    /// `permission_count` the permission cache size after re-validation.
    pub fn tick(
        &mut self,
        observed: Vec<(DeviceDescriptor, bool)>,
        permission_count: usize,
    ) -> PollOutcome {
        let device_count = observed.len();

        let outcome = match self.policy {
            DiffPolicy::CountOnly => {
                let grew = device_count > self.device_count
                    || permission_count > self.permission_count;
                PollOutcome {
                    attached: if grew {
                        observed.iter().map(|(d, _)| d.clone()).collect()
                    } else {
                        Vec::new()
                    },
                    changed: device_count != self.device_count
                        || permission_count != self.permission_count,
                }
            }
            DiffPolicy::SetDifference => {
                let attached: Vec<DeviceDescriptor> = observed
                    .iter()
                    .filter(|(device, granted)| match self.seen.get(&device.name) {
                        None => true,
                        Some(was_granted) => *granted && !*was_granted,
                    })
                    .map(|(d, _)| d.clone())
                    .collect();
                let removed = self
                    .seen
                    .keys()
                    .any(|name| !observed.iter().any(|(d, _)| &d.name == name));
                PollOutcome {
                    changed: !attached.is_empty()
                        || removed
                        || permission_count != self.permission_count,
                    attached,
                }
            }
        };

        trace!(
            "Poll: {} devices, {} permitted, {} attached, changed={}",
            device_count,
            permission_count,
            outcome.attached.len(),
            outcome.changed
        );

        self.seen = observed
            .into_iter()
            .map(|(device, granted)| (device.name, granted))
            .collect();
        self.device_count = device_count;
        self.permission_count = permission_count;

        outcome
    }

    /// Schedule the next tick: fast after a change, slow once stable
    pub fn schedule_next(&mut self, now: Instant, changed: bool) {
        if self.next_tick.is_none() {
            return;
        }
        let interval = if changed {
            self.fast_interval
        } else {
            self.slow_interval
        };
        self.next_tick = Some(now + interval);
    }

    /// Record a device reported by a platform attach notification
    pub fn observe(&mut self, device: &DeviceDescriptor, granted: bool) {
        if self.seen.insert(device.name.clone(), granted).is_none() {
            self.device_count += 1;
        }
    }

    /// Drop a detached device from the snapshot
    pub fn forget(&mut self, name: &str) {
        if self.seen.remove(name).is_some() {
            self.device_count = self.device_count.saturating_sub(1);
        }
    }
}
