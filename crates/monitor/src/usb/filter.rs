//! Inclusion/exclusion rules over attached devices

use common::{DeviceDescriptor, DeviceFilter};
use tracing::debug;

/// Ordered list of device filters
///
/// An empty set matches everything. Otherwise a device is included when at
/// least one inclusion rule matches it and no exclusion rule does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilterSet {
    filters: Vec<DeviceFilter>,
}

impl DeviceFilterSet {
    pub fn new(filters: Vec<DeviceFilter>) -> Self {
        Self { filters }
    }

    /// Check if a device is allowed by the configured filters
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let mut included = false;
        for filter in &self.filters {
            if !filter.matches(device) {
                continue;
            }
            if filter.exclude {
                debug!(
                    "Device {} ({:04x}:{:04x}) excluded by {}",
                    device.name, device.vendor_id, device.product_id, filter
                );
                return false;
            }
            included = true;
        }
        included
    }

    /// Keep only the devices this set admits
    pub fn apply(&self, devices: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
        devices.into_iter().filter(|d| self.matches(d)).collect()
    }

    pub fn set(&mut self, filters: Vec<DeviceFilter>) {
        self.filters = filters;
    }

    pub fn add(&mut self, filter: DeviceFilter) {
        self.filters.push(filter);
    }

    pub fn extend(&mut self, filters: impl IntoIterator<Item = DeviceFilter>) {
        self.filters.extend(filters);
    }

    /// Remove every rule equal to `filter`; returns whether anything was removed
    pub fn remove(&mut self, filter: &DeviceFilter) -> bool {
        let before = self.filters.len();
        self.filters.retain(|f| f != filter);
        self.filters.len() != before
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn filters(&self) -> &[DeviceFilter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
