//! Test utilities for usb-session
//!
//! Provides device snapshot builders and a scriptable [`MockPlatform`] used
//! by the session monitor tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockPlatform, create_mock_device};
//! use common::UsbPlatform;
//!
//! let platform = MockPlatform::with_devices(vec![create_mock_device(1, 0x1234, 0x5678)]);
//! assert_eq!(platform.enumerate().unwrap().len(), 1);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::channel::{NotificationSink, PlatformEvent};
use crate::error::PlatformError;
use crate::platform::{PermissionToken, UsbConnection, UsbPlatform};
use crate::usb_types::{DeviceDescriptor, InterfaceDescriptor};

/// Default time budget for waiting on asynchronous effects in tests
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock device snapshot
///
/// # Arguments
/// * `id` - Device number, used for the bus address and strings
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device;
///
/// let device = create_mock_device(4, 0x1234, 0x5678);
/// assert_eq!(device.name, "/dev/bus/usb/001/004");
/// assert_eq!(device.vendor_id, 0x1234);
/// ```
pub fn create_mock_device(id: u32, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    create_mock_device_with_class(id, vendor_id, product_id, 0x00, 0x00, 0x00)
}

/// Create a mock device snapshot with a specific USB class triple
pub fn create_mock_device_with_class(
    id: u32,
    vendor_id: u16,
    product_id: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> DeviceDescriptor {
    let device_address = (id % 128) as u8;
    DeviceDescriptor {
        name: DeviceDescriptor::node_name(1, device_address),
        bus_number: 1,
        device_address,
        vendor_id,
        product_id,
        class,
        subclass,
        protocol,
        manufacturer: Some(format!("Test Manufacturer {}", id)),
        product: Some(format!("Test Product {}", id)),
        serial_number: Some(format!("SN{:06}", id)),
        version: Some("1.00".to_string()),
        usb_version: Some("2.00".to_string()),
        num_configurations: 1,
        interfaces: Vec::new(),
    }
}

/// Create a mock UVC camera: composite device with a video interface
pub fn create_mock_camera_device(id: u32) -> DeviceDescriptor {
    DeviceDescriptor {
        interfaces: vec![
            InterfaceDescriptor {
                id: 0,
                alt_setting: 0,
                class: 0x0E,
                subclass: 0x01,
                protocol: 0x00,
                endpoint_count: 1,
            },
            InterfaceDescriptor {
                id: 1,
                alt_setting: 0,
                class: 0x0E,
                subclass: 0x02,
                protocol: 0x00,
                endpoint_count: 0,
            },
            InterfaceDescriptor {
                id: 1,
                alt_setting: 1,
                class: 0x0E,
                subclass: 0x02,
                protocol: 0x00,
                endpoint_count: 1,
            },
        ],
        ..create_mock_device_with_class(id, 0x046d, 0x0825, 0xEF, 0x02, 0x01)
    }
}

/// Create a mock HID device (keyboard/mouse)
pub fn create_mock_hid_device(id: u32) -> DeviceDescriptor {
    create_mock_device_with_class(id, 0x046d, 0xc52b, 0x03, 0x00, 0x00)
}

/// Create a list of mock devices with distinct vendor/product pairs
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_list;
///
/// let devices = create_mock_device_list(5);
/// assert_eq!(devices.len(), 5);
/// ```
pub fn create_mock_device_list(count: u32) -> Vec<DeviceDescriptor> {
    (1..=count)
        .map(|i| create_mock_device(i, 0x1000 + (i as u16), 0x2000 + (i as u16)))
        .collect()
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// How [`MockPlatform`] answers permission requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Grant immediately and notify
    GrantOnRequest,
    /// Deny immediately and notify
    DenyOnRequest,
    /// Hold the request until [`MockPlatform::resolve_permission`]
    Manual,
}

#[derive(Default)]
struct MockCounters {
    opens: AtomicUsize,
    successful_opens: AtomicUsize,
    has_permission_calls: AtomicUsize,
    permission_requests: AtomicUsize,
    closes: AtomicUsize,
    released_interfaces: Mutex<Vec<u8>>,
}

struct MockState {
    devices: Vec<DeviceDescriptor>,
    granted: HashSet<String>,
    mode: PermissionMode,
    pending: Vec<(DeviceDescriptor, PermissionToken)>,
    open_failures: HashMap<String, VecDeque<PlatformError>>,
    open_panics: HashMap<String, usize>,
    open_delay: Duration,
    retry_budget: Option<u32>,
    strings: HashMap<u8, String>,
    sink: Option<NotificationSink>,
}

/// Scriptable in-memory [`UsbPlatform`]
///
/// Devices, grants and failures are driven by the test. Notifications are
/// only delivered while registered.
pub struct MockPlatform {
    state: Mutex<MockState>,
    counters: Arc<MockCounters>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                devices: Vec::new(),
                granted: HashSet::new(),
                mode: PermissionMode::GrantOnRequest,
                pending: Vec::new(),
                open_failures: HashMap::new(),
                open_panics: HashMap::new(),
                open_delay: Duration::ZERO,
                retry_budget: None,
                strings: HashMap::new(),
                sink: None,
            }),
            counters: Arc::new(MockCounters::default()),
        }
    }

    /// Platform with devices already attached (no notifications sent)
    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        let platform = Self::new();
        platform.state().devices = devices;
        platform
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, sink: Option<NotificationSink>, event: PlatformEvent) {
        if let Some(sink) = sink {
            let _ = sink.notify(event);
        }
    }

    /// Plug a device in and notify
    pub fn attach(&self, device: DeviceDescriptor) {
        let sink = {
            let mut state = self.state();
            state.devices.retain(|d| d.name != device.name);
            state.devices.push(device.clone());
            state.sink.clone()
        };
        self.send(sink, PlatformEvent::Attached(device));
    }

    /// Plug a device in without any notification (only polling can see it)
    pub fn attach_silently(&self, device: DeviceDescriptor) {
        let mut state = self.state();
        state.devices.retain(|d| d.name != device.name);
        state.devices.push(device);
    }

    /// Unplug a device and notify; grants for the node are dropped
    pub fn detach(&self, name: &str) -> Option<DeviceDescriptor> {
        let (device, sink) = {
            let mut state = self.state();
            let index = state.devices.iter().position(|d| d.name == name)?;
            let device = state.devices.remove(index);
            state.granted.remove(name);
            (device, state.sink.clone())
        };
        self.send(sink, PlatformEvent::Detached(device.clone()));
        Some(device)
    }

    /// Unplug a device without any notification
    pub fn detach_silently(&self, name: &str) -> Option<DeviceDescriptor> {
        let mut state = self.state();
        let index = state.devices.iter().position(|d| d.name == name)?;
        state.granted.remove(name);
        Some(state.devices.remove(index))
    }

    /// Grant access to a device node out of band
    pub fn grant(&self, name: &str) {
        self.state().granted.insert(name.to_string());
    }

    /// Revoke access to a device node out of band
    pub fn revoke(&self, name: &str) {
        self.state().granted.remove(name);
    }

    pub fn set_permission_mode(&self, mode: PermissionMode) {
        self.state().mode = mode;
    }

    /// Answer the oldest pending request for a node
    ///
    /// Returns false when no request for the node is pending.
    pub fn resolve_permission(&self, name: &str, granted: bool) -> bool {
        let (device, token, sink) = {
            let mut state = self.state();
            let Some(index) = state.pending.iter().position(|(d, _)| d.name == name) else {
                return false;
            };
            let (device, token) = state.pending.remove(index);
            if granted {
                state.granted.insert(name.to_string());
            }
            (device, token, state.sink.clone())
        };
        self.send(
            sink,
            PlatformEvent::PermissionResult {
                token: Some(token),
                device,
                granted,
            },
        );
        true
    }

    /// Tokens of requests still waiting for an answer
    pub fn pending_requests(&self) -> Vec<PermissionToken> {
        self.state().pending.iter().map(|(_, t)| *t).collect()
    }

    /// Make the next `count` opens of a node fail with `error`
    pub fn fail_next_opens(&self, name: &str, count: usize, error: PlatformError) {
        let mut state = self.state();
        let queue = state.open_failures.entry(name.to_string()).or_default();
        queue.extend(std::iter::repeat_n(error, count));
    }

    /// Delay every native open, to widen concurrency windows
    /// Make the next `count` opens of `name` panic inside the platform
    pub fn panic_next_opens(&self, name: &str, count: usize) {
        self.state().open_panics.insert(name.to_string(), count);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.state().open_delay = delay;
    }

    pub fn set_retry_budget(&self, budget: Option<u32>) {
        self.state().retry_budget = budget;
    }

    /// Override the string descriptor returned for an index
    pub fn set_string_descriptor(&self, index: u8, value: &str) {
        self.state().strings.insert(index, value.to_string());
    }

    pub fn is_registered(&self) -> bool {
        self.state().sink.is_some()
    }

    /// Native open attempts, failed ones included
    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn successful_open_count(&self) -> usize {
        self.counters.successful_opens.load(Ordering::SeqCst)
    }

    pub fn has_permission_count(&self) -> usize {
        self.counters.has_permission_calls.load(Ordering::SeqCst)
    }

    pub fn permission_request_count(&self) -> usize {
        self.counters.permission_requests.load(Ordering::SeqCst)
    }

    /// Connections closed so far
    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Interfaces released across all connections, in order
    pub fn released_interfaces(&self) -> Vec<u8> {
        self.counters
            .released_interfaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl UsbPlatform for MockPlatform {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, PlatformError> {
        Ok(self.state().devices.clone())
    }

    fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        self.counters
            .has_permission_calls
            .fetch_add(1, Ordering::SeqCst);
        self.state().granted.contains(&device.name)
    }

    fn request_permission(
        &self,
        device: &DeviceDescriptor,
        token: PermissionToken,
    ) -> Result<(), PlatformError> {
        self.counters
            .permission_requests
            .fetch_add(1, Ordering::SeqCst);

        let (granted, sink) = {
            let mut state = self.state();
            match state.mode {
                PermissionMode::GrantOnRequest => {
                    state.granted.insert(device.name.clone());
                    (true, state.sink.clone())
                }
                PermissionMode::DenyOnRequest => (false, state.sink.clone()),
                PermissionMode::Manual => {
                    state.pending.push((device.clone(), token));
                    return Ok(());
                }
            }
        };

        self.send(
            sink,
            PlatformEvent::PermissionResult {
                token: Some(token),
                device: device.clone(),
                granted,
            },
        );
        Ok(())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn UsbConnection>, PlatformError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);

        let delay = self.state().open_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        if let Some(remaining) = state.open_panics.get_mut(&device.name)
            && *remaining > 0
        {
            *remaining -= 1;
            drop(state);
            panic!("mock platform open of {} panicked", device.name);
        }
        if let Some(error) = state
            .open_failures
            .get_mut(&device.name)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let Some(attached) = state.devices.iter().find(|d| d.name == device.name) else {
            return Err(PlatformError::NoDevice);
        };
        if !state.granted.contains(&device.name) {
            return Err(PlatformError::Access);
        }

        let mut strings = HashMap::new();
        if let Some(s) = &attached.manufacturer {
            strings.insert(1, s.clone());
        }
        if let Some(s) = &attached.product {
            strings.insert(2, s.clone());
        }
        if let Some(s) = &attached.serial_number {
            strings.insert(3, s.clone());
        }
        strings.extend(state.strings.iter().map(|(k, v)| (*k, v.clone())));

        let connection = MockConnection {
            device: attached.clone(),
            strings,
            claimed: BTreeSet::new(),
            closed: false,
            counters: Arc::clone(&self.counters),
        };
        drop(state);

        self.counters
            .successful_opens
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(connection))
    }

    fn open_retry_budget(&self) -> Option<u32> {
        self.state().retry_budget
    }

    fn register_notifications(&self, sink: NotificationSink) -> Result<(), PlatformError> {
        self.state().sink = Some(sink);
        Ok(())
    }

    fn unregister_notifications(&self) {
        self.state().sink = None;
    }
}

/// Connection handed out by [`MockPlatform::open`]
pub struct MockConnection {
    device: DeviceDescriptor,
    strings: HashMap<u8, String>,
    claimed: BTreeSet<u8>,
    closed: bool,
    counters: Arc<MockCounters>,
}

impl MockConnection {
    /// Standard 18-byte device descriptor for the snapshot
    fn device_descriptor(&self) -> Vec<u8> {
        let d = &self.device;
        vec![
            0x12, // bLength
            0x01, // bDescriptorType (Device)
            0x00, 0x02, // bcdUSB (2.00)
            d.class,
            d.subclass,
            d.protocol,
            0x40, // bMaxPacketSize0
            (d.vendor_id & 0xFF) as u8,
            (d.vendor_id >> 8) as u8,
            (d.product_id & 0xFF) as u8,
            (d.product_id >> 8) as u8,
            0x00, 0x01, // bcdDevice (1.00)
            0x01, // iManufacturer
            0x02, // iProduct
            0x03, // iSerialNumber
            d.num_configurations,
        ]
    }

    fn string_descriptor(&self, index: u8) -> Option<Vec<u8>> {
        if index == 0 {
            // Language table: en-US only
            return Some(vec![0x04, 0x03, 0x09, 0x04]);
        }
        let value = self.strings.get(&index)?;
        let mut bytes = vec![0u8, 0x03];
        for unit in value.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes[0] = bytes.len() as u8;
        Some(bytes)
    }
}

impl UsbConnection for MockConnection {
    fn file_descriptor(&self) -> Option<i32> {
        if self.closed {
            None
        } else {
            Some(100 + self.device.device_address as i32)
        }
    }

    fn raw_descriptors(&self) -> Vec<u8> {
        self.device_descriptor()
    }

    fn serial(&self) -> Option<String> {
        self.device.serial_number.clone()
    }

    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, PlatformError> {
        if self.closed {
            return Err(PlatformError::NoDevice);
        }

        // Only GET_DESCRIPTOR(String) is modelled
        if request_type != 0x80 || request != 0x06 || (value >> 8) != 0x03 {
            return Err(PlatformError::NotSupported);
        }

        let descriptor = self
            .string_descriptor((value & 0xFF) as u8)
            .ok_or_else(|| PlatformError::Other("pipe stall".into()))?;
        let n = descriptor.len().min(buf.len());
        buf[..n].copy_from_slice(&descriptor[..n]);
        Ok(n)
    }

    fn claim_interface(&mut self, interface: u8, _force: bool) -> Result<(), PlatformError> {
        if self.closed {
            return Err(PlatformError::NoDevice);
        }
        if !self.device.interfaces.is_empty()
            && !self.device.interfaces.iter().any(|i| i.id == interface)
        {
            return Err(PlatformError::Other(format!("no interface {}", interface)));
        }
        self.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), PlatformError> {
        if !self.claimed.remove(&interface) {
            return Err(PlatformError::Other(format!(
                "interface {} not claimed",
                interface
            )));
        }
        self.counters
            .released_interfaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(interface);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::create_notification_channel;

    #[test]
    fn test_create_mock_device() {
        let device = create_mock_device(42, 0x1234, 0x5678);

        assert_eq!(device.vendor_id, 0x1234);
        assert_eq!(device.product_id, 0x5678);
        assert_eq!(device.device_address, 42);
        assert!(device.serial_number.is_some());
        assert!(device.validate().is_ok());
    }

    #[test]
    fn test_create_mock_device_list() {
        let devices = create_mock_device_list(10);
        assert_eq!(devices.len(), 10);

        let names: HashSet<_> = devices.iter().map(|d| d.name.clone()).collect();
        assert_eq!(names.len(), 10);
    }

    #[test]
    fn test_open_requires_grant() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let platform = MockPlatform::with_devices(vec![device.clone()]);

        assert_eq!(platform.open(&device).err(), Some(PlatformError::Access));

        platform.grant(&device.name);
        let mut connection = platform.open(&device).unwrap();
        assert_eq!(connection.raw_descriptors().len(), 18);
        connection.close();
        connection.close();

        assert_eq!(platform.open_count(), 2);
        assert_eq!(platform.successful_open_count(), 1);
        assert_eq!(platform.close_count(), 1);
    }

    #[test]
    fn test_scripted_open_failures() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let platform = MockPlatform::with_devices(vec![device.clone()]);
        platform.grant(&device.name);
        platform.fail_next_opens(&device.name, 2, PlatformError::Busy);

        assert_eq!(platform.open(&device).err(), Some(PlatformError::Busy));
        assert_eq!(platform.open(&device).err(), Some(PlatformError::Busy));
        assert!(platform.open(&device).is_ok());
    }

    #[test]
    fn test_string_descriptor_transfer() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let platform = MockPlatform::with_devices(vec![device.clone()]);
        platform.grant(&device.name);
        platform.set_string_descriptor(2, "Camera");

        let connection = platform.open(&device).unwrap();
        let mut buf = [0u8; 255];
        let n = connection
            .control_transfer(0x80, 0x06, 0x0302, 0x0409, &mut buf, Duration::from_millis(100))
            .unwrap();

        assert_eq!(n, 2 + 2 * "Camera".len());
        assert_eq!(buf[0] as usize, n);
        assert_eq!(buf[1], 0x03);
    }

    #[tokio::test]
    async fn test_manual_permission_resolution() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let platform = MockPlatform::with_devices(vec![device.clone()]);
        let (sink, events) = create_notification_channel();
        platform.register_notifications(sink).unwrap();
        platform.set_permission_mode(PermissionMode::Manual);

        platform
            .request_permission(&device, PermissionToken(7))
            .unwrap();
        assert_eq!(platform.pending_requests(), vec![PermissionToken(7)]);
        assert!(events.try_recv().is_none());

        assert!(platform.resolve_permission(&device.name, true));
        assert!(!platform.resolve_permission(&device.name, true));
        assert_eq!(
            events.recv().await.unwrap(),
            PlatformEvent::PermissionResult {
                token: Some(PermissionToken(7)),
                device: device.clone(),
                granted: true,
            }
        );
        assert!(platform.has_permission(&device));
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || true));
        assert!(!wait_until(Duration::from_millis(20), || false));
    }
}
