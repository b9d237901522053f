//! libusb-backed platform service
//!
//! Desktop hosts have no permission dialog: access is whatever the device
//! node's file permissions allow, so a permission request is answered
//! immediately by trying to open the device. Hotplug notifications come from
//! libusb when it supports them; otherwise the session poller covers
//! attach detection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use common::{
    DeviceDescriptor, InterfaceDescriptor, NotificationSink, PermissionToken, PlatformError,
    PlatformEvent, UsbConnection, UsbPlatform,
};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, info, trace, warn};

const HOTPLUG_POLL_TIMEOUT: Duration = Duration::from_millis(100);

type KnownDevices = Arc<Mutex<HashMap<String, DeviceDescriptor>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct HotplugPump {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// [`UsbPlatform`] over a libusb context
pub struct RusbPlatform {
    context: Context,
    /// Last snapshot per node name, so detach events can carry full descriptors
    known: KnownDevices,
    sink: Mutex<Option<NotificationSink>>,
    pump: Mutex<Option<HotplugPump>>,
}

impl RusbPlatform {
    pub fn new() -> Result<Self, PlatformError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            context,
            known: Arc::new(Mutex::new(HashMap::new())),
            sink: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    /// Whether libusb delivers hotplug events on this host
    pub fn supports_hotplug() -> bool {
        rusb::has_hotplug()
    }

    fn find_device(&self, descriptor: &DeviceDescriptor) -> Result<Device<Context>, PlatformError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|d| {
                d.bus_number() == descriptor.bus_number && d.address() == descriptor.device_address
            })
            .ok_or(PlatformError::NoDevice)
    }

    fn stop_pump(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.stop.store(true, Ordering::SeqCst);
            if pump.thread.join().is_err() {
                warn!("Hotplug thread panicked");
            }
        }
    }
}

impl UsbPlatform for RusbPlatform {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, PlatformError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let snapshot: Vec<DeviceDescriptor> = devices.iter().filter_map(|d| describe(&d)).collect();

        let mut known = lock(&self.known);
        known.clear();
        known.extend(snapshot.iter().map(|d| (d.name.clone(), d.clone())));

        debug!("Enumerated {} devices", snapshot.len());
        Ok(snapshot)
    }

    fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        let result = self.find_device(device).and_then(|d| d.open().map_err(map_rusb_error));
        match result {
            Ok(_handle) => true,
            Err(PlatformError::Access) => false,
            Err(e) => {
                debug!("Permission check for {} failed: {}", device.name, e);
                false
            }
        }
    }

    fn request_permission(
        &self,
        device: &DeviceDescriptor,
        token: PermissionToken,
    ) -> Result<(), PlatformError> {
        let sink = lock(&self.sink)
            .clone()
            .ok_or(PlatformError::NotRegistered)?;
        let granted = self.has_permission(device);

        debug!("Permission request {} for {}: granted={}", token, device.name, granted);
        sink.notify(PlatformEvent::PermissionResult {
            token: Some(token),
            device: device.clone(),
            granted,
        })
        .map_err(|e| PlatformError::Other(e.to_string()))
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn UsbConnection>, PlatformError> {
        let usb_device = self.find_device(device)?;
        let descriptor = usb_device.device_descriptor().map_err(map_rusb_error)?;
        let handle = usb_device.open().map_err(map_rusb_error)?;

        let serial = descriptor
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

        Ok(Box::new(RusbConnection {
            handle: Some(handle),
            raw: raw_device_descriptor(&descriptor),
            serial,
            claimed: Vec::new(),
        }))
    }

    fn register_notifications(&self, sink: NotificationSink) -> Result<(), PlatformError> {
        self.stop_pump();
        *lock(&self.sink) = Some(sink.clone());

        if !rusb::has_hotplug() {
            info!("libusb hotplug not supported, relying on polling");
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let context = self.context.clone();
        let forwarder = HotplugForwarder {
            sink,
            known: Arc::clone(&self.known),
        };
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || run_hotplug_pump(context, forwarder, thread_stop))
            .map_err(|e| PlatformError::Io(e.to_string()))?;

        *lock(&self.pump) = Some(HotplugPump { stop, thread });
        Ok(())
    }

    fn unregister_notifications(&self) {
        self.stop_pump();
        *lock(&self.sink) = None;
    }
}

impl Drop for RusbPlatform {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

/// Pump libusb events until asked to stop
fn run_hotplug_pump(context: Context, forwarder: HotplugForwarder, stop: Arc<AtomicBool>) {
    let _registration: Registration<Context> = match HotplugBuilder::new()
        .enumerate(false)
        .register(&context, Box::new(forwarder))
    {
        Ok(registration) => registration,
        Err(e) => {
            warn!("Failed to register hotplug callback: {}", e);
            return;
        }
    };
    debug!("Hot-plug callbacks registered");

    while !stop.load(Ordering::SeqCst) {
        match context.handle_events(Some(HOTPLUG_POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(HOTPLUG_POLL_TIMEOUT);
            }
        }
    }
    debug!("Hot-plug pump stopped");
}

/// Forwards libusb hotplug callbacks into the notification sink
struct HotplugForwarder {
    sink: NotificationSink,
    known: KnownDevices,
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        trace!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let Some(descriptor) = describe(&device) else {
            return;
        };
        lock(&self.known).insert(descriptor.name.clone(), descriptor.clone());
        if let Err(e) = self.sink.notify(PlatformEvent::Attached(descriptor)) {
            warn!("Failed to forward attach: {}", e);
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        trace!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let name = DeviceDescriptor::node_name(device.bus_number(), device.address());
        let known = lock(&self.known).remove(&name);
        let Some(descriptor) = known.or_else(|| describe(&device)) else {
            return;
        };
        if let Err(e) = self.sink.notify(PlatformEvent::Detached(descriptor)) {
            warn!("Failed to forward detach: {}", e);
        }
    }
}

/// Build a snapshot for a libusb device; root hubs are skipped
fn describe<T: UsbContext>(device: &Device<T>) -> Option<DeviceDescriptor> {
    let desc = match device.device_descriptor() {
        Ok(desc) => desc,
        Err(e) => {
            debug!(
                "No descriptor for bus={}, addr={}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            return None;
        }
    };

    // Root hubs are VID 0x1d6b (Linux Foundation) with device class 9 (Hub)
    if desc.vendor_id() == 0x1d6b && desc.class_code() == 9 {
        return None;
    }

    let (manufacturer, product, serial_number) = match device.open() {
        Ok(handle) => (
            read_string(&handle, desc.manufacturer_string_index()),
            read_string(&handle, desc.product_string_index()),
            read_string(&handle, desc.serial_number_string_index()),
        ),
        Err(_) => (None, None, None),
    };

    let interfaces = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .map(|config| {
            config
                .interfaces()
                .flat_map(|interface| {
                    interface
                        .descriptors()
                        .map(|alt| InterfaceDescriptor {
                            id: alt.interface_number(),
                            alt_setting: alt.setting_number(),
                            class: alt.class_code(),
                            subclass: alt.sub_class_code(),
                            protocol: alt.protocol_code(),
                            endpoint_count: alt.num_endpoints(),
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        })
        .unwrap_or_default();

    Some(DeviceDescriptor {
        name: DeviceDescriptor::node_name(device.bus_number(), device.address()),
        bus_number: device.bus_number(),
        device_address: device.address(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        class: desc.class_code(),
        subclass: desc.sub_class_code(),
        protocol: desc.protocol_code(),
        manufacturer,
        product,
        serial_number,
        version: Some(format_version(desc.device_version())),
        usb_version: Some(format_version(desc.usb_version())),
        num_configurations: desc.num_configurations(),
        interfaces,
    })
}

fn read_string<T: UsbContext>(handle: &DeviceHandle<T>, index: Option<u8>) -> Option<String> {
    index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
}

fn format_version(version: rusb::Version) -> String {
    format!(
        "{}.{}{}",
        version.major(),
        version.minor(),
        version.sub_minor()
    )
}

/// Encode a version as the BCD word used in raw descriptors
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16 & 0x0F) << 4)
        | (version.sub_minor() as u16 & 0x0F)
}

/// Rebuild the standard 18-byte device descriptor
fn raw_device_descriptor(desc: &rusb::DeviceDescriptor) -> Vec<u8> {
    let usb = version_to_bcd(desc.usb_version()).to_le_bytes();
    let device = version_to_bcd(desc.device_version()).to_le_bytes();
    let vid = desc.vendor_id().to_le_bytes();
    let pid = desc.product_id().to_le_bytes();

    vec![
        0x12,
        0x01,
        usb[0],
        usb[1],
        desc.class_code(),
        desc.sub_class_code(),
        desc.protocol_code(),
        desc.max_packet_size(),
        vid[0],
        vid[1],
        pid[0],
        pid[1],
        device[0],
        device[1],
        desc.manufacturer_string_index().unwrap_or(0),
        desc.product_string_index().unwrap_or(0),
        desc.serial_number_string_index().unwrap_or(0),
        desc.num_configurations(),
    ]
}

/// Opened libusb device
struct RusbConnection {
    handle: Option<DeviceHandle<Context>>,
    raw: Vec<u8>,
    serial: Option<String>,
    /// Claimed interfaces and whether a kernel driver was detached for them
    claimed: Vec<(u8, bool)>,
}

impl UsbConnection for RusbConnection {
    fn file_descriptor(&self) -> Option<i32> {
        // libusb keeps the descriptor private
        None
    }

    fn raw_descriptors(&self) -> Vec<u8> {
        self.raw.clone()
    }

    fn serial(&self) -> Option<String> {
        self.serial.clone()
    }

    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError> {
        let handle = self.handle.as_ref().ok_or(PlatformError::NoDevice)?;
        let result = if request_type & 0x80 != 0 {
            handle.read_control(request_type, request, value, index, buf, timeout)
        } else {
            handle.write_control(request_type, request, value, index, buf, timeout)
        };
        result.map_err(map_rusb_error)
    }

    fn claim_interface(&mut self, interface: u8, force: bool) -> Result<(), PlatformError> {
        let handle = self.handle.as_mut().ok_or(PlatformError::NoDevice)?;

        let mut detached = false;
        if force {
            match handle.kernel_driver_active(interface) {
                Ok(true) => match handle.detach_kernel_driver(interface) {
                    Ok(()) => {
                        debug!("Detached kernel driver from interface {}", interface);
                        detached = true;
                    }
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                },
                Ok(false) => {}
                Err(e) => debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                ),
            }
        }

        handle.claim_interface(interface).map_err(map_rusb_error)?;
        self.claimed.push((interface, detached));
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), PlatformError> {
        let handle = self.handle.as_mut().ok_or(PlatformError::NoDevice)?;
        let position = self.claimed.iter().position(|(i, _)| *i == interface);

        handle.release_interface(interface).map_err(map_rusb_error)?;

        if let Some(position) = position {
            let (_, detached) = self.claimed.remove(position);
            if detached && let Err(e) = handle.attach_kernel_driver(interface) {
                debug!("Could not reattach kernel driver to interface {}: {}", interface, e);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        let claimed: Vec<u8> = self.claimed.iter().map(|(i, _)| *i).collect();
        for interface in claimed {
            if let Err(e) = self.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
        }
        self.claimed.clear();
        self.handle = None;
    }
}

/// Map rusb errors onto the platform error vocabulary
pub fn map_rusb_error(err: rusb::Error) -> PlatformError {
    match err {
        rusb::Error::Busy => PlatformError::Busy,
        rusb::Error::NoDevice | rusb::Error::NotFound => PlatformError::NoDevice,
        rusb::Error::Access => PlatformError::Access,
        rusb::Error::Timeout => PlatformError::Timeout,
        rusb::Error::NotSupported => PlatformError::NotSupported,
        rusb::Error::Io => PlatformError::Io(err.to_string()),
        _ => PlatformError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Busy), PlatformError::Busy);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), PlatformError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), PlatformError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Access), PlatformError::Access);
        assert_eq!(map_rusb_error(rusb::Error::Timeout), PlatformError::Timeout);
        assert!(map_rusb_error(rusb::Error::Io).is_transient());
        assert!(matches!(map_rusb_error(rusb::Error::Pipe), PlatformError::Other(_)));
    }

    #[test]
    fn test_version_to_bcd() {
        assert_eq!(version_to_bcd(rusb::Version(2, 0, 0)), 0x0200);
        assert_eq!(version_to_bcd(rusb::Version(3, 1, 0)), 0x0310);
        assert_eq!(version_to_bcd(rusb::Version(1, 1, 2)), 0x0112);
    }

    #[test]
    fn test_rusb_platform_creation() {
        // Context creation may fail without USB support in the test environment
        match RusbPlatform::new() {
            Ok(platform) => {
                if let Ok(devices) = platform.enumerate() {
                    assert!(devices.iter().all(|d| d.validate().is_ok()));
                }
            }
            Err(e) => {
                eprintln!("USB context creation failed (expected without USB): {}", e);
            }
        }
    }
}
