//! Interface to the platform USB service
//!
//! The session monitor never touches native handles directly. Everything it
//! needs from the host (enumeration, permission prompts, opening devices,
//! hotplug notifications) goes through [`UsbPlatform`], and every opened
//! device is a [`UsbConnection`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::NotificationSink;
use crate::error::PlatformError;
use crate::usb_types::DeviceDescriptor;

/// Correlates a permission request with its asynchronous answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PermissionToken(pub u64);

impl fmt::Display for PermissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "perm#{}", self.0)
    }
}

/// Host USB service
///
/// Implementations must be callable from any thread. Notifications are
/// delivered through the sink passed to [`UsbPlatform::register_notifications`],
/// possibly from a platform-owned thread.
pub trait UsbPlatform: Send + Sync {
    /// Snapshot of all attached devices
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, PlatformError>;

    /// Whether the caller may currently open the device
    fn has_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Ask the user for access; the answer arrives as
    /// [`crate::PlatformEvent::PermissionResult`]
    fn request_permission(
        &self,
        device: &DeviceDescriptor,
        token: PermissionToken,
    ) -> Result<(), PlatformError>;

    /// Open the device natively
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn UsbConnection>, PlatformError>;

    /// Platform-specific override for how many times a failed open is retried
    fn open_retry_budget(&self) -> Option<u32> {
        None
    }

    /// Start delivering attach/detach/permission notifications
    fn register_notifications(&self, sink: NotificationSink) -> Result<(), PlatformError>;

    /// Stop delivering notifications. Safe to call when not registered.
    fn unregister_notifications(&self);
}

/// An opened device
///
/// Dropping a connection without calling [`UsbConnection::close`] leaks
/// nothing on well-behaved platforms, but claimed interfaces are only
/// guaranteed to be released by `close`.
pub trait UsbConnection: Send {
    /// Native file descriptor, when the platform exposes one
    fn file_descriptor(&self) -> Option<i32>;

    /// Raw device descriptor bytes (at least the 18-byte device descriptor)
    fn raw_descriptors(&self) -> Vec<u8>;

    /// Serial number as reported by the opened device
    fn serial(&self) -> Option<String>;

    /// Perform a control transfer; direction follows bit 7 of `request_type`
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError>;

    /// Claim an interface, detaching any kernel driver first when `force` is set
    fn claim_interface(&mut self, interface: u8, force: bool) -> Result<(), PlatformError>;

    /// Release a previously claimed interface
    fn release_interface(&mut self, interface: u8) -> Result<(), PlatformError>;

    /// Close the native handle
    fn close(&mut self);
}
