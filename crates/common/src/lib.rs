//! Common types for usb-session
//!
//! This crate holds the vocabulary shared between the session monitor and
//! the platform USB service it drives: device snapshots, identities and
//! filters, the platform traits, the inbound notification channel, error
//! types, logging setup, and a scriptable mock platform for tests.

pub mod channel;
pub mod error;
pub mod logging;
pub mod platform;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb_types;

pub use channel::{NotificationSink, PlatformEvent, PlatformEvents, create_notification_channel};
pub use error::{Error, PlatformError, Result};
pub use logging::setup_logging;
pub use platform::{PermissionToken, UsbConnection, UsbPlatform};
pub use usb_types::{
    DeviceDescriptor, DeviceFilter, DeviceIdentity, DeviceInfo, IdentityScope,
    InterfaceDescriptor,
};
