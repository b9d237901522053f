//! USB subsystem
//!
//! Device filtering, permission caching, the control block registry and the
//! rusb-backed platform implementation.

pub mod control_block;
pub mod device_info;
pub mod filter;
pub mod permission;
pub mod registry;
pub mod rusb_platform;

pub use control_block::ControlBlock;
pub use device_info::read_device_info;
pub use filter::DeviceFilterSet;
pub use permission::{PermissionCache, PermissionChange, PermissionRecord};
pub use registry::{ControlBlockRegistry, RetryPolicy};
pub use rusb_platform::{RusbPlatform, map_rusb_error};
