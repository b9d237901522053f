//! USB session monitor
//!
//! Discovers attached USB devices, negotiates access permission with the
//! platform, tracks hotplug attach/detach and owns the lifecycle of opened
//! device handles ("control blocks").
//!
//! All state mutation and event emission happens on one dedicated worker
//! thread; see [`session::SessionMonitor`].

pub mod channel;
pub mod config;
pub mod error;
pub mod install_state;
pub mod session;
pub mod usb;

pub use channel::{ChannelListener, DeviceListener, EventStream, MonitorEvent, create_event_channel};
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use install_state::InstallState;
pub use session::{NegotiationState, PermissionRequest, SessionMonitor};
pub use usb::{ControlBlock, DeviceFilterSet, RetryPolicy, RusbPlatform};
