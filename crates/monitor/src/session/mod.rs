//! Session orchestration: the public monitor, its worker thread, permission
//! negotiation and the hotplug poller

pub mod monitor;
pub mod negotiator;
pub mod poller;
pub mod worker;

pub use monitor::{PermissionRequest, SessionMonitor};
pub use negotiator::{NegotiationState, PermissionNegotiator, Transition};
pub use poller::{HotplugPoller, PollOutcome};
pub use worker::{WorkerCommand, WorkerHandle};
