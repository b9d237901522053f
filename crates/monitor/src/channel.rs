//! Application-facing events
//!
//! A monitor reports to exactly one [`DeviceListener`]. Every callback runs
//! on the session worker thread, in causal order per device (attach,
//! connect, disconnect, detach). [`create_event_channel`] adapts the
//! callbacks into an async stream for Tokio consumers.

use std::sync::Arc;

use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use common::DeviceDescriptor;
use tracing::warn;

use crate::usb::ControlBlock;

/// Receiver of monitor events
///
/// Callbacks must not block for long: they run on the worker and delay
/// every other device's events. Calling back into the monitor is allowed.
pub trait DeviceListener: Send + Sync {
    /// A matching device was attached but is not yet permitted
    fn on_attach(&self, device: &DeviceDescriptor);

    /// A device went away; its block and cached permission are already gone
    fn on_detach(&self, device: &DeviceDescriptor);

    /// A control block is ready. `newly_opened` is false when an existing
    /// block was reused.
    fn on_connect(&self, device: &DeviceDescriptor, block: &Arc<ControlBlock>, newly_opened: bool);

    /// A control block was closed
    fn on_disconnect(&self, device: &DeviceDescriptor, block: &Arc<ControlBlock>);

    /// A permission negotiation or connect attempt ended without a block
    fn on_cancel(&self, device: &DeviceDescriptor);
}

/// Events as delivered through an [`EventStream`]
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Attach(DeviceDescriptor),
    Detach(DeviceDescriptor),
    Connect {
        device: DeviceDescriptor,
        block: Arc<ControlBlock>,
        newly_opened: bool,
    },
    Disconnect {
        device: DeviceDescriptor,
        block: Arc<ControlBlock>,
    },
    Cancel(DeviceDescriptor),
}

impl MonitorEvent {
    /// Device the event is about
    pub fn device(&self) -> &DeviceDescriptor {
        match self {
            Self::Attach(device)
            | Self::Detach(device)
            | Self::Cancel(device)
            | Self::Connect { device, .. }
            | Self::Disconnect { device, .. } => device,
        }
    }

    /// Forward this event to a listener
    pub fn dispatch(&self, listener: &dyn DeviceListener) {
        match self {
            Self::Attach(device) => listener.on_attach(device),
            Self::Detach(device) => listener.on_detach(device),
            Self::Connect {
                device,
                block,
                newly_opened,
            } => listener.on_connect(device, block, *newly_opened),
            Self::Disconnect { device, block } => listener.on_disconnect(device, block),
            Self::Cancel(device) => listener.on_cancel(device),
        }
    }
}

/// Listener that forwards every callback into an unbounded channel
#[derive(Clone)]
pub struct ChannelListener {
    tx: Sender<MonitorEvent>,
}

impl ChannelListener {
    fn forward(&self, event: MonitorEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Dropping monitor event, stream closed: {:?}", e.into_inner());
        }
    }
}

impl DeviceListener for ChannelListener {
    fn on_attach(&self, device: &DeviceDescriptor) {
        self.forward(MonitorEvent::Attach(device.clone()));
    }

    fn on_detach(&self, device: &DeviceDescriptor) {
        self.forward(MonitorEvent::Detach(device.clone()));
    }

    fn on_connect(&self, device: &DeviceDescriptor, block: &Arc<ControlBlock>, newly_opened: bool) {
        self.forward(MonitorEvent::Connect {
            device: device.clone(),
            block: Arc::clone(block),
            newly_opened,
        });
    }

    fn on_disconnect(&self, device: &DeviceDescriptor, block: &Arc<ControlBlock>) {
        self.forward(MonitorEvent::Disconnect {
            device: device.clone(),
            block: Arc::clone(block),
        });
    }

    fn on_cancel(&self, device: &DeviceDescriptor) {
        self.forward(MonitorEvent::Cancel(device.clone()));
    }
}

/// Async side of [`create_event_channel`]
pub struct EventStream {
    rx: Receiver<MonitorEvent>,
}

impl EventStream {
    /// Wait for the next event; `None` once the listener is dropped and drained
    pub async fn recv(&self) -> Option<MonitorEvent> {
        self.rx.recv().await.ok()
    }

    /// Take a pending event without waiting
    pub fn try_recv(&self) -> Option<MonitorEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Drain every pending event
    pub fn drain(&self) -> Vec<MonitorEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Create a listener/stream pair
///
/// Returns (ChannelListener for [`crate::SessionMonitor::set_listener`], EventStream for the application)
pub fn create_event_channel() -> (ChannelListener, EventStream) {
    let (tx, rx) = unbounded();
    (ChannelListener { tx }, EventStream { rx })
}
