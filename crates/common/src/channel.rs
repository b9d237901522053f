//! Async channel carrying platform notifications into the session worker

use async_channel::{Receiver, Sender, TryRecvError, unbounded};

use crate::platform::PermissionToken;
use crate::usb_types::DeviceDescriptor;

/// Notifications raised by the platform USB service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Device plugged in
    Attached(DeviceDescriptor),

    /// Device unplugged
    Detached(DeviceDescriptor),

    /// User answered a permission prompt
    PermissionResult {
        /// Token handed to `request_permission`, if the platform echoes it
        token: Option<PermissionToken>,
        /// Device the prompt was about
        device: DeviceDescriptor,
        /// Whether access was granted
        granted: bool,
    },
}

/// Sending half handed to the platform on registration
///
/// Cloning is cheap. Sends never block.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: Sender<PlatformEvent>,
}

impl NotificationSink {
    /// Deliver a notification to the session worker
    pub fn notify(&self, event: PlatformEvent) -> crate::Result<()> {
        self.tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Whether the receiving side is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half owned by the session worker
#[derive(Debug, Clone)]
pub struct PlatformEvents {
    rx: Receiver<PlatformEvent>,
}

impl PlatformEvents {
    /// Wait for the next notification
    pub async fn recv(&self) -> crate::Result<PlatformEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take a pending notification without waiting
    pub fn try_recv(&self) -> Option<PlatformEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Stop accepting notifications; pending ones can still be drained
    pub fn close(&self) -> bool {
        self.rx.close()
    }
}

/// Create the notification channel between platform and session worker
///
/// Returns (NotificationSink for the platform, PlatformEvents for the worker)
pub fn create_notification_channel() -> (NotificationSink, PlatformEvents) {
    let (tx, rx) = unbounded();
    (NotificationSink { tx }, PlatformEvents { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_mock_device;

    #[tokio::test]
    async fn test_notification_channel() {
        let (sink, events) = create_notification_channel();
        let device = create_mock_device(1, 0x1234, 0x5678);

        // Platform callbacks arrive on foreign threads
        let platform_sink = sink.clone();
        let sent = device.clone();
        std::thread::spawn(move || {
            platform_sink
                .notify(PlatformEvent::Attached(sent))
                .unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(events.recv().await.unwrap(), PlatformEvent::Attached(device));
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn test_notify_after_close_fails() {
        let (sink, events) = create_notification_channel();
        events.close();

        assert!(sink.is_closed());
        assert!(sink
            .notify(PlatformEvent::Detached(create_mock_device(1, 1, 1)))
            .is_err());
    }
}
