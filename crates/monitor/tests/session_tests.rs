//! End-to-end session monitor tests against the mock platform

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockPlatform, PermissionMode, create_mock_device, wait_until,
};
use common::{DeviceDescriptor, DeviceFilter, PlatformError};
use monitor::{
    ControlBlock, DeviceListener, EventStream, InstallState, MonitorConfig, MonitorError,
    MonitorEvent, NegotiationState, PermissionRequest, SessionMonitor, create_event_channel,
};
use tokio::time::timeout;

/// Config with fast open retries and polling pushed out of the way
fn test_config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.open_retry.initial_backoff_ms = 1;
    config.open_retry.backoff_step_ms = 1;
    config.polling.initial_delay_ms = 600_000;
    config.polling.fast_interval_ms = 600_000;
    config.polling.slow_interval_ms = 600_000;
    config
}

fn setup_with(
    platform: MockPlatform,
    config: MonitorConfig,
    install: InstallState,
) -> (Arc<MockPlatform>, SessionMonitor, EventStream) {
    let platform = Arc::new(platform);
    let monitor = SessionMonitor::with_install_state(platform.clone(), config, install).unwrap();
    let (listener, events) = create_event_channel();
    monitor.set_listener(Arc::new(listener)).unwrap();
    (platform, monitor, events)
}

fn setup(platform: MockPlatform) -> (Arc<MockPlatform>, SessionMonitor, EventStream) {
    setup_with(platform, test_config(), InstallState::in_memory(true))
}

async fn next_event(events: &EventStream) -> MonitorEvent {
    timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn assert_quiet(events: &EventStream, window: Duration) {
    if let Ok(Some(event)) = timeout(window, events.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

fn expect_connect(event: MonitorEvent) -> (DeviceDescriptor, Arc<ControlBlock>, bool) {
    match event {
        MonitorEvent::Connect {
            device,
            block,
            newly_opened,
        } => (device, block, newly_opened),
        other => panic!("expected connect, got {:?}", other),
    }
}

mod attach {
    use super::*;

    #[tokio::test]
    async fn test_unpermitted_attach_reported() {
        let (platform, monitor, events) = setup(MockPlatform::new());
        monitor.register().unwrap();

        let device = create_mock_device(1, 0x1234, 0x5678);
        platform.attach(device.clone());

        match next_event(&events).await {
            MonitorEvent::Attach(attached) => assert_eq!(attached, device),
            other => panic!("expected attach, got {:?}", other),
        }
        assert_eq!(platform.open_count(), 0);
    }

    #[tokio::test]
    async fn test_permitted_attach_connects() {
        let (platform, monitor, events) = setup(MockPlatform::new());
        monitor.register().unwrap();

        let device = create_mock_device(1, 0x1234, 0x5678);
        platform.grant(&device.name);
        platform.attach(device.clone());

        let (connected, block, newly_opened) = expect_connect(next_event(&events).await);
        assert_eq!(connected, device);
        assert!(newly_opened);
        assert!(block.is_open());
        assert_eq!(platform.successful_open_count(), 1);
        assert!(monitor.is_permission_cached(&device));
    }

    #[tokio::test]
    async fn test_filtered_attach_ignored() {
        let (platform, monitor, events) = setup(MockPlatform::new());
        monitor.set_filter(DeviceFilter::vendor(0x1234)).unwrap();
        monitor.register().unwrap();

        platform.attach(create_mock_device(1, 0x5678, 0x0001));
        let wanted = create_mock_device(2, 0x1234, 0x0001);
        platform.attach(wanted.clone());

        match next_event(&events).await {
            MonitorEvent::Attach(device) => assert_eq!(device, wanted),
            other => panic!("expected attach, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attach_before_register_not_reported() {
        let (platform, monitor, events) = setup(MockPlatform::new());
        platform.attach(create_mock_device(1, 0x1234, 0x5678));

        monitor.register().unwrap();
        assert_quiet(&events, Duration::from_millis(100)).await;
    }
}

mod permission {
    use super::*;

    #[tokio::test]
    async fn test_request_grant_connects() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let (platform, monitor, events) =
            setup(MockPlatform::with_devices(vec![device.clone()]));
        monitor.register().unwrap();

        assert_eq!(
            monitor.request_permission(&device).unwrap(),
            PermissionRequest::Requested
        );

        let (_, block, newly_opened) = expect_connect(next_event(&events).await);
        assert!(newly_opened);
        assert_eq!(monitor.negotiation_state(&device), NegotiationState::Granted);
        assert!(monitor.has_permission(&device));

        // Opening again reuses the block
        let reopened = monitor.open_device(&device).unwrap();
        assert!(Arc::ptr_eq(&block, &reopened));
        assert_eq!(platform.open_count(), 1);
    }

    #[tokio::test]
    async fn test_request_when_already_permitted() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let (platform, monitor, events) =
            setup(MockPlatform::with_devices(vec![device.clone()]));
        platform.grant(&device.name);
        monitor.register().unwrap();

        assert_eq!(
            monitor.request_permission(&device).unwrap(),
            PermissionRequest::Connecting
        );
        let (_, _, newly_opened) = expect_connect(next_event(&events).await);
        assert!(newly_opened);
        assert_eq!(platform.permission_request_count(), 0);

        // A second request reuses the live block
        monitor.request_permission(&device).unwrap();
        let (_, _, newly_opened) = expect_connect(next_event(&events).await);
        assert!(!newly_opened);
        assert_eq!(platform.open_count(), 1);
    }

    #[tokio::test]
    async fn test_request_denied_cancels() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let (platform, monitor, events) =
            setup(MockPlatform::with_devices(vec![device.clone()]));
        platform.set_permission_mode(PermissionMode::DenyOnRequest);
        monitor.register().unwrap();

        monitor.request_permission(&device).unwrap();
        assert!(matches!(next_event(&events).await, MonitorEvent::Cancel(_)));
        assert_eq!(monitor.negotiation_state(&device), NegotiationState::Denied);
        assert!(monitor.control_block(&device).is_none());
    }

    #[tokio::test]
    async fn test_request_resolved_later() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let (platform, monitor, events) =
            setup(MockPlatform::with_devices(vec![device.clone()]));
        platform.set_permission_mode(PermissionMode::Manual);
        monitor.register().unwrap();

        monitor.request_permission(&device).unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            platform.pending_requests().len() == 1
        }));
        assert_eq!(monitor.negotiation_state(&device), NegotiationState::Requesting);

        assert!(platform.resolve_permission(&device.name, true));
        let (connected, _, _) = expect_connect(next_event(&events).await);
        assert_eq!(connected, device);
    }

    #[tokio::test]
    async fn test_request_unregistered_cancelled() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let (platform, monitor, events) =
            setup(MockPlatform::with_devices(vec![device.clone()]));

        assert_eq!(
            monitor.request_permission(&device).unwrap(),
            PermissionRequest::Cancelled
        );
        assert!(matches!(next_event(&events).await, MonitorEvent::Cancel(_)));
        assert_eq!(platform.permission_request_count(), 0);
    }

    #[tokio::test]
    async fn test_request_invalid_descriptor_cancelled() {
        let (_platform, monitor, events) = setup(MockPlatform::new());
        monitor.register().unwrap();

        let mut device = create_mock_device(1, 0x1234, 0x5678);
        device.name.clear();

        assert_eq!(
            monitor.request_permission(&device).unwrap(),
            PermissionRequest::Cancelled
        );
        assert!(matches!(next_event(&events).await, MonitorEvent::Cancel(_)));
    }

    #[tokio::test]
    async fn test_first_activation_denial_retried_once() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let mut config = test_config();
        config.permission.first_activation_retry_ms = 20;
        config.permission.reset_on_first_activation = false;
        let (platform, monitor, events) = setup_with(
            MockPlatform::with_devices(vec![device.clone()]),
            config,
            InstallState::in_memory(false),
        );
        platform.set_permission_mode(PermissionMode::DenyOnRequest);
        monitor.register().unwrap();

        monitor.request_permission(&device).unwrap();
        assert!(matches!(next_event(&events).await, MonitorEvent::Cancel(_)));
        assert_eq!(platform.permission_request_count(), 2);
        assert_quiet(&events, Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_first_activation_resets_open_block() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let mut config = test_config();
        config.permission.reset_settle_ms = 10;
        let (platform, monitor, events) = setup_with(
            MockPlatform::with_devices(vec![device.clone()]),
            config,
            InstallState::in_memory(false),
        );
        platform.grant(&device.name);
        monitor.register().unwrap();

        let stale = monitor.open_device(&device).unwrap();
        monitor.request_permission(&device).unwrap();

        match next_event(&events).await {
            MonitorEvent::Disconnect { block, .. } => assert!(Arc::ptr_eq(&block, &stale)),
            other => panic!("expected disconnect, got {:?}", other),
        }
        let (_, fresh, newly_opened) = expect_connect(next_event(&events).await);
        assert!(newly_opened);
        assert!(!stale.is_open());
        assert_ne!(stale.id(), fresh.id());
    }

    #[tokio::test]
    async fn test_reset_device_permission() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let (platform, monitor, events) =
            setup(MockPlatform::with_devices(vec![device.clone()]));
        platform.grant(&device.name);
        monitor.register().unwrap();

        let block = monitor.open_device(&device).unwrap();
        assert!(monitor.is_permission_cached(&device));

        monitor.reset_device_permission(&device).unwrap();
        match next_event(&events).await {
            MonitorEvent::Disconnect { block: closed, .. } => {
                assert!(Arc::ptr_eq(&closed, &block))
            }
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert!(!monitor.is_permission_cached(&device));
        assert!(monitor.control_block(&device).is_none());
    }

    #[tokio::test]
    async fn test_open_failure_cancels() {
        let (platform, monitor, events) = setup(MockPlatform::new());
        monitor.register().unwrap();

        let device = create_mock_device(1, 0x1234, 0x5678);
        platform.grant(&device.name);
        platform.fail_next_opens(&device.name, 10, PlatformError::NotSupported);
        platform.attach(device);

        assert!(matches!(next_event(&events).await, MonitorEvent::Cancel(_)));
        assert_eq!(platform.open_count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_open_does_not_wedge_worker() {
        let (platform, monitor, events) = setup(MockPlatform::new());
        monitor.register().unwrap();

        let device = create_mock_device(1, 0x1234, 0x5678);
        platform.grant(&device.name);
        platform.panic_next_opens(&device.name, 1);
        platform.attach(device.clone());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || platform.open_count() == 1));

        let outcome = monitor.request_permission(&device).unwrap();
        assert_eq!(outcome, PermissionRequest::Connecting);

        let (connected, block, newly_opened) = expect_connect(next_event(&events).await);
        assert_eq!(connected, device);
        assert!(newly_opened);
        assert!(block.is_open());
        assert_eq!(platform.successful_open_count(), 1);

        let destroyed = tokio::task::spawn_blocking(move || monitor.destroy());
        timeout(DEFAULT_TEST_TIMEOUT, destroyed)
            .await
            .expect("destroy hung")
            .unwrap();
    }
}

mod lifecycle {
    use super::*;

    /// Records callback order and checks monitor state from inside `on_detach`
    #[derive(Default)]
    struct DetachRecorder {
        monitor: OnceLock<Weak<SessionMonitor>>,
        log: Mutex<Vec<&'static str>>,
        clean_on_detach: AtomicBool,
    }

    impl DeviceListener for DetachRecorder {
        fn on_attach(&self, _device: &DeviceDescriptor) {
            self.log.lock().unwrap().push("attach");
        }

        fn on_detach(&self, device: &DeviceDescriptor) {
            if let Some(monitor) = self.monitor.get().and_then(Weak::upgrade) {
                let clean = monitor.control_block(device).is_none()
                    && !monitor.is_permission_cached(device);
                self.clean_on_detach.store(clean, Ordering::SeqCst);
            }
            self.log.lock().unwrap().push("detach");
        }

        fn on_connect(&self, _device: &DeviceDescriptor, _block: &Arc<ControlBlock>, _new: bool) {
            self.log.lock().unwrap().push("connect");
        }

        fn on_disconnect(&self, _device: &DeviceDescriptor, _block: &Arc<ControlBlock>) {
            self.log.lock().unwrap().push("disconnect");
        }

        fn on_cancel(&self, _device: &DeviceDescriptor) {
            self.log.lock().unwrap().push("cancel");
        }
    }

    #[test]
    fn test_detach_cleans_up_before_on_detach() {
        let platform = Arc::new(MockPlatform::new());
        let monitor = Arc::new(
            SessionMonitor::with_install_state(
                platform.clone(),
                test_config(),
                InstallState::in_memory(true),
            )
            .unwrap(),
        );
        let recorder = Arc::new(DetachRecorder::default());
        recorder.monitor.set(Arc::downgrade(&monitor)).unwrap();
        monitor.set_listener(recorder.clone()).unwrap();
        monitor.register().unwrap();

        let device = create_mock_device(1, 0x1234, 0x5678);
        platform.grant(&device.name);
        platform.attach(device.clone());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || monitor
            .control_block(&device)
            .is_some()));

        platform.detach(&device.name);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || recorder.log.lock().unwrap().len() == 3));

        assert_eq!(*recorder.log.lock().unwrap(), vec!["connect", "disconnect", "detach"]);
        assert!(recorder.clean_on_detach.load(Ordering::SeqCst));
        assert_eq!(platform.close_count(), 1);
    }

    #[tokio::test]
    async fn test_block_close_reports_disconnect_once() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let (platform, monitor, events) =
            setup(MockPlatform::with_devices(vec![device.clone()]));
        platform.grant(&device.name);

        let block = monitor.open_device(&device).unwrap();
        block.close();
        block.close();

        match next_event(&events).await {
            MonitorEvent::Disconnect { block: closed, .. } => {
                assert!(Arc::ptr_eq(&closed, &block))
            }
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert_quiet(&events, Duration::from_millis(100)).await;
        assert_eq!(platform.close_count(), 1);
        assert!(monitor.control_block(&device).is_none());
        assert!(matches!(block.get_interface(0, 0), Err(MonitorError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_destroy_closes_every_block() {
        let devices = common::test_utils::create_mock_device_list(3);
        let (platform, monitor, events) = setup(MockPlatform::with_devices(devices.clone()));
        monitor.register().unwrap();

        let blocks: Vec<_> = devices
            .iter()
            .map(|device| {
                platform.grant(&device.name);
                monitor.open_device(device).unwrap()
            })
            .collect();

        monitor.destroy();

        let disconnects = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, MonitorEvent::Disconnect { .. }))
            .count();
        assert_eq!(disconnects, 3);
        assert!(blocks.iter().all(|b| !b.is_open()));
        assert_eq!(platform.close_count(), 3);
        assert!(!platform.is_registered());

        assert!(matches!(
            monitor.open_device(&devices[0]),
            Err(MonitorError::AlreadyDestroyed)
        ));
        assert!(matches!(
            monitor.request_permission(&devices[0]),
            Err(MonitorError::AlreadyDestroyed)
        ));
        assert!(matches!(monitor.device_list(), Err(MonitorError::AlreadyDestroyed)));
        assert!(!monitor.has_permission(&devices[0]));
    }

    #[tokio::test]
    async fn test_destroy_cancels_pending_negotiation() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let (platform, monitor, events) =
            setup(MockPlatform::with_devices(vec![device.clone()]));
        platform.set_permission_mode(PermissionMode::Manual);
        monitor.register().unwrap();

        monitor.request_permission(&device).unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            platform.pending_requests().len() == 1
        }));

        monitor.destroy();
        let drained = events.drain();
        assert!(matches!(drained.as_slice(), [MonitorEvent::Cancel(d)] if *d == device));
    }

    #[tokio::test]
    async fn test_drop_destroys() {
        let device = create_mock_device(1, 0x1234, 0x5678);
        let (platform, monitor, events) =
            setup(MockPlatform::with_devices(vec![device.clone()]));
        platform.grant(&device.name);
        let block = monitor.open_device(&device).unwrap();

        drop(monitor);
        assert!(!block.is_open());
        assert!(matches!(
            events.drain().as_slice(),
            [MonitorEvent::Disconnect { .. }]
        ));
    }

    /// Panics on the first attach, records everything after
    struct FlakyListener {
        panicked: AtomicBool,
        attaches: Mutex<Vec<String>>,
    }

    impl DeviceListener for FlakyListener {
        fn on_attach(&self, device: &DeviceDescriptor) {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("listener failure");
            }
            self.attaches.lock().unwrap().push(device.name.clone());
        }
        fn on_detach(&self, _device: &DeviceDescriptor) {}
        fn on_connect(&self, _device: &DeviceDescriptor, _block: &Arc<ControlBlock>, _new: bool) {}
        fn on_disconnect(&self, _device: &DeviceDescriptor, _block: &Arc<ControlBlock>) {}
        fn on_cancel(&self, _device: &DeviceDescriptor) {}
    }

    #[test]
    fn test_listener_panic_does_not_stop_worker() {
        let platform = Arc::new(MockPlatform::new());
        let monitor = SessionMonitor::with_install_state(
            platform.clone(),
            test_config(),
            InstallState::in_memory(true),
        )
        .unwrap();
        let listener = Arc::new(FlakyListener {
            panicked: AtomicBool::new(false),
            attaches: Mutex::new(Vec::new()),
        });
        monitor.set_listener(listener.clone()).unwrap();
        monitor.register().unwrap();

        platform.attach(create_mock_device(1, 0x1234, 0x0001));
        let second = create_mock_device(2, 0x1234, 0x0002);
        platform.attach(second.clone());

        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
            !listener.attaches.lock().unwrap().is_empty()
        }));
        assert_eq!(*listener.attaches.lock().unwrap(), vec![second.name]);
    }
}
