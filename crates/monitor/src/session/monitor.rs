//! Public session monitor API

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use common::{
    DeviceDescriptor, DeviceFilter, DeviceIdentity, DeviceInfo, IdentityScope, NotificationSink,
    UsbPlatform, create_notification_channel,
};
use tracing::{debug, error, info, warn};

use crate::channel::{DeviceListener, MonitorEvent};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::install_state::InstallState;
use crate::session::negotiator::{NegotiationState, PermissionNegotiator};
use crate::session::poller::HotplugPoller;
use crate::session::worker::{Worker, WorkerCommand, WorkerHandle, worker_channel};
use crate::usb::{
    ControlBlock, ControlBlockRegistry, DeviceFilterSet, PermissionCache, RetryPolicy,
    read_device_info,
};

/// Immediate outcome of [`SessionMonitor::request_permission`]
///
/// The final result arrives through the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionRequest {
    /// Permission is already held; `on_connect` follows
    Connecting,
    /// The platform is being asked; `on_connect` or `on_cancel` follows
    Requested,
    /// Rejected up front; `on_cancel` follows
    Cancelled,
}

/// State shared between the public handle and the worker
pub(crate) struct MonitorShared {
    pub(crate) platform: Arc<dyn UsbPlatform>,
    pub(crate) scope: IdentityScope,
    pub(crate) retry: RetryPolicy,
    pub(crate) permissions: PermissionCache,
    pub(crate) registry: ControlBlockRegistry,
    pub(crate) worker: WorkerHandle,
    filters: Mutex<DeviceFilterSet>,
    negotiator: Mutex<PermissionNegotiator>,
    listener: Mutex<Option<Arc<dyn DeviceListener>>>,
    sink: NotificationSink,
    registered: AtomicBool,
    destroyed: AtomicBool,
}

impl MonitorShared {
    pub(crate) fn identity(&self, device: &DeviceDescriptor) -> DeviceIdentity {
        DeviceIdentity::from_descriptor(device, self.scope)
    }

    pub(crate) fn filters(&self) -> MutexGuard<'_, DeviceFilterSet> {
        self.filters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn negotiator(&self) -> MutexGuard<'_, PermissionNegotiator> {
        self.negotiator.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn DeviceListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn clear_listener(&self) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }
}

/// USB session monitor
///
/// Discovers devices, negotiates permission, tracks hotplug and owns the
/// control blocks it opened. Events are reported to one [`DeviceListener`]
/// from the `usb-session-worker` thread. Dropping the monitor destroys it.
pub struct SessionMonitor {
    shared: Arc<MonitorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionMonitor {
    /// Create a monitor, loading install state from the configured path
    pub fn new(platform: Arc<dyn UsbPlatform>, config: MonitorConfig) -> Result<Self> {
        let install = InstallState::load(config.state_path()).unwrap_or_else(|e| {
            warn!("Failed to load install state: {}, keeping it in memory", e);
            InstallState::in_memory(false)
        });
        Self::with_install_state(platform, config, install)
    }

    /// Create a monitor with explicit install state
    pub fn with_install_state(
        platform: Arc<dyn UsbPlatform>,
        config: MonitorConfig,
        install: InstallState,
    ) -> Result<Self> {
        let filters = config
            .parsed_filters()
            .map_err(|e| MonitorError::InvalidArgument(e.to_string()))?;

        let (sink, platform_events) = create_notification_channel();
        let (handle, commands) = worker_channel();

        let shared = Arc::new(MonitorShared {
            platform,
            scope: config.monitor.identity_scope,
            retry: config.open_retry.policy(),
            permissions: PermissionCache::new(),
            registry: ControlBlockRegistry::new(),
            worker: handle,
            filters: Mutex::new(DeviceFilterSet::new(filters)),
            negotiator: Mutex::new(PermissionNegotiator::new(install, &config.permission)),
            listener: Mutex::new(None),
            sink,
            registered: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });

        let worker = Worker::new(
            Arc::clone(&shared),
            platform_events,
            commands,
            HotplugPoller::new(&config.polling),
        );
        let join = thread::Builder::new()
            .name("usb-session-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| MonitorError::Worker(format!("failed to spawn worker: {}", e)))?;

        debug!("Session monitor created");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(join)),
        })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(MonitorError::AlreadyDestroyed);
        }
        Ok(())
    }

    fn identity(&self, device: &DeviceDescriptor) -> DeviceIdentity {
        self.shared.identity(device)
    }

    /// Install the listener, replacing any previous one
    pub fn set_listener(&self, listener: Arc<dyn DeviceListener>) -> Result<()> {
        self.ensure_alive()?;
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
        Ok(())
    }

    /// Start receiving platform notifications and polling
    pub fn register(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.shared.registered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self
            .shared
            .platform
            .register_notifications(self.shared.sink.clone())
        {
            self.shared.registered.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        self.shared.worker.send(WorkerCommand::StartPolling);
        info!("Session monitor registered");
        Ok(())
    }

    /// Stop notifications and polling; live blocks stay open
    pub fn unregister(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.shared.registered.swap(false, Ordering::SeqCst) {
            self.shared.platform.unregister_notifications();
            self.shared.worker.send(WorkerCommand::StopPolling);
            info!("Session monitor unregistered");
        }
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.shared.is_registered()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Replace the active filters with a single filter
    pub fn set_filter(&self, filter: DeviceFilter) -> Result<()> {
        self.set_filters(vec![filter])
    }

    /// Replace the active filters
    pub fn set_filters(&self, filters: Vec<DeviceFilter>) -> Result<()> {
        self.ensure_alive()?;
        self.shared.filters().set(filters);
        Ok(())
    }

    pub fn add_filter(&self, filter: DeviceFilter) -> Result<()> {
        self.add_filters(vec![filter])
    }

    pub fn add_filters(&self, filters: Vec<DeviceFilter>) -> Result<()> {
        self.ensure_alive()?;
        self.shared.filters().extend(filters);
        Ok(())
    }

    /// Remove one filter; returns whether it was active
    pub fn remove_filter(&self, filter: &DeviceFilter) -> Result<bool> {
        self.ensure_alive()?;
        Ok(self.shared.filters().remove(filter))
    }

    /// Remove several filters; returns how many were active
    pub fn remove_filters(&self, filters: &[DeviceFilter]) -> Result<usize> {
        self.ensure_alive()?;
        let mut set = self.shared.filters();
        Ok(filters.iter().filter(|f| set.remove(f)).count())
    }

    pub fn filters(&self) -> Vec<DeviceFilter> {
        self.shared.filters().filters().to_vec()
    }

    /// Attached devices matching the active filters
    pub fn device_list(&self) -> Result<Vec<DeviceDescriptor>> {
        let filters = self.shared.filters().clone();
        self.device_list_with(&filters)
    }

    /// Attached devices matching `filters` instead of the active set
    pub fn device_list_with(&self, filters: &DeviceFilterSet) -> Result<Vec<DeviceDescriptor>> {
        Ok(filters.apply(self.devices()?))
    }

    pub fn device_count(&self) -> Result<usize> {
        Ok(self.device_list()?.len())
    }

    /// Every attached device, unfiltered
    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.ensure_alive()?;
        Ok(self.shared.platform.enumerate()?)
    }

    /// Whether the device is accessible, re-validated against the platform
    pub fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.shared.permissions.has_permission(
            self.shared.platform.as_ref(),
            device,
            &self.identity(device),
        )
    }

    /// Cached permission state, without asking the platform
    pub fn is_permission_cached(&self, device: &DeviceDescriptor) -> bool {
        self.shared
            .permissions
            .is_cached_granted(&self.identity(device))
    }

    /// Ask for access to a device
    ///
    /// Returns once the request is queued; the outcome arrives as
    /// `on_connect` or `on_cancel` on the listener.
    pub fn request_permission(&self, device: &DeviceDescriptor) -> Result<PermissionRequest> {
        self.ensure_alive()?;

        let rejection = if !self.is_registered() {
            Some("monitor not registered".to_string())
        } else {
            device.validate().err()
        };
        if let Some(reason) = rejection {
            warn!("Permission request for {:?} cancelled: {}", device.name, reason);
            self.shared
                .worker
                .send(WorkerCommand::Emit(MonitorEvent::Cancel(device.clone())));
            return Ok(PermissionRequest::Cancelled);
        }

        let already_granted = self.has_permission(device);
        if !self
            .shared
            .worker
            .send(WorkerCommand::RequestPermission(device.clone()))
        {
            warn!("Permission request for {} cancelled: worker unavailable", device.name);
            if let Some(listener) = self.shared.listener() {
                listener.on_cancel(device);
            }
            return Ok(PermissionRequest::Cancelled);
        }

        Ok(if already_granted {
            PermissionRequest::Connecting
        } else {
            PermissionRequest::Requested
        })
    }

    /// Open a permitted device or return its live block
    pub fn open_device(&self, device: &DeviceDescriptor) -> Result<Arc<ControlBlock>> {
        self.ensure_alive()?;
        device.validate().map_err(MonitorError::InvalidArgument)?;

        if !self.has_permission(device) {
            return Err(MonitorError::PermissionDenied {
                device: device.name.clone(),
            });
        }

        let identity = self.identity(device);
        let (block, _) = self.shared.registry.open(
            self.shared.platform.as_ref(),
            device,
            &identity,
            &self.shared.retry,
            Some(&self.shared.worker),
        )?;
        Ok(block)
    }

    /// Live block for a device, if any
    pub fn control_block(&self, device: &DeviceDescriptor) -> Option<Arc<ControlBlock>> {
        self.shared.registry.get(&self.identity(device))
    }

    pub fn negotiation_state(&self, device: &DeviceDescriptor) -> NegotiationState {
        self.shared.negotiator().state(&self.identity(device))
    }

    /// Forget the cached permission and close the device's block
    pub fn reset_device_permission(&self, device: &DeviceDescriptor) -> Result<()> {
        self.ensure_alive()?;
        if !self
            .shared
            .worker
            .send(WorkerCommand::ResetPermission(device.clone()))
        {
            return Err(MonitorError::Worker("worker unavailable".to_string()));
        }
        Ok(())
    }

    /// Descriptive strings for a device
    ///
    /// Uses the live block when there is one, otherwise opens the device
    /// briefly if permitted, otherwise falls back to the snapshot.
    pub fn device_info(&self, device: &DeviceDescriptor) -> DeviceInfo {
        if let Some(block) = self.control_block(device) {
            return block.info().clone();
        }

        if self.has_permission(device) {
            match self.shared.platform.open(device) {
                Ok(mut connection) => {
                    let info = read_device_info(device, Some(connection.as_ref()));
                    connection.close();
                    return info;
                }
                Err(e) => debug!("Could not open {} for info: {}", device.name, e),
            }
        }

        read_device_info(device, None)
    }

    pub fn identity_of(&self, device: &DeviceDescriptor) -> DeviceIdentity {
        self.identity(device)
    }

    /// Tear the monitor down
    ///
    /// Pending negotiations end with `on_cancel`, every live block is closed
    /// with one `on_disconnect`, and later calls fail with
    /// [`MonitorError::AlreadyDestroyed`]. Safe to call from a listener.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Destroying session monitor");

        if self.shared.registered.swap(false, Ordering::SeqCst) {
            self.shared.platform.unregister_notifications();
        }
        self.shared.worker.send(WorkerCommand::Shutdown);

        let join = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(join) = join else {
            return;
        };

        if join.thread().id() == thread::current().id() {
            // Called from a listener; the worker exits after this message
            return;
        }
        if join.join().is_err() {
            error!("Session worker panicked");
        }

        // Anything opened after the worker drained the registry
        let leftover = self.shared.registry.close_all();
        if !leftover.is_empty() {
            warn!("Closed {} control block(s) after worker exit", leftover.len());
        }
        self.shared.permissions.clear();
        self.shared.clear_listener();
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        self.destroy();
    }
}
