//! Session worker thread
//!
//! One dedicated thread owns every state transition of a monitor. It runs a
//! current-thread Tokio runtime and multiplexes platform notifications,
//! commands from the public API and its own timers (poller ticks and
//! first-activation retries). Platform notifications are drained first.
//! Each message is handled inside `catch_unwind` so a failing device or a
//! panicking listener never stops the loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender, unbounded};
use common::{DeviceDescriptor, PlatformEvent, PlatformEvents};
use tracing::{debug, error, info, trace, warn};

use crate::channel::MonitorEvent;
use crate::session::monitor::MonitorShared;
use crate::session::negotiator::Transition;
use crate::session::poller::HotplugPoller;
use crate::usb::ControlBlock;

/// Idle wake-up when no timer is armed
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Commands sent to the worker
#[derive(Debug)]
pub enum WorkerCommand {
    RequestPermission(DeviceDescriptor),
    ResetPermission(DeviceDescriptor),
    /// Deliver an event produced off the worker
    Emit(MonitorEvent),
    /// A control block was closed by its owner
    Disconnected(Arc<ControlBlock>),
    StartPolling,
    StopPolling,
    Shutdown,
}

/// Sending side of the worker queue
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    tx: Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// Queue a command; false once the worker has exited
    pub fn send(&self, command: WorkerCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                debug!("Worker unavailable, dropping {:?}", e.into_inner());
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub(crate) fn worker_channel() -> (WorkerHandle, Receiver<WorkerCommand>) {
    let (tx, rx) = unbounded();
    (WorkerHandle { tx }, rx)
}

enum Message {
    Platform(PlatformEvent),
    PlatformClosed,
    Command(WorkerCommand),
    Timer,
}

struct DelayedRequest {
    due: Instant,
    device: DeviceDescriptor,
}

pub(crate) struct Worker {
    shared: Arc<MonitorShared>,
    platform_events: PlatformEvents,
    platform_open: bool,
    commands: Receiver<WorkerCommand>,
    poller: HotplugPoller,
    retries: Vec<DelayedRequest>,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<MonitorShared>,
        platform_events: PlatformEvents,
        commands: Receiver<WorkerCommand>,
        poller: HotplugPoller,
    ) -> Self {
        Self {
            shared,
            platform_events,
            platform_open: true,
            commands,
            poller,
            retries: Vec::new(),
        }
    }

    /// Thread entry point
    pub(crate) fn run(mut self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to build worker runtime: {}", e);
                return;
            }
        };

        runtime.block_on(self.event_loop());
    }

    async fn event_loop(&mut self) {
        info!("Session worker started");

        loop {
            let wait = self.next_wakeup(Instant::now());
            let platform_open = self.platform_open;

            let message = tokio::select! {
                biased;

                event = self.platform_events.recv(), if platform_open => match event {
                    Ok(event) => Message::Platform(event),
                    Err(_) => Message::PlatformClosed,
                },
                command = self.commands.recv() => match command {
                    Ok(command) => Message::Command(command),
                    Err(_) => Message::Command(WorkerCommand::Shutdown),
                },
                _ = tokio::time::sleep(wait) => Message::Timer,
            };

            if matches!(message, Message::PlatformClosed) {
                warn!("Platform notification channel closed");
                self.platform_open = false;
                continue;
            }

            if matches!(message, Message::Command(WorkerCommand::Shutdown)) {
                self.guarded("shutdown", |worker| worker.shutdown());
                break;
            }

            self.guarded("message", |worker| worker.handle(message));
            self.guarded("timers", |worker| worker.run_due_timers(Instant::now()));
        }

        info!("Session worker stopped");
    }

    fn guarded(&mut self, what: &str, f: impl FnOnce(&mut Self)) {
        if catch_unwind(AssertUnwindSafe(|| f(self))).is_err() {
            error!("Session worker recovered from a panic while handling {}", what);
        }
    }

    fn next_wakeup(&self, now: Instant) -> Duration {
        self.poller
            .next_deadline()
            .into_iter()
            .chain(self.retries.iter().map(|r| r.due))
            .min()
            .map(|due| due.saturating_duration_since(now))
            .unwrap_or(IDLE_WAKEUP)
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Platform(event) => self.handle_platform_event(event),
            Message::Command(command) => self.handle_command(command),
            Message::PlatformClosed | Message::Timer => {}
        }
    }

    fn handle_platform_event(&mut self, event: PlatformEvent) {
        trace!("Platform event: {:?}", event);
        match event {
            PlatformEvent::Attached(device) => self.handle_attach(device),
            PlatformEvent::Detached(device) => self.handle_detach(device),
            PlatformEvent::PermissionResult {
                token,
                device,
                granted,
            } => {
                let identity = self.shared.identity(&device);
                if !granted {
                    self.shared.permissions.update(&identity, false);
                }
                let transition =
                    self.shared
                        .negotiator()
                        .resolve(token, &identity, &device, granted);
                self.apply(transition);
            }
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::RequestPermission(device) => self.request_permission(device),
            WorkerCommand::ResetPermission(device) => self.reset_permission(&device),
            WorkerCommand::Emit(event) => self.emit(event),
            WorkerCommand::Disconnected(block) => {
                let device = block.device().clone();
                self.emit(MonitorEvent::Disconnect { device, block });
            }
            WorkerCommand::StartPolling => {
                debug!("Polling started");
                self.poller.start(Instant::now());
            }
            WorkerCommand::StopPolling => {
                debug!("Polling stopped");
                self.poller.stop();
            }
            // Handled by the event loop
            WorkerCommand::Shutdown => {}
        }
    }

    fn handle_attach(&mut self, device: DeviceDescriptor) {
        if !self.shared.is_registered() {
            return;
        }
        if !self.shared.filters().matches(&device) {
            debug!("Ignoring attach of {}, not matched by filters", device.name);
            return;
        }

        let identity = self.shared.identity(&device);
        let granted = self
            .shared
            .permissions
            .has_permission(self.shared.platform.as_ref(), &device, &identity);
        self.poller.observe(&device, granted);

        info!("Device attached: {} (permitted: {})", device.name, granted);
        if granted {
            self.connect(device);
        } else {
            self.emit(MonitorEvent::Attach(device));
        }
    }

    fn handle_detach(&mut self, device: DeviceDescriptor) {
        info!("Device detached: {}", device.name);
        let identity = self.shared.identity(&device);

        // Another unit sharing the identity may own the block
        if let Some(block) = self.shared.registry.get(&identity)
            && block.device().name == device.name
            && self.shared.registry.remove_if_same(&identity, block.id())
            && block.release()
        {
            self.emit(MonitorEvent::Disconnect {
                device: block.device().clone(),
                block,
            });
        }

        self.shared.permissions.remove(&identity);
        self.poller.forget(&device.name);

        let abandoned = self.shared.negotiator().abandon(&identity);
        if let Some(pending) = abandoned {
            self.emit(MonitorEvent::Cancel(pending));
        }

        self.emit(MonitorEvent::Detach(device));
    }

    fn request_permission(&mut self, device: DeviceDescriptor) {
        if !self.shared.is_registered() {
            self.emit(MonitorEvent::Cancel(device));
            return;
        }

        let reset = {
            let mut negotiator = self.shared.negotiator();
            if negotiator.should_reset_before_request() {
                negotiator.mark_reset_done();
                Some(negotiator.reset_settle())
            } else {
                None
            }
        };
        if let Some(settle) = reset {
            info!("First activation, resetting permission for {}", device.name);
            self.reset_permission(&device);
            std::thread::sleep(settle);
        }

        let identity = self.shared.identity(&device);
        let granted = self
            .shared
            .permissions
            .has_permission(self.shared.platform.as_ref(), &device, &identity);
        let transition = self.shared.negotiator().begin(&identity, &device, granted);
        self.apply(transition);
    }

    fn reset_permission(&mut self, device: &DeviceDescriptor) {
        let identity = self.shared.identity(device);
        self.shared.permissions.remove(&identity);

        if let Some(block) = self.shared.registry.take(&identity)
            && block.release()
        {
            debug!("Closed control block {} for permission reset", block.id());
            self.emit(MonitorEvent::Disconnect {
                device: block.device().clone(),
                block,
            });
        }
    }

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Connect(device) => self.connect(device),
            Transition::Request(device, token) => {
                if let Err(e) = self.shared.platform.request_permission(&device, token) {
                    warn!("Permission request for {} failed: {}", device.name, e);
                    let failed = self.shared.negotiator().fail(token);
                    if let Some(device) = failed {
                        self.emit(MonitorEvent::Cancel(device));
                    }
                }
            }
            Transition::Cancel(device) => self.emit(MonitorEvent::Cancel(device)),
            Transition::RetryLater { device, delay } => {
                self.retries.push(DelayedRequest {
                    due: Instant::now() + delay,
                    device,
                });
            }
            Transition::Ignore => {}
        }
    }

    /// Record the grant, open (or reuse) the block and report it
    fn connect(&mut self, device: DeviceDescriptor) {
        let identity = self.shared.identity(&device);
        self.shared.permissions.update(&identity, true);

        match self.shared.registry.open(
            self.shared.platform.as_ref(),
            &device,
            &identity,
            &self.shared.retry,
            Some(&self.shared.worker),
        ) {
            Ok((block, newly_opened)) => self.emit(MonitorEvent::Connect {
                device,
                block,
                newly_opened,
            }),
            Err(e) => {
                warn!("Connect to {} failed: {}", device.name, e);
                self.emit(MonitorEvent::Cancel(device));
            }
        }
    }

    fn run_due_timers(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) =
            self.retries.drain(..).partition(|r| r.due <= now);
        self.retries = later;
        for retry in due {
            debug!("Retrying permission request for {}", retry.device.name);
            self.request_permission(retry.device);
        }

        if self.poller.is_due(now) {
            self.poll(now);
        }
    }

    fn poll(&mut self, now: Instant) {
        let devices = match self.shared.platform.enumerate() {
            Ok(devices) => self.shared.filters().apply(devices),
            Err(e) => {
                warn!("Poll enumeration failed: {}", e);
                self.poller.schedule_next(now, false);
                return;
            }
        };

        let observed: Vec<(DeviceDescriptor, bool)> = devices
            .into_iter()
            .map(|device| {
                let identity = self.shared.identity(&device);
                let granted = self.shared.permissions.has_permission(
                    self.shared.platform.as_ref(),
                    &device,
                    &identity,
                );
                (device, granted)
            })
            .collect();

        let outcome = self.poller.tick(observed, self.shared.permissions.len());
        self.poller.schedule_next(now, outcome.changed);

        // Unregistered while this tick was enumerating
        if !self.shared.is_registered() {
            return;
        }
        for device in outcome.attached {
            self.emit(MonitorEvent::Attach(device));
        }
    }

    fn shutdown(&mut self) {
        let cancelled = self.shared.negotiator().cancel_all();
        for device in cancelled {
            self.emit(MonitorEvent::Cancel(device));
        }

        let closed = self.shared.registry.close_all();
        info!("Closed {} control block(s) on shutdown", closed.len());
        for block in closed {
            self.emit(MonitorEvent::Disconnect {
                device: block.device().clone(),
                block,
            });
        }

        self.shared.permissions.clear();
        self.poller.stop();
        self.retries.clear();
        self.shared.clear_listener();
    }

    fn emit(&self, event: MonitorEvent) {
        if let Some(listener) = self.shared.listener() {
            event.dispatch(listener.as_ref());
        }
    }
}
