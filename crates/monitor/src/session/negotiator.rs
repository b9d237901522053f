//! Permission negotiation state machine
//!
//! Tracks per-identity negotiation state (`Idle -> Requesting -> Granted |
//! Denied`) and the tokens of requests in flight. The negotiator never talks
//! to the platform: it returns a [`Transition`] and the worker carries it out.

use std::collections::HashMap;
use std::time::Duration;

use common::{DeviceDescriptor, DeviceIdentity, PermissionToken};
use tracing::{debug, info, warn};

use crate::config::PermissionSettings;
use crate::install_state::InstallState;

/// Negotiation state of one device identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegotiationState {
    #[default]
    Idle,
    Requesting,
    Granted,
    Denied,
}

/// What the worker must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Permission is held; run the connect sequence
    Connect(DeviceDescriptor),
    /// Ask the platform, tagging the request with `token`
    Request(DeviceDescriptor, PermissionToken),
    /// Negotiation over without access
    Cancel(DeviceDescriptor),
    /// First-activation denial; request again after `delay`
    RetryLater {
        device: DeviceDescriptor,
        delay: Duration,
    },
    /// Stale or unknown result
    Ignore,
}

#[derive(Debug)]
struct Pending {
    identity: DeviceIdentity,
    device: DeviceDescriptor,
}

#[derive(Debug)]
pub struct PermissionNegotiator {
    install: InstallState,
    retry_delay: Duration,
    reset_enabled: bool,
    reset_settle: Duration,
    reset_done: bool,
    next_token: u64,
    pending: HashMap<PermissionToken, Pending>,
    states: HashMap<DeviceIdentity, NegotiationState>,
}

impl PermissionNegotiator {
    pub fn new(install: InstallState, settings: &PermissionSettings) -> Self {
        Self {
            install,
            retry_delay: settings.first_activation_retry(),
            reset_enabled: settings.reset_on_first_activation,
            reset_settle: settings.reset_settle(),
            reset_done: false,
            next_token: 1,
            pending: HashMap::new(),
            states: HashMap::new(),
        }
    }

    pub fn state(&self, identity: &DeviceIdentity) -> NegotiationState {
        self.states.get(identity).copied().unwrap_or_default()
    }

    pub fn first_activation_pending(&self) -> bool {
        self.install.first_activation_pending()
    }

    /// Whether the one-shot post-install reset should run before this request
    pub fn should_reset_before_request(&self) -> bool {
        self.reset_enabled && !self.reset_done && self.install.first_activation_pending()
    }

    pub fn mark_reset_done(&mut self) {
        self.reset_done = true;
    }

    pub fn reset_settle(&self) -> Duration {
        self.reset_settle
    }

    /// Start a negotiation; an attempt already in flight is superseded
    pub fn begin(
        &mut self,
        identity: &DeviceIdentity,
        device: &DeviceDescriptor,
        already_granted: bool,
    ) -> Transition {
        self.pending.retain(|_, p| &p.identity != identity);

        if already_granted {
            debug!("{} already permitted", device.name);
            self.states.insert(identity.clone(), NegotiationState::Granted);
            self.complete_first_activation();
            return Transition::Connect(device.clone());
        }

        let token = PermissionToken(self.next_token);
        self.next_token += 1;
        self.pending.insert(
            token,
            Pending {
                identity: identity.clone(),
                device: device.clone(),
            },
        );
        self.states
            .insert(identity.clone(), NegotiationState::Requesting);
        debug!("Requesting permission for {} ({})", device.name, token);
        Transition::Request(device.clone(), token)
    }

    /// Apply a platform permission result
    ///
    /// A result carrying a token nobody is waiting for is stale and ignored.
    /// A result without a token is an unsolicited change and always applies.
    pub fn resolve(
        &mut self,
        token: Option<PermissionToken>,
        identity: &DeviceIdentity,
        device: &DeviceDescriptor,
        granted: bool,
    ) -> Transition {
        match token {
            Some(token) => {
                if self.pending.remove(&token).is_none() {
                    debug!("Ignoring stale permission result {} for {}", token, device.name);
                    return Transition::Ignore;
                }
            }
            None => self.pending.retain(|_, p| &p.identity != identity),
        }

        if granted {
            info!("Permission granted for {}", device.name);
            self.states.insert(identity.clone(), NegotiationState::Granted);
            self.complete_first_activation();
            return Transition::Connect(device.clone());
        }

        self.states.insert(identity.clone(), NegotiationState::Denied);
        if self.install.first_activation_pending() {
            // Only the first denial of an installation is retried
            self.complete_first_activation();
            info!(
                "Permission denied for {} during first activation, retrying in {:?}",
                device.name, self.retry_delay
            );
            return Transition::RetryLater {
                device: device.clone(),
                delay: self.retry_delay,
            };
        }

        info!("Permission denied for {}", device.name);
        Transition::Cancel(device.clone())
    }

    /// The platform refused to even issue the request
    pub fn fail(&mut self, token: PermissionToken) -> Option<DeviceDescriptor> {
        let pending = self.pending.remove(&token)?;
        self.states
            .insert(pending.identity, NegotiationState::Denied);
        Some(pending.device)
    }

    /// Forget a detached device; returns it if a request was in flight
    pub fn abandon(&mut self, identity: &DeviceIdentity) -> Option<DeviceDescriptor> {
        self.states.remove(identity);
        let token = self
            .pending
            .iter()
            .find(|(_, p)| &p.identity == identity)
            .map(|(token, _)| *token)?;
        self.pending.remove(&token).map(|p| p.device)
    }

    /// Drop every negotiation in flight, returning their devices
    pub fn cancel_all(&mut self) -> Vec<DeviceDescriptor> {
        self.states.clear();
        self.pending.drain().map(|(_, p)| p.device).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn complete_first_activation(&mut self) {
        if let Err(e) = self.install.complete_first_activation() {
            warn!("Failed to persist install state: {}", e);
        }
    }
}
