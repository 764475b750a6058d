//! Permission and adapter readiness checks.
//!
//! Before scanning or connecting the platform must have granted the
//! required permissions and the adapter must be powered on. Adapter state
//! is learned from two sources at once, periodic queries and the push
//! stream of state changes; whichever reports a decisive state first wins
//! and the other source is dropped with it.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ble::permissions::{Permission, PermissionProvider};
use crate::ble::transport::{AdapterState, Transport};

/// What an adapter state means for a caller waiting on readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Adapter is powered on.
    Ready,
    /// Adapter will not become usable during this wait.
    Failed,
    /// Keep waiting.
    Pending,
}

/// How strictly a wait treats a powered-off adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoweredOffPolicy {
    /// Powered off ends the wait with failure.
    Terminal,
    /// Powered off keeps waiting, the user may switch Bluetooth on.
    KeepWaiting,
}

/// Classify an adapter state.
pub fn classify(state: AdapterState, powered_off: PoweredOffPolicy) -> Readiness {
    match state {
        AdapterState::PoweredOn => Readiness::Ready,
        AdapterState::Unsupported | AdapterState::Unauthorized => Readiness::Failed,
        AdapterState::PoweredOff if powered_off == PoweredOffPolicy::Terminal => {
            Readiness::Failed
        }
        _ => Readiness::Pending,
    }
}

/// Gate combining permission requests and adapter readiness.
pub struct ReadinessGate {
    transport: Arc<dyn Transport>,
    permissions: Arc<dyn PermissionProvider>,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl ReadinessGate {
    /// Create a gate.
    pub fn new(
        transport: Arc<dyn Transport>,
        permissions: Arc<dyn PermissionProvider>,
        poll_interval: Duration,
        poll_attempts: u32,
    ) -> Self {
        Self {
            transport,
            permissions,
            poll_interval,
            poll_attempts,
        }
    }

    /// Request every permission the platform tier requires.
    ///
    /// Returns the permissions that were refused; empty means all granted.
    pub async fn request_permissions(&self) -> Vec<Permission> {
        let tier = self.permissions.tier();
        let mut denied = Vec::new();

        for &permission in tier.required() {
            let status = self.permissions.request(permission).await;
            debug!("Permission {} -> {:?}", permission, status);
            if !status.is_granted() {
                denied.push(permission);
            }
        }

        if !denied.is_empty() {
            warn!("Permissions denied: {:?}", denied);
        }
        denied
    }

    /// Required permissions that are not granted, checked without prompting.
    pub async fn missing_permissions(&self) -> Vec<Permission> {
        let mut missing = Vec::new();
        for &permission in self.permissions.tier().required() {
            if !self.permissions.check(permission).await {
                debug!("Permission {} missing", permission);
                missing.push(permission);
            }
        }
        missing
    }

    /// Check the required permissions without prompting.
    pub async fn has_permissions(&self) -> bool {
        self.missing_permissions().await.is_empty()
    }

    /// Current adapter state; query failures read as `Unknown`.
    pub async fn adapter_state(&self) -> AdapterState {
        match self.transport.adapter_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                AdapterState::Unknown
            }
        }
    }

    /// Check if the adapter is powered on right now.
    pub async fn is_powered_on(&self) -> bool {
        let state = self.adapter_state().await;
        if !state.is_powered_on() {
            warn!("Bluetooth not powered on: {}", state);
        }
        state.is_powered_on()
    }

    /// Wait for a decisive adapter state, polling at the configured interval.
    ///
    /// Powered off is terminal. Gives up with `false` after the configured
    /// number of polls.
    pub async fn poll_until_ready(&self) -> bool {
        let state = self.adapter_state().await;
        match classify(state, PoweredOffPolicy::Terminal) {
            Readiness::Ready => return true,
            Readiness::Failed => {
                warn!("Bluetooth unavailable: {}", state);
                return false;
            }
            Readiness::Pending => info!("Adapter state {}, waiting for update", state),
        }

        let mut changes = self.state_changes().await;
        let mut ticker = tokio::time::interval(self.poll_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        let mut attempts = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    attempts += 1;
                    let state = self.adapter_state().await;
                    debug!("Poll {}/{}: adapter state {}", attempts, self.poll_attempts, state);
                    match classify(state, PoweredOffPolicy::Terminal) {
                        Readiness::Ready => return true,
                        Readiness::Failed => return false,
                        Readiness::Pending if attempts >= self.poll_attempts => {
                            warn!("Timed out waiting for adapter state");
                            return false;
                        }
                        Readiness::Pending => {}
                    }
                }
                Some(state) = changes.next() => {
                    debug!("Adapter state changed: {}", state);
                    match classify(state, PoweredOffPolicy::Terminal) {
                        Readiness::Ready => return true,
                        Readiness::Failed => return false,
                        Readiness::Pending => {}
                    }
                }
            }
        }
    }

    /// Wait up to `timeout` for the adapter to power on.
    ///
    /// Only unsupported or unauthorized end the wait early.
    pub async fn wait_powered_on(&self, timeout: Duration) -> bool {
        let wait = async {
            // Subscribe before querying so a change in between is not lost.
            let mut changes = self.state_changes().await;
            let state = self.adapter_state().await;
            match classify(state, PoweredOffPolicy::KeepWaiting) {
                Readiness::Ready => return true,
                Readiness::Failed => return false,
                Readiness::Pending => {}
            }

            while let Some(state) = changes.next().await {
                match classify(state, PoweredOffPolicy::KeepWaiting) {
                    Readiness::Ready => return true,
                    Readiness::Failed => return false,
                    Readiness::Pending => {}
                }
            }
            // Stream ended without a decision, let the timeout run out.
            futures::future::pending::<bool>().await
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(ready) => ready,
            Err(_) => {
                warn!("Bluetooth did not power on within {:?}", timeout);
                false
            }
        }
    }

    async fn state_changes(&self) -> futures::stream::BoxStream<'static, AdapterState> {
        match self.transport.adapter_state_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                warn!("Adapter state changes unavailable: {}", e);
                stream::pending().boxed()
            }
        }
    }
}
