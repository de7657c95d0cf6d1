//! Tenant runtime supervisor — reconciles running sessions against the
//! set of active tenants.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::FunnelEngine;
use crate::error::Result;
use crate::funnel::model::Tenant;
use crate::session::TenantSession;

/// Lifecycle of one tenant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// A supervised session task.
struct SessionHandle {
    state: SessionState,
    bot_token: String,
    join: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Starts, stops, and restarts one session task per active tenant.
///
/// Reconciliation ticks are serialized by running inside a single task,
/// so no session is ever double-started.
pub struct Supervisor {
    engine: Arc<FunnelEngine>,
    client: reqwest::Client,
    public_url: Option<String>,
    poll_timeout_secs: u64,
    registry: Mutex<HashMap<i64, SessionHandle>>,
}

impl Supervisor {
    pub fn new(
        engine: Arc<FunnelEngine>,
        public_url: Option<String>,
        poll_timeout_secs: u64,
    ) -> Self {
        Self {
            engine,
            client: reqwest::Client::new(),
            public_url,
            poll_timeout_secs,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile loop. Runs until the process shuts down.
    pub async fn run(self: Arc<Self>, interval: std::time::Duration) {
        info!("Supervisor started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "Reconcile tick failed");
            }
        }
    }

    /// One reconciliation pass:
    /// - start sessions for active tenants that have none
    /// - restart sessions whose task finished (crashed)
    /// - restart sessions whose bot token changed
    /// - stop sessions for tenants no longer active
    pub async fn reconcile(&self) -> Result<()> {
        let active = self.engine.store().list_active_tenants().await?;
        let mut registry = self.registry.lock().await;

        let active_ids: std::collections::HashSet<i64> = active.iter().map(|t| t.id).collect();

        // Stop sessions whose tenant went away or deactivated.
        let stale: Vec<i64> = registry
            .keys()
            .copied()
            .filter(|id| !active_ids.contains(id))
            .collect();
        for id in stale {
            if let Some(mut handle) = registry.remove(&id) {
                handle.state = SessionState::Stopping;
                let _ = handle.shutdown.send(true);
                handle.join.abort();
                info!(tenant_id = id, "Session stopped (tenant deactivated)");
            }
        }

        for tenant in active {
            let respawn = match registry.get_mut(&tenant.id) {
                Some(handle) if handle.join.is_finished() => {
                    handle.state = SessionState::Crashed;
                    warn!(tenant_id = tenant.id, "Session task exited, restarting");
                    true
                }
                Some(handle) if handle.bot_token != tenant.bot_token => {
                    // Token rotation: the old token can't poll anymore.
                    info!(tenant_id = tenant.id, "Bot token changed, restarting session");
                    let _ = handle.shutdown.send(true);
                    handle.join.abort();
                    true
                }
                Some(handle) => {
                    handle.state = SessionState::Running;
                    false
                }
                None => true,
            };
            if respawn {
                let handle = self.spawn_session(&tenant);
                registry.insert(tenant.id, handle);
            }
        }
        Ok(())
    }

    fn spawn_session(&self, tenant: &Tenant) -> SessionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = TenantSession::new(
            tenant.id,
            &tenant.bot_token,
            self.engine.clone(),
            self.client.clone(),
            self.public_url.clone(),
            self.poll_timeout_secs,
            shutdown_rx,
        );
        let join = tokio::spawn(session.run());
        info!(tenant_id = tenant.id, "Session spawned");
        SessionHandle {
            state: SessionState::Starting,
            bot_token: tenant.bot_token.clone(),
            join,
            shutdown: shutdown_tx,
        }
    }

    /// Stop a tenant's session and, if the tenant is still active, spawn a
    /// fresh one immediately. Returns whether a session is running after.
    pub async fn restart(&self, tenant_id: i64) -> Result<bool> {
        let mut registry = self.registry.lock().await;
        if let Some(mut handle) = registry.remove(&tenant_id) {
            handle.state = SessionState::Stopping;
            let _ = handle.shutdown.send(true);
            handle.join.abort();
        }
        if let Some(tenant) = self.engine.store().get_tenant(tenant_id).await? {
            if tenant.active {
                let handle = self.spawn_session(&tenant);
                registry.insert(tenant_id, handle);
                info!(tenant_id, "Session restarted");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Current lifecycle state of a tenant's session, if one is tracked.
    pub async fn session_state(&self, tenant_id: i64) -> Option<SessionState> {
        self.registry.lock().await.get(&tenant_id).map(|h| h.state)
    }

    /// Number of tracked sessions.
    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}
