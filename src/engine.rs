//! Funnel engine — serializes per-user work, resolves the next screen,
//! and applies the ledger-then-state-then-push conversion pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::funnel::correlation;
use crate::funnel::model::{AdminFlag, ConversionEvent, ConversionKind, Screen};
use crate::funnel::resolver::{self, ResolveInput};
use crate::gateway;
use crate::store::Database;
use crate::telegram::{ChatTransport, TransportFactory};

/// What caused a screen evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// User interaction (command, callback). Menu renders normally.
    Interaction,
    /// Conversion intake push. Menu is a no-op: a user already in the
    /// steady state gets no message from a repeat postback.
    Conversion,
}

/// Outcome of one conversion intake, as seen by the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Event recorded. `pushed` is false when the follow-up screen push
    /// failed; the ledger write stands regardless.
    Accepted { pushed: bool },
    /// No funnel state owns this correlation id (or the tenant hint
    /// contradicts the one that does). An audit row is still recorded.
    UnknownCorrelation,
    /// Tenant has a shared secret configured and the call didn't match.
    /// An audit row is still recorded.
    BadSecret { tenant_id: i64 },
}

/// A postback as parsed by the intake surface.
#[derive(Debug, Clone)]
pub struct Postback {
    pub correlation_id: String,
    pub kind: ConversionKind,
    pub amount: Option<Decimal>,
    pub secret: Option<String>,
    /// Tenant id claimed by the caller (`tid`). Cross-checked against the
    /// tenant that owns the correlation id.
    pub tenant_hint: Option<i64>,
    pub trader_ref: Option<String>,
    pub raw_query: Option<String>,
}

/// Shared engine: one per process, used by every session and the intake
/// router.
pub struct FunnelEngine {
    store: Arc<dyn Database>,
    factory: Arc<dyn TransportFactory>,
    salt: SecretString,
    runtime: RuntimeConfig,
    // Per-(tenant, user) serialization. Lock entries are created lazily
    // and never removed; the set of active users is small enough.
    locks: Mutex<HashMap<(i64, i64), Arc<tokio::sync::Mutex<()>>>>,
}

impl FunnelEngine {
    pub fn new(
        store: Arc<dyn Database>,
        factory: Arc<dyn TransportFactory>,
        salt: SecretString,
        runtime: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            factory,
            salt,
            runtime,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    pub fn correlation_id(&self, tenant_id: i64, user_id: i64) -> String {
        correlation::derive_id(&self.salt, tenant_id, user_id)
    }

    fn user_lock(&self, tenant_id: i64, user_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((tenant_id, user_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Evaluate and deliver the next screen for a user.
    ///
    /// The whole snapshot-resolve-render-commit cycle runs under the
    /// per-user lock, so concurrent triggers (a postback racing a button
    /// press) serialize instead of double-rendering a shown-once screen.
    pub async fn show_next_screen(
        &self,
        transport: &dyn ChatTransport,
        tenant_id: i64,
        user_id: i64,
        trigger: Trigger,
    ) -> Result<()> {
        let lock = self.user_lock(tenant_id, user_id);
        let _guard = lock.lock().await;

        let Some(tenant) = self.store.get_tenant(tenant_id).await? else {
            warn!(tenant_id, "Screen evaluation for unknown tenant");
            return Ok(());
        };

        let correlation_id = self.correlation_id(tenant_id, user_id);
        let mut state = self
            .store
            .ensure_state(tenant_id, user_id, &correlation_id)
            .await?;

        // Membership is checked live, and only when the gate is on.
        let is_member = if tenant.subscription_required {
            match tenant.gate_channel_id {
                Some(channel_id) => transport
                    .is_channel_member(channel_id, user_id)
                    .await
                    .unwrap_or(false),
                // Gate on but no channel configured: don't lock everyone out.
                None => true,
            }
        } else {
            true
        };

        let credited = self.store.credited_total(tenant_id, &correlation_id).await?;

        let resolution = resolver::resolve(&ResolveInput {
            tenant: &tenant,
            state: &state,
            is_member,
            credited,
        });

        // The upgrade itself commits before the render; the welcome screen
        // only marks itself shown after it actually went out.
        if resolution.delta.grant_platinum {
            self.store.grant_platinum(tenant_id, user_id).await?;
            state.platinum_tier = true;
            state.platinum_shown = false;
            info!(tenant_id, user_id, "Platinum tier granted");
        }

        if resolution.screen == Screen::Menu && trigger == Trigger::Conversion {
            // Steady state: repeat postbacks don't message the user.
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match gateway::deliver(transport, &self.store, &tenant, &state, &resolution.screen)
                .await
            {
                Ok(()) => break,
                Err(e) if attempt < self.runtime.render_attempts => {
                    warn!(
                        tenant_id,
                        user_id,
                        attempt,
                        error = %e,
                        "Screen delivery failed, retrying"
                    );
                    tokio::time::sleep(self.runtime.render_backoff).await;
                }
                Err(e) => {
                    // Shown-once marks stay unset so the next trigger
                    // re-offers the screen.
                    warn!(tenant_id, user_id, error = %e, "Screen delivery failed");
                    return Err(e);
                }
            }
        }

        if resolution.delta.mark_platinum_shown {
            self.store.mark_platinum_shown(tenant_id, user_id).await?;
        }
        if resolution.delta.mark_unlocked_shown {
            self.store.mark_unlocked_shown(tenant_id, user_id).await?;
        }
        Ok(())
    }

    /// Audit trail for a rejected postback. Tenant attribution falls back
    /// from the known owner to the caller's hint to the correlation id's
    /// cleartext prefix; 0 marks completely unattributable calls.
    async fn audit_rejected(
        &self,
        postback: &Postback,
        known_tenant: Option<i64>,
    ) -> Result<()> {
        let tenant_id = known_tenant
            .or(postback.tenant_hint)
            .or_else(|| correlation::tenant_prefix(&postback.correlation_id))
            .unwrap_or(0);
        let event = ConversionEvent::new(
            tenant_id,
            &postback.correlation_id,
            postback.kind,
            postback.amount,
            postback.raw_query.clone(),
        )
        .rejected();
        self.store.append_event(&event).await?;
        Ok(())
    }

    /// Conversion intake pipeline: ledger append, then state mutation,
    /// then push. The ledger write is never rolled back by later failures.
    /// Rejected calls still leave an audit row, marked not-accepted so
    /// they never credit.
    pub async fn ingest(&self, postback: Postback) -> Result<IngestOutcome> {
        let Some(state) = self
            .store
            .find_state_by_correlation(&postback.correlation_id)
            .await?
        else {
            info!(
                correlation_id = %postback.correlation_id,
                kind = postback.kind.as_str(),
                "Postback for unknown correlation id"
            );
            self.audit_rejected(&postback, None).await?;
            return Ok(IngestOutcome::UnknownCorrelation);
        };

        let tenant_id = state.tenant_id;
        let user_id = state.user_id;

        if let Some(hint) = postback.tenant_hint {
            if hint != tenant_id {
                warn!(
                    tenant_id,
                    hint,
                    correlation_id = %postback.correlation_id,
                    "Postback tenant hint contradicts correlation owner"
                );
                self.audit_rejected(&postback, Some(tenant_id)).await?;
                return Ok(IngestOutcome::UnknownCorrelation);
            }
        }

        let Some(tenant) = self.store.get_tenant(tenant_id).await? else {
            self.audit_rejected(&postback, Some(tenant_id)).await?;
            return Ok(IngestOutcome::UnknownCorrelation);
        };

        // A configured secret must match; no secret means no check.
        if let Some(expected) = tenant.webhook_secret.as_deref() {
            if postback.secret.as_deref() != Some(expected) {
                warn!(tenant_id, kind = postback.kind.as_str(), "Postback secret mismatch");
                self.audit_rejected(&postback, Some(tenant_id)).await?;
                return Ok(IngestOutcome::BadSecret { tenant_id });
            }
        }

        let event = ConversionEvent::new(
            tenant_id,
            &postback.correlation_id,
            postback.kind,
            postback.amount,
            postback.raw_query,
        );
        self.store.append_event(&event).await?;

        match postback.kind {
            ConversionKind::Registration => {
                self.store.set_registered(tenant_id, user_id).await?;
            }
            ConversionKind::FirstDeposit => {
                self.store.set_deposit_confirmed(tenant_id, user_id).await?;
            }
            ConversionKind::RepeatDeposit => {}
        }
        if let Some(trader_ref) = postback.trader_ref.as_deref() {
            self.store
                .set_trader_ref_once(tenant_id, user_id, trader_ref)
                .await?;
        }

        info!(
            tenant_id,
            user_id,
            kind = postback.kind.as_str(),
            amount = ?postback.amount,
            "Conversion recorded"
        );

        // Push the follow-up screen. The event is already durable; a
        // transport failure downgrades the outcome, nothing more.
        let transport = self.factory.transport_for(&tenant.bot_token);
        let pushed = match self
            .show_next_screen(transport.as_ref(), tenant_id, user_id, Trigger::Conversion)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(tenant_id, user_id, error = %e, "Post-conversion push failed");
                false
            }
        };

        Ok(IngestOutcome::Accepted { pushed })
    }

    /// Admin override of a monotonic flag. Always audited.
    pub async fn admin_override(
        &self,
        tenant_id: i64,
        user_id: i64,
        flag: AdminFlag,
        value: bool,
    ) -> Result<()> {
        self.store
            .set_admin_flag(tenant_id, user_id, flag, value)
            .await?;
        Ok(())
    }
}
