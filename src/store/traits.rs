//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::DatabaseError;
use crate::funnel::model::{AdminFlag, ContentOverride, ConversionEvent, FunnelState, Tenant};

/// Fields required to onboard a new tenant. Everything else starts from
/// the schema defaults (both gates on, min deposit 10, platinum at 500).
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub owner_user_id: i64,
    pub bot_token: String,
    pub bot_username: Option<String>,
}

/// Backend-agnostic database trait covering tenants, funnel state, the
/// conversion ledger, and content overrides.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tenants ─────────────────────────────────────────────────────

    /// Insert a new tenant, returning its id. An owner or bot token that
    /// is already registered yields `DatabaseError::Constraint`.
    async fn insert_tenant(&self, tenant: &NewTenant) -> Result<i64, DatabaseError>;

    /// Get a tenant by id.
    async fn get_tenant(&self, id: i64) -> Result<Option<Tenant>, DatabaseError>;

    /// All tenants with `active = true` (the supervisor's reconcile set).
    async fn list_active_tenants(&self) -> Result<Vec<Tenant>, DatabaseError>;

    /// Persist every owner-mutable tenant field (gates, thresholds, links,
    /// secret, token, active flag).
    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), DatabaseError>;

    /// Superadmin-only hard delete, cascading to all per-user state and
    /// ledger rows for the tenant.
    async fn delete_tenant(&self, id: i64) -> Result<(), DatabaseError>;

    // ── Funnel state ────────────────────────────────────────────────

    /// Get the state row for a (tenant, user), if it exists.
    async fn get_state(&self, tenant_id: i64, user_id: i64)
    -> Result<Option<FunnelState>, DatabaseError>;

    /// Get the state row, creating it lazily with the given correlation id
    /// on first interaction.
    async fn ensure_state(
        &self,
        tenant_id: i64,
        user_id: i64,
        correlation_id: &str,
    ) -> Result<FunnelState, DatabaseError>;

    /// Reverse lookup: the state row owning a correlation id.
    async fn find_state_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<FunnelState>, DatabaseError>;

    /// Monotonic: set `registered = true` (no-op if already set).
    async fn set_registered(&self, tenant_id: i64, user_id: i64) -> Result<(), DatabaseError>;

    /// Monotonic: set `deposit_confirmed = true`.
    async fn set_deposit_confirmed(&self, tenant_id: i64, user_id: i64)
    -> Result<(), DatabaseError>;

    /// Set the external account ref, only if not already set.
    async fn set_trader_ref_once(
        &self,
        tenant_id: i64,
        user_id: i64,
        trader_ref: &str,
    ) -> Result<(), DatabaseError>;

    /// Record the latest username seen on an interaction.
    async fn set_username(
        &self,
        tenant_id: i64,
        user_id: i64,
        username: &str,
    ) -> Result<(), DatabaseError>;

    /// Platinum upgrade: `platinum_tier = true, platinum_shown = false`
    /// (re-arms the welcome screen).
    async fn grant_platinum(&self, tenant_id: i64, user_id: i64) -> Result<(), DatabaseError>;

    /// Shown-once commit, applied only after a successful render.
    async fn mark_platinum_shown(&self, tenant_id: i64, user_id: i64)
    -> Result<(), DatabaseError>;

    /// Shown-once commit, applied only after a successful render.
    async fn mark_unlocked_shown(&self, tenant_id: i64, user_id: i64)
    -> Result<(), DatabaseError>;

    /// Admin override: force-set or clear a monotonic flag. The sole
    /// mutator allowed to bypass monotonicity; granting platinum this way
    /// also re-arms the welcome screen.
    async fn set_admin_flag(
        &self,
        tenant_id: i64,
        user_id: i64,
        flag: AdminFlag,
        value: bool,
    ) -> Result<(), DatabaseError>;

    /// Set the user's language preference.
    async fn set_lang(
        &self,
        tenant_id: i64,
        user_id: i64,
        lang: &str,
    ) -> Result<(), DatabaseError>;

    /// Track the handle of the last rendered funnel message.
    async fn set_last_message_id(
        &self,
        tenant_id: i64,
        user_id: i64,
        message_id: Option<i64>,
    ) -> Result<(), DatabaseError>;

    /// Admin user lookup by user id, trader ref, or correlation fragment.
    async fn search_states(
        &self,
        tenant_id: i64,
        query: &str,
        limit: u32,
    ) -> Result<Vec<FunnelState>, DatabaseError>;

    // ── Conversion ledger ───────────────────────────────────────────

    /// Append an event. Append-only: events are never mutated or deleted,
    /// and duplicates are not rejected.
    async fn append_event(&self, event: &ConversionEvent) -> Result<(), DatabaseError>;

    /// Sum of accepted deposit-kind amounts for a correlation id (the
    /// credited total). Monotonic over the life of the ledger; audit-only
    /// rejected events never count.
    async fn credited_total(
        &self,
        tenant_id: i64,
        correlation_id: &str,
    ) -> Result<Decimal, DatabaseError>;

    /// All events recorded for a correlation id, oldest first, including
    /// rejected audit rows.
    async fn list_events(
        &self,
        tenant_id: i64,
        correlation_id: &str,
    ) -> Result<Vec<ConversionEvent>, DatabaseError>;

    // ── Content overrides ───────────────────────────────────────────

    /// Fetch the override row for (tenant, lang, screen), if any.
    async fn get_override(
        &self,
        tenant_id: i64,
        lang: &str,
        screen: &str,
    ) -> Result<Option<ContentOverride>, DatabaseError>;

    /// Upsert an override row.
    async fn upsert_override(
        &self,
        tenant_id: i64,
        lang: &str,
        screen: &str,
        ov: &ContentOverride,
    ) -> Result<(), DatabaseError>;
}
