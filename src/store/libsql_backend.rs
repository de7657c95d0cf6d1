//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are stored
//! as RFC 3339 text; money columns are stored as decimal strings so no
//! float ever touches the ledger.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::funnel::model::{
    AdminFlag, ContentOverride, ConversionEvent, ConversionKind, FunnelState, Tenant,
};
use crate::store::migrations;
use crate::store::traits::{Database, NewTenant};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Parse a stored decimal string, defaulting to zero on malformed data.
fn parse_decimal(s: &str) -> Decimal {
    s.parse().unwrap_or_else(|_| {
        warn!(value = s, "Malformed decimal in database, treating as zero");
        Decimal::ZERO
    })
}

const TENANT_COLUMNS: &str = "id, owner_user_id, bot_token, bot_username, active, \
    gate_channel_id, gate_channel_url, ref_link, deposit_link, support_url, \
    miniapp_url, platinum_miniapp_url, webhook_secret, subscription_required, \
    deposit_required, min_deposit, platinum_threshold, created_at";

fn row_to_tenant(row: &Row) -> Result<Tenant, libsql::Error> {
    let min_deposit: String = row.get(15)?;
    let platinum_threshold: String = row.get(16)?;
    let created_str: String = row.get(17)?;
    Ok(Tenant {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        bot_token: row.get(2)?,
        bot_username: row.get(3).ok(),
        active: row.get::<i64>(4)? != 0,
        gate_channel_id: row.get(5).ok(),
        gate_channel_url: row.get(6).ok(),
        ref_link: row.get(7).ok(),
        deposit_link: row.get(8).ok(),
        support_url: row.get(9).ok(),
        miniapp_url: row.get(10).ok(),
        platinum_miniapp_url: row.get(11).ok(),
        webhook_secret: row.get(12).ok(),
        subscription_required: row.get::<i64>(13)? != 0,
        deposit_required: row.get::<i64>(14)? != 0,
        min_deposit: parse_decimal(&min_deposit),
        platinum_threshold: parse_decimal(&platinum_threshold),
        created_at: parse_datetime(&created_str),
    })
}

const STATE_COLUMNS: &str = "tenant_id, user_id, registered, deposit_confirmed, \
    unlocked_shown, platinum_tier, platinum_shown, correlation_id, trader_ref, \
    username, lang, last_message_id, created_at, updated_at";

fn row_to_state(row: &Row) -> Result<FunnelState, libsql::Error> {
    let created_str: String = row.get(12)?;
    let updated_str: String = row.get(13)?;
    Ok(FunnelState {
        tenant_id: row.get(0)?,
        user_id: row.get(1)?,
        registered: row.get::<i64>(2)? != 0,
        deposit_confirmed: row.get::<i64>(3)? != 0,
        unlocked_shown: row.get::<i64>(4)? != 0,
        platinum_tier: row.get::<i64>(5)? != 0,
        platinum_shown: row.get::<i64>(6)? != 0,
        correlation_id: row.get(7)?,
        trader_ref: row.get(8).ok(),
        username: row.get(9).ok(),
        lang: row.get(10)?,
        last_message_id: row.get(11).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Database trait implementation ───────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tenants ─────────────────────────────────────────────────────

    async fn insert_tenant(&self, tenant: &NewTenant) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tenants (owner_user_id, bot_token, bot_username, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                tenant.owner_user_id,
                tenant.bot_token.as_str(),
                tenant.bot_username.as_deref(),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("UNIQUE") {
                DatabaseError::Constraint(format!("insert_tenant: {msg}"))
            } else {
                DatabaseError::Query(format!("insert_tenant: {msg}"))
            }
        })?;

        let id = conn.last_insert_rowid();
        debug!(tenant_id = id, "Tenant inserted");
        Ok(id)
    }

    async fn get_tenant(&self, id: i64) -> Result<Option<Tenant>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tenant: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_tenant(&row).map_err(|e| {
                DatabaseError::Query(format!("get_tenant row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_tenant: {e}"))),
        }
    }

    async fn list_active_tenants(&self) -> Result<Vec<Tenant>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE active = 1 ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_tenants: {e}")))?;

        let mut tenants = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tenants.push(row_to_tenant(&row).map_err(|e| {
                DatabaseError::Query(format!("list_active_tenants row parse: {e}"))
            })?);
        }
        Ok(tenants)
    }

    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tenants SET bot_token = ?1, bot_username = ?2, active = ?3, \
                 gate_channel_id = ?4, gate_channel_url = ?5, ref_link = ?6, \
                 deposit_link = ?7, support_url = ?8, miniapp_url = ?9, \
                 platinum_miniapp_url = ?10, webhook_secret = ?11, \
                 subscription_required = ?12, deposit_required = ?13, \
                 min_deposit = ?14, platinum_threshold = ?15 WHERE id = ?16",
                params![
                    tenant.bot_token.as_str(),
                    tenant.bot_username.as_deref(),
                    tenant.active as i64,
                    tenant.gate_channel_id,
                    tenant.gate_channel_url.as_deref(),
                    tenant.ref_link.as_deref(),
                    tenant.deposit_link.as_deref(),
                    tenant.support_url.as_deref(),
                    tenant.miniapp_url.as_deref(),
                    tenant.platinum_miniapp_url.as_deref(),
                    tenant.webhook_secret.as_deref(),
                    tenant.subscription_required as i64,
                    tenant.deposit_required as i64,
                    tenant.min_deposit.to_string(),
                    tenant.platinum_threshold.to_string(),
                    tenant.id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_tenant: {e}")))?;
        Ok(())
    }

    async fn delete_tenant(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        for sql in [
            "DELETE FROM conversion_events WHERE tenant_id = ?1",
            "DELETE FROM funnel_state WHERE tenant_id = ?1",
            "DELETE FROM content_overrides WHERE tenant_id = ?1",
            "DELETE FROM tenants WHERE id = ?1",
        ] {
            conn.execute(sql, params![id])
                .await
                .map_err(|e| DatabaseError::Query(format!("delete_tenant: {e}")))?;
        }
        info!(tenant_id = id, "Tenant deleted with cascade");
        Ok(())
    }

    // ── Funnel state ────────────────────────────────────────────────

    async fn get_state(
        &self,
        tenant_id: i64,
        user_id: i64,
    ) -> Result<Option<FunnelState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM funnel_state \
                     WHERE tenant_id = ?1 AND user_id = ?2"
                ),
                params![tenant_id, user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_state(&row).map_err(|e| {
                DatabaseError::Query(format!("get_state row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_state: {e}"))),
        }
    }

    async fn ensure_state(
        &self,
        tenant_id: i64,
        user_id: i64,
        correlation_id: &str,
    ) -> Result<FunnelState, DatabaseError> {
        if let Some(state) = self.get_state(tenant_id, user_id).await? {
            return Ok(state);
        }

        let now = Utc::now().to_rfc3339();
        // OR IGNORE: a concurrent creator winning the race is fine, we
        // re-read below either way.
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO funnel_state \
                 (tenant_id, user_id, correlation_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![tenant_id, user_id, correlation_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_state insert: {e}")))?;

        self.get_state(tenant_id, user_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "funnel_state".to_string(),
                id: format!("{tenant_id}/{user_id}"),
            })
    }

    async fn find_state_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<FunnelState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {STATE_COLUMNS} FROM funnel_state WHERE correlation_id = ?1"),
                params![correlation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_state_by_correlation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_state(&row).map_err(|e| {
                DatabaseError::Query(format!("find_state_by_correlation row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_state_by_correlation: {e}"
            ))),
        }
    }

    async fn set_registered(&self, tenant_id: i64, user_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE funnel_state SET registered = 1, updated_at = ?3 \
                 WHERE tenant_id = ?1 AND user_id = ?2",
                params![tenant_id, user_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_registered: {e}")))?;
        Ok(())
    }

    async fn set_deposit_confirmed(
        &self,
        tenant_id: i64,
        user_id: i64,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE funnel_state SET deposit_confirmed = 1, updated_at = ?3 \
                 WHERE tenant_id = ?1 AND user_id = ?2",
                params![tenant_id, user_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_deposit_confirmed: {e}")))?;
        Ok(())
    }

    async fn set_trader_ref_once(
        &self,
        tenant_id: i64,
        user_id: i64,
        trader_ref: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE funnel_state SET trader_ref = ?3, updated_at = ?4 \
                 WHERE tenant_id = ?1 AND user_id = ?2 AND trader_ref IS NULL",
                params![tenant_id, user_id, trader_ref, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_trader_ref_once: {e}")))?;
        Ok(())
    }

    async fn set_username(
        &self,
        tenant_id: i64,
        user_id: i64,
        username: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE funnel_state SET username = ?3, updated_at = ?4 \
                 WHERE tenant_id = ?1 AND user_id = ?2",
                params![tenant_id, user_id, username, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_username: {e}")))?;
        Ok(())
    }

    async fn grant_platinum(&self, tenant_id: i64, user_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE funnel_state SET platinum_tier = 1, platinum_shown = 0, updated_at = ?3 \
                 WHERE tenant_id = ?1 AND user_id = ?2",
                params![tenant_id, user_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("grant_platinum: {e}")))?;
        Ok(())
    }

    async fn mark_platinum_shown(
        &self,
        tenant_id: i64,
        user_id: i64,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE funnel_state SET platinum_shown = 1, updated_at = ?3 \
                 WHERE tenant_id = ?1 AND user_id = ?2",
                params![tenant_id, user_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_platinum_shown: {e}")))?;
        Ok(())
    }

    async fn mark_unlocked_shown(
        &self,
        tenant_id: i64,
        user_id: i64,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE funnel_state SET unlocked_shown = 1, updated_at = ?3 \
                 WHERE tenant_id = ?1 AND user_id = ?2",
                params![tenant_id, user_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_unlocked_shown: {e}")))?;
        Ok(())
    }

    async fn set_admin_flag(
        &self,
        tenant_id: i64,
        user_id: i64,
        flag: AdminFlag,
        value: bool,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let sql = match (flag, value) {
            // Granting the tier re-arms the welcome screen, same as the
            // resolver's upgrade path.
            (AdminFlag::PlatinumTier, true) => {
                "UPDATE funnel_state SET platinum_tier = 1, platinum_shown = 0, updated_at = ?3 \
                 WHERE tenant_id = ?1 AND user_id = ?2"
                    .to_string()
            }
            (AdminFlag::PlatinumTier, false) => {
                "UPDATE funnel_state SET platinum_tier = 0, updated_at = ?3 \
                 WHERE tenant_id = ?1 AND user_id = ?2"
                    .to_string()
            }
            (flag, value) => format!(
                "UPDATE funnel_state SET {} = {}, updated_at = ?3 \
                 WHERE tenant_id = ?1 AND user_id = ?2",
                flag.as_str(),
                value as i64
            ),
        };
        self.conn()
            .execute(&sql, params![tenant_id, user_id, now])
            .await
            .map_err(|e| DatabaseError::Query(format!("set_admin_flag: {e}")))?;

        info!(
            tenant_id,
            user_id,
            flag = flag.as_str(),
            value,
            "Admin override applied"
        );
        Ok(())
    }

    async fn set_lang(
        &self,
        tenant_id: i64,
        user_id: i64,
        lang: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE funnel_state SET lang = ?3, updated_at = ?4 \
                 WHERE tenant_id = ?1 AND user_id = ?2",
                params![tenant_id, user_id, lang, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_lang: {e}")))?;
        Ok(())
    }

    async fn set_last_message_id(
        &self,
        tenant_id: i64,
        user_id: i64,
        message_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE funnel_state SET last_message_id = ?3, updated_at = ?4 \
                 WHERE tenant_id = ?1 AND user_id = ?2",
                params![tenant_id, user_id, message_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_last_message_id: {e}")))?;
        Ok(())
    }

    async fn search_states(
        &self,
        tenant_id: i64,
        query: &str,
        limit: u32,
    ) -> Result<Vec<FunnelState>, DatabaseError> {
        let pattern = format!("%{query}%");
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STATE_COLUMNS} FROM funnel_state WHERE tenant_id = ?1 AND \
                     (CAST(user_id AS TEXT) LIKE ?2 OR trader_ref LIKE ?2 \
                      OR correlation_id LIKE ?2 OR username LIKE ?2) \
                     ORDER BY user_id LIMIT ?3"
                ),
                params![tenant_id, pattern, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("search_states: {e}")))?;

        let mut states = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            states.push(
                row_to_state(&row)
                    .map_err(|e| DatabaseError::Query(format!("search_states row parse: {e}")))?,
            );
        }
        Ok(states)
    }

    // ── Conversion ledger ───────────────────────────────────────────

    async fn append_event(&self, event: &ConversionEvent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO conversion_events \
                 (id, tenant_id, correlation_id, kind, amount, raw_query, accepted, received_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.id.to_string(),
                    event.tenant_id,
                    event.correlation_id.as_str(),
                    event.kind.as_str(),
                    event.amount.map(|a| a.to_string()),
                    event.raw_query.as_deref(),
                    event.accepted as i64,
                    event.received_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;

        debug!(
            tenant_id = event.tenant_id,
            correlation_id = %event.correlation_id,
            kind = event.kind.as_str(),
            accepted = event.accepted,
            "Conversion event appended"
        );
        Ok(())
    }

    async fn credited_total(
        &self,
        tenant_id: i64,
        correlation_id: &str,
    ) -> Result<Decimal, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT amount FROM conversion_events \
                 WHERE tenant_id = ?1 AND correlation_id = ?2 \
                 AND kind IN (?3, ?4) AND amount IS NOT NULL AND accepted = 1",
                params![
                    tenant_id,
                    correlation_id,
                    ConversionKind::FirstDeposit.as_str(),
                    ConversionKind::RepeatDeposit.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("credited_total: {e}")))?;

        // Summed in Decimal on the way out; SQLite would sum in floats.
        let mut total = Decimal::ZERO;
        while let Ok(Some(row)) = rows.next().await {
            let amount: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("credited_total row parse: {e}")))?;
            total += parse_decimal(&amount);
        }
        Ok(total)
    }

    async fn list_events(
        &self,
        tenant_id: i64,
        correlation_id: &str,
    ) -> Result<Vec<ConversionEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, kind, amount, raw_query, accepted, received_at \
                 FROM conversion_events \
                 WHERE tenant_id = ?1 AND correlation_id = ?2 \
                 ORDER BY received_at, id",
                params![tenant_id, correlation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list_events row parse: {e}")))?;
            let kind: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("list_events row parse: {e}")))?;
            let received_str: String = row
                .get(5)
                .map_err(|e| DatabaseError::Query(format!("list_events row parse: {e}")))?;
            events.push(ConversionEvent {
                id: uuid::Uuid::parse_str(&id)
                    .map_err(|e| DatabaseError::Query(format!("list_events bad uuid: {e}")))?,
                tenant_id,
                correlation_id: correlation_id.to_string(),
                kind: ConversionKind::parse(&kind).ok_or_else(|| {
                    DatabaseError::Query(format!("list_events unknown kind: {kind}"))
                })?,
                amount: row.get::<String>(2).ok().map(|a| parse_decimal(&a)),
                raw_query: row.get(3).ok(),
                accepted: row
                    .get::<i64>(4)
                    .map_err(|e| DatabaseError::Query(format!("list_events row parse: {e}")))?
                    != 0,
                received_at: parse_datetime(&received_str),
            });
        }
        Ok(events)
    }

    // ── Content overrides ───────────────────────────────────────────

    async fn get_override(
        &self,
        tenant_id: i64,
        lang: &str,
        screen: &str,
    ) -> Result<Option<ContentOverride>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT title, body, button_text, photo_file_id FROM content_overrides \
                 WHERE tenant_id = ?1 AND lang = ?2 AND screen = ?3",
                params![tenant_id, lang, screen],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_override: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(ContentOverride {
                title: row.get(0).ok(),
                body: row.get(1).ok(),
                button_text: row.get(2).ok(),
                photo_file_id: row.get(3).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_override: {e}"))),
        }
    }

    async fn upsert_override(
        &self,
        tenant_id: i64,
        lang: &str,
        screen: &str,
        ov: &ContentOverride,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO content_overrides \
                 (tenant_id, lang, screen, title, body, button_text, photo_file_id, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
                 ON CONFLICT (tenant_id, lang, screen) DO UPDATE SET \
                 title = excluded.title, body = excluded.body, \
                 button_text = excluded.button_text, \
                 photo_file_id = excluded.photo_file_id, updated_at = excluded.updated_at",
                params![
                    tenant_id,
                    lang,
                    screen,
                    ov.title.as_deref(),
                    ov.body.as_deref(),
                    ov.button_text.as_deref(),
                    ov.photo_file_id.as_deref(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_override: {e}")))?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    async fn db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn seed_tenant(db: &LibSqlBackend) -> i64 {
        db.insert_tenant(&NewTenant {
            owner_user_id: 9000,
            bot_token: "123:ABC".into(),
            bot_username: Some("test_bot".into()),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn tenant_defaults_both_gates_on() {
        let db = db().await;
        let id = seed_tenant(&db).await;
        let t = db.get_tenant(id).await.unwrap().unwrap();
        assert!(t.active);
        assert!(t.subscription_required);
        assert!(t.deposit_required);
        assert_eq!(t.min_deposit, dec!(10));
        assert_eq!(t.platinum_threshold, dec!(500));
        assert!(t.webhook_secret.is_none());
    }

    #[tokio::test]
    async fn update_tenant_round_trips() {
        let db = db().await;
        let id = seed_tenant(&db).await;
        let mut t = db.get_tenant(id).await.unwrap().unwrap();
        t.subscription_required = false;
        t.min_deposit = dec!(25.50);
        t.webhook_secret = Some("s3cret".into());
        t.ref_link = Some("https://broker.example/r".into());
        db.update_tenant(&t).await.unwrap();

        let t = db.get_tenant(id).await.unwrap().unwrap();
        assert!(!t.subscription_required);
        assert_eq!(t.min_deposit, dec!(25.50));
        assert_eq!(t.webhook_secret.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn inactive_tenants_excluded_from_reconcile_set() {
        let db = db().await;
        let id = seed_tenant(&db).await;
        assert_eq!(db.list_active_tenants().await.unwrap().len(), 1);

        let mut t = db.get_tenant(id).await.unwrap().unwrap();
        t.active = false;
        db.update_tenant(&t).await.unwrap();
        assert!(db.list_active_tenants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ensure_state_is_lazy_and_idempotent() {
        let db = db().await;
        let tid = seed_tenant(&db).await;
        assert!(db.get_state(tid, 42).await.unwrap().is_none());

        let a = db.ensure_state(tid, 42, "1-abc").await.unwrap();
        let b = db.ensure_state(tid, 42, "1-IGNORED").await.unwrap();
        assert_eq!(a.correlation_id, "1-abc");
        // Second call must not reassign the correlation id.
        assert_eq!(b.correlation_id, "1-abc");
        assert!(!b.registered);
    }

    #[tokio::test]
    async fn correlation_reverse_lookup() {
        let db = db().await;
        let tid = seed_tenant(&db).await;
        db.ensure_state(tid, 42, "1-abc").await.unwrap();

        let found = db.find_state_by_correlation("1-abc").await.unwrap().unwrap();
        assert_eq!(found.user_id, 42);
        assert!(db.find_state_by_correlation("1-zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn monotonic_setters() {
        let db = db().await;
        let tid = seed_tenant(&db).await;
        db.ensure_state(tid, 42, "1-abc").await.unwrap();

        db.set_registered(tid, 42).await.unwrap();
        db.set_registered(tid, 42).await.unwrap(); // no-op repeat
        db.set_deposit_confirmed(tid, 42).await.unwrap();
        let s = db.get_state(tid, 42).await.unwrap().unwrap();
        assert!(s.registered);
        assert!(s.deposit_confirmed);
    }

    #[tokio::test]
    async fn trader_ref_set_once() {
        let db = db().await;
        let tid = seed_tenant(&db).await;
        db.ensure_state(tid, 42, "1-abc").await.unwrap();

        db.set_trader_ref_once(tid, 42, "TR-1").await.unwrap();
        db.set_trader_ref_once(tid, 42, "TR-2").await.unwrap();
        let s = db.get_state(tid, 42).await.unwrap().unwrap();
        assert_eq!(s.trader_ref.as_deref(), Some("TR-1"));
    }

    #[tokio::test]
    async fn grant_platinum_rearms_welcome() {
        let db = db().await;
        let tid = seed_tenant(&db).await;
        db.ensure_state(tid, 42, "1-abc").await.unwrap();
        db.mark_platinum_shown(tid, 42).await.unwrap();

        db.grant_platinum(tid, 42).await.unwrap();
        let s = db.get_state(tid, 42).await.unwrap().unwrap();
        assert!(s.platinum_tier);
        assert!(!s.platinum_shown);
    }

    #[tokio::test]
    async fn admin_flag_can_clear_monotonic_fields() {
        let db = db().await;
        let tid = seed_tenant(&db).await;
        db.ensure_state(tid, 42, "1-abc").await.unwrap();
        db.set_registered(tid, 42).await.unwrap();

        db.set_admin_flag(tid, 42, AdminFlag::Registered, false)
            .await
            .unwrap();
        let s = db.get_state(tid, 42).await.unwrap().unwrap();
        assert!(!s.registered);

        db.set_admin_flag(tid, 42, AdminFlag::PlatinumTier, true)
            .await
            .unwrap();
        let s = db.get_state(tid, 42).await.unwrap().unwrap();
        assert!(s.platinum_tier);
        assert!(!s.platinum_shown);
    }

    #[tokio::test]
    async fn credited_total_sums_deposit_kinds_only() {
        let db = db().await;
        let tid = seed_tenant(&db).await;

        db.append_event(&ConversionEvent::new(
            tid,
            "1-abc",
            ConversionKind::Registration,
            None,
            None,
        ))
        .await
        .unwrap();
        db.append_event(&ConversionEvent::new(
            tid,
            "1-abc",
            ConversionKind::FirstDeposit,
            Some(dec!(7)),
            None,
        ))
        .await
        .unwrap();
        db.append_event(&ConversionEvent::new(
            tid,
            "1-abc",
            ConversionKind::RepeatDeposit,
            Some(dec!(5.25)),
            None,
        ))
        .await
        .unwrap();

        assert_eq!(db.credited_total(tid, "1-abc").await.unwrap(), dec!(12.25));
        assert_eq!(db.credited_total(tid, "1-zzz").await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn duplicate_tenant_is_a_constraint_error() {
        let db = db().await;
        seed_tenant(&db).await;
        let err = db
            .insert_tenant(&NewTenant {
                owner_user_id: 9000,
                bot_token: "999:ZZZ".into(),
                bot_username: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn rejected_events_are_kept_but_never_credit() {
        let db = db().await;
        let tid = seed_tenant(&db).await;

        db.append_event(&ConversionEvent::new(
            tid,
            "1-abc",
            ConversionKind::FirstDeposit,
            Some(dec!(10)),
            None,
        ))
        .await
        .unwrap();
        db.append_event(
            &ConversionEvent::new(
                tid,
                "1-abc",
                ConversionKind::FirstDeposit,
                Some(dec!(999)),
                Some("secret=wrong".into()),
            )
            .rejected(),
        )
        .await
        .unwrap();

        assert_eq!(db.credited_total(tid, "1-abc").await.unwrap(), dec!(10));

        let events = db.list_events(tid, "1-abc").await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].accepted);
        assert!(!events[1].accepted);
        assert_eq!(events[1].amount, Some(dec!(999)));
        assert_eq!(events[1].raw_query.as_deref(), Some("secret=wrong"));
    }

    #[tokio::test]
    async fn duplicate_events_both_count() {
        // Replayed webhooks are not deduplicated — each accepted event
        // adds to the sum.
        let db = db().await;
        let tid = seed_tenant(&db).await;
        for _ in 0..2 {
            db.append_event(&ConversionEvent::new(
                tid,
                "1-abc",
                ConversionKind::FirstDeposit,
                Some(dec!(10)),
                None,
            ))
            .await
            .unwrap();
        }
        assert_eq!(db.credited_total(tid, "1-abc").await.unwrap(), dec!(20));
    }

    #[tokio::test]
    async fn delete_tenant_cascades() {
        let db = db().await;
        let tid = seed_tenant(&db).await;
        db.ensure_state(tid, 42, "1-abc").await.unwrap();
        db.append_event(&ConversionEvent::new(
            tid,
            "1-abc",
            ConversionKind::FirstDeposit,
            Some(dec!(10)),
            None,
        ))
        .await
        .unwrap();

        db.delete_tenant(tid).await.unwrap();
        assert!(db.get_tenant(tid).await.unwrap().is_none());
        assert!(db.get_state(tid, 42).await.unwrap().is_none());
        assert_eq!(db.credited_total(tid, "1-abc").await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn search_states_matches_multiple_fields() {
        let db = db().await;
        let tid = seed_tenant(&db).await;
        db.ensure_state(tid, 1001, "1-aaa111").await.unwrap();
        db.ensure_state(tid, 1002, "1-bbb222").await.unwrap();
        db.set_trader_ref_once(tid, 1002, "TR-777").await.unwrap();
        db.set_username(tid, 1001, "alice").await.unwrap();

        let by_id = db.search_states(tid, "1001", 10).await.unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].user_id, 1001);

        let by_ref = db.search_states(tid, "TR-777", 10).await.unwrap();
        assert_eq!(by_ref.len(), 1);
        assert_eq!(by_ref[0].user_id, 1002);

        let by_corr = db.search_states(tid, "bbb", 10).await.unwrap();
        assert_eq!(by_corr.len(), 1);

        let by_name = db.search_states(tid, "alice", 10).await.unwrap();
        assert_eq!(by_name.len(), 1);
    }

    #[tokio::test]
    async fn override_upsert_and_fetch() {
        let db = db().await;
        let tid = seed_tenant(&db).await;
        assert!(db.get_override(tid, "en", "menu").await.unwrap().is_none());

        db.upsert_override(
            tid,
            "en",
            "menu",
            &ContentOverride {
                title: Some("Custom menu".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        db.upsert_override(
            tid,
            "en",
            "menu",
            &ContentOverride {
                title: Some("Custom menu v2".into()),
                button_text: Some("Go".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let ov = db.get_override(tid, "en", "menu").await.unwrap().unwrap();
        assert_eq!(ov.title.as_deref(), Some("Custom menu v2"));
        assert_eq!(ov.button_text.as_deref(), Some("Go"));
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = db().await;
        db.run_migrations().await.unwrap();
        db.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn open_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("funnel.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(db);
    }
}
