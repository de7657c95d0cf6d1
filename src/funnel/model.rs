//! Domain types — tenants, per-user funnel state, conversion events, screens.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One independently configured funnel/brand instance.
///
/// Created on onboarding, mutated by its owner through the admin panel,
/// never hard-deleted except by explicit superadmin action (which cascades
/// to all per-user state).
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: i64,
    /// Telegram user id of the tenant owner (admin panel access).
    pub owner_user_id: i64,
    /// Bot API token for this tenant's chat session.
    pub bot_token: String,
    pub bot_username: Option<String>,
    pub active: bool,

    /// Channel the subscription gate checks membership against.
    pub gate_channel_id: Option<i64>,
    pub gate_channel_url: Option<String>,

    /// Affiliate registration link (correlation id is appended per user).
    pub ref_link: Option<String>,
    /// Deposit link (correlation id is appended per user).
    pub deposit_link: Option<String>,
    pub support_url: Option<String>,
    pub miniapp_url: Option<String>,
    pub platinum_miniapp_url: Option<String>,

    /// Shared secret for the postback intake. `None` disables the check;
    /// the admin postback-setup flow provisions one on first open.
    pub webhook_secret: Option<String>,

    pub subscription_required: bool,
    pub deposit_required: bool,
    pub min_deposit: Decimal,
    pub platinum_threshold: Decimal,

    pub created_at: DateTime<Utc>,
}

/// Per-(tenant, user) funnel progress record.
///
/// `registered`, `deposit_confirmed`, and `platinum_tier` are monotonic:
/// once true they are never reset except by explicit admin override.
/// `unlocked_shown`/`platinum_shown` are shown-once gates, set only after
/// the corresponding screen rendered successfully. Subscription status is
/// checked live against the transport and never stored here.
#[derive(Debug, Clone)]
pub struct FunnelState {
    pub tenant_id: i64,
    pub user_id: i64,

    pub registered: bool,
    pub deposit_confirmed: bool,
    pub unlocked_shown: bool,
    pub platinum_tier: bool,
    pub platinum_shown: bool,

    /// Stable per-(tenant,user) token joining postbacks back to this user.
    /// Unique per tenant, immutable once assigned.
    pub correlation_id: String,
    /// External account id reported by the affiliate network, set once.
    pub trader_ref: Option<String>,
    /// Last username seen on an interaction, for the admin user list.
    pub username: Option<String>,

    pub lang: String,
    /// Handle of the last funnel message rendered in this chat, so the
    /// gateway can replace it instead of stacking screens.
    pub last_message_id: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FunnelState {
    /// Fresh state for a user entering the funnel.
    pub fn new(tenant_id: i64, user_id: i64, correlation_id: String, lang: &str) -> Self {
        let now = Utc::now();
        Self {
            tenant_id,
            user_id,
            registered: false,
            deposit_confirmed: false,
            unlocked_shown: false,
            platinum_tier: false,
            platinum_shown: false,
            correlation_id,
            trader_ref: None,
            username: None,
            lang: lang.to_string(),
            last_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Kind of an external conversion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionKind {
    Registration,
    FirstDeposit,
    RepeatDeposit,
}

impl ConversionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionKind::Registration => "registration",
            ConversionKind::FirstDeposit => "first_deposit",
            ConversionKind::RepeatDeposit => "repeat_deposit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registration" => Some(ConversionKind::Registration),
            "first_deposit" => Some(ConversionKind::FirstDeposit),
            "repeat_deposit" => Some(ConversionKind::RepeatDeposit),
            _ => None,
        }
    }

    /// Whether this kind's amount counts toward the credited total.
    pub fn counts_toward_total(&self) -> bool {
        matches!(
            self,
            ConversionKind::FirstDeposit | ConversionKind::RepeatDeposit
        )
    }
}

/// Immutable, append-only record of one postback call.
///
/// Duplicate deliveries are deliberately not deduplicated — each accepted
/// event adds to the credited total (observed upstream behavior). Rejected
/// calls (secret mismatch, unknown correlation) are still appended for
/// audit with `accepted = false` and never credit anything.
#[derive(Debug, Clone)]
pub struct ConversionEvent {
    pub id: Uuid,
    pub tenant_id: i64,
    pub correlation_id: String,
    pub kind: ConversionKind,
    pub amount: Option<Decimal>,
    /// Raw query string of the inbound call, kept for audit.
    pub raw_query: Option<String>,
    pub accepted: bool,
    pub received_at: DateTime<Utc>,
}

impl ConversionEvent {
    pub fn new(
        tenant_id: i64,
        correlation_id: &str,
        kind: ConversionKind,
        amount: Option<Decimal>,
        raw_query: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            correlation_id: correlation_id.to_string(),
            kind,
            amount,
            raw_query,
            accepted: true,
            received_at: Utc::now(),
        }
    }

    /// Mark this event as an audit-only record of a rejected call.
    pub fn rejected(mut self) -> Self {
        self.accepted = false;
        self
    }
}

/// Deposit-gate progress carried by `Screen::Deposit` for template
/// interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositProgress {
    pub needed: Decimal,
    pub paid: Decimal,
    pub remaining: Decimal,
}

/// The single screen a user should see next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Subscribe,
    Register,
    Deposit(DepositProgress),
    PlatinumWelcome,
    Unlocked,
    Menu,
}

impl Screen {
    /// Content-override key for this screen (tenant+lang+screen lookup).
    pub fn key(&self) -> &'static str {
        match self {
            Screen::Subscribe => "subscribe",
            Screen::Register => "register",
            Screen::Deposit(_) => "deposit",
            Screen::PlatinumWelcome => "platinum",
            Screen::Unlocked => "unlocked",
            Screen::Menu => "menu",
        }
    }
}

/// Flags the admin override can force-set or clear, bypassing monotonicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminFlag {
    Registered,
    DepositConfirmed,
    PlatinumTier,
}

impl AdminFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminFlag::Registered => "registered",
            AdminFlag::DepositConfirmed => "deposit_confirmed",
            AdminFlag::PlatinumTier => "platinum_tier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(AdminFlag::Registered),
            "deposit_confirmed" => Some(AdminFlag::DepositConfirmed),
            "platinum_tier" => Some(AdminFlag::PlatinumTier),
            _ => None,
        }
    }
}

/// Per-tenant content override row (external-collaborator KV).
#[derive(Debug, Clone, Default)]
pub struct ContentOverride {
    pub title: Option<String>,
    pub body: Option<String>,
    pub button_text: Option<String>,
    pub photo_file_id: Option<String>,
}
