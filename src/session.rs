//! Per-tenant chat session — the long-poll loop, funnel command handlers,
//! and the owner admin panel.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::{FunnelEngine, Trigger};
use crate::error::Result;
use crate::funnel::model::{AdminFlag, FunnelState, Tenant};
use crate::screens;
use crate::telegram::{
    CallbackQuery, ChatTransport, InlineButton, InlineKeyboard, Message, TelegramApi, Update,
};

const SEARCH_LIMIT: u32 = 8;
const SECRET_LEN: usize = 24;

/// Input the admin panel is waiting for from a specific admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminPrompt {
    MinDeposit,
    PlatinumThreshold,
    RefLink,
    DepositLink,
    SupportUrl,
    GateChannel,
    FindUser,
}

/// One running tenant session. Owns the update loop for a single bot
/// token; all per-admin conversational state lives here, so two tenants
/// (or a restart) can never bleed prompts into each other.
pub struct TenantSession {
    tenant_id: i64,
    engine: Arc<FunnelEngine>,
    api: TelegramApi,
    public_url: Option<String>,
    poll_timeout_secs: u64,
    shutdown: watch::Receiver<bool>,
    admin_prompts: HashMap<i64, AdminPrompt>,
}

impl TenantSession {
    pub fn new(
        tenant_id: i64,
        bot_token: &str,
        engine: Arc<FunnelEngine>,
        client: reqwest::Client,
        public_url: Option<String>,
        poll_timeout_secs: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            tenant_id,
            engine,
            api: TelegramApi::new(bot_token, client),
            public_url,
            poll_timeout_secs,
            shutdown,
            admin_prompts: HashMap::new(),
        }
    }

    /// Update loop. Runs until the shutdown signal flips; poll errors are
    /// logged and retried after a pause.
    pub async fn run(mut self) {
        info!(tenant_id = self.tenant_id, "Session started");
        let mut offset = 0i64;

        loop {
            let polled = {
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = shutdown.changed() => None,
                    polled = self.api.get_updates(offset, self.poll_timeout_secs) => Some(polled),
                }
            };

            match polled {
                None => {
                    info!(tenant_id = self.tenant_id, "Session stopping");
                    return;
                }
                Some(Ok(updates)) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Err(e) = self.handle_update(update).await {
                            warn!(
                                tenant_id = self.tenant_id,
                                error = %e,
                                "Update handling failed"
                            );
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(tenant_id = self.tenant_id, error = %e, "Poll failed");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn handle_update(&mut self, update: Update) -> Result<()> {
        if let Some(message) = update.message {
            self.handle_message(message).await?;
        } else if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await?;
        }
        Ok(())
    }

    async fn tenant(&self) -> Result<Option<Tenant>> {
        self.engine.store().get_tenant(self.tenant_id).await.map_err(Into::into)
    }

    fn is_owner(&self, tenant: &Tenant, user_id: i64) -> bool {
        tenant.owner_user_id == user_id
    }

    async fn show_funnel(&self, user_id: i64) -> Result<()> {
        self.engine
            .show_next_screen(&self.api, self.tenant_id, user_id, Trigger::Interaction)
            .await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn handle_message(&mut self, message: Message) -> Result<()> {
        let Some(from) = message.from.clone() else {
            return Ok(());
        };
        let user_id = from.id;
        let text = message.text.as_deref().unwrap_or("").trim().to_string();

        let Some(tenant) = self.tenant().await? else {
            return Ok(());
        };

        match text.as_str() {
            "/start" => {
                let store = self.engine.store();
                let fresh = store.get_state(self.tenant_id, user_id).await?.is_none();
                let correlation_id = self.engine.correlation_id(self.tenant_id, user_id);
                store
                    .ensure_state(self.tenant_id, user_id, &correlation_id)
                    .await?;
                if let Some(username) = from.username.as_deref() {
                    store.set_username(self.tenant_id, user_id, username).await?;
                }
                // Language is picked up from the client once, on first
                // contact; after that the user owns the choice.
                if fresh {
                    if let Some(code) = from.language_code.as_deref() {
                        if code != "en" && screens::LANGS.contains(&code) {
                            store.set_lang(self.tenant_id, user_id, code).await?;
                        }
                    }
                }
                self.show_funnel(user_id).await
            }
            "/my_id" => {
                let text = match self.engine.store().get_state(self.tenant_id, user_id).await? {
                    Some(state) => format!(
                        "Your id: <code>{user_id}</code>\nClick id: <code>{}</code>",
                        state.correlation_id
                    ),
                    None => format!("Your id: <code>{user_id}</code>"),
                };
                self.api
                    .send_text(user_id, &text, None)
                    .await
                    .map_err(crate::error::Error::Transport)?;
                Ok(())
            }
            "/admin" if self.is_owner(&tenant, user_id) => {
                self.admin_prompts.remove(&user_id);
                self.send_admin_panel(&tenant, user_id).await
            }
            _ => {
                if self.is_owner(&tenant, user_id) {
                    if let Some(prompt) = self.admin_prompts.remove(&user_id) {
                        return self.apply_admin_input(tenant, user_id, prompt, &text).await;
                    }
                }
                Ok(())
            }
        }
    }

    // ── Callbacks ───────────────────────────────────────────────────

    async fn handle_callback(&mut self, callback: CallbackQuery) -> Result<()> {
        let user_id = callback.from.id;
        let data = callback.data.as_deref().unwrap_or("").to_string();

        // Ack first so the client spinner never hangs on a slow handler.
        if let Err(e) = self.api.answer_callback(&callback.id, None).await {
            warn!(tenant_id = self.tenant_id, error = %e, "Callback ack failed");
        }

        let Some(tenant) = self.tenant().await? else {
            return Ok(());
        };

        match data.as_str() {
            "check_sub" | "menu" | "signal" => self.show_funnel(user_id).await,
            "howto" => {
                let lang = self.user_lang(user_id).await?;
                self.api
                    .send_text(user_id, screens::howto_text(&lang), None)
                    .await
                    .map_err(crate::error::Error::Transport)?;
                Ok(())
            }
            "lang" => {
                let kb = InlineKeyboard::new()
                    .row(vec![
                        InlineButton::callback("English", "set_lang:en"),
                        InlineButton::callback("Русский", "set_lang:ru"),
                    ])
                    .row(vec![
                        InlineButton::callback("हिन्दी", "set_lang:hi"),
                        InlineButton::callback("Español", "set_lang:es"),
                    ]);
                self.api
                    .send_text(user_id, "Language / Язык:", Some(&kb))
                    .await
                    .map_err(crate::error::Error::Transport)?;
                Ok(())
            }
            _ if data.starts_with("set_lang:") => {
                let lang = data.trim_start_matches("set_lang:");
                if screens::LANGS.contains(&lang) {
                    self.engine
                        .store()
                        .set_lang(self.tenant_id, user_id, lang)
                        .await?;
                }
                self.show_funnel(user_id).await
            }
            _ if data.starts_with("adm:") && self.is_owner(&tenant, user_id) => {
                self.handle_admin_callback(tenant, user_id, &data).await
            }
            _ => Ok(()),
        }
    }

    async fn user_lang(&self, user_id: i64) -> Result<String> {
        Ok(self
            .engine
            .store()
            .get_state(self.tenant_id, user_id)
            .await?
            .map(|s| s.lang)
            .unwrap_or_else(|| "en".to_string()))
    }

    // ── Admin panel ─────────────────────────────────────────────────

    async fn send_admin_panel(&self, tenant: &Tenant, admin_id: i64) -> Result<()> {
        let text = format!(
            "<b>Admin panel</b>\n\n\
             Subscription gate: {}\n\
             Deposit gate: {}\n\
             Min deposit: ${}\n\
             Platinum threshold: ${}\n\
             Registration link: {}\n\
             Deposit link: {}\n\
             Support: {}\n\
             Gate channel: {}",
            onoff(tenant.subscription_required),
            onoff(tenant.deposit_required),
            screens::format_amount(tenant.min_deposit),
            screens::format_amount(tenant.platinum_threshold),
            tenant.ref_link.as_deref().unwrap_or("—"),
            tenant.deposit_link.as_deref().unwrap_or("—"),
            tenant.support_url.as_deref().unwrap_or("—"),
            tenant
                .gate_channel_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "—".to_string()),
        );

        let kb = InlineKeyboard::new()
            .row(vec![
                InlineButton::callback("Toggle subscription", "adm:toggle_sub"),
                InlineButton::callback("Toggle deposit", "adm:toggle_dep"),
            ])
            .row(vec![
                InlineButton::callback("Set min deposit", "adm:set_min"),
                InlineButton::callback("Set platinum", "adm:set_plat"),
            ])
            .row(vec![
                InlineButton::callback("Set reg link", "adm:set_ref"),
                InlineButton::callback("Set deposit link", "adm:set_dep_link"),
            ])
            .row(vec![
                InlineButton::callback("Set support", "adm:set_support"),
                InlineButton::callback("Set channel", "adm:set_channel"),
            ])
            .row(vec![
                InlineButton::callback("Postback setup", "adm:postbacks"),
                InlineButton::callback("Find user", "adm:find"),
            ]);

        self.api
            .send_text(admin_id, &text, Some(&kb))
            .await
            .map_err(crate::error::Error::Transport)?;
        Ok(())
    }

    async fn handle_admin_callback(
        &mut self,
        mut tenant: Tenant,
        admin_id: i64,
        data: &str,
    ) -> Result<()> {
        let store = self.engine.store().clone();
        match data {
            "adm:panel" => return self.send_admin_panel(&tenant, admin_id).await,
            "adm:toggle_sub" => {
                tenant.subscription_required = !tenant.subscription_required;
                store.update_tenant(&tenant).await?;
                return self.send_admin_panel(&tenant, admin_id).await;
            }
            "adm:toggle_dep" => {
                tenant.deposit_required = !tenant.deposit_required;
                store.update_tenant(&tenant).await?;
                return self.send_admin_panel(&tenant, admin_id).await;
            }
            "adm:set_min" => {
                return self
                    .prompt(admin_id, AdminPrompt::MinDeposit, "Send the new minimum deposit:")
                    .await;
            }
            "adm:set_plat" => {
                return self
                    .prompt(
                        admin_id,
                        AdminPrompt::PlatinumThreshold,
                        "Send the new platinum threshold:",
                    )
                    .await;
            }
            "adm:set_ref" => {
                return self
                    .prompt(admin_id, AdminPrompt::RefLink, "Send the registration link:")
                    .await;
            }
            "adm:set_dep_link" => {
                return self
                    .prompt(admin_id, AdminPrompt::DepositLink, "Send the deposit link:")
                    .await;
            }
            "adm:set_support" => {
                return self
                    .prompt(admin_id, AdminPrompt::SupportUrl, "Send the support URL:")
                    .await;
            }
            "adm:set_channel" => {
                return self
                    .prompt(
                        admin_id,
                        AdminPrompt::GateChannel,
                        "Send the gate channel id (e.g. -1001234567890):",
                    )
                    .await;
            }
            "adm:find" => {
                return self
                    .prompt(
                        admin_id,
                        AdminPrompt::FindUser,
                        "Send a user id, username, trader ref, or click id fragment:",
                    )
                    .await;
            }
            "adm:postbacks" => return self.send_postback_setup(tenant, admin_id).await,
            _ => {}
        }

        // User-card flag overrides: adm:flag:<user_id>:<flag>:<0|1>
        if let Some((target, flag, value)) = parse_flag_callback(data) {
            self.engine
                .admin_override(self.tenant_id, target, flag, value)
                .await?;
            return self.send_user_card(admin_id, target).await;
        }
        if let Some(rest) = data.strip_prefix("adm:user:") {
            if let Ok(target) = rest.parse::<i64>() {
                return self.send_user_card(admin_id, target).await;
            }
        }
        Ok(())
    }

    async fn prompt(&mut self, admin_id: i64, prompt: AdminPrompt, text: &str) -> Result<()> {
        self.admin_prompts.insert(admin_id, prompt);
        self.api
            .send_text(admin_id, text, None)
            .await
            .map_err(crate::error::Error::Transport)?;
        Ok(())
    }

    async fn apply_admin_input(
        &mut self,
        mut tenant: Tenant,
        admin_id: i64,
        prompt: AdminPrompt,
        input: &str,
    ) -> Result<()> {
        let store = self.engine.store().clone();
        let reply: String = match prompt {
            AdminPrompt::MinDeposit => match input.parse() {
                Ok(value) => {
                    tenant.min_deposit = value;
                    store.update_tenant(&tenant).await?;
                    format!("Min deposit set to ${}", screens::format_amount(value))
                }
                Err(_) => format!("Not a number: {input}"),
            },
            AdminPrompt::PlatinumThreshold => match input.parse() {
                Ok(value) => {
                    tenant.platinum_threshold = value;
                    store.update_tenant(&tenant).await?;
                    format!(
                        "Platinum threshold set to ${}",
                        screens::format_amount(value)
                    )
                }
                Err(_) => format!("Not a number: {input}"),
            },
            AdminPrompt::RefLink => {
                tenant.ref_link = Some(input.to_string());
                store.update_tenant(&tenant).await?;
                "Registration link updated".to_string()
            }
            AdminPrompt::DepositLink => {
                tenant.deposit_link = Some(input.to_string());
                store.update_tenant(&tenant).await?;
                "Deposit link updated".to_string()
            }
            AdminPrompt::SupportUrl => {
                tenant.support_url = Some(input.to_string());
                store.update_tenant(&tenant).await?;
                "Support URL updated".to_string()
            }
            AdminPrompt::GateChannel => match input.parse::<i64>() {
                Ok(id) => {
                    tenant.gate_channel_id = Some(id);
                    store.update_tenant(&tenant).await?;
                    format!("Gate channel set to {id}")
                }
                Err(_) => format!("Not a channel id: {input}"),
            },
            AdminPrompt::FindUser => {
                return self.send_search_results(admin_id, input).await;
            }
        };

        self.api
            .send_text(admin_id, &reply, Some(&panel_back_keyboard()))
            .await
            .map_err(crate::error::Error::Transport)?;
        Ok(())
    }

    /// Postback setup: provisions a shared secret on first open and shows
    /// the intake URLs with their parameter macros.
    async fn send_postback_setup(&self, mut tenant: Tenant, admin_id: i64) -> Result<()> {
        let secret = match tenant.webhook_secret.clone() {
            Some(secret) => secret,
            None => {
                let secret: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(SECRET_LEN)
                    .map(char::from)
                    .collect();
                tenant.webhook_secret = Some(secret.clone());
                self.engine.store().update_tenant(&tenant).await?;
                info!(tenant_id = tenant.id, "Postback secret provisioned");
                secret
            }
        };

        let base = self
            .public_url
            .clone()
            .unwrap_or_else(|| "https://<your-host>".to_string());
        let text = format!(
            "<b>Postback setup</b>\n\n\
             Secret: <code>{secret}</code>\n\n\
             Registration:\n<code>{base}/pp/reg?click_id={{click_id}}&secret={secret}</code>\n\n\
             First deposit:\n<code>{base}/pp/ftd?click_id={{click_id}}&sumdep={{sumdep}}&secret={secret}</code>\n\n\
             Repeat deposit:\n<code>{base}/pp/rd?click_id={{click_id}}&sumdep={{sumdep}}&secret={secret}</code>",
        );

        self.api
            .send_text(admin_id, &text, Some(&panel_back_keyboard()))
            .await
            .map_err(crate::error::Error::Transport)?;
        Ok(())
    }

    async fn send_search_results(&self, admin_id: i64, query: &str) -> Result<()> {
        let states = self
            .engine
            .store()
            .search_states(self.tenant_id, query, SEARCH_LIMIT)
            .await?;

        if states.is_empty() {
            self.api
                .send_text(admin_id, "No matching users.", Some(&panel_back_keyboard()))
                .await
                .map_err(crate::error::Error::Transport)?;
            return Ok(());
        }

        let mut kb = InlineKeyboard::new();
        for state in &states {
            let label = match state.username.as_deref() {
                Some(name) => format!("@{name} ({})", state.user_id),
                None => state.user_id.to_string(),
            };
            kb = kb.row(vec![InlineButton::callback(
                label,
                format!("adm:user:{}", state.user_id),
            )]);
        }
        kb = kb.row(vec![InlineButton::callback("Back", "adm:panel")]);

        self.api
            .send_text(admin_id, "Matches:", Some(&kb))
            .await
            .map_err(crate::error::Error::Transport)?;
        Ok(())
    }

    async fn send_user_card(&self, admin_id: i64, target: i64) -> Result<()> {
        let store = self.engine.store();
        let Some(state) = store.get_state(self.tenant_id, target).await? else {
            self.api
                .send_text(admin_id, "No such user.", Some(&panel_back_keyboard()))
                .await
                .map_err(crate::error::Error::Transport)?;
            return Ok(());
        };
        let credited = store
            .credited_total(self.tenant_id, &state.correlation_id)
            .await?;

        let text = format!(
            "<b>User {}</b>\n\n\
             Username: {}\n\
             Click id: <code>{}</code>\n\
             Trader ref: {}\n\
             Registered: {}\n\
             Deposit confirmed: {}\n\
             Platinum: {}\n\
             Credited total: ${}",
            state.user_id,
            state.username.as_deref().unwrap_or("—"),
            state.correlation_id,
            state.trader_ref.as_deref().unwrap_or("—"),
            yesno(state.registered),
            yesno(state.deposit_confirmed),
            yesno(state.platinum_tier),
            screens::format_amount(credited),
        );

        let kb = InlineKeyboard::new()
            .row(vec![flag_button(target, AdminFlag::Registered, &state)])
            .row(vec![flag_button(target, AdminFlag::DepositConfirmed, &state)])
            .row(vec![flag_button(target, AdminFlag::PlatinumTier, &state)])
            .row(vec![InlineButton::callback("Back", "adm:panel")]);

        self.api
            .send_text(admin_id, &text, Some(&kb))
            .await
            .map_err(crate::error::Error::Transport)?;
        Ok(())
    }
}

fn onoff(v: bool) -> &'static str {
    if v { "on" } else { "off" }
}

fn yesno(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}

fn panel_back_keyboard() -> InlineKeyboard {
    InlineKeyboard::new().row(vec![InlineButton::callback("Back to panel", "adm:panel")])
}

fn flag_button(target: i64, flag: AdminFlag, state: &FunnelState) -> InlineButton {
    let current = match flag {
        AdminFlag::Registered => state.registered,
        AdminFlag::DepositConfirmed => state.deposit_confirmed,
        AdminFlag::PlatinumTier => state.platinum_tier,
    };
    let verb = if current { "Clear" } else { "Set" };
    InlineButton::callback(
        format!("{verb} {}", flag.as_str()),
        format!("adm:flag:{target}:{}:{}", flag.as_str(), !current as u8),
    )
}

/// Parse `adm:flag:<user_id>:<flag>:<0|1>`.
fn parse_flag_callback(data: &str) -> Option<(i64, AdminFlag, bool)> {
    let rest = data.strip_prefix("adm:flag:")?;
    let mut parts = rest.splitn(3, ':');
    let user_id = parts.next()?.parse().ok()?;
    let flag = AdminFlag::parse(parts.next()?)?;
    let value = match parts.next()? {
        "1" => true,
        "0" => false,
        _ => return None,
    };
    Some((user_id, flag, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_callback_round_trip() {
        assert_eq!(
            parse_flag_callback("adm:flag:42:registered:1"),
            Some((42, AdminFlag::Registered, true))
        );
        assert_eq!(
            parse_flag_callback("adm:flag:42:platinum_tier:0"),
            Some((42, AdminFlag::PlatinumTier, false))
        );
        assert_eq!(parse_flag_callback("adm:flag:42:bogus:1"), None);
        assert_eq!(parse_flag_callback("adm:flag:nope:registered:1"), None);
        assert_eq!(parse_flag_callback("adm:user:42"), None);
    }

    #[test]
    fn flag_button_toggles_against_current_value() {
        let mut state = FunnelState::new(1, 42, "1-abc".into(), "en");
        state.registered = true;
        let InlineButton::Callback { text, data } = flag_button(42, AdminFlag::Registered, &state)
        else {
            panic!("expected callback button");
        };
        assert!(text.starts_with("Clear"));
        assert_eq!(data, "adm:flag:42:registered:0");
    }
}
