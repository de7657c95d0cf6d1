//! Onboarding (parent) bot — tenants are created by messaging it a bot
//! token, and managed through per-tenant cards.
//!
//! Any user can onboard exactly one bot. The configured superadmin
//! additionally sees every tenant and can pause, resume, restart, or
//! delete them.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{DatabaseError, Result};
use crate::funnel::model::Tenant;
use crate::store::{Database, NewTenant};
use crate::supervisor::Supervisor;
use crate::telegram::{
    CallbackQuery, ChatTransport, InlineButton, InlineKeyboard, Message, TelegramApi, Update,
};

const START_TEXT: &str = "Send me a bot token from @BotFather and I'll run your funnel bot on it.\n\n\
     Once it's up, open your bot and use /admin to configure gates, links, and postbacks.";

/// Management actions carried in parent-bot callback data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentAction {
    Card,
    Pause,
    Resume,
    Restart,
    Delete,
    DeleteConfirm,
}

/// Outcome of a token submission.
#[derive(Debug, PartialEq, Eq)]
pub enum Onboarding {
    Created(i64),
    Duplicate,
}

/// Register a tenant for `owner_user_id` running on `bot_token`. An owner
/// or token that already has a tenant comes back as `Duplicate`.
pub async fn register_tenant(
    store: &Arc<dyn Database>,
    owner_user_id: i64,
    bot_token: &str,
) -> Result<Onboarding> {
    let new = NewTenant {
        owner_user_id,
        bot_token: bot_token.to_string(),
        bot_username: None,
    };
    match store.insert_tenant(&new).await {
        Ok(id) => {
            info!(tenant_id = id, owner_user_id, "Tenant onboarded");
            Ok(Onboarding::Created(id))
        }
        Err(DatabaseError::Constraint(_)) => Ok(Onboarding::Duplicate),
        Err(e) => Err(e.into()),
    }
}

/// Loose shape check for a Bot API token (`<bot id>:<secret>`). Catches
/// stray chat messages without calling getMe on every line of text.
pub fn looks_like_bot_token(text: &str) -> bool {
    let Some((id, secret)) = text.split_once(':') else {
        return false;
    };
    !id.is_empty()
        && id.chars().all(|c| c.is_ascii_digit())
        && secret.len() >= 30
        && secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse `pt:<action>:<tenant_id>`.
pub fn parse_parent_callback(data: &str) -> Option<(ParentAction, i64)> {
    let rest = data.strip_prefix("pt:")?;
    let (action, id) = rest.split_once(':')?;
    let action = match action {
        "card" => ParentAction::Card,
        "pause" => ParentAction::Pause,
        "resume" => ParentAction::Resume,
        "restart" => ParentAction::Restart,
        "delete" => ParentAction::Delete,
        "delete2" => ParentAction::DeleteConfirm,
        _ => return None,
    };
    Some((action, id.parse().ok()?))
}

fn mask_token(token: &str) -> String {
    match token.split_once(':') {
        Some((id, secret)) if secret.len() > 4 => {
            format!("{id}:…{}", &secret[secret.len() - 4..])
        }
        _ => "***".to_string(),
    }
}

/// The parent bot's update loop.
pub struct ParentSession {
    store: Arc<dyn Database>,
    supervisor: Arc<Supervisor>,
    api: TelegramApi,
    superadmin_id: Option<i64>,
    poll_timeout_secs: u64,
    shutdown: watch::Receiver<bool>,
}

impl ParentSession {
    pub fn new(
        store: Arc<dyn Database>,
        supervisor: Arc<Supervisor>,
        bot_token: &str,
        superadmin_id: Option<i64>,
        poll_timeout_secs: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            supervisor,
            api: TelegramApi::new(bot_token, reqwest::Client::new()),
            superadmin_id,
            poll_timeout_secs,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("Parent session started");
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
                    info!("Parent session stopping");
                    return;
                }
                Some(Ok(updates)) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Err(e) = self.handle_update(update).await {
                            warn!(error = %e, "Parent update handling failed");
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Parent poll failed");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn handle_update(&self, update: Update) -> Result<()> {
        if let Some(message) = update.message {
            self.handle_message(message).await?;
        } else if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await?;
        }
        Ok(())
    }

    fn is_superadmin(&self, user_id: i64) -> bool {
        self.superadmin_id == Some(user_id)
    }

    async fn reply(&self, chat_id: i64, text: &str, kb: Option<&InlineKeyboard>) -> Result<()> {
        self.api
            .send_text(chat_id, text, kb)
            .await
            .map_err(crate::error::Error::Transport)?;
        Ok(())
    }

    async fn handle_message(&self, message: Message) -> Result<()> {
        let Some(from) = message.from else {
            return Ok(());
        };
        let user_id = from.id;
        let text = message.text.as_deref().unwrap_or("").trim();

        match text {
            "/start" => self.reply(user_id, START_TEXT, None).await,
            "/tenants" if self.is_superadmin(user_id) => self.send_tenant_list(user_id).await,
            token if looks_like_bot_token(token) => {
                match register_tenant(&self.store, user_id, token).await? {
                    Onboarding::Created(id) => {
                        // Bring the new bot up without waiting a tick.
                        if let Err(e) = self.supervisor.reconcile().await {
                            warn!(tenant_id = id, error = %e, "Post-onboarding reconcile failed");
                        }
                        self.reply(
                            user_id,
                            "Your bot is live. Open it and send /admin to configure it.",
                            Some(&card_keyboard(id, true)),
                        )
                        .await
                    }
                    Onboarding::Duplicate => {
                        self.reply(
                            user_id,
                            "That bot (or your account) already has a tenant registered.",
                            None,
                        )
                        .await
                    }
                }
            }
            _ => Ok(()),
        }
    }

    async fn handle_callback(&self, callback: CallbackQuery) -> Result<()> {
        let user_id = callback.from.id;

        if let Err(e) = self.api.answer_callback(&callback.id, None).await {
            warn!(error = %e, "Parent callback ack failed");
        }

        let data = callback.data.as_deref().unwrap_or("");
        let Some((action, tenant_id)) = parse_parent_callback(data) else {
            return Ok(());
        };

        let Some(mut tenant) = self.store.get_tenant(tenant_id).await? else {
            return self.reply(user_id, "No such tenant.", None).await;
        };
        // Owners manage their own tenant; the superadmin manages all.
        if !self.is_superadmin(user_id) && tenant.owner_user_id != user_id {
            return Ok(());
        }

        match action {
            ParentAction::Card => self.send_tenant_card(user_id, &tenant).await,
            ParentAction::Pause => {
                tenant.active = false;
                self.store.update_tenant(&tenant).await?;
                if let Err(e) = self.supervisor.reconcile().await {
                    warn!(tenant_id, error = %e, "Post-pause reconcile failed");
                }
                self.send_tenant_card(user_id, &tenant).await
            }
            ParentAction::Resume => {
                tenant.active = true;
                self.store.update_tenant(&tenant).await?;
                if let Err(e) = self.supervisor.reconcile().await {
                    warn!(tenant_id, error = %e, "Post-resume reconcile failed");
                }
                self.send_tenant_card(user_id, &tenant).await
            }
            ParentAction::Restart => {
                let running = self.supervisor.restart(tenant_id).await?;
                let text = if running {
                    "Session restarted."
                } else {
                    "Tenant is paused; nothing to restart."
                };
                self.reply(user_id, text, Some(&card_keyboard(tenant_id, tenant.active)))
                    .await
            }
            ParentAction::Delete => {
                let kb = InlineKeyboard::new().row(vec![
                    InlineButton::callback(
                        "Yes, delete everything",
                        format!("pt:delete2:{tenant_id}"),
                    ),
                    InlineButton::callback("Cancel", format!("pt:card:{tenant_id}")),
                ]);
                self.reply(
                    user_id,
                    "Delete this tenant? All user progress and ledger rows go with it.",
                    Some(&kb),
                )
                .await
            }
            ParentAction::DeleteConfirm => {
                self.store.delete_tenant(tenant_id).await?;
                if let Err(e) = self.supervisor.reconcile().await {
                    warn!(tenant_id, error = %e, "Post-delete reconcile failed");
                }
                info!(tenant_id, by = user_id, "Tenant deleted");
                self.reply(user_id, "Tenant deleted.", None).await
            }
        }
    }

    async fn send_tenant_list(&self, chat_id: i64) -> Result<()> {
        let tenants = self.store.list_active_tenants().await?;
        if tenants.is_empty() {
            return self.reply(chat_id, "No active tenants.", None).await;
        }
        let mut kb = InlineKeyboard::new();
        for tenant in &tenants {
            let label = tenant
                .bot_username
                .clone()
                .map(|u| format!("@{u}"))
                .unwrap_or_else(|| mask_token(&tenant.bot_token));
            kb = kb.row(vec![InlineButton::callback(
                format!("#{} {label}", tenant.id),
                format!("pt:card:{}", tenant.id),
            )]);
        }
        self.reply(chat_id, "Active tenants:", Some(&kb)).await
    }

    async fn send_tenant_card(&self, chat_id: i64, tenant: &Tenant) -> Result<()> {
        let text = format!(
            "<b>Tenant #{}</b>\n\n\
             Bot: {}\n\
             Owner: <code>{}</code>\n\
             Status: {}",
            tenant.id,
            tenant
                .bot_username
                .clone()
                .map(|u| format!("@{u}"))
                .unwrap_or_else(|| mask_token(&tenant.bot_token)),
            tenant.owner_user_id,
            if tenant.active { "running" } else { "paused" },
        );
        self.reply(chat_id, &text, Some(&card_keyboard(tenant.id, tenant.active)))
            .await
    }
}

fn card_keyboard(tenant_id: i64, active: bool) -> InlineKeyboard {
    let toggle = if active {
        InlineButton::callback("Pause", format!("pt:pause:{tenant_id}"))
    } else {
        InlineButton::callback("Resume", format!("pt:resume:{tenant_id}"))
    };
    InlineKeyboard::new()
        .row(vec![
            toggle,
            InlineButton::callback("Restart", format!("pt:restart:{tenant_id}")),
        ])
        .row(vec![InlineButton::callback(
            "Delete",
            format!("pt:delete:{tenant_id}"),
        )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[test]
    fn token_shape_check() {
        assert!(looks_like_bot_token(
            "123456789:AAEhBOweik6ad9r_QXMENQjcrGbqCr4K-pc"
        ));
        assert!(!looks_like_bot_token("/start"));
        assert!(!looks_like_bot_token("hello there"));
        assert!(!looks_like_bot_token("abc:AAEhBOweik6ad9r_QXMENQjcrGbqCr4K"));
        assert!(!looks_like_bot_token("123456789:short"));
        assert!(!looks_like_bot_token("123456789:has spaces in the secret part!!"));
    }

    #[test]
    fn callback_parsing() {
        assert_eq!(
            parse_parent_callback("pt:card:7"),
            Some((ParentAction::Card, 7))
        );
        assert_eq!(
            parse_parent_callback("pt:delete2:7"),
            Some((ParentAction::DeleteConfirm, 7))
        );
        assert_eq!(parse_parent_callback("pt:bogus:7"), None);
        assert_eq!(parse_parent_callback("pt:card:x"), None);
        assert_eq!(parse_parent_callback("adm:panel"), None);
    }

    #[test]
    fn token_masking_keeps_only_the_tail() {
        let masked = mask_token("123456789:AAEhBOweik6ad9r_QXMENQjcrGbqCr4K-pc");
        assert!(masked.starts_with("123456789:"));
        assert!(masked.ends_with("4K-pc") || masked.ends_with("K-pc"));
        assert!(!masked.contains("AAEhBOweik"));
        assert_eq!(mask_token("garbage"), "***");
    }

    #[tokio::test]
    async fn onboarding_creates_once_then_reports_duplicates() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());

        let first = register_tenant(&store, 42, "111:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
            .await
            .unwrap();
        let Onboarding::Created(id) = first else {
            panic!("expected a created tenant");
        };
        let tenant = store.get_tenant(id).await.unwrap().unwrap();
        assert_eq!(tenant.owner_user_id, 42);
        assert!(tenant.active);

        // Same owner, different token: still one tenant per owner.
        let again = register_tenant(&store, 42, "222:BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB")
            .await
            .unwrap();
        assert_eq!(again, Onboarding::Duplicate);
    }
}
