//! Telegram Bot API transport.
//!
//! Thin client over the HTTP Bot API plus the `ChatTransport` trait the
//! engine and sessions talk through, so tests can substitute a recording
//! transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::TransportError;

const API_BASE: &str = "https://api.telegram.org";

// ── Inline keyboards ────────────────────────────────────────────────

/// One inline keyboard button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineButton {
    Url { text: String, url: String },
    Callback { text: String, data: String },
    WebApp { text: String, url: String },
}

impl InlineButton {
    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Url {
            text: text.into(),
            url: url.into(),
        }
    }

    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Callback {
            text: text.into(),
            data: data.into(),
        }
    }

    pub fn web_app(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self::WebApp {
            text: text.into(),
            url: url.into(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            InlineButton::Url { text, url } => json!({ "text": text, "url": url }),
            InlineButton::Callback { text, data } => {
                json!({ "text": text, "callback_data": data })
            }
            InlineButton::WebApp { text, url } => {
                json!({ "text": text, "web_app": { "url": url } })
            }
        }
    }
}

/// Inline keyboard as rows of buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, buttons: Vec<InlineButton>) -> Self {
        self.rows.push(buttons);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `reply_markup` value for the Bot API.
    pub fn to_json(&self) -> Value {
        let rows: Vec<Vec<Value>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(InlineButton::to_json).collect())
            .collect();
        json!({ "inline_keyboard": rows })
    }
}

// ── Update types (getUpdates payloads) ──────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

// ── Transport trait ─────────────────────────────────────────────────

/// Chat operations the funnel needs from the transport. One instance per
/// tenant bot token.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send an HTML-formatted text message, returning its message id.
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64, TransportError>;

    /// Send a photo by file id with an HTML caption.
    async fn send_photo(
        &self,
        chat_id: i64,
        file_id: &str,
        caption: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64, TransportError>;

    /// Delete a previously sent message.
    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError>;

    /// Live membership check against a channel. API failures count as
    /// not-a-member rather than an error.
    async fn is_channel_member(&self, channel_id: i64, user_id: i64)
    -> Result<bool, TransportError>;

    /// Acknowledge a callback query (stops the client spinner).
    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError>;
}

/// Creates transports per bot token. The supervisor hands each session a
/// transport built from its tenant's token; tests substitute stubs here.
pub trait TransportFactory: Send + Sync {
    fn transport_for(&self, bot_token: &str) -> Arc<dyn ChatTransport>;
}

// ── Bot API client ──────────────────────────────────────────────────

/// Raw Bot API client for one bot token.
pub struct TelegramApi {
    token: String,
    client: reqwest::Client,
}

impl TelegramApi {
    pub fn new(token: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            token: token.into(),
            client,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, TransportError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("{method}: {e}")))?;

        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Http(format!("{method} response parse: {e}")))?;

        if !api.ok {
            return Err(TransportError::Api(format!(
                "{method}: {}",
                api.description.unwrap_or_else(|| "unknown error".into())
            )));
        }
        Ok(api.result.unwrap_or(Value::Null))
    }

    /// Long-poll for updates. `offset` is one past the last confirmed
    /// update id.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError> {
        let result = self
            .call(
                "getUpdates",
                json!({
                    "offset": offset,
                    "timeout": timeout_secs,
                    "allowed_updates": ["message", "callback_query"],
                }),
            )
            .await?;

        serde_json::from_value(result)
            .map_err(|e| TransportError::Http(format!("getUpdates decode: {e}")))
    }
}

fn message_id_from(result: Value) -> Result<i64, TransportError> {
    result
        .get("message_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| TransportError::Api("sendMessage result missing message_id".into()))
}

#[async_trait]
impl ChatTransport for TelegramApi {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64, TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some(kb) = keyboard.filter(|kb| !kb.is_empty()) {
            body["reply_markup"] = kb.to_json();
        }

        let result = self
            .call("sendMessage", body)
            .await
            .map_err(|e| TransportError::SendFailed {
                chat_id,
                reason: e.to_string(),
            })?;
        message_id_from(result)
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        file_id: &str,
        caption: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64, TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "photo": file_id,
            "caption": caption,
            "parse_mode": "HTML",
        });
        if let Some(kb) = keyboard.filter(|kb| !kb.is_empty()) {
            body["reply_markup"] = kb.to_json();
        }

        let result = self
            .call("sendPhoto", body)
            .await
            .map_err(|e| TransportError::SendFailed {
                chat_id,
                reason: e.to_string(),
            })?;
        message_id_from(result)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TransportError> {
        self.call(
            "deleteMessage",
            json!({ "chat_id": chat_id, "message_id": message_id }),
        )
        .await
        .map_err(|e| TransportError::DeleteFailed {
            chat_id,
            message_id,
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn is_channel_member(
        &self,
        channel_id: i64,
        user_id: i64,
    ) -> Result<bool, TransportError> {
        let result = self
            .call(
                "getChatMember",
                json!({ "chat_id": channel_id, "user_id": user_id }),
            )
            .await;

        match result {
            Ok(member) => {
                let status = member.get("status").and_then(Value::as_str).unwrap_or("");
                Ok(matches!(status, "member" | "administrator" | "creator"))
            }
            // A user who never touched the channel often yields an API
            // error ("user not found"), which is simply not-a-member.
            Err(e) => {
                debug!(channel_id, user_id, error = %e, "Membership check failed");
                Ok(false)
            }
        }
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        self.call("answerCallbackQuery", body).await?;
        Ok(())
    }
}

/// Production factory: one shared HTTP client, one `TelegramApi` per token.
pub struct TelegramFactory {
    client: reqwest::Client,
}

impl TelegramFactory {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for TelegramFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for TelegramFactory {
    fn transport_for(&self, bot_token: &str) -> Arc<dyn ChatTransport> {
        Arc::new(TelegramApi::new(bot_token, self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_embeds_token_and_method() {
        let api = TelegramApi::new("123:ABC", reqwest::Client::new());
        assert_eq!(
            api.api_url("sendMessage"),
            "https://api.telegram.org/bot123:ABC/sendMessage"
        );
    }

    #[test]
    fn keyboard_serializes_all_button_kinds() {
        let kb = InlineKeyboard::new()
            .row(vec![InlineButton::url("Open", "https://example.com")])
            .row(vec![
                InlineButton::callback("Check", "check_sub"),
                InlineButton::web_app("App", "https://app.example.com"),
            ]);
        let v = kb.to_json();
        assert_eq!(v["inline_keyboard"][0][0]["url"], "https://example.com");
        assert_eq!(v["inline_keyboard"][1][0]["callback_data"], "check_sub");
        assert_eq!(
            v["inline_keyboard"][1][1]["web_app"]["url"],
            "https://app.example.com"
        );
    }

    #[test]
    fn empty_keyboard_is_skippable() {
        assert!(InlineKeyboard::new().is_empty());
    }

    #[test]
    fn update_decodes_message_and_callback() {
        let raw = serde_json::json!([
            {
                "update_id": 7,
                "message": {
                    "message_id": 100,
                    "from": { "id": 42, "username": "alice", "language_code": "ru" },
                    "chat": { "id": 42 },
                    "text": "/start"
                }
            },
            {
                "update_id": 8,
                "callback_query": {
                    "id": "cb1",
                    "from": { "id": 42 },
                    "message": { "message_id": 100, "chat": { "id": 42 } },
                    "data": "menu"
                }
            }
        ]);
        let updates: Vec<Update> = serde_json::from_value(raw).unwrap();
        assert_eq!(updates.len(), 2);
        let msg = updates[0].message.as_ref().unwrap();
        assert_eq!(msg.text.as_deref(), Some("/start"));
        assert_eq!(msg.from.as_ref().unwrap().language_code.as_deref(), Some("ru"));
        let cb = updates[1].callback_query.as_ref().unwrap();
        assert_eq!(cb.data.as_deref(), Some("menu"));
    }
}
