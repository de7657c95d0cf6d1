//! Screen delivery — replaces the previous funnel message instead of
//! stacking a new one under it.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::funnel::model::{FunnelState, Screen, Tenant};
use crate::screens;
use crate::store::Database;
use crate::telegram::ChatTransport;

/// Render one screen into the user's chat.
///
/// Deletes the previously tracked funnel message first; a failed delete
/// (already deleted, too old) is logged and ignored. A failed send
/// propagates so the caller can retry and withhold shown-once commits.
pub async fn deliver(
    transport: &dyn ChatTransport,
    store: &Arc<dyn Database>,
    tenant: &Tenant,
    state: &FunnelState,
    screen: &Screen,
) -> Result<()> {
    let ov = store
        .get_override(tenant.id, &state.lang, screen.key())
        .await?;
    let rendered = screens::render_screen(tenant, state, screen, ov.as_ref());
    let chat_id = state.user_id;

    if let Some(old_id) = state.last_message_id {
        if let Err(e) = transport.delete_message(chat_id, old_id).await {
            debug!(chat_id, message_id = old_id, error = %e, "Stale message delete failed");
        }
    }

    let keyboard = Some(&rendered.keyboard).filter(|kb| !kb.is_empty());
    let message_id = match &rendered.photo_file_id {
        Some(file_id) => {
            transport
                .send_photo(chat_id, file_id, &rendered.text, keyboard)
                .await
        }
        None => transport.send_text(chat_id, &rendered.text, keyboard).await,
    }
    .map_err(Error::Transport)?;

    store
        .set_last_message_id(tenant.id, state.user_id, Some(message_id))
        .await?;

    debug!(
        tenant_id = tenant.id,
        user_id = state.user_id,
        screen = screen.key(),
        message_id,
        "Screen delivered"
    );
    Ok(())
}
