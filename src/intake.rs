//! Conversion intake HTTP surface.
//!
//! Affiliate networks call these endpoints fire-and-forget; every response
//! is HTTP 200 with a JSON envelope carrying the actual status, so broken
//! callers don't retry-storm us.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tracing::debug;

use crate::engine::{FunnelEngine, IngestOutcome, Postback};
use crate::error::IntakeError;
use crate::funnel::model::ConversionKind;

/// Build the intake router.
pub fn router(engine: Arc<FunnelEngine>) -> Router {
    Router::new()
        .route("/pp/reg", get(handle_reg))
        .route("/pp/ftd", get(handle_ftd))
        .route("/pp/rd", get(handle_rd))
        .route("/pp/debug", get(handle_debug))
        .with_state(engine)
}

fn ok(extra: Value) -> Json<Value> {
    let mut body = json!({ "status": "ok" });
    if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    Json(body)
}

fn err(message: &str) -> Json<Value> {
    Json(json!({ "status": "error", "message": message }))
}

fn reject(e: &IntakeError) -> Json<Value> {
    err(&e.to_string())
}

fn not_found(correlation_id: &str) -> Json<Value> {
    let message = IntakeError::UnknownCorrelation {
        correlation_id: correlation_id.to_string(),
    }
    .to_string();
    Json(json!({
        "status": "not_found",
        "click_id": correlation_id,
        "message": message,
    }))
}

/// Parse a postback amount. Tolerates currency symbols, surrounding
/// whitespace, and thousands separators ("$1,234.56" → 1234.56).
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn correlation_from(params: &HashMap<String, String>) -> Option<String> {
    params
        .get("click_id")
        .filter(|s| !s.is_empty())
        .cloned()
}

/// `tid` is the caller's tenant id, optional; when present it must be
/// numeric. It is only a cross-check — the correlation id alone names the
/// owning tenant.
fn tenant_hint_from(params: &HashMap<String, String>) -> Result<Option<i64>, IntakeError> {
    match params.get("tid").filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| IntakeError::BadTenantHint { raw: raw.clone() }),
    }
}

fn raw_query(params: &HashMap<String, String>) -> Option<String> {
    if params.is_empty() {
        return None;
    }
    let mut pairs: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    Some(pairs.join("&"))
}

async fn handle_conversion(
    engine: Arc<FunnelEngine>,
    params: HashMap<String, String>,
    kind: ConversionKind,
) -> Json<Value> {
    let Some(correlation_id) = correlation_from(&params) else {
        return reject(&IntakeError::MissingCorrelation);
    };
    let tenant_hint = match tenant_hint_from(&params) {
        Ok(hint) => hint,
        Err(e) => return reject(&e),
    };

    let amount = if kind.counts_toward_total() {
        let raw = params
            .get("sumdep")
            .or_else(|| params.get("amount"))
            .map(String::as_str)
            .unwrap_or("");
        match parse_amount(raw) {
            Some(a) => Some(a),
            None => return reject(&IntakeError::BadAmount { raw: raw.to_string() }),
        }
    } else {
        None
    };

    let postback = Postback {
        correlation_id: correlation_id.clone(),
        kind,
        amount,
        secret: params.get("secret").cloned(),
        tenant_hint,
        trader_ref: params.get("trader_id").cloned(),
        raw_query: raw_query(&params),
    };

    match engine.ingest(postback).await {
        Ok(IngestOutcome::Accepted { pushed }) => ok(json!({
            "event": kind.as_str(),
            "pushed": pushed,
        })),
        Ok(IngestOutcome::UnknownCorrelation) => not_found(&correlation_id),
        Ok(IngestOutcome::BadSecret { tenant_id }) => {
            reject(&IntakeError::BadSecret { tenant_id })
        }
        Err(e) => {
            debug!(error = %e, "Intake processing failed");
            err("internal error")
        }
    }
}

async fn handle_reg(
    State(engine): State<Arc<FunnelEngine>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    handle_conversion(engine, params, ConversionKind::Registration).await
}

async fn handle_ftd(
    State(engine): State<Arc<FunnelEngine>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    handle_conversion(engine, params, ConversionKind::FirstDeposit).await
}

async fn handle_rd(
    State(engine): State<Arc<FunnelEngine>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    handle_conversion(engine, params, ConversionKind::RepeatDeposit).await
}

/// Echo endpoint for wiring checks: confirms the correlation id resolves,
/// without touching the ledger.
async fn handle_debug(
    State(engine): State<Arc<FunnelEngine>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let Some(correlation_id) = correlation_from(&params) else {
        return reject(&IntakeError::MissingCorrelation);
    };

    match engine.store().find_state_by_correlation(&correlation_id).await {
        Ok(Some(state)) => {
            let events = engine
                .store()
                .list_events(state.tenant_id, &correlation_id)
                .await
                .map(|e| e.len())
                .unwrap_or(0);
            ok(json!({
                "click_id": correlation_id,
                "tenant_id": state.tenant_id,
                "registered": state.registered,
                "deposit_confirmed": state.deposit_confirmed,
                "events": events,
            }))
        }
        Ok(None) => not_found(&correlation_id),
        Err(e) => {
            debug!(error = %e, "Debug lookup failed");
            err("internal error")
        }
    }
}
