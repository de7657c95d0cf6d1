//! End-to-end funnel scenarios against an in-memory database and a
//! recording transport.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use funnelbot::config::RuntimeConfig;
use funnelbot::engine::{FunnelEngine, IngestOutcome, Postback, Trigger};
use funnelbot::error::TransportError;
use funnelbot::funnel::model::ConversionKind;
use funnelbot::store::{Database, LibSqlBackend, NewTenant};
use funnelbot::telegram::{ChatTransport, InlineKeyboard, TransportFactory};

/// Records every sent message; can be told to fail the next N sends.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<String>>,
    fail_sends: AtomicU32,
}

impl RecordingTransport {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn fail_next(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        _keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) > 0 {
            self.fail_sends.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::SendFailed {
                chat_id,
                reason: "injected failure".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(text.to_string());
        Ok(sent.len() as i64)
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        _file_id: &str,
        caption: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64, TransportError> {
        self.send_text(chat_id, caption, keyboard).await
    }

    async fn delete_message(&self, _chat_id: i64, _message_id: i64) -> Result<(), TransportError> {
        Ok(())
    }

    async fn is_channel_member(
        &self,
        _channel_id: i64,
        _user_id: i64,
    ) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn answer_callback(
        &self,
        _callback_id: &str,
        _text: Option<&str>,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

struct SharedFactory(Arc<RecordingTransport>);

impl TransportFactory for SharedFactory {
    fn transport_for(&self, _bot_token: &str) -> Arc<dyn ChatTransport> {
        self.0.clone()
    }
}

struct Fixture {
    store: Arc<dyn Database>,
    engine: Arc<FunnelEngine>,
    transport: Arc<RecordingTransport>,
    tenant_id: i64,
}

const USER: i64 = 42;

async fn fixture() -> Fixture {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let transport = Arc::new(RecordingTransport::default());

    let tenant_id = store
        .insert_tenant(&NewTenant {
            owner_user_id: 9000,
            bot_token: "123:ABC".into(),
            bot_username: Some("funnel_test_bot".into()),
        })
        .await
        .unwrap();

    // Registration + deposit gates; no channel gate, so the transport's
    // membership answer is irrelevant.
    let mut tenant = store.get_tenant(tenant_id).await.unwrap().unwrap();
    tenant.subscription_required = false;
    tenant.ref_link = Some("https://broker.example/r".into());
    store.update_tenant(&tenant).await.unwrap();

    let runtime = RuntimeConfig {
        render_backoff: Duration::from_millis(1),
        ..RuntimeConfig::default()
    };
    let engine = Arc::new(FunnelEngine::new(
        store.clone(),
        Arc::new(SharedFactory(transport.clone())),
        SecretString::from("test-salt"),
        runtime,
    ));

    Fixture {
        store,
        engine,
        transport,
        tenant_id,
    }
}

impl Fixture {
    /// Simulate the user's first /start and return their correlation id.
    async fn start_user(&self) -> String {
        self.engine
            .show_next_screen(
                self.transport.as_ref(),
                self.tenant_id,
                USER,
                Trigger::Interaction,
            )
            .await
            .unwrap();
        self.store
            .get_state(self.tenant_id, USER)
            .await
            .unwrap()
            .unwrap()
            .correlation_id
    }

    fn postback(&self, correlation_id: &str, kind: ConversionKind, amount: &str) -> Postback {
        Postback {
            correlation_id: correlation_id.to_string(),
            kind,
            amount: if amount.is_empty() {
                None
            } else {
                Some(amount.parse().unwrap())
            },
            secret: None,
            tenant_hint: None,
            trader_ref: None,
            raw_query: None,
        }
    }
}

#[tokio::test]
async fn full_progression_to_unlocked() {
    let fx = fixture().await;
    let cid = fx.start_user().await;

    // First screen: register.
    assert!(fx.transport.texts()[0].contains("Create your account"));

    // Registration postback pushes the deposit screen with full amount due.
    let out = fx
        .engine
        .ingest(fx.postback(&cid, ConversionKind::Registration, ""))
        .await
        .unwrap();
    assert_eq!(out, IngestOutcome::Accepted { pushed: true });
    let last = fx.transport.texts().pop().unwrap();
    assert!(last.contains("Minimum deposit: $10"));
    assert!(last.contains("Remaining: $10"));

    // Partial deposit: progress updates.
    fx.engine
        .ingest(fx.postback(&cid, ConversionKind::FirstDeposit, "7"))
        .await
        .unwrap();
    let last = fx.transport.texts().pop().unwrap();
    assert!(last.contains("Paid so far: $7"));
    assert!(last.contains("Remaining: $3"));

    // Crossing the minimum unlocks, exactly once.
    fx.engine
        .ingest(fx.postback(&cid, ConversionKind::RepeatDeposit, "3"))
        .await
        .unwrap();
    let last = fx.transport.texts().pop().unwrap();
    assert!(last.contains("Access granted"));

    // Steady state: another postback stores the event but pushes nothing.
    let count_before = fx.transport.texts().len();
    let out = fx
        .engine
        .ingest(fx.postback(&cid, ConversionKind::RepeatDeposit, "5"))
        .await
        .unwrap();
    assert_eq!(out, IngestOutcome::Accepted { pushed: true });
    assert_eq!(fx.transport.texts().len(), count_before);

    // An interaction now renders the menu.
    fx.engine
        .show_next_screen(fx.transport.as_ref(), fx.tenant_id, USER, Trigger::Interaction)
        .await
        .unwrap();
    assert!(fx.transport.texts().pop().unwrap().contains("Main menu"));

    let state = fx.store.get_state(fx.tenant_id, USER).await.unwrap().unwrap();
    assert!(state.registered);
    assert!(state.deposit_confirmed);
    assert!(state.unlocked_shown);
    assert_eq!(fx.store.credited_total(fx.tenant_id, &cid).await.unwrap(), dec!(15));
}

#[tokio::test]
async fn platinum_at_exact_threshold_shown_once() {
    let fx = fixture().await;
    let cid = fx.start_user().await;

    fx.engine
        .ingest(fx.postback(&cid, ConversionKind::Registration, ""))
        .await
        .unwrap();

    // One deposit exactly at the platinum threshold: the upgrade wins over
    // the plain unlocked screen.
    fx.engine
        .ingest(fx.postback(&cid, ConversionKind::FirstDeposit, "500"))
        .await
        .unwrap();
    let last = fx.transport.texts().pop().unwrap();
    assert!(last.contains("Platinum unlocked"));

    let state = fx.store.get_state(fx.tenant_id, USER).await.unwrap().unwrap();
    assert!(state.platinum_tier);
    assert!(state.platinum_shown);
    // Unlocked was skipped entirely, so its shown mark stays clear; the
    // next interaction goes straight to the menu, not back to Unlocked.
    assert!(!state.unlocked_shown);

    fx.engine
        .show_next_screen(fx.transport.as_ref(), fx.tenant_id, USER, Trigger::Interaction)
        .await
        .unwrap();
    let last = fx.transport.texts().pop().unwrap();
    assert!(last.contains("Access granted"));

    // After Unlocked has shown, interactions settle on the menu and the
    // platinum welcome never repeats.
    fx.engine
        .show_next_screen(fx.transport.as_ref(), fx.tenant_id, USER, Trigger::Interaction)
        .await
        .unwrap();
    let last = fx.transport.texts().pop().unwrap();
    assert!(last.contains("Main menu"));
}

#[tokio::test]
async fn unknown_correlation_is_reported_not_crashed() {
    let fx = fixture().await;
    let out = fx
        .engine
        .ingest(fx.postback("1-doesnotexist", ConversionKind::FirstDeposit, "10"))
        .await
        .unwrap();
    assert_eq!(out, IngestOutcome::UnknownCorrelation);
    assert!(fx.transport.texts().is_empty());

    // The rejection leaves an audit row, attributed via the cleartext
    // tenant prefix, which never credits anything.
    let events = fx.store.list_events(1, "1-doesnotexist").await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].accepted);
    assert_eq!(events[0].amount, Some(dec!(10)));
    assert_eq!(
        fx.store.credited_total(1, "1-doesnotexist").await.unwrap(),
        dec!(0)
    );
}

#[tokio::test]
async fn tenant_hint_mismatch_is_rejected_with_audit() {
    let fx = fixture().await;
    let cid = fx.start_user().await;

    let mut pb = fx.postback(&cid, ConversionKind::FirstDeposit, "50");
    pb.tenant_hint = Some(fx.tenant_id + 99);
    let out = fx.engine.ingest(pb).await.unwrap();
    assert_eq!(out, IngestOutcome::UnknownCorrelation);
    assert_eq!(
        fx.store.credited_total(fx.tenant_id, &cid).await.unwrap(),
        dec!(0)
    );
    let events = fx.store.list_events(fx.tenant_id, &cid).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].accepted);

    // A hint matching the owning tenant is accepted normally.
    let mut pb = fx.postback(&cid, ConversionKind::FirstDeposit, "50");
    pb.tenant_hint = Some(fx.tenant_id);
    assert!(matches!(
        fx.engine.ingest(pb).await.unwrap(),
        IngestOutcome::Accepted { .. }
    ));
    assert_eq!(
        fx.store.credited_total(fx.tenant_id, &cid).await.unwrap(),
        dec!(50)
    );
}

#[tokio::test]
async fn secret_mismatch_rejects_without_crediting() {
    let fx = fixture().await;
    let cid = fx.start_user().await;

    let mut tenant = fx.store.get_tenant(fx.tenant_id).await.unwrap().unwrap();
    tenant.webhook_secret = Some("topsecret".into());
    fx.store.update_tenant(&tenant).await.unwrap();

    let mut pb = fx.postback(&cid, ConversionKind::FirstDeposit, "100");
    pb.secret = Some("wrong".into());
    let out = fx.engine.ingest(pb).await.unwrap();
    assert_eq!(
        out,
        IngestOutcome::BadSecret {
            tenant_id: fx.tenant_id
        }
    );
    assert_eq!(
        fx.store.credited_total(fx.tenant_id, &cid).await.unwrap(),
        dec!(0)
    );

    // The rejected call is still on the ledger as an audit row.
    let events = fx.store.list_events(fx.tenant_id, &cid).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].accepted);
    assert_eq!(events[0].amount, Some(dec!(100)));

    // Correct secret goes through.
    let mut pb = fx.postback(&cid, ConversionKind::FirstDeposit, "100");
    pb.secret = Some("topsecret".into());
    assert!(matches!(
        fx.engine.ingest(pb).await.unwrap(),
        IngestOutcome::Accepted { .. }
    ));
}

#[tokio::test]
async fn ledger_survives_push_failure() {
    let fx = fixture().await;
    let cid = fx.start_user().await;
    fx.engine
        .ingest(fx.postback(&cid, ConversionKind::Registration, ""))
        .await
        .unwrap();

    // Both render attempts fail; the event must still be credited.
    fx.transport.fail_next(2);
    let out = fx
        .engine
        .ingest(fx.postback(&cid, ConversionKind::FirstDeposit, "10"))
        .await
        .unwrap();
    assert_eq!(out, IngestOutcome::Accepted { pushed: false });
    assert_eq!(
        fx.store.credited_total(fx.tenant_id, &cid).await.unwrap(),
        dec!(10)
    );

    // Shown-once was not committed, so the next interaction still renders
    // the unlocked screen.
    let state = fx.store.get_state(fx.tenant_id, USER).await.unwrap().unwrap();
    assert!(!state.unlocked_shown);
    fx.engine
        .show_next_screen(fx.transport.as_ref(), fx.tenant_id, USER, Trigger::Interaction)
        .await
        .unwrap();
    assert!(fx.transport.texts().pop().unwrap().contains("Access granted"));
}

#[tokio::test]
async fn transient_send_failure_is_retried() {
    let fx = fixture().await;
    // First attempt fails, second succeeds; the user still gets a screen.
    fx.transport.fail_next(1);
    fx.engine
        .show_next_screen(fx.transport.as_ref(), fx.tenant_id, USER, Trigger::Interaction)
        .await
        .unwrap();
    assert_eq!(fx.transport.texts().len(), 1);
}

#[tokio::test]
async fn duplicate_postbacks_both_credit() {
    let fx = fixture().await;
    let cid = fx.start_user().await;
    fx.engine
        .ingest(fx.postback(&cid, ConversionKind::Registration, ""))
        .await
        .unwrap();

    for _ in 0..2 {
        fx.engine
            .ingest(fx.postback(&cid, ConversionKind::FirstDeposit, "6"))
            .await
            .unwrap();
    }
    assert_eq!(
        fx.store.credited_total(fx.tenant_id, &cid).await.unwrap(),
        dec!(12)
    );
}

#[tokio::test]
async fn subscription_gate_blocks_until_member() {
    let fx = fixture().await;

    let mut tenant = fx.store.get_tenant(fx.tenant_id).await.unwrap().unwrap();
    tenant.subscription_required = true;
    tenant.gate_channel_id = Some(-1000);
    tenant.gate_channel_url = Some("https://t.me/chan".into());
    fx.store.update_tenant(&tenant).await.unwrap();

    // RecordingTransport answers membership with true, so the gate passes
    // straight through to registration.
    fx.start_user().await;
    assert!(fx.transport.texts()[0].contains("Create your account"));
}
