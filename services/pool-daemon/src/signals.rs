//! Ingest endpoints for upstream signals
//!
//! The agent host posts a signal whenever a provider throttles a session and
//! after every completed exchange. Handling never fails from the caller's
//! point of view: malformed bodies are rejected by the extractor, everything
//! after that is accepted.
//!
//! - POST /signals/throttle   `ThrottleSignal` → 202 with the switch decision
//! - POST /signals/usage      `UsageSignal` → 202

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use account_pool::{SwitchDecision, ThrottleHandler, ThrottleSignal, UsageListener, UsageSignal};

#[derive(Clone)]
pub struct SignalState {
    throttle: Arc<ThrottleHandler>,
    usage: Arc<UsageListener>,
}

impl SignalState {
    pub fn new(throttle: Arc<ThrottleHandler>, usage: Arc<UsageListener>) -> Self {
        Self { throttle, usage }
    }
}

pub fn build_signal_router(state: SignalState) -> Router {
    Router::new()
        .route("/signals/throttle", post(throttle_signal))
        .route("/signals/usage", post(usage_signal))
        .with_state(state)
}

async fn throttle_signal(
    State(state): State<SignalState>,
    Json(signal): Json<ThrottleSignal>,
) -> impl IntoResponse {
    let decision = state.throttle.handle(&signal).await;
    let mut body = serde_json::json!({
        "decision": decision.as_ref().map(SwitchDecision::label),
    });
    if let Some(
        SwitchDecision::Prompt { to_account_id } | SwitchDecision::Execute { to_account_id },
    ) = &decision
    {
        body["toAccountId"] = serde_json::json!(to_account_id);
    }
    (StatusCode::ACCEPTED, Json(body))
}

async fn usage_signal(
    State(state): State<SignalState>,
    Json(signal): Json<UsageSignal>,
) -> impl IntoResponse {
    state.usage.on_usage(&signal).await;
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use account_pool::{
        AccountEvent, AccountRegistry, BroadcastSink, EventSink, ManualClock, NewAccount,
    };
    use account_store::{AccountStatus, MemoryStore, SwitchConfigPatch};
    use tokio::sync::broadcast;
    use usage_store::MemoryUsageStore;

    struct Harness {
        registry: Arc<AccountRegistry>,
        events: broadcast::Receiver<AccountEvent>,
        app: Router,
    }

    fn harness() -> Harness {
        let registry = Arc::new(AccountRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        ));
        let usage = Arc::new(MemoryUsageStore::new());
        let broadcast = BroadcastSink::new(64);
        let events = broadcast.subscribe();
        let sink: Arc<dyn EventSink> = Arc::new(broadcast);

        let throttle = Arc::new(ThrottleHandler::new(
            registry.clone(),
            usage.clone(),
            sink.clone(),
        ));
        let listener = Arc::new(UsageListener::new(
            registry.clone(),
            usage,
            sink,
            vec!["-ai-".into()],
        ));
        Harness {
            registry,
            events,
            app: build_signal_router(SignalState::new(throttle, listener)),
        }
    }

    async fn add(registry: &AccountRegistry, name: &str) -> String {
        registry
            .add(NewAccount::new(
                name,
                format!("{name}@example.com"),
                format!("/tmp/{name}"),
            ))
            .await
            .unwrap()
            .id
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<AccountEvent>) -> Vec<&'static str> {
        let mut channels = Vec::new();
        while let Ok(event) = rx.try_recv() {
            channels.push(event.channel());
        }
        channels
    }

    #[tokio::test]
    async fn throttle_signal_returns_decision() {
        let mut h = harness();
        let a = add(&h.registry, "a").await;
        let b = add(&h.registry, "b").await;
        h.registry
            .update_switch_config(SwitchConfigPatch {
                prompt_before_switch: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();

        let response = h
            .app
            .clone()
            .oneshot(post_json(
                "/signals/throttle",
                serde_json::json!({
                    "sessionId": "s1",
                    "accountId": a,
                    "errorType": "rate_limited",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["decision"], "execute");
        assert_eq!(json["toAccountId"], b.as_str());

        assert_eq!(
            h.registry.get(&a).await.unwrap().unwrap().status,
            AccountStatus::Throttled
        );
        assert_eq!(drain(&mut h.events), vec!["account:switch-execute"]);
    }

    #[tokio::test]
    async fn throttle_for_unknown_account_is_still_accepted() {
        let h = harness();
        let response = h
            .app
            .oneshot(post_json(
                "/signals/throttle",
                serde_json::json!({
                    "sessionId": "s1",
                    "accountId": "missing",
                    "errorType": "rate_limited",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["decision"].is_null());
    }

    #[tokio::test]
    async fn usage_signal_publishes_update() {
        let mut h = harness();
        let a = add(&h.registry, "a").await;
        h.registry.assign_to_session("s1", &a).await.unwrap();

        let response = h
            .app
            .clone()
            .oneshot(post_json(
                "/signals/usage",
                serde_json::json!({
                    "sessionId": "s1-ai-3",
                    "usageStats": { "inputTokens": 120, "outputTokens": 30, "costUsd": 0.002 },
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(drain(&mut h.events), vec!["account:usage-update"]);
    }

    #[tokio::test]
    async fn malformed_signal_is_rejected() {
        let h = harness();
        let response = h
            .app
            .oneshot(post_json(
                "/signals/usage",
                serde_json::json!({ "usageStats": {} }),
            ))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
