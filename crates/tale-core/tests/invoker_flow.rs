mod common;

use common::{harness, Behavior, FakeProvider};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tale_core::{BudgetStore, GuardConfig, SerdeValidator, TaleError, TextRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Title {
    title: String,
}

fn title_validator() -> SerdeValidator<Title> {
    SerdeValidator::new(json!({
        "type": "object",
        "properties": { "title": { "type": "string" } },
        "required": ["title"]
    }))
}

#[tokio::test]
async fn repeated_prompt_is_accounted_once() {
    let h = harness(FakeProvider::reply("The Lost Kite", 100, 50), GuardConfig::default());

    let first = h
        .invoker
        .invoke_text("title", TextRequest::new("a kite story"))
        .await
        .unwrap();
    assert!(!first.cached);
    assert_eq!(first.usage.tokens_in, 100);
    assert_eq!(first.usage.tokens_out, 50);

    let second = h
        .invoker
        .invoke_text("title", TextRequest::new("a kite story"))
        .await
        .unwrap();
    let third = h
        .invoker
        .invoke_text("title", TextRequest::new("a kite story"))
        .await
        .unwrap();
    assert!(second.cached && third.cached);
    assert_eq!(third.payload, "The Lost Kite");
    assert_eq!(h.provider.calls(), 1);

    let status = h.guard.snapshot().await.unwrap();
    assert_eq!(status.total_tokens_used, 150);
    let expected_cost = 100.0 * 0.000_001 + 50.0 * 0.000_002;
    assert!((status.total_cost_usd - expected_cost).abs() < 1e-12);
}

#[tokio::test]
async fn different_operations_do_not_share_cache_slots() {
    let h = harness(FakeProvider::reply("text", 1, 1), GuardConfig::default());
    h.invoker
        .invoke_text("title", TextRequest::new("same prompt"))
        .await
        .unwrap();
    let other = h
        .invoker
        .invoke_text("summary", TextRequest::new("same prompt"))
        .await
        .unwrap();
    assert!(!other.cached);
    assert_eq!(h.provider.calls(), 2);
}

#[tokio::test]
async fn missing_usage_still_counts_as_success() {
    let h = harness(
        FakeProvider::new(Behavior::Reply {
            text: "ok".into(),
            usage: None,
        }),
        GuardConfig::default(),
    );
    h.guard.record_outcome(tale_core::Outcome::Failure).await;
    let out = h
        .invoker
        .invoke_text("story", TextRequest::new("no usage"))
        .await
        .unwrap();
    assert!(out.cost.is_none());
    let status = h.guard.snapshot().await.unwrap();
    assert_eq!(status.failure_count, 0);
    assert_eq!(status.total_tokens_used, 0);
}

#[tokio::test(start_paused = true)]
async fn hung_provider_times_out_and_counts_as_failure() {
    let h = harness(FakeProvider::new(Behavior::Hang), GuardConfig::default());
    let req = TextRequest::new("never answers").with_timeout(Duration::from_millis(500));

    let err = h.invoker.invoke_text("story", req).await.unwrap_err();
    assert!(matches!(err, TaleError::ProviderTimeout(d) if d == Duration::from_millis(500)));
    assert_eq!(h.guard.snapshot().await.unwrap().failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn default_timeout_applies_without_request_override() {
    let h = harness(FakeProvider::new(Behavior::Hang), GuardConfig::default());
    let err = h
        .invoker
        .invoke_text("story", TextRequest::new("hang"))
        .await
        .unwrap_err();
    assert!(matches!(err, TaleError::ProviderTimeout(d) if d == Duration::from_millis(2_000)));
}

#[tokio::test]
async fn structured_reply_is_validated_and_cached() {
    let h = harness(
        FakeProvider::new(Behavior::Structured {
            value: json!({ "title": "Moonlit Garden" }),
            usage: Some(json!({ "input_tokens": 20, "output_tokens": 5 })),
        }),
        GuardConfig::default(),
    );
    let validator = title_validator();

    let out = h
        .invoker
        .invoke_structured("title", TextRequest::new("garden"), &validator)
        .await
        .unwrap();
    assert_eq!(out.payload.title, "Moonlit Garden");

    let again = h
        .invoker
        .invoke_structured("title", TextRequest::new("garden"), &validator)
        .await
        .unwrap();
    assert!(again.cached);
    assert_eq!(again.payload, out.payload);
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test]
async fn schema_mismatch_is_terminal_but_not_a_breaker_failure() {
    let h = harness(
        FakeProvider::new(Behavior::Structured {
            value: json!({ "name": "wrong shape" }),
            usage: Some(json!({ "tokensInput": 30, "tokensOutput": 10 })),
        }),
        GuardConfig::default(),
    );
    let validator = title_validator();

    let err = h
        .invoker
        .invoke_structured("title", TextRequest::new("garden"), &validator)
        .await
        .unwrap_err();
    assert!(matches!(err, TaleError::SchemaValidation(_)));

    let status = h.guard.snapshot().await.unwrap();
    assert_eq!(status.failure_count, 0);
    assert_eq!(status.total_tokens_used, 40);

    // nothing was cached, so the provider is asked again
    let _ = h
        .invoker
        .invoke_structured("title", TextRequest::new("garden"), &validator)
        .await;
    assert_eq!(h.provider.calls(), 2);
}

#[tokio::test]
async fn stream_success_resets_failures() {
    let h = harness(
        FakeProvider::new(Behavior::Stream(vec![
            Ok("Once ".into()),
            Ok("upon ".into()),
            Ok("a time".into()),
        ])),
        GuardConfig::default(),
    );
    h.guard.record_outcome(tale_core::Outcome::Failure).await;

    let stream = h
        .invoker
        .invoke_streamed(TextRequest::new("tell me"))
        .await
        .unwrap();
    let parts: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
    assert_eq!(parts.concat(), "Once upon a time");
    assert_eq!(h.guard.snapshot().await.unwrap().failure_count, 0);
}

#[tokio::test]
async fn stream_error_stops_and_counts_failure() {
    let h = harness(
        FakeProvider::new(Behavior::Stream(vec![
            Ok("Once ".into()),
            Err("connection reset".into()),
            Ok("never seen".into()),
        ])),
        GuardConfig::default(),
    );
    let items: Vec<_> = h
        .invoker
        .invoke_streamed(TextRequest::new("tell me"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    assert!(items[1].is_err());
    assert_eq!(h.guard.snapshot().await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn stream_failure_is_counted_before_the_error_reaches_the_consumer() {
    let h = harness(
        FakeProvider::new(Behavior::Stream(vec![
            Ok("Once ".into()),
            Err("connection reset".into()),
        ])),
        GuardConfig::default(),
    );
    let mut stream = h
        .invoker
        .invoke_streamed(TextRequest::new("tell me"))
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_ok());
    assert!(stream.next().await.unwrap().is_err());
    drop(stream);
    assert_eq!(h.guard.snapshot().await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn stream_dropped_early_records_nothing() {
    let h = harness(
        FakeProvider::new(Behavior::Stream(vec![Ok("Once ".into()), Ok("upon".into())])),
        GuardConfig::default(),
    );
    h.guard.record_outcome(tale_core::Outcome::Failure).await;
    let mut stream = h
        .invoker
        .invoke_streamed(TextRequest::new("tell me"))
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "Once ");
    drop(stream);
    let state = h.guard.snapshot().await.unwrap();
    assert_eq!(state.failure_count, 1);
    assert_eq!(state.total_tokens_used, 0);
}

#[tokio::test]
async fn stream_respects_open_circuit() {
    let h = harness(FakeProvider::new(Behavior::Stream(vec![])), GuardConfig::default());
    h.guard.record_success(0, 1.0).await;
    let err = match h.invoker.invoke_streamed(TextRequest::new("x")).await {
        Ok(_) => panic!("stream should be rejected"),
        Err(e) => e,
    };
    assert!(err.is_policy_rejection());
    assert_eq!(h.provider.calls(), 0);
}
