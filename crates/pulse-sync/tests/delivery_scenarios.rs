//! End-to-end delivery scenarios over the scripted transport.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use pulse_core::{DeliveryOutcome, EventKind, EventPayload, PulseConfig};
use pulse_sync::{DeliveryCoordinator, HandshakeOutcome, SkipReason};
use pulse_testkit::{Fixture, SIGNED_TOKEN, SUBJECT, queued_event};
use pulse_transport::HttpResponse;
use serde_json::json;

fn coordinator(fx: &Fixture) -> DeliveryCoordinator {
    DeliveryCoordinator::new(
        Arc::clone(&fx.monitor),
        Arc::clone(&fx.queue),
        fx.identities.clone(),
        Arc::clone(&fx.api),
        fx.config.delivery.clone(),
    )
}

fn sent_event_ids(fx: &Fixture) -> Vec<String> {
    fx.transport
        .requests_to("event")
        .iter()
        .filter_map(|r| r.body.as_ref())
        .filter_map(|body| body["meta"]["eventId"].as_str().map(ToString::to_string))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn cold_start_handshake_issues_and_stores_identity() {
    let fx = Fixture::new();
    fx.healthy_backend();
    let delivery = coordinator(&fx);

    let outcome = delivery.handshake_and_flush(SUBJECT).await;

    assert!(matches!(outcome, HandshakeOutcome::Completed(Some(_))));
    assert_eq!(fx.transport.endpoint_log(), vec!["issue", "me"]);
    let stored = fx.identities.signed(SUBJECT).map(|t| t.expose().to_string());
    assert_eq!(stored.as_deref(), Some(SIGNED_TOKEN));
}

#[tokio::test(start_paused = true)]
async fn overloaded_backend_keeps_event_and_pauses() {
    let fx = Fixture::new();
    fx.with_signed_identity();
    fx.transport.respond_status("event", 503);
    let delivery = coordinator(&fx);

    let receipt = delivery
        .track_event(SUBJECT, EventPayload::new(EventKind::NewTip))
        .await;

    assert_eq!(receipt.outcome, DeliveryOutcome::Overloaded);
    assert!(fx.queue.contains(&receipt.event_id));
    assert!(delivery.auth_pause_remaining() >= Duration::from_millis(2_000));

    let report = delivery.flush_queue(SUBJECT).await;
    assert_eq!(report.skipped, Some(SkipReason::AuthPaused));
    assert_eq!(report.attempts, 0);
    assert_eq!(fx.transport.requests_to("event").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_event_ids_are_delivered_once() {
    let fx = Fixture::new();
    fx.with_signed_identity().healthy_backend();
    let delivery = coordinator(&fx);

    assert!(fx.queue.enqueue(queued_event("evt-1", EventKind::CopyTip)).unwrap());
    assert!(!fx.queue.enqueue(queued_event("evt-1", EventKind::CopyTip)).unwrap());

    let report = delivery.flush_queue(SUBJECT).await;

    assert_eq!(report.delivered, 1);
    assert_eq!(sent_event_ids(&fx), vec!["evt-1"]);
    assert!(fx.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn events_survive_an_outage_and_a_restart() {
    let fx = Fixture::new();
    fx.with_signed_identity();
    let delivery = coordinator(&fx);

    let mut ids = Vec::new();
    for kind in [EventKind::NewTip, EventKind::CopyTip, EventKind::ShareTip] {
        let receipt = delivery.track_event(SUBJECT, EventPayload::new(kind)).await;
        assert_ne!(receipt.outcome, DeliveryOutcome::Success);
        ids.push(receipt.event_id);
    }
    assert_eq!(fx.queue.len(), 3);
    drop(delivery);

    let revived = fx.restarted();
    assert_eq!(revived.queue.len(), 3);
    revived.healthy_backend();
    revived.transport.clear_requests();
    let delivery = coordinator(&revived);

    let report = delivery.flush_queue(SUBJECT).await;

    assert_eq!(report.delivered, 3);
    assert!(revived.queue.is_empty());
    assert_eq!(sent_event_ids(&revived), ids);
}

#[tokio::test(start_paused = true)]
async fn flush_preserves_order_across_rounds() {
    let mut config = PulseConfig::default();
    config.delivery = config.delivery.clone().with_batches(2, 5);
    let fx = Fixture::with_config(config);
    fx.with_signed_identity().healthy_backend();
    let delivery = coordinator(&fx);

    let ids: Vec<String> = (1..=5).map(|n| format!("evt-{n}")).collect();
    for id in &ids {
        fx.queue.enqueue(queued_event(id, EventKind::Topic)).unwrap();
    }

    let report = delivery.flush_queue(SUBJECT).await;

    assert_eq!(report.rounds, 3);
    assert_eq!(report.delivered, 5);
    assert_eq!(sent_event_ids(&fx), ids);
}

#[tokio::test(start_paused = true)]
async fn rejected_credential_pauses_then_recovers() {
    let fx = Fixture::new();
    fx.with_signed_identity().healthy_backend();
    fx.transport
        .respond_once("event", HttpResponse::json(401, json!({"error": "expired"})));
    let delivery = coordinator(&fx);

    let receipt = delivery
        .track_event(SUBJECT, EventPayload::new(EventKind::ShareTip))
        .await;

    assert_eq!(receipt.outcome, DeliveryOutcome::AuthRejected);
    assert!(fx.queue.contains(&receipt.event_id));
    assert!(delivery.auth_pause_remaining() >= Duration::from_millis(1_600));
    assert_eq!(fx.transport.requests_to("me").len(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!delivery.is_auth_paused());

    let report = delivery.flush_queue(SUBJECT).await;
    assert_eq!(report.delivered, 1);
    assert!(fx.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn flush_stops_at_overload_and_counts_the_attempt() {
    let fx = Fixture::new();
    fx.with_signed_identity();
    fx.transport
        .respond_once("event", HttpResponse::json(201, json!({})))
        .respond_once("event", HttpResponse::json(503, json!({})));
    let delivery = coordinator(&fx);

    for id in ["a", "b", "c"] {
        fx.queue.enqueue(queued_event(id, EventKind::NewTip)).unwrap();
    }

    let report = delivery.flush_queue(SUBJECT).await;

    assert_eq!(report.attempts, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.stopped_by, Some(DeliveryOutcome::Overloaded));

    let left = fx.queue.snapshot();
    let summary: Vec<(&str, u32)> = left
        .iter()
        .map(|e| (e.id.as_str(), e.attempt_count))
        .collect();
    assert_eq!(summary, vec![("b", 1), ("c", 0)]);
    assert!(delivery.is_auth_paused());
}

#[tokio::test(start_paused = true)]
async fn flush_stops_at_auth_rejection() {
    let fx = Fixture::new();
    fx.with_signed_identity();
    fx.transport.respond_status("event", 403);
    let delivery = coordinator(&fx);

    for id in ["a", "b"] {
        fx.queue.enqueue(queued_event(id, EventKind::NewTip)).unwrap();
    }

    let report = delivery.flush_queue(SUBJECT).await;

    assert_eq!(report.attempts, 1);
    assert_eq!(report.stopped_by, Some(DeliveryOutcome::AuthRejected));
    assert_eq!(fx.queue.len(), 2);
    assert!(delivery.auth_pause_remaining() >= Duration::from_millis(1_600));
}

#[tokio::test(start_paused = true)]
async fn flush_stops_at_transport_failure_without_pausing() {
    let fx = Fixture::new();
    fx.with_signed_identity();
    fx.transport.respond_once("event", HttpResponse::json(201, json!({})));
    let delivery = coordinator(&fx);

    for id in ["a", "b", "c"] {
        fx.queue.enqueue(queued_event(id, EventKind::NewTip)).unwrap();
    }

    let report = delivery.flush_queue(SUBJECT).await;

    assert_eq!(report.attempts, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.stopped_by, Some(DeliveryOutcome::Transport));
    assert!(!delivery.is_auth_paused());
    assert_eq!(fx.queue.len(), 2);
}
