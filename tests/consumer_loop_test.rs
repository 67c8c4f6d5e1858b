//! Consumer loop behavior against the in-memory broker: settlement,
//! redelivery, dead-lettering and recovery from broker faults.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{
    eventually, producer, reference_broker, settings, RunningConsumer, ScriptedHandler,
    DEAD_LETTER_QUEUE, QUEUE,
};
use tasker_lanes::messaging::{InMemoryBroker, TaskRequest};
use tasker_lanes::worker::ConsumerState;

const EXAMES: &str = "fluxo_exames";

fn hemograma() -> TaskRequest {
    TaskRequest::new("hemograma").with_data(json!({"paciente": {"id": 1, "nome": "A"}}))
}

#[tokio::test]
async fn test_successful_delivery_is_acked_and_never_redelivered() {
    let broker = reference_broker();
    let receipt = producer(&broker).try_publish(hemograma()).await.unwrap();
    let handler = ScriptedHandler::succeeding(EXAMES);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("ack", || consumer.stats.snapshot().acked == 1).await;
    // Give the loop a few more polls to prove nothing comes back
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = consumer.stop().await;
    assert_eq!(summary.deliveries, 1);
    assert_eq!(summary.requeued, 0);
    assert_eq!(handler.calls(), vec![receipt.task_id]);
    assert_eq!(broker.queue_depth(EXAMES, QUEUE), 0);
    assert_eq!(broker.unacked_count(EXAMES, QUEUE), 0);
}

#[tokio::test]
async fn test_failed_delivery_is_redelivered_until_success() {
    let broker = reference_broker();
    let receipt = producer(&broker).try_publish(hemograma()).await.unwrap();
    let handler = ScriptedHandler::failing_first(EXAMES, 2);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("ack after retries", || consumer.stats.snapshot().acked == 1).await;
    let summary = consumer.stop().await;

    assert_eq!(summary.requeued, 2);
    assert_eq!(summary.handler_failures, 2);
    assert_eq!(summary.dead_lettered, 0);
    assert_eq!(handler.calls(), vec![receipt.task_id; 3]);
    assert_eq!(broker.queue_depth(EXAMES, QUEUE), 0);
}

#[tokio::test]
async fn test_error_status_outcome_counts_as_failure() {
    let broker = reference_broker();
    producer(&broker).try_publish(hemograma()).await.unwrap();
    let handler = ScriptedHandler::reporting_errors_first(EXAMES, 1);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("ack", || consumer.stats.snapshot().acked == 1).await;
    let summary = consumer.stop().await;

    assert_eq!(summary.requeued, 1);
    assert_eq!(handler.call_count(), 2);
}

#[tokio::test]
async fn test_redelivery_limit_dead_letters_the_message() {
    let broker = reference_broker();
    broker.provision_queue_with_dead_letter(EXAMES, QUEUE, DEAD_LETTER_QUEUE);
    producer(&broker).try_publish(hemograma()).await.unwrap();
    let handler = ScriptedHandler::always_failing(EXAMES);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(3));

    eventually("dead letter", || consumer.stats.snapshot().dead_lettered == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = consumer.stop().await;

    assert_eq!(summary.requeued, 2);
    assert_eq!(handler.call_count(), 3);
    assert_eq!(broker.queue_depth(EXAMES, QUEUE), 0);
    assert_eq!(broker.queue_depth(EXAMES, DEAD_LETTER_QUEUE), 1);
}

#[tokio::test]
async fn test_limit_uses_message_id_counter_without_broker_count() {
    let broker = reference_broker().without_delivery_count();
    broker.provision_queue_with_dead_letter(EXAMES, QUEUE, DEAD_LETTER_QUEUE);
    producer(&broker).try_publish(hemograma()).await.unwrap();
    let handler = ScriptedHandler::always_failing(EXAMES);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(3));

    eventually("dead letter", || consumer.stats.snapshot().dead_lettered == 1).await;
    consumer.stop().await;

    assert_eq!(handler.call_count(), 3);
    assert_eq!(broker.queue_depth(EXAMES, DEAD_LETTER_QUEUE), 1);
}

#[tokio::test]
async fn test_unbounded_policy_keeps_requeueing() {
    let broker = reference_broker();
    producer(&broker).try_publish(hemograma()).await.unwrap();
    let handler = ScriptedHandler::always_failing(EXAMES);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(0));

    eventually("many requeues", || consumer.stats.snapshot().requeued >= 15).await;
    let summary = consumer.stop().await;

    assert_eq!(summary.dead_lettered, 0);
    assert_eq!(summary.acked, 0);
    // The message survives the worker
    assert_eq!(broker.queue_depth(EXAMES, QUEUE), 1);
    assert_eq!(broker.unacked_count(EXAMES, QUEUE), 0);
}

#[tokio::test]
async fn test_undecodable_delivery_is_rejected_without_reaching_handler() {
    let broker = reference_broker();
    broker.inject(EXAMES, QUEUE, b"not json".to_vec());
    broker.inject(EXAMES, QUEUE, br#"{"id": "7d3c1c5e-3f55-4b8e-9a53-0c5bd2a5e0a1", "tipo": "", "timestamp": "2024-05-01T10:00:00"}"#.to_vec());
    let handler = ScriptedHandler::succeeding(EXAMES);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(1));

    eventually("both rejected", || consumer.stats.snapshot().dead_lettered == 2).await;
    let summary = consumer.stop().await;

    assert_eq!(summary.decode_failures, 2);
    assert_eq!(handler.call_count(), 0);
    assert_eq!(broker.queue_depth(EXAMES, QUEUE), 0);
}

#[tokio::test]
async fn test_naive_timestamp_from_legacy_producer_is_accepted() {
    let broker = reference_broker();
    broker.inject(
        EXAMES,
        QUEUE,
        br#"{"id": "7d3c1c5e-3f55-4b8e-9a53-0c5bd2a5e0a1", "tipo": "raio_x", "paciente": {"id": 9}, "timestamp": "2024-05-01T10:00:00.123456"}"#.to_vec(),
    );
    let handler = ScriptedHandler::succeeding(EXAMES);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("ack", || consumer.stats.snapshot().acked == 1).await;
    let summary = consumer.stop().await;
    assert_eq!(summary.decode_failures, 0);
}

#[tokio::test]
async fn test_dropped_connection_reconnects_and_resumes() {
    let broker = reference_broker();
    let handler = ScriptedHandler::succeeding(EXAMES);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("consuming", || consumer.stats.state() == ConsumerState::Consuming).await;
    assert_eq!(broker.sever_connections(EXAMES), 1);

    eventually("loss detected", || consumer.stats.snapshot().connection_losses == 1).await;
    eventually("reconnected", || {
        consumer.stats.state() == ConsumerState::Consuming && broker.open_connections(EXAMES) == 1
    })
    .await;

    producer(&broker).try_publish(hemograma()).await.unwrap();
    eventually("ack after reconnect", || consumer.stats.snapshot().acked == 1).await;
    assert!(consumer.is_running());

    let summary = consumer.stop().await;
    assert!(summary.connect_attempts >= 2);
}

#[tokio::test]
async fn test_settlement_failure_sends_loop_back_to_reconnect() {
    let broker = reference_broker();
    let receipt = producer(&broker).try_publish(hemograma()).await.unwrap();
    let handler = ScriptedHandler::slow(EXAMES, Duration::from_millis(200));
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("handler entered", || handler.call_count() == 1).await;
    broker.sever_connections(EXAMES);

    // The ack of the first attempt fails; the broker redelivers after reconnect
    eventually("ack after redelivery", || consumer.stats.snapshot().acked == 1).await;
    let summary = consumer.stop().await;

    assert_eq!(summary.connection_losses, 1);
    assert_eq!(handler.calls(), vec![receipt.task_id; 2]);
    assert_eq!(broker.queue_depth(EXAMES, QUEUE), 0);
}

#[tokio::test]
async fn test_unreachable_broker_is_retried_with_backoff() {
    let broker = reference_broker();
    broker.set_unreachable(true);
    let handler = ScriptedHandler::succeeding(EXAMES);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("failed attempts", || consumer.stats.snapshot().connect_failures >= 2).await;
    assert!(consumer.is_running());

    broker.set_unreachable(false);
    producer(&broker).try_publish(hemograma()).await.unwrap();
    eventually("ack once reachable", || consumer.stats.snapshot().acked == 1).await;
    consumer.stop().await;
}

#[tokio::test]
async fn test_missing_queue_is_retried_until_provisioned() {
    let broker = InMemoryBroker::new();
    broker.provision_vhost(EXAMES);
    let handler = ScriptedHandler::succeeding(EXAMES);
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("queue check failures", || consumer.stats.snapshot().queue_unavailable >= 2).await;
    assert_eq!(broker.open_connections(EXAMES), 0);

    broker.provision_queue(EXAMES, QUEUE);
    eventually("consuming", || consumer.stats.state() == ConsumerState::Consuming).await;

    producer(&broker).try_publish(hemograma()).await.unwrap();
    eventually("ack", || consumer.stats.snapshot().acked == 1).await;
    consumer.stop().await;
}

#[tokio::test]
async fn test_shutdown_settles_in_flight_delivery_and_closes_connection() {
    let broker = reference_broker();
    producer(&broker).try_publish(hemograma()).await.unwrap();
    let handler = ScriptedHandler::slow(EXAMES, Duration::from_millis(150));
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("handler entered", || handler.call_count() == 1).await;
    let summary = consumer.stop().await;

    assert_eq!(summary.acked, 1);
    assert_eq!(summary.state, ConsumerState::Stopped);
    assert_eq!(broker.open_connections(EXAMES), 0);
    assert_eq!(broker.queue_depth(EXAMES, QUEUE), 0);
}

#[tokio::test]
async fn test_prefetch_ceiling_is_respected() {
    let broker = reference_broker();
    let producer = producer(&broker);
    for _ in 0..3 {
        producer.try_publish(hemograma()).await.unwrap();
    }
    let handler = ScriptedHandler::slow(EXAMES, Duration::from_millis(100));
    let consumer = RunningConsumer::spawn(EXAMES, &broker, handler.clone(), settings(10));

    eventually("handler entered", || handler.call_count() == 1).await;
    assert_eq!(broker.unacked_count(EXAMES, QUEUE), 1);
    assert_eq!(broker.queue_depth(EXAMES, QUEUE), 2);

    eventually("all acked", || consumer.stats.snapshot().acked == 3).await;
    consumer.stop().await;
}
