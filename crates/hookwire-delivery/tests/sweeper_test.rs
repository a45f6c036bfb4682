//! Retry sweeping and exhaustion.

use std::time::Duration;

use anyhow::Result;
use hookwire_core::{DeliveryEvent, MutationKind, WebhookConfig};
use hookwire_delivery::storage::DeliveryStorage;
use hookwire_testing::{ListenerBuilder, SubjectBuilder, TestEnv};

#[tokio::test]
async fn unreachable_listener_is_retried_then_given_up() -> Result<()> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]).max_attempts(2))
        .build()
        .await?;
    // Nothing listens on port 1.
    let listener = ListenerBuilder::new("article").url("http://127.0.0.1:1/hook").build();
    env.storage.add_listener(listener).await?;

    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;

    // Fan-out with a failed first attempt.
    let processing = env.engine.processor().process_pending().await?;
    assert_eq!(processing.tasks_created(), 1);
    assert_eq!(processing.delivered(), 0);
    let task = env.storage.tasks().await.remove(0);
    assert_eq!(task.attempts, 1);
    assert!(!task.processed);
    assert!(task.failed_at.is_some());

    // One retry, which also fails.
    env.clock.advance(Duration::from_secs(60));
    let second = env.engine.sweeper().sweep().await?;
    assert_eq!(second.retried, 1);
    assert_eq!(second.failed, 1);
    assert_eq!(second.exhausted, 0);
    let task = env.storage.find_task(task.id).await?.expect("task exists");
    assert_eq!(task.attempts, 2);
    assert!(!task.processed);

    // Given up without another attempt.
    env.clock.advance(Duration::from_secs(60));
    let third = env.engine.sweeper().sweep().await?;
    assert_eq!(third.exhausted, 1);
    assert_eq!(third.retried, 0);
    let task = env.storage.find_task(task.id).await?.expect("task exists");
    assert_eq!(task.attempts, 2);
    assert!(task.processed);

    let attempts = env.storage.find_attempts(task.id).await?;
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| !a.succeeded));
    assert_eq!(env.events.failed_count().await, 2);
    assert_eq!(env.events.exhausted_count().await, 1);
    assert_eq!(env.events.succeeded_count().await, 0);

    let fourth = env.engine.sweeper().sweep().await?;
    assert_eq!(fourth.retried, 0);
    assert_eq!(fourth.exhausted, 0);
    Ok(())
}

#[tokio::test]
async fn batches_fan_out_then_sweep() -> Result<()> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]).max_attempts(2))
        .build()
        .await?;
    env.storage
        .add_listener(ListenerBuilder::new("article").url("http://127.0.0.1:1/hook").build())
        .await?;
    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;

    // The first batch makes the first attempt and the first retry.
    let first = env.run_batch().await?;
    assert_eq!(first.processing.tasks_created(), 1);
    assert_eq!(first.sweep.retried, 1);
    assert_eq!(first.sweep.exhausted, 0);

    let second = env.run_batch().await?;
    assert_eq!(second.processing.outcomes.len(), 0);
    assert_eq!(second.sweep.exhausted, 1);
    assert_eq!(second.sweep.retried, 0);

    let task = env.storage.tasks().await.remove(0);
    assert!(task.processed);
    assert_eq!(task.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn retry_succeeds_after_failed_first_attempt() -> Result<()> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]).max_attempts(3))
        .require_success_status(true)
        .build()
        .await?;
    env.http.respond_sequence("/hook", &[500, 200]).await;
    env.add_listener(ListenerBuilder::new("article"), "/hook").await?;

    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;
    let report = env.run_batch().await?;
    assert_eq!(report.processing.delivered(), 0);
    assert_eq!(report.sweep.retried, 1);
    assert_eq!(report.sweep.delivered, 1);

    let task = env.storage.tasks().await.remove(0);
    assert!(task.processed);
    assert_eq!(task.attempts, 2);
    assert_eq!(env.http.request_count("/hook").await, 2);

    let attempts = env.storage.find_attempts(task.id).await?;
    let statuses: Vec<Option<u16>> = attempts.iter().map(|a| a.response_status).collect();
    assert_eq!(statuses, vec![Some(500), Some(200)]);
    assert_eq!(
        attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
        vec![1, 2]
    );
    Ok(())
}

#[tokio::test]
async fn single_attempt_registration_is_given_up_by_the_same_batch() -> Result<()> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]))
        .require_success_status(true)
        .build()
        .await?;
    env.http.respond("/hook", 503).await;
    env.add_listener(ListenerBuilder::new("article"), "/hook").await?;

    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;
    let report = env.run_batch().await?;

    assert_eq!(report.sweep.exhausted, 1);
    assert_eq!(report.sweep.retried, 0);
    assert_eq!(env.http.request_count("/hook").await, 1);

    let events = env.events.events().await;
    let exhausted: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DeliveryEvent::Exhausted(event) => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].attempts, 1);
    Ok(())
}

#[tokio::test]
async fn listeners_progress_independently() -> Result<()> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]).max_attempts(2))
        .require_success_status(true)
        .build()
        .await?;
    env.http.respond("/ok", 200).await;
    env.http.respond("/broken", 500).await;
    let ok = env
        .add_listener(ListenerBuilder::new("article").filter("status", "published"), "/ok")
        .await?;
    let broken =
        env.add_listener(ListenerBuilder::new("article").filter("author", "7"), "/broken").await?;

    let article =
        SubjectBuilder::article("1").field("status", "published").field("author", "7").build();
    env.mutate(&article, MutationKind::Created).await?;

    env.run_batch().await?;
    env.run_batch().await?;

    let tasks = env.storage.tasks().await;
    assert_eq!(tasks.len(), 2);
    let ok_task = tasks.iter().find(|t| t.listener_id == ok.id).expect("task for ok listener");
    let broken_task =
        tasks.iter().find(|t| t.listener_id == broken.id).expect("task for broken listener");

    assert!(ok_task.processed);
    assert_eq!(ok_task.attempts, 1);
    assert!(broken_task.processed);
    assert_eq!(broken_task.attempts, 2);

    assert_eq!(env.http.request_count("/ok").await, 1);
    assert_eq!(env.http.request_count("/broken").await, 2);
    Ok(())
}

#[tokio::test]
async fn sweep_only_touches_its_registration_limits() -> Result<()> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]).max_attempts(1))
        .register(["comment"], WebhookConfig::new(["text"]).max_attempts(3))
        .require_success_status(true)
        .build()
        .await?;
    env.http.respond("/articles", 500).await;
    env.http.respond("/comments", 500).await;
    env.add_listener(ListenerBuilder::new("article"), "/articles").await?;
    env.add_listener(ListenerBuilder::new("comment"), "/comments").await?;

    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;
    let comment = SubjectBuilder::new("comment", "1").field("text", "nice").build();
    env.mutate(&comment, MutationKind::Created).await?;

    env.engine.processor().process_pending().await?;
    let report = env.engine.sweeper().sweep().await?;

    // Article used its only attempt; the comment still has two left.
    assert_eq!(report.exhausted, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(env.http.request_count("/articles").await, 1);
    assert_eq!(env.http.request_count("/comments").await, 2);
    Ok(())
}
