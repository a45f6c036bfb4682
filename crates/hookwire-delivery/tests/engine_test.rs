//! Batch runs, the batch lease and batch-level failures.

use std::time::Duration;

use anyhow::Result;
use hookwire_core::{Clock, MutationKind, WebhookConfig};
use hookwire_delivery::storage::DeliveryStorage;
use hookwire_testing::{ListenerBuilder, SubjectBuilder, TestEnv};

const LEASE: &str = "hookwire-batch";

async fn article_env() -> Result<TestEnv> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]).max_attempts(2))
        .build()
        .await?;
    env.http.respond("/hook", 200).await;
    env.add_listener(ListenerBuilder::new("article"), "/hook").await?;
    Ok(env)
}

#[tokio::test]
async fn batch_delivers_pending_messages() -> Result<()> {
    let env = article_env().await?;
    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;
    env.mutate(&SubjectBuilder::article("2").build(), MutationKind::Created).await?;

    let report = env.run_batch().await?;
    assert!(!report.skipped);
    assert_eq!(report.processing.fanned_out(), 2);
    assert_eq!(report.processing.delivered(), 2);
    assert!(!report.has_unregistered_types());
    assert_eq!(env.http.request_count("/hook").await, 2);
    assert!(env.storage.unprocessed_messages().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn empty_batch_is_a_no_op() -> Result<()> {
    let env = article_env().await?;
    let report = env.run_batch().await?;

    assert!(!report.skipped);
    assert!(report.processing.outcomes.is_empty());
    assert_eq!(report.sweep.retried, 0);
    assert_eq!(env.http.request_count("/hook").await, 0);
    Ok(())
}

#[tokio::test]
async fn held_lease_skips_the_batch_until_it_expires() -> Result<()> {
    let env = article_env().await?;
    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;

    let acquired = env
        .storage
        .try_acquire_lease(
            LEASE.to_string(),
            "other-process".to_string(),
            env.clock.now(),
            Duration::from_secs(60),
        )
        .await?;
    assert!(acquired);

    let report = env.run_batch().await?;
    assert!(report.skipped);
    assert_eq!(env.http.request_count("/hook").await, 0);
    assert_eq!(env.storage.unprocessed_messages().await?.len(), 1);

    env.clock.advance(Duration::from_secs(61));
    let report = env.run_batch().await?;
    assert!(!report.skipped);
    assert_eq!(report.processing.fanned_out(), 1);
    Ok(())
}

#[tokio::test]
async fn lease_is_released_after_each_batch() -> Result<()> {
    let env = article_env().await?;
    env.run_batch().await?;

    let acquired = env
        .storage
        .try_acquire_lease(
            LEASE.to_string(),
            "other-process".to_string(),
            env.clock.now(),
            Duration::from_secs(60),
        )
        .await?;
    assert!(acquired);
    Ok(())
}

#[tokio::test]
async fn listing_failure_fails_the_batch_and_releases_the_lease() -> Result<()> {
    let env = article_env().await?;
    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;
    env.storage.fail_next_listing("connection reset").await;

    let error = env.engine.run_once().await.expect_err("listing fails");
    assert!(error.to_string().contains("connection reset"));

    // The next batch picks the message up.
    let report = env.run_batch().await?;
    assert!(!report.skipped);
    assert_eq!(report.processing.fanned_out(), 1);
    Ok(())
}

#[tokio::test]
async fn unregistered_types_are_flagged() -> Result<()> {
    let env = article_env().await?;
    let comment = SubjectBuilder::new("comment", "1").field("text", "hi").build();
    env.save_subject(&comment).await;
    env.engine.capture().capture(&comment).await?;
    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;

    let report = env.run_batch().await?;
    assert!(report.has_unregistered_types());
    assert_eq!(report.processing.fanned_out(), 1);
    assert_eq!(env.storage.unprocessed_messages().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn removing_a_listener_drops_its_tasks() -> Result<()> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]).max_attempts(5))
        .require_success_status(true)
        .build()
        .await?;
    env.http.respond("/hook", 500).await;
    let listener = env.add_listener(ListenerBuilder::new("article"), "/hook").await?;
    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;
    env.run_batch().await?;
    assert_eq!(env.storage.tasks().await.len(), 1);

    assert!(env.storage.remove_listener(listener.id).await?);
    assert!(env.storage.tasks().await.is_empty());

    let report = env.run_batch().await?;
    assert_eq!(report.sweep.retried, 0);
    Ok(())
}
