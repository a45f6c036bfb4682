//! End-to-end batches: capture, fan-out, delivery, retry and exhaustion.

use anyhow::Result;
use hookwire_core::{DeliveryEvent, MutationKind, WebhookConfig};
use hookwire_delivery::storage::DeliveryStorage;
use hookwire_testing::{ListenerBuilder, SubjectBuilder, TestEnv};
use serde_json::json;

async fn article_env(max_attempts: u32) -> Result<TestEnv> {
    TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]).max_attempts(max_attempts))
        .require_success_status(true)
        .build()
        .await
}

#[tokio::test]
async fn draft_article_reaches_no_one() -> Result<()> {
    let env = article_env(2).await?;
    env.http.respond("/published", 200).await;
    env.add_listener(ListenerBuilder::new("article").filter("status", "published"), "/published")
        .await?;

    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;
    let report = env.run_batch().await?;

    assert_eq!(report.processing.discarded(), 1);
    assert_eq!(report.processing.tasks_created(), 0);
    assert!(env.storage.messages().await.is_empty());
    assert!(env.storage.tasks().await.is_empty());
    assert_eq!(env.http.request_count("/published").await, 0);
    Ok(())
}

#[tokio::test]
async fn published_article_is_delivered_once() -> Result<()> {
    let env = article_env(2).await?;
    env.http.respond("/published", 200).await;
    env.add_listener(ListenerBuilder::new("article").filter("status", "published"), "/published")
        .await?;

    let article = SubjectBuilder::article("1").field("status", "published").build();
    env.mutate(&article, MutationKind::Created).await?;
    let report = env.run_batch().await?;

    assert_eq!(report.processing.tasks_created(), 1);
    assert_eq!(report.processing.delivered(), 1);
    assert_eq!(report.sweep.retried, 0);

    let task = env.storage.tasks().await.remove(0);
    assert!(task.processed);
    assert_eq!(task.attempts, 1);

    let requests = env.http.requests_to("/published").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].json()?,
        json!([{"model": "article", "pk": "1", "fields": {"title": "Article 1"}}])
    );

    // Later batches leave the delivered task alone.
    let report = env.run_batch().await?;
    assert_eq!(report.sweep.retried, 0);
    assert_eq!(report.sweep.exhausted, 0);
    assert_eq!(env.http.request_count("/published").await, 1);
    Ok(())
}

#[tokio::test]
async fn unreachable_listener_is_given_up_after_max_attempts() -> Result<()> {
    let env = article_env(2).await?;
    env.storage
        .add_listener(ListenerBuilder::new("article").url("http://127.0.0.1:1/hook").build())
        .await?;

    env.mutate(&SubjectBuilder::article("1").build(), MutationKind::Created).await?;

    let processing = env.engine.processor().process_pending().await?;
    assert_eq!(processing.delivered(), 0);
    let task = env.storage.tasks().await.remove(0);
    assert_eq!((task.attempts, task.processed), (1, false));
    assert!(task.failed_at.is_some());

    let sweep = env.engine.sweeper().sweep().await?;
    assert_eq!((sweep.retried, sweep.exhausted), (1, 0));
    let task = env.storage.find_task(task.id).await?.expect("task exists");
    assert_eq!((task.attempts, task.processed), (2, false));

    let sweep = env.engine.sweeper().sweep().await?;
    assert_eq!((sweep.retried, sweep.exhausted), (0, 1));
    let task = env.storage.find_task(task.id).await?.expect("task exists");
    assert_eq!((task.attempts, task.processed), (2, true));

    let attempts = env.storage.find_attempts(task.id).await?;
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| !a.succeeded && a.response_status.is_none()));

    let events = env.events.events_for(task.id).await;
    assert!(matches!(events.last(), Some(DeliveryEvent::Exhausted(e)) if e.attempts == 2));
    Ok(())
}

#[tokio::test]
async fn two_filters_matching_one_message_make_two_tasks() -> Result<()> {
    let env = article_env(2).await?;
    env.http.respond("/by-status", 200).await;
    env.http.respond_sequence("/by-lang", &[500, 200]).await;
    let by_status = env
        .add_listener(ListenerBuilder::new("article").filter("status", "published"), "/by-status")
        .await?;
    let by_lang =
        env.add_listener(ListenerBuilder::new("article").filter("lang", "en"), "/by-lang").await?;

    let article =
        SubjectBuilder::article("1").field("status", "published").field("lang", "en").build();
    env.mutate(&article, MutationKind::Updated).await?;

    let processing = env.engine.processor().process_pending().await?;
    assert_eq!(processing.tasks_created(), 2);
    assert_eq!(processing.delivered(), 1);

    let sweep = env.engine.sweeper().sweep().await?;
    assert_eq!((sweep.retried, sweep.delivered), (1, 1));

    let tasks = env.storage.tasks().await;
    let status_task = tasks.iter().find(|t| t.listener_id == by_status.id).expect("status task");
    let lang_task = tasks.iter().find(|t| t.listener_id == by_lang.id).expect("lang task");
    assert_eq!((status_task.attempts, status_task.processed), (1, true));
    assert_eq!((lang_task.attempts, lang_task.processed), (2, true));
    assert_eq!(status_task.message_id, lang_task.message_id);
    Ok(())
}

#[tokio::test]
async fn many_messages_share_one_batch() -> Result<()> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]))
        .register(["comment"], WebhookConfig::new(["text"]).max_attempts(3))
        .concurrency(4)
        .build()
        .await?;
    env.http.respond("/articles", 200).await;
    env.http.respond("/comments", 204).await;
    env.add_listener(ListenerBuilder::new("article"), "/articles").await?;
    env.add_listener(ListenerBuilder::new("comment"), "/comments").await?;
    env.add_listener(ListenerBuilder::new("comment"), "/comments").await?;

    for id in 0..5 {
        env.mutate(&SubjectBuilder::article(id.to_string()).build(), MutationKind::Created)
            .await?;
        let comment =
            SubjectBuilder::new("comment", id.to_string()).field("text", "first!").build();
        env.mutate(&comment, MutationKind::Created).await?;
    }

    let report = env.run_batch().await?;
    assert_eq!(report.processing.fanned_out(), 10);
    assert_eq!(report.processing.tasks_created(), 15);
    assert_eq!(report.processing.delivered(), 15);
    assert_eq!(env.http.request_count("/articles").await, 5);
    assert_eq!(env.http.request_count("/comments").await, 10);
    assert_eq!(env.events.succeeded_count().await, 15);
    Ok(())
}
