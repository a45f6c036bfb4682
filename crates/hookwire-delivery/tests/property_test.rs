//! Property tests for listener matching, attempt counting and retry
//! selection.

use std::collections::BTreeSet;

use chrono::Utc;
use hookwire_core::{
    DeliveryTask, JsonSubject, Listener, ListenerId, Message, MessageId, SubjectRef,
    WebhookConfig,
};
use hookwire_delivery::{select_listeners, storage::DeliveryStorage, SweepReport};
use hookwire_testing::{ListenerBuilder, TestEnv};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use serde_json::{Map, Value};

const PROPERTIES: [&str; 3] = ["status", "author", "lang"];
const VALUES: [&str; 3] = ["a", "b", "c"];

fn listener_strategy() -> impl Strategy<Value = Listener> {
    (prop::option::of((0..PROPERTIES.len(), 0..VALUES.len())), "[a-z]{1,8}").prop_map(
        |(filter, path)| {
            let owner = SubjectRef::new("user", "1");
            let listener = Listener::new("article", format!("http://example.com/{path}"), owner);
            match filter {
                Some((p, v)) => listener.filtered(PROPERTIES[p], VALUES[v]),
                None => listener,
            }
        },
    )
}

fn subject_strategy() -> impl Strategy<Value = JsonSubject> {
    prop::collection::vec(prop::option::of(0..VALUES.len()), PROPERTIES.len()).prop_map(
        |values| {
            let mut fields = Map::new();
            for (name, value) in PROPERTIES.iter().zip(values) {
                if let Some(v) = value {
                    fields.insert((*name).to_string(), Value::String(VALUES[v].to_string()));
                }
            }
            JsonSubject::new(SubjectRef::new("article", "1"), fields)
        },
    )
}

proptest! {
    #[test]
    fn selected_listeners_follow_the_matching_rule(
        listeners in prop::collection::vec(listener_strategy(), 0..12),
        subject in subject_strategy(),
    ) {
        let selected: BTreeSet<ListenerId> =
            select_listeners(listeners.clone(), &subject).iter().map(|l| l.id).collect();
        let any_filtered = listeners.iter().any(|l| !l.is_wildcard());

        for listener in &listeners {
            let expected = if listener.is_wildcard() {
                !any_filtered
            } else {
                subject.fields().get(&listener.property).and_then(Value::as_str)
                    == Some(listener.value.as_str())
            };
            prop_assert_eq!(selected.contains(&listener.id), expected);
        }
    }

    #[test]
    fn attempts_grow_by_one_and_failures_never_complete(outcomes in prop::collection::vec(any::<bool>(), 1..10)) {
        let mut task = DeliveryTask::new(MessageId::new(), ListenerId::new(), Utc::now());

        for (index, delivered) in outcomes.iter().enumerate() {
            if task.processed {
                break;
            }
            let before = task.attempts;
            let number = task.begin_attempt(Utc::now());
            prop_assert_eq!(number, before + 1);
            prop_assert_eq!(task.attempts, u32::try_from(index + 1).unwrap());

            if *delivered {
                task.mark_delivered(Utc::now());
                prop_assert!(task.processed);
            } else {
                task.mark_failed(Utc::now());
                prop_assert!(!task.processed);
                prop_assert!(task.failed_at.is_some());
            }
        }
    }
}

/// Task state before a sweep: `(attempts, processed)`.
type Seed = (u32, bool);

/// Seeds one message whose tasks start in the given states, runs a single
/// sweep and returns the report, every task before and after, and the number
/// of POSTs the listeners received.
async fn sweep_seeded(
    max_attempts: u32,
    seeds: &[Seed],
) -> anyhow::Result<(SweepReport, Vec<(DeliveryTask, DeliveryTask)>, usize)> {
    let env = TestEnv::builder()
        .register(["article"], WebhookConfig::new(["title"]).max_attempts(max_attempts))
        .require_success_status(true)
        .build()
        .await?;
    env.http.respond("/hook", 500).await;

    let now = Utc::now();
    let message = Message::new(SubjectRef::new("article", "1"), now);
    env.storage.create_message(message.clone()).await?;

    let mut tasks = Vec::with_capacity(seeds.len());
    for &(attempts, processed) in seeds {
        let listener = env.add_listener(ListenerBuilder::new("article"), "/hook").await?;
        let mut task = DeliveryTask::new(message.id, listener.id, now);
        task.attempts = attempts;
        task.processed = processed;
        tasks.push(task);
    }
    env.storage.commit_fan_out(message, tasks.clone()).await?;

    let report = env.engine.sweeper().sweep().await?;

    let mut pairs = Vec::with_capacity(tasks.len());
    for before in tasks {
        let after = env.storage.find_task(before.id).await?.expect("task kept");
        pairs.push((before, after));
    }
    let requests = env.http.request_count("/hook").await;
    Ok((report, pairs, requests))
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, failure_persistence: None, ..ProptestConfig::default() })]

    #[test]
    fn sweep_partitions_open_tasks_into_retried_and_exhausted(
        max_attempts in 1u32..5,
        seeds in prop::collection::vec((0u32..7, any::<bool>()), 1..8),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime builds");
        let (report, pairs, requests) =
            runtime.block_on(sweep_seeded(max_attempts, &seeds)).expect("sweep runs");

        let retryable = seeds.iter().filter(|(a, p)| !p && *a < max_attempts).count();
        let exhausted = seeds.iter().filter(|(a, p)| !p && *a >= max_attempts).count();
        prop_assert_eq!(report.retried, retryable);
        prop_assert_eq!(report.exhausted, exhausted);
        prop_assert_eq!(report.failed, retryable);
        prop_assert_eq!(requests, retryable);

        for (before, after) in &pairs {
            if before.processed {
                // Already terminal: never selected again.
                prop_assert_eq!(after.attempts, before.attempts);
                prop_assert!(after.processed);
            } else if before.attempts >= max_attempts {
                // Given up without another attempt.
                prop_assert_eq!(after.attempts, before.attempts);
                prop_assert!(after.processed);
            } else {
                prop_assert_eq!(after.attempts, before.attempts + 1);
                prop_assert!(!after.processed);
                prop_assert!(after.failed_at.is_some());
            }
        }
    }
}
