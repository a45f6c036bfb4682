//! Property-based tests for core domain rules.
//!
//! Deterministic and in-memory; no database needed.

use chrono::Utc;
use hookwire_core::{
    payload_digest, render_property, DeliveryTask, JsonSerializer, JsonSubject, ListenerId,
    MessageId, RegistryBuilder, Serializer, SubjectRef, WebhookConfig,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use serde_json::{Map, Value};

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() }
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Attempts only ever grow by one, and a task is retryable or exhausted
    /// but never both while open.
    #[test]
    fn task_attempts_are_monotonic(max_attempts in 1u32..6, calls in 0usize..10) {
        let now = Utc::now();
        let mut task = DeliveryTask::new(MessageId::new(), ListenerId::new(), now);

        for expected in 1..=calls {
            let before = task.attempts;
            let number = task.begin_attempt(now);
            task.mark_failed(now);
            prop_assert_eq!(number, before + 1);
            prop_assert_eq!(task.attempts as usize, expected);
            prop_assert!(task.is_retryable(max_attempts) != task.is_exhausted(max_attempts));
        }

        task.mark_delivered(now);
        prop_assert!(!task.is_retryable(max_attempts));
        prop_assert!(!task.is_exhausted(max_attempts));
    }

    #[test]
    fn digest_is_stable_lowercase_hex(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
        let digest = payload_digest(&payload);
        prop_assert_eq!(digest.len(), 64);
        prop_assert!(digest.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        prop_assert_eq!(digest, payload_digest(&payload));
    }

    #[test]
    fn scalars_render_as_their_text(s in ".*", n in any::<i64>(), b in any::<bool>()) {
        prop_assert_eq!(render_property(&Value::from(s.clone())), Some(s));
        prop_assert_eq!(render_property(&Value::from(n)), Some(n.to_string()));
        prop_assert_eq!(render_property(&Value::from(b)), Some(b.to_string()));
    }

    /// Payload fields follow registration order, not subject order.
    #[test]
    fn payload_keeps_registration_field_order(
        names in proptest::collection::btree_set("[a-z]{1,8}", 1..6),
    ) {
        let mut fields = Map::new();
        for name in names.iter().rev() {
            fields.insert(name.clone(), Value::from(name.len()));
        }
        let subject = JsonSubject::new(SubjectRef::new("article", "1"), fields);
        let order: Vec<String> = names.iter().cloned().collect();

        let payload = JsonSerializer.serialize(&subject, &order).expect("all fields exist");
        let value: Value = serde_json::from_slice(&payload).expect("valid json");
        let keys: Vec<String> = value[0]["fields"]
            .as_object()
            .expect("fields object")
            .keys()
            .cloned()
            .collect();
        prop_assert_eq!(keys, order);
    }

    #[test]
    fn registrations_iterate_sorted(
        types in proptest::collection::hash_set("[a-z]{1,10}", 1..8),
    ) {
        let mut builder = RegistryBuilder::new();
        for subject_type in &types {
            builder
                .register([subject_type.as_str()], WebhookConfig::new(["title"]))
                .expect("distinct types register");
        }
        let registry = builder.build();

        let listed: Vec<String> =
            registry.registrations().map(|r| r.subject_type.to_string()).collect();
        let mut expected: Vec<String> = types.into_iter().collect();
        expected.sort();
        prop_assert_eq!(listed, expected);
    }
}
