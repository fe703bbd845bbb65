//! Property-based test generators using proptest.
//!
//! Documents are kept small and drawn from narrow alphabets so that
//! generated pairs share keys, repeat list items and collide often.

use proptest::prelude::*;
use serde_json::{Map, Value as JsonValue};
use tidepool_core::{Oid, Ref, Timestamp};
use tidepool_sync_protocol::AckNonce;

/// Strategy for generating root object identifiers.
pub fn oid_strategy() -> impl Strategy<Value = Oid> {
    (
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
        prop::string::string_regex("[a-z0-9]{1,12}").expect("Invalid regex"),
    )
        .prop_map(|(collection, id)| Oid::new(&collection, &id))
}

/// Strategy for generating timestamps from a few replicas.
pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (0u64..1_000_000, 0u32..100, prop::sample::select(vec!["a", "b", "c"]))
        .prop_map(|(wall, counter, replica)| Timestamp::new(0, wall, counter, replica))
}

/// Strategy for generating scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = JsonValue> {
    prop_oneof![
        1 => Just(JsonValue::Null),
        1 => any::<bool>().prop_map(JsonValue::Bool),
        3 => (0i64..5).prop_map(JsonValue::from),
        3 => prop::string::string_regex("[ab]{0,2}")
            .expect("Invalid regex")
            .prop_map(JsonValue::String),
    ]
}

/// Strategy for generating nested JSON values.
pub fn json_value_strategy() -> impl Strategy<Value = JsonValue> {
    scalar_strategy().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(JsonValue::Array),
            prop::collection::btree_map(field_name_strategy(), inner, 0..4)
                .prop_map(|fields| JsonValue::Object(fields.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// Strategy for generating document roots (always objects).
pub fn json_document_strategy() -> impl Strategy<Value = JsonValue> {
    prop::collection::btree_map(field_name_strategy(), json_value_strategy(), 0..5)
        .prop_map(|fields| JsonValue::Object(fields.into_iter().collect()))
}

/// Strategy for generating a sequence of document versions.
pub fn document_history_strategy() -> impl Strategy<Value = Vec<JsonValue>> {
    prop::collection::vec(json_document_strategy(), 1..5)
}

/// Strategy for generating scalar lists with many repeated items.
pub fn scalar_list_strategy() -> impl Strategy<Value = Vec<JsonValue>> {
    prop::collection::vec(
        prop::sample::select(vec!["a", "b", "c"]).prop_map(JsonValue::from),
        0..8,
    )
}

/// Strategy for generating a list of distinct object references and a
/// reordering of it.
pub fn reordered_refs_strategy() -> impl Strategy<Value = (Vec<JsonValue>, Vec<JsonValue>)> {
    (1usize..8)
        .prop_flat_map(|len| {
            let refs: Vec<JsonValue> = (0..len)
                .map(|n| Ref::Object(Oid::new("docs", "d1").with_sub_id(&n.to_string())).to_json())
                .collect();
            (Just(refs.clone()), Just(refs).prop_shuffle())
        })
}

/// Strategy for generating acknowledgement nonces.
pub fn ack_nonce_strategy() -> impl Strategy<Value = AckNonce> {
    (any::<u64>(), any::<u64>()).prop_map(|(first, last)| AckNonce::new(first, last))
}

fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-d]").expect("Invalid regex")
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
