use serde::{Deserialize, Serialize};

/// Attribute payload stored with every seeded record.
pub const TARGETING_RULES: &str = r#"{"country":"US"}"#;

/// Seeding logs progress every this many records.
pub const PROGRESS_EVERY: u64 = 10_000;

/// A single row of the synthetic dataset.
///
/// The identifier doubles as the primary key (`_id` in document stores).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticRecord {
    #[serde(rename = "_id", alias = "id")]
    pub id: i64,
    pub experiment_name: String,
    pub targeting_rules: String,
}

impl SyntheticRecord {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            experiment_name: format!("Test {}", id),
            targeting_rules: TARGETING_RULES.to_owned(),
        }
    }

    /// The attribute payload as a JSON value, for backends with a native
    /// JSON column type.
    pub fn targeting_rules_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.targeting_rules).unwrap_or(serde_json::Value::Null)
    }

    /// The record as a JSON object keyed by `id`, for key-value stores.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "experiment_name": self.experiment_name,
            "targeting_rules": self.targeting_rules,
        })
    }
}

/// Iterates over the whole dataset: ids `1..=record_count`, in order.
pub fn records(record_count: u64) -> impl Iterator<Item = SyntheticRecord> {
    (1..=record_count as i64).map(SyntheticRecord::new)
}

/// Splits `1..=record_count` into consecutive batches of at most
/// `batch_size` records.
pub fn batches(record_count: u64, batch_size: usize) -> impl Iterator<Item = Vec<SyntheticRecord>> {
    let batch_size = batch_size.max(1) as u64;
    (0..record_count.div_ceil(batch_size)).map(move |batch| {
        let first = batch * batch_size + 1;
        let last = std::cmp::min(first + batch_size - 1, record_count);
        (first as i64..=last as i64).map(SyntheticRecord::new).collect()
    })
}

/// Returns true if a progress line should be logged after writing the
/// record with the given id.
pub fn should_log_progress(id: u64, record_count: u64) -> bool {
    id % PROGRESS_EVERY == 0 || id == record_count
}
