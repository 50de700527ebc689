//! Fan-out response aggregation for control-plane procedures that address
//! more than one station (spec.md §4.8): tracks which `hashId`s are expected
//! to answer a broadcast request and resolves once all have, or the
//! aggregation timeout elapses.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    pub hash_ids_succeeded: Vec<String>,
    pub hash_ids_failed: Vec<String>,
    pub responses_failed: Vec<Value>,
}

struct Pending {
    expected: HashSet<String>,
    result: AggregateResult,
    notify: Option<oneshot::Sender<AggregateResult>>,
}

#[derive(Default)]
pub struct Aggregator {
    pending: DashMap<String, Pending>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new fan-out, returning the receiver the caller should
    /// await (with its own timeout; `record` resolves it early on completion).
    pub fn begin(&self, correlation_id: String, expected: Vec<String>) -> oneshot::Receiver<AggregateResult> {
        let (tx, rx) = oneshot::channel();
        let is_empty = expected.is_empty();
        self.pending.insert(
            correlation_id.clone(),
            Pending {
                expected: expected.into_iter().collect(),
                result: AggregateResult::default(),
                notify: Some(tx),
            },
        );
        if is_empty {
            self.finish(&correlation_id);
        }
        rx
    }

    /// Record one station's answer. Resolves the waiter once every expected
    /// `hashId` has reported.
    pub fn record(&self, correlation_id: &str, hash_id: String, success: bool, payload: Value) {
        let done = {
            let Some(mut entry) = self.pending.get_mut(correlation_id) else {
                return;
            };
            entry.expected.remove(&hash_id);
            if success {
                entry.result.hash_ids_succeeded.push(hash_id);
            } else {
                entry.result.hash_ids_failed.push(hash_id.clone());
                entry.result.responses_failed.push(payload);
            }
            entry.expected.is_empty()
        };
        if done {
            self.finish(correlation_id);
        }
    }

    fn finish(&self, correlation_id: &str) {
        if let Some((_, mut pending)) = self.pending.remove(correlation_id) {
            if let Some(tx) = pending.notify.take() {
                let _ = tx.send(pending.result);
            }
        }
    }

    /// Abandon a fan-out past its deadline, returning whatever was collected
    /// so far.
    pub fn timeout(&self, correlation_id: &str) -> AggregateResult {
        self.pending
            .remove(correlation_id)
            .map(|(_, p)| p.result)
            .unwrap_or_default()
    }
}

pub async fn await_aggregate(
    aggregator: &Aggregator,
    correlation_id: String,
    expected: Vec<String>,
    timeout: Duration,
) -> AggregateResult {
    let rx = aggregator.begin(correlation_id.clone(), expected);
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        _ => aggregator.timeout(&correlation_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_once_all_expected_have_reported() {
        let aggregator = Aggregator::new();
        let fut = await_aggregate(
            &aggregator,
            "c1".into(),
            vec!["h1".into(), "h2".into()],
            Duration::from_secs(5),
        );
        aggregator.record("c1", "h1".into(), true, json!({}));
        aggregator.record("c1", "h2".into(), false, json!({"error": "x"}));
        let result = fut.await;
        assert_eq!(result.hash_ids_succeeded, vec!["h1".to_string()]);
        assert_eq!(result.hash_ids_failed, vec!["h2".to_string()]);
    }

    #[tokio::test]
    async fn empty_expectation_resolves_immediately() {
        let aggregator = Aggregator::new();
        let result = await_aggregate(&aggregator, "c2".into(), vec![], Duration::from_secs(5)).await;
        assert!(result.hash_ids_succeeded.is_empty());
    }

    #[tokio::test]
    async fn times_out_with_partial_result() {
        let aggregator = Aggregator::new();
        let result = await_aggregate(
            &aggregator,
            "c3".into(),
            vec!["h1".into()],
            Duration::from_millis(10),
        )
        .await;
        assert!(result.hash_ids_succeeded.is_empty());
        assert!(result.hash_ids_failed.is_empty());
    }
}
