/// Step trace feed and passive performance monitor
///
/// Both observers are fire-and-forget from the dispatcher's point of view: a failed
/// trace write is logged and execution continues.

use crate::runtime::store::ContextStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

/// One executed node as seen by inspection tooling
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepTrace {
    pub context_id: String,
    pub flow_id: String,
    pub node_id: String,
    pub node_type: String,
    /// Cumulative step number inside the context
    pub step: u32,
    /// "ok", "waiting", "ended" or "error"
    pub status: String,
    pub duration_ms: u64,
    pub input: Value,
    pub output: Value,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Persists traces and fans them out to live subscribers
#[derive(Debug)]
pub struct TraceFeed {
    store: ContextStore,
    sender: broadcast::Sender<StepTrace>,
}

impl TraceFeed {
    pub fn new(store: ContextStore, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { store, sender }
    }

    pub async fn record(&self, trace: StepTrace) {
        if let Err(e) = self.store.insert_trace(&trace).await {
            tracing::warn!("⚠️ Failed to persist trace for {}/{}: {}", trace.context_id, trace.node_id, e);
        }
        // No subscribers is the normal case
        let _ = self.sender.send(trace);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepTrace> {
        self.sender.subscribe()
    }
}

/// Aggregated timings for one flow
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowStats {
    pub steps: u64,
    pub step_time_ms: u64,
    pub max_step_ms: u64,
    pub errors: u64,
    pub completed: u64,
    pub failed: u64,
}

impl FlowStats {
    pub fn average_step_ms(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.step_time_ms as f64 / self.steps as f64
        }
    }
}

/// Per-flow step and outcome counters
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    flows: Mutex<HashMap<String, FlowStats>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, flow_id: &str, apply: impl FnOnce(&mut FlowStats)) {
        match self.flows.lock() {
            Ok(mut flows) => apply(flows.entry(flow_id.to_string()).or_default()),
            Err(_) => tracing::warn!("⚠️ Performance monitor lock poisoned; dropping sample"),
        }
    }

    pub fn record_step(&self, flow_id: &str, duration: Duration, failed: bool) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.update(flow_id, |stats| {
            stats.steps += 1;
            stats.step_time_ms = stats.step_time_ms.saturating_add(ms);
            stats.max_step_ms = stats.max_step_ms.max(ms);
            if failed {
                stats.errors += 1;
            }
        });
    }

    pub fn record_outcome(&self, flow_id: &str, success: bool) {
        self.update(flow_id, |stats| {
            if success {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
        });
    }

    pub fn snapshot(&self) -> HashMap<String, FlowStats> {
        self.flows.lock().map(|flows| flows.clone()).unwrap_or_default()
    }
}

/// Observers handed to the dispatcher
#[derive(Debug)]
pub struct Telemetry {
    pub feed: TraceFeed,
    pub performance: PerformanceMonitor,
}

impl Telemetry {
    pub fn new(store: ContextStore) -> Self {
        Self {
            feed: TraceFeed::new(store, 256),
            performance: PerformanceMonitor::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Database;
    use serde_json::json;

    fn trace(context_id: &str, node_id: &str, step: u32) -> StepTrace {
        StepTrace {
            context_id: context_id.into(),
            flow_id: "greet".into(),
            node_id: node_id.into(),
            node_type: "message".into(),
            step,
            status: "ok".into(),
            duration_ms: 3,
            input: json!({"text": "Hi"}),
            output: json!({"sent": true}),
            error: None,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn feed_persists_and_broadcasts_in_order() {
        let db = Database::in_memory().await.unwrap();
        let store = ContextStore::new(db.pool().clone());
        let feed = TraceFeed::new(store.clone(), 8);
        let mut live = feed.subscribe();

        feed.record(trace("ctx", "hi", 1)).await;
        feed.record(trace("ctx", "done", 2)).await;

        assert_eq!(live.recv().await.unwrap().node_id, "hi");
        assert_eq!(live.recv().await.unwrap().node_id, "done");
        let stored = store.list_traces("ctx").await.unwrap();
        let steps: Vec<(&str, u32)> = stored.iter().map(|t| (t.node_id.as_str(), t.step)).collect();
        assert_eq!(steps, vec![("hi", 1), ("done", 2)]);
        assert_eq!(stored[0].output, json!({"sent": true}));
    }

    #[tokio::test]
    async fn failed_persist_still_reaches_subscribers() {
        let db = Database::in_memory().await.unwrap();
        let feed = TraceFeed::new(ContextStore::new(db.pool().clone()), 8);
        let mut live = feed.subscribe();
        sqlx::query("DROP TABLE execution_traces").execute(db.pool()).await.unwrap();

        feed.record(trace("ctx", "hi", 1)).await;
        assert_eq!(live.recv().await.unwrap().context_id, "ctx");
    }

    #[test]
    fn monitor_aggregates_per_flow() {
        let monitor = PerformanceMonitor::new();
        monitor.record_step("a", Duration::from_millis(10), false);
        monitor.record_step("a", Duration::from_millis(30), true);
        monitor.record_outcome("a", true);
        monitor.record_step("b", Duration::from_millis(5), false);

        let stats = monitor.snapshot();
        let a = &stats["a"];
        assert_eq!((a.steps, a.errors, a.completed, a.max_step_ms), (2, 1, 1, 30));
        assert_eq!(a.average_step_ms(), 20.0);
        assert_eq!(stats["b"].steps, 1);
    }
}
