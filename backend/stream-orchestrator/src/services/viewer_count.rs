//! Batched viewer-count aggregation.
//!
//! Joins and leaves land here as +1/-1 deltas; a periodic flush applies the
//! net delta per stream as a single store update. Room counters remain the
//! authoritative real-time numbers between flushes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::metrics;
use crate::persistence::ViewerCountStore;
use crate::services::tasks::PeriodicTask;

pub struct ViewerCountAggregator {
    deltas: Mutex<HashMap<Uuid, i64>>,
    store: Arc<dyn ViewerCountStore>,
}

impl ViewerCountAggregator {
    pub fn new(store: Arc<dyn ViewerCountStore>) -> Self {
        Self {
            deltas: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn record(&self, stream_id: Uuid, delta: i64) {
        let mut deltas = self.deltas.lock().expect("aggregator mutex poisoned");
        *deltas.entry(stream_id).or_insert(0) += delta;
    }

    /// Applies all buffered net deltas, one store call per stream. Failed
    /// updates are re-queued so counts are not lost to a transient store
    /// outage.
    pub async fn flush_once(&self) {
        let drained: Vec<(Uuid, i64)> = {
            let mut deltas = self.deltas.lock().expect("aggregator mutex poisoned");
            deltas.drain().collect()
        };

        for (stream_id, net) in drained {
            if net == 0 {
                continue;
            }
            match self.store.apply_viewer_delta(stream_id, net).await {
                Ok(()) => metrics::viewer_flush_applied(),
                Err(err) => {
                    tracing::warn!(
                        %stream_id,
                        delta = net,
                        error = %err,
                        "viewer count flush failed, re-queueing delta"
                    );
                    self.record(stream_id, net);
                }
            }
        }
    }

    pub fn spawn_flusher(self: Arc<Self>, interval: Duration) -> PeriodicTask {
        let aggregator = self;
        PeriodicTask::spawn("viewer-count-flush", interval, move || {
            let aggregator = aggregator.clone();
            async move {
                aggregator.flush_once().await;
            }
        })
    }

    #[cfg(test)]
    fn pending(&self, stream_id: Uuid) -> i64 {
        self.deltas
            .lock()
            .expect("aggregator mutex poisoned")
            .get(&stream_id)
            .copied()
            .unwrap_or(0)
    }
}
