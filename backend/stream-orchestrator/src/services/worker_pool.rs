//! SFU worker pool: fixed-then-elastic worker set with load tracking.
//!
//! Load is the number of rooms bound to a worker. Placement reads operate
//! on a momentary snapshot; transiently uneven placement under concurrent
//! room creation is acceptable and no invariant depends on perfect balance.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::WorkerPoolConfig;
use crate::engine::{PortRange, SfuEngine, SfuWorker, WorkerId, WorkerOptions};
use crate::error::{AppError, AppResult};
use crate::metrics;

/// Disjoint port range for a worker slot.
pub fn rtc_port_range(cfg: &WorkerPoolConfig, slot: usize) -> PortRange {
    let span = cfg.ports_per_worker as u32;
    let min = (cfg.rtc_min_port as u32 + slot as u32 * span).min(u16::MAX as u32);
    let max = (min + span - 1).min(u16::MAX as u32);
    PortRange {
        min: min as u16,
        max: max as u16,
    }
}

enum SlotState {
    Ready(Arc<dyn SfuWorker>),
    /// Worker creation failed or the worker died; a background task is
    /// bringing a replacement up. The slot is skipped by placement.
    Restarting,
}

struct WorkerSlot {
    state: SlotState,
    load: usize,
}

struct PoolInner {
    engine: Arc<dyn SfuEngine>,
    cfg: WorkerPoolConfig,
    slots: RwLock<Vec<WorkerSlot>>,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates the initial worker set. Failure to create the very first
    /// worker is fatal; failures on later slots are logged and retried in
    /// the background without blocking startup.
    pub async fn initialize(
        engine: Arc<dyn SfuEngine>,
        cfg: WorkerPoolConfig,
    ) -> AppResult<Arc<Self>> {
        let inner = Arc::new(PoolInner {
            engine,
            cfg,
            slots: RwLock::new(Vec::new()),
        });

        for slot in 0..inner.cfg.initial_workers {
            let opts = WorkerOptions {
                port_range: rtc_port_range(&inner.cfg, slot),
            };
            match inner.engine.create_worker(opts).await {
                Ok(worker) => {
                    tracing::info!(slot, worker_id = %worker.id(), "media worker created");
                    inner.slots.write().await.push(WorkerSlot {
                        state: SlotState::Ready(worker),
                        load: 0,
                    });
                }
                Err(err) if slot == 0 => {
                    tracing::error!(error = %err, "failed to create first media worker");
                    return Err(AppError::Engine);
                }
                Err(err) => {
                    tracing::warn!(slot, error = %err, "worker creation failed, retrying in background");
                    inner.slots.write().await.push(WorkerSlot {
                        state: SlotState::Restarting,
                        load: 0,
                    });
                    spawn_restart(inner.clone(), slot);
                }
            }
        }

        metrics::set_worker_count(ready_count(&inner).await);
        Ok(Arc::new(Self { inner }))
    }

    /// Minimum-load ready worker; ties resolve to the lowest slot index.
    pub async fn optimal_worker(&self) -> AppResult<(usize, Arc<dyn SfuWorker>)> {
        let slots = self.inner.slots.read().await;
        slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.state {
                SlotState::Ready(worker) => Some((index, slot.load, worker.clone())),
                SlotState::Restarting => None,
            })
            .min_by_key(|(index, load, _)| (*load, *index))
            .map(|(index, _, worker)| (index, worker))
            .ok_or_else(|| AppError::Capacity("no media workers available".into()))
    }

    /// Binds one more room to the slot. The worker id guards against a
    /// crash racing the bind: a slot that was reset (and possibly re-owned
    /// by a replacement worker) keeps its zeroed load.
    pub async fn assign(&self, slot: usize, worker_id: WorkerId) {
        let mut slots = self.inner.slots.write().await;
        if let Some(entry) = slots.get_mut(slot) {
            if let SlotState::Ready(worker) = &entry.state {
                if worker.id() == worker_id {
                    entry.load += 1;
                }
            }
        }
    }

    /// Unbinds one room from the slot, only while the slot still belongs
    /// to the worker the room was bound to.
    pub async fn release(&self, slot: usize, worker_id: WorkerId) {
        let mut slots = self.inner.slots.write().await;
        if let Some(entry) = slots.get_mut(slot) {
            if let SlotState::Ready(worker) = &entry.state {
                if worker.id() == worker_id {
                    entry.load = entry.load.saturating_sub(1);
                }
            }
        }
    }

    /// Adds a worker when auto-scale is on, there is headroom, and average
    /// load is above the threshold. The new slot is reserved under the
    /// write lock so concurrent calls cannot both scale.
    pub async fn maybe_scale_up(&self) {
        scale_up(&self.inner).await;
    }

    /// Fire-and-forget scale check, used on the room-creation path so
    /// placement is never blocked on worker creation.
    pub fn scale_up_in_background(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            scale_up(&inner).await;
        });
    }

    /// Marks the dead worker's slot for replacement and starts the restart
    /// task. Returns the slot index, or `None` for an unknown (stale) id.
    /// Rooms bound to the dead worker are the gateway's business.
    pub async fn handle_worker_failure(&self, worker_id: WorkerId) -> Option<usize> {
        let slot = {
            let mut slots = self.inner.slots.write().await;
            let found = slots.iter().position(|s| match &s.state {
                SlotState::Ready(worker) => worker.id() == worker_id,
                SlotState::Restarting => false,
            })?;
            slots[found].state = SlotState::Restarting;
            slots[found].load = 0;
            found
        };

        metrics::worker_failure();
        metrics::set_worker_count(ready_count(&self.inner).await);
        tracing::error!(%worker_id, slot, "media worker died, replacing");
        spawn_restart(self.inner.clone(), slot);
        Some(slot)
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.slots.read().await.len()
    }

    pub async fn ready_worker_count(&self) -> usize {
        ready_count(&self.inner).await
    }

    /// Per-slot load snapshot, in slot order.
    pub async fn load_snapshot(&self) -> Vec<usize> {
        self.inner.slots.read().await.iter().map(|s| s.load).collect()
    }
}

async fn ready_count(inner: &PoolInner) -> usize {
    inner
        .slots
        .read()
        .await
        .iter()
        .filter(|s| matches!(s.state, SlotState::Ready(_)))
        .count()
}

async fn scale_up(inner: &Arc<PoolInner>) {
    if !inner.cfg.auto_scale {
        return;
    }
    let slot = {
        let mut slots = inner.slots.write().await;
        if slots.is_empty() || slots.len() >= inner.cfg.max_workers {
            return;
        }
        let total: usize = slots.iter().map(|s| s.load).sum();
        let average = total as f64 / slots.len() as f64;
        if average <= inner.cfg.scale_load_threshold {
            return;
        }
        slots.push(WorkerSlot {
            state: SlotState::Restarting,
            load: 0,
        });
        slots.len() - 1
    };

    tracing::info!(slot, "average worker load above threshold, adding worker");
    let opts = WorkerOptions {
        port_range: rtc_port_range(&inner.cfg, slot),
    };
    match inner.engine.create_worker(opts).await {
        Ok(worker) => install(inner, slot, worker).await,
        Err(err) => {
            tracing::warn!(slot, error = %err, "scale-up worker creation failed, retrying in background");
            spawn_restart(inner.clone(), slot);
        }
    }
}

fn spawn_restart(inner: Arc<PoolInner>, slot: usize) {
    tokio::spawn(async move {
        let mut delay = Duration::from_millis(500);
        loop {
            let opts = WorkerOptions {
                port_range: rtc_port_range(&inner.cfg, slot),
            };
            match inner.engine.create_worker(opts).await {
                Ok(worker) => {
                    tracing::info!(slot, worker_id = %worker.id(), "worker slot restored");
                    install(&inner, slot, worker).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!(slot, error = %err, retry_ms = delay.as_millis() as u64, "worker restart failed");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
            }
        }
    });
}

async fn install(inner: &PoolInner, slot: usize, worker: Arc<dyn SfuWorker>) {
    {
        let mut slots = inner.slots.write().await;
        if let Some(entry) = slots.get_mut(slot) {
            entry.state = SlotState::Ready(worker);
        }
    }
    metrics::set_worker_count(ready_count(inner).await);
}
