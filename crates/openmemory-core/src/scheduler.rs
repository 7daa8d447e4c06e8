//! Maintenance scheduler
//!
//! Owns the background jobs: decay sweeps, reflection, weekly pruning and
//! user-summary rebuilds. Each job is a cancellable tokio task driven by
//! its own interval; engine work runs on the blocking pool so sweeps never
//! stall the event loop. `shutdown` flips a watch channel and joins every
//! job before returning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::MemoryEngine;
use crate::error::Result;

/// Background job scheduler
///
/// Construction spawns the jobs; dropping without `shutdown` aborts them
/// with the runtime. The engine's startup decay pass has already run by
/// the time an engine reaches the scheduler, so every interval starts one
/// full period out.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the maintenance jobs for an engine
    pub fn start(engine: Arc<MemoryEngine>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cfg = engine.config();

        let handles = vec![
            spawn_job(
                "decay",
                Duration::from_secs(cfg.decay_interval_minutes * 60),
                shutdown_rx.clone(),
                engine.clone(),
                |engine| {
                    engine
                        .run_decay()
                        .map(|r| (r.decayed + r.tombstoned) as i64)
                },
            ),
            spawn_job(
                "reflect",
                Duration::from_secs(cfg.reflect_interval_minutes * 60),
                shutdown_rx.clone(),
                engine.clone(),
                |engine| engine.run_reflection_scheduled().map(|r| r.created as i64),
            ),
            spawn_job(
                "prune",
                Duration::from_secs(cfg.prune_interval_minutes * 60),
                shutdown_rx.clone(),
                engine.clone(),
                |engine| {
                    engine
                        .run_prune()
                        .map(|r| (r.waypoints_pruned + r.edges_pruned) as i64)
                },
            ),
            spawn_job(
                "summary",
                Duration::from_secs(cfg.summary_interval_minutes * 60),
                shutdown_rx,
                engine,
                |engine| engine.rebuild_user_summaries().map(|n| n as i64),
            ),
        ];

        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Stop every job and wait for it to finish its current run
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn spawn_job(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    engine: Arc<MemoryEngine>,
    job: fn(&MemoryEngine) -> Result<i64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => {
                    let worker = engine.clone();
                    match tokio::task::spawn_blocking(move || job(&worker)).await {
                        Ok(Ok(count)) => {
                            tracing::info!(job = name, count, "Maintenance job complete");
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(job = name, "Maintenance job failed: {}", e);
                            engine.note_job_error(name);
                        }
                        Err(e) => {
                            tracing::warn!(job = name, "Maintenance job panicked: {}", e);
                            engine.note_job_error(name);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigPatch, EngineConfig};
    use crate::embed::SyntheticEmbedder;
    use crate::memory::AddInput;
    use tempfile::TempDir;

    fn fast_engine(dir: &TempDir) -> Arc<MemoryEngine> {
        let config = EngineConfig::default();
        let embedder = Arc::new(SyntheticEmbedder::new(config.vector_dim));
        let engine =
            MemoryEngine::new(Some(dir.path().join("sched.db")), embedder, config).unwrap();
        Arc::new(engine)
    }

    #[tokio::test]
    async fn test_shutdown_joins_all_jobs() {
        let dir = TempDir::new().unwrap();
        let engine = fast_engine(&dir);
        engine.add(AddInput::new("memory under scheduling")).unwrap();

        let scheduler = Scheduler::start(engine.clone());
        // Shutdown before any long interval fires; must return promptly
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_job_fires_on_interval() {
        let dir = TempDir::new().unwrap();
        let engine = fast_engine(&dir);
        engine
            .update_config(ConfigPatch {
                decay_interval_minutes: Some(1),
                ..Default::default()
            })
            .unwrap();
        engine.add(AddInput::new("memory awaiting the sweep")).unwrap();

        let decay_stats_before = engine
            .store
            .recent_stats(50)
            .unwrap()
            .iter()
            .filter(|s| s.stat_type == "decay")
            .count();

        let scheduler = Scheduler::start(engine.clone());

        // Let the spawned jobs reach their first await point so each
        // interval is anchored from "now" before we move the clock.
        tokio::task::yield_now().await;

        // Advance paused time past one interval; the tick runs the sweep.
        // The sweep itself runs on the blocking pool, which ticks on real
        // time even while the tokio clock is paused, so give it a few
        // real-time yields to finish and report back before we check.
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(5));
        }

        scheduler.shutdown().await;

        let decay_stats_after = engine
            .store
            .recent_stats(50)
            .unwrap()
            .iter()
            .filter(|s| s.stat_type == "decay")
            .count();
        assert!(decay_stats_after > decay_stats_before);
    }
}
