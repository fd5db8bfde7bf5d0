use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::access::AccessCodeMachine;
use crate::engine::{Engine, now_ms};
use crate::model::Ms;

/// Intervals for the background jobs.
#[derive(Debug, Clone, Copy)]
pub struct JobSchedule {
    /// Periodic AffectedSet rebuild, on top of rebuilds triggered by
    /// structural writes.
    pub hierarchy_interval: Duration,
    pub staleness_bound: Duration,
    pub span_prune_interval: Duration,
    pub span_rebuild_interval: Duration,
    pub sweep_interval: Duration,
    pub compact_interval: Duration,
    pub compact_threshold: u64,
}

impl Default for JobSchedule {
    fn default() -> Self {
        Self {
            hierarchy_interval: Duration::from_secs(60),
            staleness_bound: Duration::from_secs(600),
            span_prune_interval: Duration::from_secs(60),
            span_rebuild_interval: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            compact_interval: Duration::from_secs(30),
            compact_threshold: 1000,
        }
    }
}

/// Spawn every background job. Returned handles are aborted on shutdown.
pub fn spawn_jobs(
    engine: Arc<Engine>,
    machine: Arc<AccessCodeMachine>,
    schedule: JobSchedule,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(run_hierarchy_rebuilder(
            engine.clone(),
            schedule.hierarchy_interval,
            schedule.staleness_bound,
        )),
        tokio::spawn(run_span_maintenance(
            engine.clone(),
            schedule.span_prune_interval,
            schedule.span_rebuild_interval,
        )),
        tokio::spawn(run_sweeper(machine, schedule.sweep_interval)),
        tokio::spawn(run_compactor(
            engine,
            schedule.compact_interval,
            schedule.compact_threshold,
        )),
    ]
}

/// Rebuild the AffectedSet index after structural writes. A rebuild that
/// keeps failing leaves the old index serving; once that has lasted longer
/// than `staleness_bound` every pass logs a warning.
pub async fn run_hierarchy_rebuilder(engine: Arc<Engine>, every: Duration, staleness_bound: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = engine.structure_changed() => {}
        }
        if engine.is_structure_stale().await {
            // Errors are logged and counted by the engine.
            let _ = engine.rebuild_affected_sets().await;
        }
        check_staleness(&engine, staleness_bound.as_millis() as Ms, now_ms()).await;
    }
}

async fn check_staleness(engine: &Engine, bound_ms: Ms, now: Ms) -> bool {
    match engine.staleness_warning(bound_ms, now).await {
        Some(warning) => {
            metrics::counter!(crate::observability::STALENESS_WARNINGS_TOTAL).increment(1);
            warn!("{warning}");
            true
        }
        None => false,
    }
}

/// Prune expired span rows often; rebuild the whole index occasionally.
pub async fn run_span_maintenance(engine: Arc<Engine>, prune_every: Duration, rebuild_every: Duration) {
    let mut prune = tokio::time::interval(prune_every);
    let mut rebuild = tokio::time::interval(rebuild_every);
    // Both fire immediately; the engine just built the index.
    prune.tick().await;
    rebuild.tick().await;
    loop {
        tokio::select! {
            _ = prune.tick() => {
                let pruned = engine.prune_affecting_time_spans(now_ms()).await;
                if pruned > 0 {
                    tracing::debug!(pruned, "expired span rows dropped");
                }
            }
            _ = rebuild.tick() => {
                let rows = engine.rebuild_affecting_time_spans().await;
                info!(rows, "periodic span index rebuild");
            }
        }
    }
}

/// Periodic access-code reconciliation.
pub async fn run_sweeper(machine: Arc<AccessCodeMachine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        machine.update_access_code_is_active().await;
    }
}

/// Rewrite the WAL as a snapshot once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, every: Duration, threshold: u64) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BufferCalculator;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("resv_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("wal.tmp"));
        path
    }

    fn engine(name: &str) -> Arc<Engine> {
        Arc::new(Engine::new(test_wal_path(name), BufferCalculator::new(chrono_tz::UTC)).unwrap())
    }

    #[tokio::test]
    async fn rebuilder_reacts_to_structural_writes() {
        let engine = engine("rebuilder.wal");
        let job = tokio::spawn(run_hierarchy_rebuilder(
            engine.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ));

        let (hall, room) = (Ulid::new(), Ulid::new());
        engine.create_space(hall, None, None).await.unwrap();
        engine.create_space(room, Some(hall), None).await.unwrap();
        let hall_unit = ReservationUnit::new(Ulid::new()).with_spaces(vec![hall]);
        let room_unit = ReservationUnit::new(Ulid::new()).with_spaces(vec![room]);
        let (hall_id, room_id) = (hall_unit.id, room_unit.id);
        engine.save_unit(hall_unit).await.unwrap();
        engine.save_unit(room_unit).await.unwrap();

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            while engine.is_structure_stale().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        job.abort();
        assert!(settled.is_ok());
        let mut expected = vec![hall_id, room_id];
        expected.sort();
        assert_eq!(engine.affected_set(&room_id).await, expected);
    }

    #[tokio::test]
    async fn staleness_warns_only_past_the_bound() {
        let engine = engine("staleness.wal");
        engine.create_space(Ulid::new(), None, None).await.unwrap();
        assert!(engine.is_structure_stale().await);

        let now = now_ms();
        assert!(!check_staleness(&engine, 60_000, now).await);
        assert!(check_staleness(&engine, 60_000, now + 120_000).await);

        engine.rebuild_affected_sets().await.unwrap();
        assert!(!check_staleness(&engine, 60_000, now + 120_000).await);
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let path = test_wal_path("compactor.wal");
        let engine = Arc::new(Engine::new(path.clone(), BufferCalculator::new(chrono_tz::UTC)).unwrap());
        let ids: Vec<Ulid> = (0..5).map(|_| Ulid::new()).collect();
        for id in &ids {
            engine.create_space(*id, None, None).await.unwrap();
        }
        assert!(!compact_if_needed(&engine, 10).await);
        assert!(compact_if_needed(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        drop(engine);

        let reopened = Engine::new(path, BufferCalculator::new(chrono_tz::UTC)).unwrap();
        assert!(ids.iter().all(|id| reopened.get_space(id).is_some()));
    }
}
