use chrono::{Duration, Utc};
use rusqlite::params;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::database::DbPool;
use crate::models::{ForwardEvent, Result};
use crate::snowball::SnowballEngine;

const ROUTER_QUEUE_DEPTH: usize = 1024;
const WORKER_QUEUE_DEPTH: usize = 256;

/// Fan-in point for forward events. One router task owns the map of
/// per-repository senders and lazily spawns a worker per repository,
/// so events for one repository are processed by a single writer and
/// the tally-then-admit sequence never races.
#[derive(Clone)]
pub struct ForwardRouter {
    tx: mpsc::Sender<ForwardEvent>,
}

impl ForwardRouter {
    pub fn spawn(engine: Arc<SnowballEngine>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ForwardEvent>(ROUTER_QUEUE_DEPTH);

        tokio::spawn(async move {
            let mut workers: HashMap<i64, mpsc::Sender<ForwardEvent>> = HashMap::new();

            while let Some(event) = rx.recv().await {
                let repo_id = event.repository_id;
                let worker_tx = match workers.get(&repo_id) {
                    Some(tx) => tx.clone(),
                    None => {
                        debug!("spawning forward worker for repository {}", repo_id);
                        let tx = spawn_repository_worker(repo_id, engine.clone());
                        workers.insert(repo_id, tx.clone());
                        tx
                    }
                };

                if let Err(returned) = worker_tx.send(event).await {
                    // Worker died; replace it and hand the event over.
                    warn!("forward worker for repository {} is gone, respawning", repo_id);
                    let replacement = spawn_repository_worker(repo_id, engine.clone());
                    let _ = replacement.send(returned.0).await;
                    workers.insert(repo_id, replacement);
                }
            }
            info!("forward router shutting down");
        });

        Self { tx }
    }

    /// Queue one forward event. Backpressure applies when the router
    /// queue is full; the send never blocks indefinitely because the
    /// router is always draining.
    pub async fn submit(&self, event: ForwardEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| "forward router is not running".into())
    }
}

fn spawn_repository_worker(
    repository_id: i64,
    engine: Arc<SnowballEngine>,
) -> mpsc::Sender<ForwardEvent> {
    let (tx, mut rx) = mpsc::channel::<ForwardEvent>(WORKER_QUEUE_DEPTH);

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match engine.process_forward(&event).await {
                Ok(transitions) if !transitions.is_empty() => {
                    info!(
                        "repository {}: {} admission(s) from forward by {}",
                        repository_id,
                        transitions.len(),
                        event.source_email
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        "repository {}: forward processing failed: {}",
                        repository_id, e
                    );
                }
            }
        }
        debug!("forward worker for repository {} stopped", repository_id);
    });

    tx
}

/// Periodic sweep that drops pending candidates whose last forward is
/// older than the retention window. Safe to run at any cadence; the
/// delete is idempotent.
pub fn spawn_candidate_sweeper(
    pool: DbPool,
    retention_hours: i64,
    interval_seconds: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
        loop {
            ticker.tick().await;
            match sweep_expired_candidates(&pool, retention_hours).await {
                Ok(0) => {}
                Ok(swept) => info!("candidate sweep: {} expired aggregates dropped", swept),
                Err(e) => error!("candidate sweep failed: {}", e),
            }
        }
    })
}

pub async fn sweep_expired_candidates(pool: &DbPool, retention_hours: i64) -> Result<usize> {
    let cutoff = Utc::now() - Duration::hours(retention_hours);
    let conn = pool.get().await?;
    let swept = conn.execute(
        "DELETE FROM forward_candidates WHERE last_seen < ?1",
        params![cutoff],
    )?;
    Ok(swept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::EmailClassifier;
    use crate::config::Config;
    use crate::database::testutil::{test_pool, test_repository};
    use crate::governor::GrowthGovernor;
    use crate::membership::MembershipStore;
    use crate::models::MemberSource;

    fn engine(pool: DbPool) -> Arc<SnowballEngine> {
        let config = Config::default();
        Arc::new(SnowballEngine::new(
            pool.clone(),
            EmailClassifier::new(&config.classifier),
            GrowthGovernor::new(pool, config.governor),
            config.retention.max_forwarders_tracked,
        ))
    }

    #[tokio::test]
    async fn routed_forwards_reach_the_engine() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let engine = engine(pool.clone());

        let classifier = EmailClassifier::new(&Config::default().classifier);
        for i in 0..10 {
            engine
                .store()
                .add_member(
                    &repo,
                    &classifier.classify(&format!("seed{}@widgets.example", i)),
                    MemberSource::CsvImport,
                    None,
                    &[],
                    true,
                    false,
                )
                .await
                .unwrap();
        }

        let router = ForwardRouter::spawn(engine.clone());
        for i in 0..5 {
            router
                .submit(ForwardEvent {
                    repository_id: repo.id,
                    source_email: format!("seed{}@widgets.example", i),
                    candidate_emails: vec!["routed@example.com".to_string()],
                    depth: 1,
                })
                .await
                .unwrap();
        }

        // Default threshold is five; wait for the worker to drain.
        let store = MembershipStore::new(pool);
        for _ in 0..100 {
            if let Some(member) = store.get_member(repo.id, "routed@example.com").await.unwrap() {
                assert_eq!(member.source, MemberSource::Snowball);
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("forward events were not processed in time");
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_candidates() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let engine = engine(pool.clone());

        engine
            .process_forward(&ForwardEvent {
                repository_id: repo.id,
                source_email: "someone@widgets.example".to_string(),
                candidate_emails: vec![
                    "fresh@example.com".to_string(),
                    "stale@example.com".to_string(),
                ],
                depth: 1,
            })
            .await
            .unwrap();

        // Age one of the two aggregates past the retention window.
        let conn = pool.get().await.unwrap();
        let old = Utc::now() - Duration::hours(100);
        conn.execute(
            "UPDATE forward_candidates SET last_seen = ?1 WHERE email = 'stale@example.com'",
            params![old],
        )
        .unwrap();
        drop(conn);

        let swept = sweep_expired_candidates(&pool, 72).await.unwrap();
        assert_eq!(swept, 1);
        assert!(engine
            .get_candidate(repo.id, "stale@example.com")
            .await
            .unwrap()
            .is_none());
        assert!(engine
            .get_candidate(repo.id, "fresh@example.com")
            .await
            .unwrap()
            .is_some());

        // Running again finds nothing more to do.
        assert_eq!(sweep_expired_candidates(&pool, 72).await.unwrap(), 0);
    }
}
