use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::config::GovernorConfig;
use crate::database::DbPool;
use crate::membership::{MembershipStore, StateChange};
use crate::models::{Repository, Result, Transition};

#[derive(Debug, Clone, serde::Serialize)]
pub struct RepositoryHealth {
    pub total_members: i64,
    pub bounced_members: i64,
    pub bounce_rate: f64,
    pub healthy: bool,
}

/// Enforces growth-rate caps per admission cycle and the bounce and
/// complaint suspension rules. Every decision is a deterministic
/// function of the stored counters.
#[derive(Clone)]
pub struct GrowthGovernor {
    pool: DbPool,
    config: GovernorConfig,
    store: MembershipStore,
}

impl GrowthGovernor {
    pub fn new(pool: DbPool, config: GovernorConfig) -> Self {
        let store = MembershipStore::new(pool.clone());
        Self {
            pool,
            config,
            store,
        }
    }

    /// May `candidate_count` more admissions happen in the current cycle?
    /// A cycle opens on first use and lasts `cooldown_hours`; its cap is
    /// fixed from the repository size at open time. Approval reserves the
    /// slots, so callers must only ask when they are about to admit.
    pub async fn approve_admission(
        &self,
        repo: &Repository,
        candidate_count: usize,
    ) -> Result<bool> {
        let now = Utc::now();
        let cycle = self.current_cycle(repo.id).await?;

        let (cycle_start, base_size, admitted) = match cycle {
            Some((start, base, admitted))
                if now < start + Duration::hours(repo.snowball.cooldown_hours) =>
            {
                (start, base, admitted)
            }
            _ => {
                // Previous cycle expired (or none existed). Open a new one
                // with the cap anchored to the current size.
                let size = self.store.active_count(repo.id).await?.max(1);
                let start = now;
                let conn = self.pool.get().await?;
                conn.execute(
                    "INSERT INTO admission_cycles (repository_id, cycle_start, base_size, admitted) \
                     VALUES (?1, ?2, ?3, 0)",
                    params![repo.id, start, size],
                )?;
                debug!(
                    "admission cycle opened: repo={} base_size={} cap={}",
                    repo.id,
                    size,
                    (size as f64 * repo.snowball.max_growth_rate) as i64
                );
                (start, size, 0)
            }
        };

        let cap = (base_size as f64 * repo.snowball.max_growth_rate) as i64;
        if admitted + candidate_count as i64 > cap {
            debug!(
                "admission deferred by growth cap: repo={} admitted={} cap={}",
                repo.id, admitted, cap
            );
            return Ok(false);
        }

        let conn = self.pool.get().await?;
        conn.execute(
            "UPDATE admission_cycles SET admitted = admitted + ?1 \
             WHERE repository_id = ?2 AND cycle_start = ?3",
            params![candidate_count as i64, repo.id, cycle_start],
        )?;
        Ok(true)
    }

    async fn current_cycle(
        &self,
        repository_id: i64,
    ) -> Result<Option<(DateTime<Utc>, i64, i64)>> {
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare(
            "SELECT cycle_start, base_size, admitted FROM admission_cycles \
             WHERE repository_id = ?1 ORDER BY cycle_start DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![repository_id])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?))),
            None => Ok(None),
        }
    }

    /// Hard bounce notification from the delivery layer. Crossing the
    /// threshold suspends the address.
    pub async fn record_bounce(
        &self,
        repository_id: i64,
        email: &str,
    ) -> Result<Option<Transition>> {
        let normalized = crate::classifier::normalize_email(email);
        let conn = self.pool.get().await?;
        let changed = conn.execute(
            "UPDATE members SET bounce_count = bounce_count + 1 \
             WHERE repository_id = ?1 AND email = ?2",
            params![repository_id, normalized],
        )?;
        if changed == 0 {
            warn!(
                "bounce for unknown address: repo={} email={}",
                repository_id, normalized
            );
            return Ok(None);
        }
        drop(conn);

        let member = self
            .store
            .get_member(repository_id, &normalized)
            .await?
            .ok_or("member vanished during bounce accounting")?;

        if member.bounce_count >= self.config.hard_bounce_threshold {
            match self.store.mark_bounced(repository_id, &normalized).await? {
                StateChange::Applied(transition) => {
                    info!(
                        "address suppressed after {} hard bounces: repo={} email={}",
                        member.bounce_count, repository_id, normalized
                    );
                    return Ok(Some(transition));
                }
                StateChange::Rejected { .. } => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Spam complaint notification. The complaint threshold forces an
    /// opt-out regardless of the member's stored preference.
    pub async fn record_complaint(
        &self,
        repository_id: i64,
        email: &str,
    ) -> Result<Option<Transition>> {
        let normalized = crate::classifier::normalize_email(email);
        let conn = self.pool.get().await?;
        let changed = conn.execute(
            "UPDATE members SET complaint_count = complaint_count + 1 \
             WHERE repository_id = ?1 AND email = ?2",
            params![repository_id, normalized],
        )?;
        if changed == 0 {
            warn!(
                "complaint for unknown address: repo={} email={}",
                repository_id, normalized
            );
            return Ok(None);
        }
        drop(conn);

        let member = self
            .store
            .get_member(repository_id, &normalized)
            .await?
            .ok_or("member vanished during complaint accounting")?;

        if member.complaint_count >= self.config.complaint_threshold {
            match self
                .store
                .opt_out(repository_id, &normalized, "complaint threshold crossed")
                .await?
            {
                StateChange::Applied(transition) => {
                    info!(
                        "address opted out after {} complaints: repo={} email={}",
                        member.complaint_count, repository_id, normalized
                    );
                    return Ok(Some(transition));
                }
                StateChange::Rejected { .. } => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Bounce-health report, surfaced to the owner via analytics. Never
    /// blocks anything by itself.
    pub async fn health(&self, repository_id: i64) -> Result<RepositoryHealth> {
        let conn = self.pool.get().await?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM members WHERE repository_id = ?1 AND state != 'removed'",
            params![repository_id],
            |row| row.get(0),
        )?;
        let bounced: i64 = conn.query_row(
            "SELECT COUNT(*) FROM members WHERE repository_id = ?1 AND state = 'bounced'",
            params![repository_id],
            |row| row.get(0),
        )?;
        let bounce_rate = if total > 0 {
            bounced as f64 / total as f64
        } else {
            0.0
        };
        Ok(RepositoryHealth {
            total_members: total,
            bounced_members: bounced,
            bounce_rate,
            healthy: bounce_rate <= self.config.unhealthy_bounce_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::EmailClassifier;
    use crate::config::Config;
    use crate::database::testutil::{test_pool, test_repository};
    use crate::models::{MemberSource, MemberState};

    async fn seed_members(store: &MembershipStore, repo: &Repository, n: usize) {
        let classifier = EmailClassifier::new(&Config::default().classifier);
        for i in 0..n {
            store
                .add_member(
                    repo,
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
    }

    #[tokio::test]
    async fn growth_cap_defers_admissions_beyond_the_cycle_allowance() {
        let pool = test_pool().await;
        let mut repo = test_repository(&pool).await;
        repo.snowball.max_growth_rate = 2.0;
        let store = MembershipStore::new(pool.clone());
        let governor = GrowthGovernor::new(pool, Config::default().governor);

        seed_members(&store, &repo, 3).await;

        // Base size 3, rate 2.0: six admissions fit in the cycle.
        for _ in 0..6 {
            assert!(governor.approve_admission(&repo, 1).await.unwrap());
        }
        assert!(!governor.approve_admission(&repo, 1).await.unwrap());
    }

    #[tokio::test]
    async fn a_new_cycle_opens_after_the_cooldown() {
        let pool = test_pool().await;
        let mut repo = test_repository(&pool).await;
        repo.snowball.max_growth_rate = 1.0;
        let store = MembershipStore::new(pool.clone());
        let governor = GrowthGovernor::new(pool.clone(), Config::default().governor);

        seed_members(&store, &repo, 1).await;
        assert!(governor.approve_admission(&repo, 1).await.unwrap());
        assert!(!governor.approve_admission(&repo, 1).await.unwrap());

        // Age the open cycle past the cooldown window.
        let conn = pool.get().await.unwrap();
        let old = Utc::now() - Duration::hours(repo.snowball.cooldown_hours + 1);
        conn.execute(
            "UPDATE admission_cycles SET cycle_start = ?1 WHERE repository_id = ?2",
            params![old, repo.id],
        )
        .unwrap();
        drop(conn);

        assert!(governor.approve_admission(&repo, 1).await.unwrap());
    }

    #[tokio::test]
    async fn empty_repository_still_admits_a_trickle() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let governor = GrowthGovernor::new(pool, Config::default().governor);

        // No members at all: the base size floors at one.
        assert!(governor.approve_admission(&repo, 1).await.unwrap());
        assert!(governor.approve_admission(&repo, 1).await.unwrap());
        assert!(!governor.approve_admission(&repo, 1).await.unwrap());
    }

    #[tokio::test]
    async fn third_hard_bounce_suppresses_the_address() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let store = MembershipStore::new(pool.clone());
        let governor = GrowthGovernor::new(pool, Config::default().governor);
        seed_members(&store, &repo, 1).await;

        assert!(governor
            .record_bounce(repo.id, "seed0@widgets.example")
            .await
            .unwrap()
            .is_none());
        assert!(governor
            .record_bounce(repo.id, "seed0@widgets.example")
            .await
            .unwrap()
            .is_none());
        let transition = governor
            .record_bounce(repo.id, "seed0@widgets.example")
            .await
            .unwrap()
            .expect("third bounce crosses the threshold");
        assert_eq!(transition.to, MemberState::Bounced);

        let member = store
            .get_member(repo.id, "seed0@widgets.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.state, MemberState::Bounced);
        assert_eq!(member.bounce_count, 3);

        let recipients = store.digest_recipients(repo.id).await.unwrap();
        assert!(recipients.is_empty());
    }

    #[tokio::test]
    async fn second_complaint_forces_opt_out() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let store = MembershipStore::new(pool.clone());
        let governor = GrowthGovernor::new(pool, Config::default().governor);
        seed_members(&store, &repo, 1).await;

        assert!(governor
            .record_complaint(repo.id, "seed0@widgets.example")
            .await
            .unwrap()
            .is_none());
        let transition = governor
            .record_complaint(repo.id, "seed0@widgets.example")
            .await
            .unwrap()
            .expect("second complaint crosses the threshold");
        assert_eq!(transition.to, MemberState::OptedOut);
    }

    #[tokio::test]
    async fn bounce_rate_flags_unhealthy_repositories() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let store = MembershipStore::new(pool.clone());
        let governor = GrowthGovernor::new(pool, Config::default().governor);
        seed_members(&store, &repo, 10).await;

        let health = governor.health(repo.id).await.unwrap();
        assert!(health.healthy);

        for _ in 0..3 {
            governor
                .record_bounce(repo.id, "seed0@widgets.example")
                .await
                .unwrap();
        }

        let health = governor.health(repo.id).await.unwrap();
        assert_eq!(health.bounced_members, 1);
        assert!(!health.healthy, "1/10 bounced exceeds the 5% default");
    }
}
