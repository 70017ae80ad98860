use chrono::Utc;
use rusqlite::params;
use tracing::{debug, info};

use crate::classifier::{normalize_email, EmailClassifier};
use crate::database::{get_repository, DbPool};
use crate::governor::GrowthGovernor;
use crate::membership::MembershipStore;
use crate::models::{ForwardCandidate, ForwardEvent, Repository, Result, Transition};

/// The propagation state machine. Forward events arrive here (routed
/// through the per-repository workers), candidate tallies accumulate,
/// and candidates crossing their threshold are admitted.
pub struct SnowballEngine {
    pool: DbPool,
    classifier: EmailClassifier,
    governor: GrowthGovernor,
    store: MembershipStore,
    max_forwarders_tracked: usize,
}

impl SnowballEngine {
    pub fn new(
        pool: DbPool,
        classifier: EmailClassifier,
        governor: GrowthGovernor,
        max_forwarders_tracked: usize,
    ) -> Self {
        let store = MembershipStore::new(pool.clone());
        Self {
            pool,
            classifier,
            governor,
            store,
            max_forwarders_tracked,
        }
    }

    pub fn store(&self) -> &MembershipStore {
        &self.store
    }

    /// Process one forward event. Each candidate gets an audit row
    /// whether or not anything was admitted; the returned transitions
    /// cover only candidates that changed membership state.
    ///
    /// Callers must serialize invocations per repository (the worker
    /// router does); the tally-then-admit sequence is not safe to run
    /// concurrently for the same candidate.
    pub async fn process_forward(&self, event: &ForwardEvent) -> Result<Vec<Transition>> {
        let repo = get_repository(&self.pool, event.repository_id)
            .await?
            .ok_or_else(|| format!("unknown repository {}", event.repository_id))?;

        let source = normalize_email(&event.source_email);
        let mut transitions = Vec::new();

        for raw_candidate in &event.candidate_emails {
            let verdict = self.classifier.classify(raw_candidate);
            let candidate = if verdict.normalized.is_empty() {
                raw_candidate.trim().to_lowercase()
            } else {
                verdict.normalized.clone()
            };

            if !repo.snowball.enabled {
                self.append_event(&repo, &source, &candidate, event.depth, 0, false, "snowball disabled")
                    .await?;
                continue;
            }

            if repo.archived {
                self.append_event(&repo, &source, &candidate, event.depth, 0, false, "repository archived")
                    .await?;
                continue;
            }

            if let Some(member) = self.store.get_member(repo.id, &candidate).await? {
                let reason = format!("already a member in state {}", member.state.as_str());
                self.append_event(&repo, &source, &candidate, event.depth, 0, false, &reason)
                    .await?;
                continue;
            }

            if event.depth > repo.snowball.max_depth {
                let reason = format!(
                    "depth {} exceeds max hop count {}",
                    event.depth, repo.snowball.max_depth
                );
                self.append_event(&repo, &source, &candidate, event.depth, 0, false, &reason)
                    .await?;
                continue;
            }

            // Trust rejections are permanent: no pending aggregate is
            // ever created for these addresses.
            if !verdict.is_valid {
                let reason = verdict
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "failed classification".to_string());
                self.append_event(&repo, &source, &candidate, event.depth, 0, false, &reason)
                    .await?;
                continue;
            }

            if !repo.settings.domain_allowed(&verdict.domain) {
                let reason = format!("domain '{}' not permitted", verdict.domain);
                self.append_event(&repo, &source, &candidate, event.depth, 0, false, &reason)
                    .await?;
                continue;
            }

            let aggregate = self
                .tally_forward(&repo, &candidate, &source, event.depth, verdict.trust_score)
                .await?;

            match self.try_admit(&repo, &aggregate).await? {
                AdmissionCheck::Admitted => {
                    let transition = self
                        .store
                        .admit_candidate(repo.id, &candidate, &verdict.domain, verdict.trust_score)
                        .await?;
                    self.delete_candidate(repo.id, &candidate).await?;
                    self.append_event(
                        &repo,
                        &source,
                        &candidate,
                        aggregate.min_depth,
                        aggregate.forwarder_count,
                        true,
                        "forward threshold reached",
                    )
                    .await?;
                    info!(
                        "candidate admitted: repo={} email={} forwarders={}",
                        repo.id, candidate, aggregate.forwarder_count
                    );
                    transitions.push(transition);
                }
                AdmissionCheck::Deferred(reason) => {
                    self.append_event(
                        &repo,
                        &source,
                        &candidate,
                        aggregate.min_depth,
                        aggregate.forwarder_count,
                        false,
                        &reason,
                    )
                    .await?;
                }
            }
        }

        Ok(transitions)
    }

    /// Fold one forward into the candidate aggregate. The forwarder list
    /// is a distinct set, so repeated forwards from the same address
    /// never move the tally.
    async fn tally_forward(
        &self,
        repo: &Repository,
        candidate: &str,
        source: &str,
        depth: u32,
        trust_score: f64,
    ) -> Result<ForwardCandidate> {
        let now = Utc::now();
        let mut aggregate = match self.get_candidate(repo.id, candidate).await? {
            Some(existing) => existing,
            None => ForwardCandidate {
                repository_id: repo.id,
                email: candidate.to_string(),
                forwarder_count: 0,
                forwarders: Vec::new(),
                min_depth: depth,
                trust_score,
                first_seen: now,
                last_seen: now,
            },
        };

        if !aggregate.forwarders.iter().any(|f| f == source)
            && aggregate.forwarders.len() < self.max_forwarders_tracked
        {
            aggregate.forwarders.push(source.to_string());
            aggregate.forwarder_count += 1;
        } else {
            debug!(
                "forwarder not counted (repeat or tracking bound): repo={} candidate={} source={}",
                repo.id, candidate, source
            );
        }
        aggregate.min_depth = aggregate.min_depth.min(depth);
        aggregate.trust_score = trust_score;
        aggregate.last_seen = now;

        let conn = self.pool.get().await?;
        conn.execute(
            r#"
            INSERT INTO forward_candidates (
                repository_id, email, forwarder_count, forwarders, min_depth,
                trust_score, first_seen, last_seen
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(repository_id, email) DO UPDATE SET
                forwarder_count = excluded.forwarder_count,
                forwarders = excluded.forwarders,
                min_depth = excluded.min_depth,
                trust_score = excluded.trust_score,
                last_seen = excluded.last_seen
            "#,
            params![
                aggregate.repository_id,
                aggregate.email,
                aggregate.forwarder_count as i64,
                serde_json::to_string(&aggregate.forwarders)?,
                aggregate.min_depth as i64,
                aggregate.trust_score,
                aggregate.first_seen,
                aggregate.last_seen,
            ],
        )?;

        Ok(aggregate)
    }

    async fn try_admit(
        &self,
        repo: &Repository,
        aggregate: &ForwardCandidate,
    ) -> Result<AdmissionCheck> {
        if aggregate.forwarder_count < repo.snowball.auto_add_threshold {
            return Ok(AdmissionCheck::Deferred(format!(
                "below auto-add threshold ({}/{})",
                aggregate.forwarder_count, repo.snowball.auto_add_threshold
            )));
        }
        if !repo.settings.auto_approve {
            return Ok(AdmissionCheck::Deferred(
                "auto-approve disabled, awaiting owner review".to_string(),
            ));
        }
        if aggregate.trust_score < repo.settings.quality_threshold {
            return Ok(AdmissionCheck::Deferred(format!(
                "trust score {:.2} below quality threshold {:.2}",
                aggregate.trust_score, repo.settings.quality_threshold
            )));
        }
        // The growth cap has the last word; a capped candidate stays
        // pending and retries on a later forward or in the next cycle.
        if !self.governor.approve_admission(repo, 1).await? {
            return Ok(AdmissionCheck::Deferred(
                "growth cap reached for this cycle".to_string(),
            ));
        }
        Ok(AdmissionCheck::Admitted)
    }

    pub async fn get_candidate(
        &self,
        repository_id: i64,
        email: &str,
    ) -> Result<Option<ForwardCandidate>> {
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare(
            "SELECT repository_id, email, forwarder_count, forwarders, min_depth, \
                    trust_score, first_seen, last_seen \
             FROM forward_candidates WHERE repository_id = ?1 AND email = ?2",
        )?;
        let mut rows = stmt.query(params![repository_id, normalize_email(email)])?;
        match rows.next()? {
            Some(row) => {
                let forwarders: String = row.get(3)?;
                Ok(Some(ForwardCandidate {
                    repository_id: row.get(0)?,
                    email: row.get(1)?,
                    forwarder_count: row.get::<_, i64>(2)? as usize,
                    forwarders: serde_json::from_str(&forwarders).unwrap_or_default(),
                    min_depth: row.get::<_, i64>(4)? as u32,
                    trust_score: row.get(5)?,
                    first_seen: row.get(6)?,
                    last_seen: row.get(7)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete_candidate(&self, repository_id: i64, email: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            "DELETE FROM forward_candidates WHERE repository_id = ?1 AND email = ?2",
            params![repository_id, email],
        )?;
        Ok(())
    }

    /// Audit row for one processed candidate. The multiplier recorded is
    /// the repository's size multiplier at the time of the event.
    async fn append_event(
        &self,
        repo: &Repository,
        source: &str,
        candidate: &str,
        depth: u32,
        forwarder_count: usize,
        approved: bool,
        reason: &str,
    ) -> Result<()> {
        let active = self.store.active_count(repo.id).await?;
        let original = self.store.original_count(repo.id).await?.max(1);
        let multiplier = active as f64 / original as f64;

        let conn = self.pool.get().await?;
        conn.execute(
            r#"
            INSERT INTO snowball_events (
                repository_id, source_email, candidate_email, depth,
                forwarder_count, multiplier, approved, reason, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                repo.id,
                source,
                candidate,
                depth as i64,
                forwarder_count as i64,
                multiplier,
                approved as i64,
                reason,
                Utc::now(),
            ],
        )?;
        Ok(())
    }
}

enum AdmissionCheck {
    Admitted,
    Deferred(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::database::testutil::{test_pool, test_repository};
    use crate::database::{create_repository, NewRepository};
    use crate::membership::AddOutcome;
    use crate::models::{MemberSource, MemberState, RepositorySettings, SnowballConfig};

    fn engine(pool: DbPool) -> SnowballEngine {
        let config = Config::default();
        SnowballEngine::new(
            pool.clone(),
            EmailClassifier::new(&config.classifier),
            GrowthGovernor::new(pool, config.governor),
            config.retention.max_forwarders_tracked,
        )
    }

    async fn seed(engine: &SnowballEngine, repo: &Repository, n: usize) {
        let classifier = EmailClassifier::new(&Config::default().classifier);
        for i in 0..n {
            let outcome = engine
                .store()
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
            assert!(matches!(outcome, AddOutcome::Added(_)));
        }
    }

    fn forward(repo_id: i64, from: &str, to: &str, depth: u32) -> ForwardEvent {
        ForwardEvent {
            repository_id: repo_id,
            source_email: from.to_string(),
            candidate_emails: vec![to.to_string()],
            depth,
        }
    }

    async fn repo_with_threshold(pool: &DbPool, threshold: usize) -> Repository {
        create_repository(
            pool,
            NewRepository {
                name: "ml-papers".to_string(),
                owner: "owner@curated.example".to_string(),
                visibility: "private".to_string(),
                settings: RepositorySettings::default(),
                snowball: SnowballConfig {
                    auto_add_threshold: threshold,
                    ..SnowballConfig::default()
                },
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn threshold_gate_admits_on_the_tenth_distinct_forwarder() {
        let pool = test_pool().await;
        let repo = repo_with_threshold(&pool, 10).await;
        let engine = engine(pool);
        seed(&engine, &repo, 30).await;

        for i in 0..8 {
            let transitions = engine
                .process_forward(&forward(
                    repo.id,
                    &format!("seed{}@widgets.example", i),
                    "pending@example.com",
                    1,
                ))
                .await
                .unwrap();
            assert!(transitions.is_empty());
        }

        let aggregate = engine
            .get_candidate(repo.id, "pending@example.com")
            .await
            .unwrap()
            .expect("still pending");
        assert_eq!(aggregate.forwarder_count, 8);
        assert!(engine
            .store()
            .get_member(repo.id, "pending@example.com")
            .await
            .unwrap()
            .is_none());

        engine
            .process_forward(&forward(repo.id, "seed8@widgets.example", "pending@example.com", 1))
            .await
            .unwrap();
        let transitions = engine
            .process_forward(&forward(repo.id, "seed9@widgets.example", "pending@example.com", 1))
            .await
            .unwrap();

        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, Some(MemberState::Pending));
        assert_eq!(transitions[0].to, MemberState::Active);

        let member = engine
            .store()
            .get_member(repo.id, "pending@example.com")
            .await
            .unwrap()
            .expect("admitted");
        assert_eq!(member.source, MemberSource::Snowball);

        // The aggregate is folded away on admission.
        assert!(engine
            .get_candidate(repo.id, "pending@example.com")
            .await
            .unwrap()
            .is_none());

        // The admission is recorded approved=true.
        let conn = engine.pool.get().await.unwrap();
        let approved: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM snowball_events \
                 WHERE repository_id = ?1 AND candidate_email = 'pending@example.com' \
                   AND approved = 1",
                params![repo.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(approved, 1);
    }

    #[tokio::test]
    async fn repeat_forwarders_never_inflate_the_tally() {
        let pool = test_pool().await;
        let repo = repo_with_threshold(&pool, 5).await;
        let engine = engine(pool);
        seed(&engine, &repo, 10).await;

        for _ in 0..7 {
            engine
                .process_forward(&forward(
                    repo.id,
                    "seed0@widgets.example",
                    "candidate@example.com",
                    1,
                ))
                .await
                .unwrap();
        }

        let aggregate = engine
            .get_candidate(repo.id, "candidate@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aggregate.forwarder_count, 1);
        assert!(engine
            .store()
            .get_member(repo.id, "candidate@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn disposable_candidates_never_become_pending() {
        let pool = test_pool().await;
        let repo = repo_with_threshold(&pool, 2).await;
        let engine = engine(pool);
        seed(&engine, &repo, 10).await;

        for i in 0..5 {
            let transitions = engine
                .process_forward(&forward(
                    repo.id,
                    &format!("seed{}@widgets.example", i),
                    "burner@mailinator.com",
                    1,
                ))
                .await
                .unwrap();
            assert!(transitions.is_empty());
        }

        assert!(engine
            .get_candidate(repo.id, "burner@mailinator.com")
            .await
            .unwrap()
            .is_none());
        assert!(engine
            .store()
            .get_member(repo.id, "burner@mailinator.com")
            .await
            .unwrap()
            .is_none());

        // Discards still leave audit events behind.
        let conn = engine.pool.get().await.unwrap();
        let events: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM snowball_events WHERE candidate_email = 'burner@mailinator.com'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(events, 5);
    }

    #[tokio::test]
    async fn depth_beyond_the_hop_limit_is_ignored() {
        let pool = test_pool().await;
        let repo = repo_with_threshold(&pool, 1).await;
        let engine = engine(pool);
        seed(&engine, &repo, 5).await;

        let transitions = engine
            .process_forward(&forward(repo.id, "seed0@widgets.example", "deep@example.com", 4))
            .await
            .unwrap();
        assert!(transitions.is_empty());
        assert!(engine
            .get_candidate(repo.id, "deep@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn existing_members_are_not_re_candidates() {
        let pool = test_pool().await;
        let repo = repo_with_threshold(&pool, 1).await;
        let engine = engine(pool);
        seed(&engine, &repo, 3).await;

        engine
            .store()
            .opt_out(repo.id, "seed2@widgets.example", "member request")
            .await
            .unwrap();

        for target in ["seed1@widgets.example", "seed2@widgets.example"] {
            let transitions = engine
                .process_forward(&forward(repo.id, "seed0@widgets.example", target, 1))
                .await
                .unwrap();
            assert!(transitions.is_empty());
            assert!(engine.get_candidate(repo.id, target).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn growth_cap_keeps_candidates_pending() {
        let pool = test_pool().await;
        let repo = create_repository(
            &pool,
            NewRepository {
                name: "tiny".to_string(),
                owner: "owner@curated.example".to_string(),
                visibility: "private".to_string(),
                settings: RepositorySettings::default(),
                snowball: SnowballConfig {
                    auto_add_threshold: 1,
                    max_growth_rate: 1.0,
                    ..SnowballConfig::default()
                },
            },
        )
        .await
        .unwrap();
        let engine = engine(pool);
        seed(&engine, &repo, 2).await;

        // Cap is 2 admissions (base 2, rate 1.0). Third stays pending.
        for (i, candidate) in ["new1@example.com", "new2@example.com"].iter().enumerate() {
            let transitions = engine
                .process_forward(&forward(
                    repo.id,
                    &format!("seed{}@widgets.example", i),
                    candidate,
                    1,
                ))
                .await
                .unwrap();
            assert_eq!(transitions.len(), 1, "{} should be admitted", candidate);
        }

        let transitions = engine
            .process_forward(&forward(repo.id, "seed0@widgets.example", "new3@example.com", 1))
            .await
            .unwrap();
        assert!(transitions.is_empty());

        let held = engine
            .get_candidate(repo.id, "new3@example.com")
            .await
            .unwrap()
            .expect("deferred candidate stays pending");
        assert_eq!(held.forwarder_count, 1);
    }

    #[tokio::test]
    async fn disabled_snowball_only_audits() {
        let pool = test_pool().await;
        let repo = create_repository(
            &pool,
            NewRepository {
                name: "static-list".to_string(),
                owner: "owner@curated.example".to_string(),
                visibility: "private".to_string(),
                settings: RepositorySettings::default(),
                snowball: SnowballConfig {
                    enabled: false,
                    ..SnowballConfig::default()
                },
            },
        )
        .await
        .unwrap();
        let engine = engine(pool);

        let transitions = engine
            .process_forward(&forward(repo.id, "anyone@example.com", "new@example.com", 1))
            .await
            .unwrap();
        assert!(transitions.is_empty());
        assert!(engine
            .get_candidate(repo.id, "new@example.com")
            .await
            .unwrap()
            .is_none());

        let conn = engine.pool.get().await.unwrap();
        let events: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM snowball_events WHERE repository_id = ?1",
                params![repo.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(events, 1);
    }
}
