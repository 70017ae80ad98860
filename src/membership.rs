use chrono::Utc;
use rusqlite::params;
use tracing::{debug, info};

use crate::classifier::{normalize_email, EmailVerdict};
use crate::database::DbPool;
use crate::models::{
    MemberSource, MemberState, MembershipRecord, Repository, Result, Transition,
};

/// Outcome of asking the store to change one member's state. Illegal
/// transitions are reported, never applied and never a panic.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StateChange {
    Applied(Transition),
    Rejected { email: String, reason: String },
}

impl StateChange {
    pub fn is_applied(&self) -> bool {
        matches!(self, StateChange::Applied(_))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AddOutcome {
    Added(Transition),
    Duplicate { email: String, state: MemberState },
    Rejected { email: String, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub enum EngagementKind {
    Open,
    Click,
    Reply,
    Forward,
}

impl EngagementKind {
    fn column(&self) -> &'static str {
        match self {
            EngagementKind::Open => "opens",
            EngagementKind::Click => "clicks",
            EngagementKind::Reply => "replies",
            EngagementKind::Forward => "forwards",
        }
    }
}

#[derive(Clone)]
pub struct MembershipStore {
    pool: DbPool,
}

impl MembershipStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_member(
        &self,
        repository_id: i64,
        email: &str,
    ) -> Result<Option<MembershipRecord>> {
        let normalized = normalize_email(email);
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, repository_id, email, domain, source, state, trust_score, tags,
                   opens, clicks, replies, forwards, bounce_count, complaint_count,
                   can_receive_digest, can_receive_snowball, can_be_shared,
                   added_by, added_at, verified_at, last_engagement_at
            FROM members WHERE repository_id = ?1 AND email = ?2
            "#,
        )?;
        let mut rows = stmt.query(params![repository_id, normalized])?;
        match rows.next()? {
            Some(row) => Ok(Some(map_member_row(row)?)),
            None => Ok(None),
        }
    }

    /// Direct, CSV, or API addition. The caller supplies the classifier
    /// verdict; this method enforces repository policy and uniqueness.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_member(
        &self,
        repo: &Repository,
        verdict: &EmailVerdict,
        source: MemberSource,
        added_by: Option<&str>,
        tags: &[String],
        subscribed: bool,
        override_removed: bool,
    ) -> Result<AddOutcome> {
        let email = verdict.normalized.clone();

        if !verdict.is_valid {
            return Ok(AddOutcome::Rejected {
                email,
                reason: verdict
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "invalid email".to_string()),
            });
        }
        if repo.archived {
            return Ok(AddOutcome::Rejected {
                email,
                reason: "repository is archived".to_string(),
            });
        }
        if !repo.settings.domain_allowed(&verdict.domain) {
            return Ok(AddOutcome::Rejected {
                email,
                reason: format!("domain '{}' not permitted by repository policy", verdict.domain),
            });
        }

        if let Some(existing) = self.get_member(repo.id, &email).await? {
            return match existing.state {
                MemberState::OptedOut => Ok(AddOutcome::Rejected {
                    email,
                    reason: "address has opted out".to_string(),
                }),
                MemberState::Bounced => Ok(AddOutcome::Rejected {
                    email,
                    reason: "address is suppressed after hard bounces".to_string(),
                }),
                MemberState::Removed => {
                    if override_removed {
                        self.reinstate(repo.id, &email, source, added_by).await
                    } else {
                        Ok(AddOutcome::Rejected {
                            email,
                            reason: "address was removed; owner override required".to_string(),
                        })
                    }
                }
                state => Ok(AddOutcome::Duplicate { email, state }),
            };
        }

        if repo.settings.max_emails_per_contributor > 0 {
            if let Some(contributor) = added_by {
                let already = self.contributor_count(repo.id, contributor).await?;
                if already >= repo.settings.max_emails_per_contributor as i64 {
                    return Ok(AddOutcome::Rejected {
                        email,
                        reason: format!(
                            "contributor '{}' reached the per-contributor cap of {}",
                            contributor, repo.settings.max_emails_per_contributor
                        ),
                    });
                }
            }
        }

        let conn = self.pool.get().await?;
        let now = Utc::now();
        let inserted = conn.execute(
            r#"
            INSERT INTO members (
                repository_id, email, domain, source, state, trust_score, tags,
                can_receive_digest, can_receive_snowball, added_by, added_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10)
            ON CONFLICT(repository_id, email) DO NOTHING
            "#,
            params![
                repo.id,
                email,
                verdict.domain,
                source.as_str(),
                MemberState::Active.as_str(),
                verdict.trust_score,
                tags.join(","),
                subscribed as i64,
                added_by,
                now,
            ],
        )?;

        if inserted == 0 {
            // Lost a race with a concurrent add for the same address.
            let state = self
                .get_member(repo.id, &email)
                .await?
                .map(|m| m.state)
                .unwrap_or(MemberState::Active);
            return Ok(AddOutcome::Duplicate { email, state });
        }

        debug!(
            "member added: repo={} email={} source={}",
            repo.id,
            email,
            source.as_str()
        );
        Ok(AddOutcome::Added(Transition {
            email,
            from: None,
            to: MemberState::Active,
            reason: format!("added via {}", source.as_str()),
        }))
    }

    /// Owner-override re-add of a previously removed address.
    async fn reinstate(
        &self,
        repository_id: i64,
        email: &str,
        source: MemberSource,
        added_by: Option<&str>,
    ) -> Result<AddOutcome> {
        let conn = self.pool.get().await?;
        conn.execute(
            r#"
            UPDATE members SET state = ?1, source = ?2, added_by = ?3, added_at = ?4,
                   can_receive_digest = 1, can_receive_snowball = 1
            WHERE repository_id = ?5 AND email = ?6
            "#,
            params![
                MemberState::Active.as_str(),
                source.as_str(),
                added_by,
                Utc::now(),
                repository_id,
                email,
            ],
        )?;
        info!(
            "member reinstated by owner override: repo={} email={}",
            repository_id, email
        );
        Ok(AddOutcome::Added(Transition {
            email: email.to_string(),
            from: Some(MemberState::Removed),
            to: MemberState::Active,
            reason: "owner override re-add".to_string(),
        }))
    }

    /// Snowball admission: materializes the membership record for a
    /// candidate that crossed its threshold. Only the per-repository
    /// worker calls this, so the existence check cannot race.
    pub async fn admit_candidate(
        &self,
        repository_id: i64,
        email: &str,
        domain: &str,
        trust_score: f64,
    ) -> Result<Transition> {
        let conn = self.pool.get().await?;
        conn.execute(
            r#"
            INSERT INTO members (
                repository_id, email, domain, source, state, trust_score, added_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(repository_id, email) DO NOTHING
            "#,
            params![
                repository_id,
                email,
                domain,
                MemberSource::Snowball.as_str(),
                MemberState::Active.as_str(),
                trust_score,
                Utc::now(),
            ],
        )?;
        Ok(Transition {
            email: email.to_string(),
            from: Some(MemberState::Pending),
            to: MemberState::Active,
            reason: "forward threshold reached".to_string(),
        })
    }

    pub async fn verify(&self, repository_id: i64, email: &str) -> Result<StateChange> {
        self.transition(
            repository_id,
            email,
            MemberState::Verified,
            "ownership confirmed",
            |conn, normalized| {
                conn.execute(
                    "UPDATE members SET state = ?1, verified_at = ?2 \
                     WHERE repository_id = ?3 AND email = ?4",
                    params![
                        MemberState::Verified.as_str(),
                        Utc::now(),
                        repository_id,
                        normalized
                    ],
                )
            },
        )
        .await
    }

    /// Member-initiated or compliance-forced unsubscribe. Drops both
    /// delivery permissions; the record stays for re-add suppression.
    pub async fn opt_out(
        &self,
        repository_id: i64,
        email: &str,
        reason: &str,
    ) -> Result<StateChange> {
        self.transition(repository_id, email, MemberState::OptedOut, reason, |conn, normalized| {
            conn.execute(
                "UPDATE members SET state = ?1, can_receive_digest = 0, can_receive_snowball = 0 \
                 WHERE repository_id = ?2 AND email = ?3",
                params![MemberState::OptedOut.as_str(), repository_id, normalized],
            )
        })
        .await
    }

    pub async fn mark_bounced(&self, repository_id: i64, email: &str) -> Result<StateChange> {
        self.transition(
            repository_id,
            email,
            MemberState::Bounced,
            "hard bounce threshold crossed",
            |conn, normalized| {
                conn.execute(
                    "UPDATE members SET state = ?1, can_receive_digest = 0 \
                     WHERE repository_id = ?2 AND email = ?3",
                    params![MemberState::Bounced.as_str(), repository_id, normalized],
                )
            },
        )
        .await
    }

    /// Administrative removal. Terminal; later imports and forwards do
    /// not reinstate without the owner override path.
    pub async fn remove(&self, repository_id: i64, email: &str) -> Result<StateChange> {
        self.transition(
            repository_id,
            email,
            MemberState::Removed,
            "administrative removal",
            |conn, normalized| {
                conn.execute(
                    "UPDATE members SET state = ?1, can_receive_digest = 0, can_receive_snowball = 0 \
                     WHERE repository_id = ?2 AND email = ?3",
                    params![MemberState::Removed.as_str(), repository_id, normalized],
                )
            },
        )
        .await
    }

    async fn transition<F>(
        &self,
        repository_id: i64,
        email: &str,
        to: MemberState,
        reason: &str,
        apply: F,
    ) -> Result<StateChange>
    where
        F: FnOnce(&rusqlite::Connection, &str) -> rusqlite::Result<usize>,
    {
        let normalized = normalize_email(email);
        let Some(member) = self.get_member(repository_id, &normalized).await? else {
            return Ok(StateChange::Rejected {
                email: normalized,
                reason: "no such member".to_string(),
            });
        };

        if !member.state.can_transition_to(to) {
            return Ok(StateChange::Rejected {
                email: normalized,
                reason: format!(
                    "cannot move from {} to {}",
                    member.state.as_str(),
                    to.as_str()
                ),
            });
        }

        let conn = self.pool.get().await?;
        apply(&conn, &normalized)?;
        debug!(
            "member transition: repo={} email={} {} -> {} ({})",
            repository_id,
            normalized,
            member.state.as_str(),
            to.as_str(),
            reason
        );
        Ok(StateChange::Applied(Transition {
            email: normalized,
            from: Some(member.state),
            to,
            reason: reason.to_string(),
        }))
    }

    pub async fn record_engagement(
        &self,
        repository_id: i64,
        email: &str,
        kind: EngagementKind,
    ) -> Result<bool> {
        let normalized = normalize_email(email);
        let conn = self.pool.get().await?;
        let sql = format!(
            "UPDATE members SET {} = {} + 1, last_engagement_at = ?1 \
             WHERE repository_id = ?2 AND email = ?3 AND state IN ('active', 'verified')",
            kind.column(),
            kind.column()
        );
        let changed = conn.execute(&sql, params![Utc::now(), repository_id, normalized])?;
        Ok(changed > 0)
    }

    /// Addresses that currently receive the periodic digest.
    pub async fn digest_recipients(&self, repository_id: i64) -> Result<Vec<String>> {
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare(
            "SELECT email FROM members \
             WHERE repository_id = ?1 AND state IN ('active', 'verified') \
               AND can_receive_digest = 1 \
             ORDER BY email",
        )?;
        let emails = stmt
            .query_map(params![repository_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    pub async fn active_count(&self, repository_id: i64) -> Result<i64> {
        let conn = self.pool.get().await?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM members \
             WHERE repository_id = ?1 AND state IN ('active', 'verified')",
            params![repository_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Members that arrived outside the snowball, the denominator of the
    /// snowball multiplier.
    pub async fn original_count(&self, repository_id: i64) -> Result<i64> {
        let conn = self.pool.get().await?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM members \
             WHERE repository_id = ?1 AND source IN ('direct', 'csv_import', 'api') \
               AND state != 'removed'",
            params![repository_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn contributor_count(&self, repository_id: i64, added_by: &str) -> Result<i64> {
        let conn = self.pool.get().await?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM members WHERE repository_id = ?1 AND added_by = ?2",
            params![repository_id, added_by],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_member_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MembershipRecord> {
    let source: String = row.get(4)?;
    let state: String = row.get(5)?;
    let tags: String = row.get(7)?;
    Ok(MembershipRecord {
        id: Some(row.get(0)?),
        repository_id: row.get(1)?,
        email: row.get(2)?,
        domain: row.get(3)?,
        source: MemberSource::parse(&source).unwrap_or(MemberSource::Direct),
        state: MemberState::parse(&state).unwrap_or(MemberState::Active),
        trust_score: row.get(6)?,
        tags: if tags.is_empty() {
            Vec::new()
        } else {
            tags.split(',').map(|t| t.to_string()).collect()
        },
        opens: row.get(8)?,
        clicks: row.get(9)?,
        replies: row.get(10)?,
        forwards: row.get(11)?,
        bounce_count: row.get(12)?,
        complaint_count: row.get(13)?,
        can_receive_digest: row.get::<_, i64>(14)? != 0,
        can_receive_snowball: row.get::<_, i64>(15)? != 0,
        can_be_shared: row.get::<_, i64>(16)? != 0,
        added_by: row.get(17)?,
        added_at: row.get(18)?,
        verified_at: row.get(19)?,
        last_engagement_at: row.get(20)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::EmailClassifier;
    use crate::config::Config;
    use crate::database::testutil::{test_pool, test_repository};

    fn classifier() -> EmailClassifier {
        EmailClassifier::new(&Config::default().classifier)
    }

    #[tokio::test]
    async fn add_is_unique_under_normalization() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let store = MembershipStore::new(pool);
        let c = classifier();

        let first = store
            .add_member(
                &repo,
                &c.classify("Jane@Widgets.Example"),
                MemberSource::Direct,
                Some("owner"),
                &[],
                true,
                false,
            )
            .await
            .unwrap();
        assert!(matches!(first, AddOutcome::Added(_)));

        let second = store
            .add_member(
                &repo,
                &c.classify("  jane@widgets.example "),
                MemberSource::CsvImport,
                Some("owner"),
                &[],
                true,
                false,
            )
            .await
            .unwrap();
        assert!(matches!(second, AddOutcome::Duplicate { .. }));

        let member = store
            .get_member(repo.id, "JANE@widgets.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.email, "jane@widgets.example");
        assert_eq!(member.state, MemberState::Active);
    }

    #[tokio::test]
    async fn opted_out_members_leave_the_digest_and_stay_out() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let store = MembershipStore::new(pool);
        let c = classifier();

        for addr in ["stay@widgets.example", "optout@example.com"] {
            store
                .add_member(
                    &repo,
                    &c.classify(addr),
                    MemberSource::Direct,
                    None,
                    &[],
                    true,
                    false,
                )
                .await
                .unwrap();
        }

        let change = store
            .opt_out(repo.id, "optout@example.com", "member request")
            .await
            .unwrap();
        assert!(change.is_applied());

        let recipients = store.digest_recipients(repo.id).await.unwrap();
        assert_eq!(recipients, vec!["stay@widgets.example".to_string()]);

        // Re-adding an opted-out address is refused.
        let readd = store
            .add_member(
                &repo,
                &c.classify("optout@example.com"),
                MemberSource::CsvImport,
                None,
                &[],
                true,
                false,
            )
            .await
            .unwrap();
        assert!(matches!(readd, AddOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn removal_is_terminal_without_override() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let store = MembershipStore::new(pool);
        let c = classifier();

        store
            .add_member(
                &repo,
                &c.classify("gone@widgets.example"),
                MemberSource::Direct,
                None,
                &[],
                true,
                false,
            )
            .await
            .unwrap();
        assert!(store
            .remove(repo.id, "gone@widgets.example")
            .await
            .unwrap()
            .is_applied());

        let readd = store
            .add_member(
                &repo,
                &c.classify("gone@widgets.example"),
                MemberSource::Direct,
                None,
                &[],
                true,
                false,
            )
            .await
            .unwrap();
        assert!(matches!(readd, AddOutcome::Rejected { .. }));

        let forced = store
            .add_member(
                &repo,
                &c.classify("gone@widgets.example"),
                MemberSource::Direct,
                Some("owner"),
                &[],
                true,
                true,
            )
            .await
            .unwrap();
        assert!(matches!(forced, AddOutcome::Added(_)));
        let member = store
            .get_member(repo.id, "gone@widgets.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.state, MemberState::Active);
    }

    #[tokio::test]
    async fn verify_requires_active() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let store = MembershipStore::new(pool);
        let c = classifier();

        store
            .add_member(
                &repo,
                &c.classify("member@widgets.example"),
                MemberSource::Direct,
                None,
                &[],
                true,
                false,
            )
            .await
            .unwrap();

        assert!(store
            .verify(repo.id, "member@widgets.example")
            .await
            .unwrap()
            .is_applied());

        // Verified twice is an illegal transition, reported not applied.
        let again = store.verify(repo.id, "member@widgets.example").await.unwrap();
        assert!(!again.is_applied());

        let missing = store.verify(repo.id, "ghost@widgets.example").await.unwrap();
        assert!(!missing.is_applied());
    }

    #[tokio::test]
    async fn contributor_cap_is_enforced() {
        let pool = test_pool().await;
        let mut repo = test_repository(&pool).await;
        repo.settings.max_emails_per_contributor = 2;
        let store = MembershipStore::new(pool);
        let c = classifier();

        for addr in ["a@widgets.example", "b@widgets.example"] {
            let outcome = store
                .add_member(
                    &repo,
                    &c.classify(addr),
                    MemberSource::Direct,
                    Some("greedy"),
                    &[],
                    true,
                    false,
                )
                .await
                .unwrap();
            assert!(matches!(outcome, AddOutcome::Added(_)));
        }

        let capped = store
            .add_member(
                &repo,
                &c.classify("c@widgets.example"),
                MemberSource::Direct,
                Some("greedy"),
                &[],
                true,
                false,
            )
            .await
            .unwrap();
        assert!(matches!(capped, AddOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn engagement_updates_counters() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;
        let store = MembershipStore::new(pool);
        let c = classifier();

        store
            .add_member(
                &repo,
                &c.classify("reader@widgets.example"),
                MemberSource::Direct,
                None,
                &[],
                true,
                false,
            )
            .await
            .unwrap();

        assert!(store
            .record_engagement(repo.id, "reader@widgets.example", EngagementKind::Open)
            .await
            .unwrap());
        assert!(store
            .record_engagement(repo.id, "reader@widgets.example", EngagementKind::Click)
            .await
            .unwrap());

        let member = store
            .get_member(repo.id, "reader@widgets.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.opens, 1);
        assert_eq!(member.clicks, 1);
        assert!(member.last_engagement_at.is_some());
    }
}
