use chrono::{Duration, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::config::AnalyticsConfig;
use crate::database::DbPool;
use crate::governor::{GrowthGovernor, RepositoryHealth};
use crate::models::Result;

#[derive(Debug, Clone, Serialize)]
pub struct DomainCount {
    pub domain: String,
    pub members: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub total_members: i64,
    pub active_members: i64,
    pub verified_members: i64,
    pub pending_candidates: i64,
    /// Percentage change of admissions, trailing window over the one
    /// before it.
    pub growth_rate: f64,
    pub snowball_multiplier: f64,
    pub engagement_rate: f64,
    pub top_domains: Vec<DomainCount>,
    pub health: RepositoryHealth,
}

/// Read-only derivations over the membership store and the snowball
/// audit trail. Nothing here mutates state.
pub async fn snapshot(
    pool: &DbPool,
    config: &AnalyticsConfig,
    governor: &GrowthGovernor,
    repository_id: i64,
) -> Result<AnalyticsSnapshot> {
    let health = governor.health(repository_id).await?;
    let conn = pool.get().await?;

    let total_members: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members WHERE repository_id = ?1 AND state != 'removed'",
        params![repository_id],
        |row| row.get(0),
    )?;
    let active_members: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members \
         WHERE repository_id = ?1 AND state IN ('active', 'verified')",
        params![repository_id],
        |row| row.get(0),
    )?;
    let verified_members: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members WHERE repository_id = ?1 AND state = 'verified'",
        params![repository_id],
        |row| row.get(0),
    )?;
    let pending_candidates: i64 = conn.query_row(
        "SELECT COUNT(*) FROM forward_candidates WHERE repository_id = ?1",
        params![repository_id],
        |row| row.get(0),
    )?;

    let original: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members \
         WHERE repository_id = ?1 AND source IN ('direct', 'csv_import', 'api') \
           AND state != 'removed'",
        params![repository_id],
        |row| row.get(0),
    )?;
    let snowball_multiplier = active_members as f64 / original.max(1) as f64;

    let now = Utc::now();
    let window = Duration::hours(config.growth_window_hours);
    let current: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members \
         WHERE repository_id = ?1 AND added_at >= ?2 AND state != 'removed'",
        params![repository_id, now - window],
        |row| row.get(0),
    )?;
    let previous: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members \
         WHERE repository_id = ?1 AND added_at >= ?2 AND added_at < ?3 AND state != 'removed'",
        params![repository_id, now - window - window, now - window],
        |row| row.get(0),
    )?;
    let growth_rate = if previous > 0 {
        (current - previous) as f64 / previous as f64 * 100.0
    } else if current > 0 {
        100.0
    } else {
        0.0
    };

    let engaged: i64 = conn.query_row(
        "SELECT COUNT(*) FROM members \
         WHERE repository_id = ?1 AND state IN ('active', 'verified') \
           AND (opens > 0 OR clicks > 0 OR replies > 0 OR forwards > 0)",
        params![repository_id],
        |row| row.get(0),
    )?;
    let engagement_rate = if active_members > 0 {
        engaged as f64 / active_members as f64
    } else {
        0.0
    };

    let mut stmt = conn.prepare(
        "SELECT domain, COUNT(*) AS members FROM members \
         WHERE repository_id = ?1 AND state IN ('active', 'verified') \
         GROUP BY domain ORDER BY members DESC, domain ASC LIMIT 5",
    )?;
    let top_domains = stmt
        .query_map(params![repository_id], |row| {
            Ok(DomainCount {
                domain: row.get(0)?,
                members: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(AnalyticsSnapshot {
        total_members,
        active_members,
        verified_members,
        pending_candidates,
        growth_rate,
        snowball_multiplier,
        engagement_rate,
        top_domains,
        health,
    })
}
