use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Lifecycle state of a membership record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Pending,
    Active,
    Verified,
    OptedOut,
    Bounced,
    Removed,
}

impl MemberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Pending => "pending",
            MemberState::Active => "active",
            MemberState::Verified => "verified",
            MemberState::OptedOut => "opted_out",
            MemberState::Bounced => "bounced",
            MemberState::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<MemberState> {
        match s {
            "pending" => Some(MemberState::Pending),
            "active" => Some(MemberState::Active),
            "verified" => Some(MemberState::Verified),
            "opted_out" => Some(MemberState::OptedOut),
            "bounced" => Some(MemberState::Bounced),
            "removed" => Some(MemberState::Removed),
            _ => None,
        }
    }

    /// Whether the state machine permits moving from `self` to `to`.
    /// Removal is allowed from every state and is terminal.
    pub fn can_transition_to(&self, to: MemberState) -> bool {
        use MemberState::*;
        if to == Removed {
            return *self != Removed;
        }
        matches!(
            (*self, to),
            (Pending, Active)
                | (Active, Verified)
                | (Active, OptedOut)
                | (Verified, OptedOut)
                | (Active, Bounced)
                | (Verified, Bounced)
        )
    }

    pub fn receives_digests(&self) -> bool {
        matches!(self, MemberState::Active | MemberState::Verified)
    }
}

/// How an email entered a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberSource {
    Direct,
    CsvImport,
    Snowball,
    Api,
    Forward,
}

impl MemberSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberSource::Direct => "direct",
            MemberSource::CsvImport => "csv_import",
            MemberSource::Snowball => "snowball",
            MemberSource::Api => "api",
            MemberSource::Forward => "forward",
        }
    }

    pub fn parse(s: &str) -> Option<MemberSource> {
        match s {
            "direct" => Some(MemberSource::Direct),
            "csv_import" => Some(MemberSource::CsvImport),
            "snowball" => Some(MemberSource::Snowball),
            "api" => Some(MemberSource::Api),
            "forward" => Some(MemberSource::Forward),
            _ => None,
        }
    }

    /// Sources that count toward the original (pre-snowball) size of a
    /// repository when computing the snowball multiplier.
    pub fn is_original(&self) -> bool {
        matches!(
            self,
            MemberSource::Direct | MemberSource::CsvImport | MemberSource::Api
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySettings {
    pub quality_threshold: f64,
    pub auto_approve: bool,
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    /// 0 means unlimited.
    pub max_emails_per_contributor: usize,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            quality_threshold: 0.5,
            auto_approve: true,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            max_emails_per_contributor: 500,
        }
    }
}

impl RepositorySettings {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(format!(
                "quality_threshold must be within [0, 1], got {}",
                self.quality_threshold
            ));
        }
        Ok(())
    }

    /// Repository-level domain policy. A non-empty allow list is exclusive.
    pub fn domain_allowed(&self, domain: &str) -> bool {
        if self.blocked_domains.iter().any(|d| d == domain) {
            return false;
        }
        if !self.allowed_domains.is_empty() {
            return self.allowed_domains.iter().any(|d| d == domain);
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowballConfig {
    pub enabled: bool,
    pub max_depth: u32,
    pub multiplier_target: f64,
    pub auto_add_threshold: usize,
    pub cooldown_hours: i64,
    pub max_growth_rate: f64,
}

impl Default for SnowballConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 3,
            multiplier_target: 2.0,
            auto_add_threshold: 5,
            cooldown_hours: 24,
            max_growth_rate: 2.0,
        }
    }
}

impl SnowballConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.auto_add_threshold == 0 {
            return Err("auto_add_threshold must be greater than 0".to_string());
        }
        if self.max_depth == 0 {
            return Err("max_depth must be at least 1".to_string());
        }
        if self.max_growth_rate <= 0.0 {
            return Err(format!(
                "max_growth_rate must be positive, got {}",
                self.max_growth_rate
            ));
        }
        if self.cooldown_hours <= 0 {
            return Err("cooldown_hours must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub visibility: String,
    pub archived: bool,
    pub settings: RepositorySettings,
    pub snowball: SnowballConfig,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub id: Option<i64>,
    pub repository_id: i64,
    pub email: String,
    pub domain: String,
    pub source: MemberSource,
    pub state: MemberState,
    pub trust_score: f64,
    pub tags: Vec<String>,
    pub opens: i64,
    pub clicks: i64,
    pub replies: i64,
    pub forwards: i64,
    pub bounce_count: i64,
    pub complaint_count: i64,
    pub can_receive_digest: bool,
    pub can_receive_snowball: bool,
    pub can_be_shared: bool,
    pub added_by: Option<String>,
    pub added_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_engagement_at: Option<DateTime<Utc>>,
}

/// Aggregate for a not-yet-admitted forward candidate. One row per
/// (repository, email) while the candidate is pending; dropped on
/// admission or on expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardCandidate {
    pub repository_id: i64,
    pub email: String,
    pub forwarder_count: usize,
    pub forwarders: Vec<String>,
    pub min_depth: u32,
    pub trust_score: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One detected forward, as delivered by the inbound email layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardEvent {
    pub repository_id: i64,
    pub source_email: String,
    pub candidate_emails: Vec<String>,
    pub depth: u32,
}

/// Append-only audit record. Every processed candidate yields one,
/// approved or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowballEvent {
    pub id: Option<i64>,
    pub repository_id: i64,
    pub source_email: String,
    pub candidate_email: String,
    pub depth: u32,
    pub forwarder_count: usize,
    pub multiplier: f64,
    pub approved: bool,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Processing => "processing",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ImportStatus> {
        match s {
            "pending" => Some(ImportStatus::Pending),
            "processing" => Some(ImportStatus::Processing),
            "completed" => Some(ImportStatus::Completed),
            "failed" => Some(ImportStatus::Failed),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvImportRecord {
    pub id: String,
    pub repository_id: i64,
    pub filename: String,
    pub uploaded_by: String,
    pub status: ImportStatus,
    pub total_rows: usize,
    pub valid_emails: usize,
    pub duplicate_emails: usize,
    pub invalid_emails: usize,
    pub processed_rows: usize,
    pub admitted_rows: usize,
    pub error_log: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A membership state change produced by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub email: String,
    pub from: Option<MemberState>,
    pub to: MemberState,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removal_is_allowed_from_any_live_state() {
        for state in [
            MemberState::Pending,
            MemberState::Active,
            MemberState::Verified,
            MemberState::OptedOut,
            MemberState::Bounced,
        ] {
            assert!(state.can_transition_to(MemberState::Removed));
        }
        assert!(!MemberState::Removed.can_transition_to(MemberState::Removed));
    }

    #[test]
    fn pending_cannot_skip_to_verified() {
        assert!(!MemberState::Pending.can_transition_to(MemberState::Verified));
        assert!(MemberState::Pending.can_transition_to(MemberState::Active));
        assert!(MemberState::Active.can_transition_to(MemberState::Verified));
    }

    #[test]
    fn opted_out_is_sticky() {
        assert!(!MemberState::OptedOut.can_transition_to(MemberState::Active));
        assert!(!MemberState::OptedOut.can_transition_to(MemberState::Verified));
    }

    #[test]
    fn state_round_trips_through_storage_form() {
        for state in [
            MemberState::Pending,
            MemberState::Active,
            MemberState::Verified,
            MemberState::OptedOut,
            MemberState::Bounced,
            MemberState::Removed,
        ] {
            assert_eq!(MemberState::parse(state.as_str()), Some(state));
        }
        assert_eq!(MemberState::parse("gone"), None);
    }

    #[test]
    fn settings_validation_bounds() {
        let mut settings = RepositorySettings::default();
        assert!(settings.validate().is_ok());
        settings.quality_threshold = 1.2;
        assert!(settings.validate().is_err());

        let mut snowball = SnowballConfig::default();
        assert!(snowball.validate().is_ok());
        snowball.auto_add_threshold = 0;
        assert!(snowball.validate().is_err());
    }

    #[test]
    fn domain_policy_allow_list_is_exclusive() {
        let mut settings = RepositorySettings::default();
        assert!(settings.domain_allowed("example.com"));

        settings.blocked_domains = vec!["spam.example".to_string()];
        assert!(!settings.domain_allowed("spam.example"));

        settings.allowed_domains = vec!["corp.example".to_string()];
        assert!(settings.domain_allowed("corp.example"));
        assert!(!settings.domain_allowed("example.com"));
    }
}
