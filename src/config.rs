use serde::{Deserialize, Serialize};

use crate::models::{SnowballConfig, RepositorySettings};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub ingestion: IngestionConfig,
    pub classifier: ClassifierConfig,
    pub snowball: SnowballConfig,
    pub repository: RepositorySettings,
    pub governor: GovernorConfig,
    pub retention: RetentionConfig,
    pub analytics: AnalyticsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    pub max_file_bytes: usize,
    pub max_rows: usize,
    pub max_tags_per_row: usize,
    pub max_tag_length: usize,
    /// Import jobs persist progress every this many rows.
    pub progress_interval: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierConfig {
    pub disposable_domains: Vec<String>,
    pub webmail_domains: Vec<String>,
    pub role_prefixes: Vec<String>,
    pub webmail_trust: f64,
    pub custom_domain_trust: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GovernorConfig {
    pub hard_bounce_threshold: i64,
    pub complaint_threshold: i64,
    /// Proportion of bounced members above which a repository is
    /// reported unhealthy.
    pub unhealthy_bounce_rate: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Pending forward candidates older than this are swept.
    pub candidate_retention_hours: i64,
    pub sweep_interval_seconds: u64,
    /// Distinct forwarders tracked per candidate.
    pub max_forwarders_tracked: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyticsConfig {
    /// Trailing window for the growth-rate calculation.
    pub growth_window_hours: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                address: "0.0.0.0".to_string(),
                port: 8000,
                database_path: "data/snowball.db".to_string(),
            },
            ingestion: IngestionConfig {
                max_file_bytes: 10 * 1024 * 1024,
                max_rows: 10_000,
                max_tags_per_row: 10,
                max_tag_length: 50,
                progress_interval: 100,
            },
            classifier: ClassifierConfig {
                disposable_domains: default_disposable_domains(),
                webmail_domains: default_webmail_domains(),
                role_prefixes: default_role_prefixes(),
                webmail_trust: 0.7,
                custom_domain_trust: 0.9,
            },
            snowball: SnowballConfig::default(),
            repository: RepositorySettings::default(),
            governor: GovernorConfig {
                hard_bounce_threshold: 3,
                complaint_threshold: 2,
                unhealthy_bounce_rate: 0.05,
            },
            retention: RetentionConfig {
                candidate_retention_hours: 72,
                sweep_interval_seconds: 3600,
                max_forwarders_tracked: 64,
            },
            analytics: AnalyticsConfig {
                growth_window_hours: 24,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

fn default_disposable_domains() -> Vec<String> {
    [
        "mailinator.com",
        "guerrillamail.com",
        "10minutemail.com",
        "tempmail.com",
        "temp-mail.org",
        "throwaway.email",
        "yopmail.com",
        "sharklasers.com",
        "getnada.com",
        "trashmail.com",
        "dispostable.com",
        "maildrop.cc",
        "fakeinbox.com",
        "mintemail.com",
        "mytemp.email",
        "spamgourmet.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_webmail_domains() -> Vec<String> {
    [
        "gmail.com",
        "googlemail.com",
        "yahoo.com",
        "yahoo.co.uk",
        "hotmail.com",
        "outlook.com",
        "live.com",
        "msn.com",
        "aol.com",
        "icloud.com",
        "me.com",
        "mac.com",
        "protonmail.com",
        "proton.me",
        "gmx.com",
        "gmx.net",
        "zoho.com",
        "mail.com",
        "yandex.com",
        "fastmail.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_role_prefixes() -> Vec<String> {
    [
        "noreply",
        "no-reply",
        "donotreply",
        "do-not-reply",
        "admin",
        "administrator",
        "postmaster",
        "mailer-daemon",
        "bounce",
        "bounces",
        "notifications",
        "notification",
        "alerts",
        "webmaster",
        "hostmaster",
        "abuse",
        "root",
        "system",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub async fn load_config(
    path: &str,
) -> std::result::Result<Config, Box<dyn std::error::Error + Send + Sync>> {
    let content = tokio::fs::read_to_string(path).await?;
    let config: Config = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_policy() {
        let config = Config::default();
        assert_eq!(config.ingestion.max_file_bytes, 10 * 1024 * 1024);
        assert_eq!(config.ingestion.max_rows, 10_000);
        assert_eq!(config.snowball.max_depth, 3);
        assert_eq!(config.snowball.auto_add_threshold, 5);
        assert_eq!(config.governor.hard_bounce_threshold, 3);
        assert_eq!(config.governor.complaint_threshold, 2);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.snowball.cooldown_hours, config.snowball.cooldown_hours);
        assert_eq!(
            back.classifier.disposable_domains,
            config.classifier.disposable_domains
        );
    }
}
