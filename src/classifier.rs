use regex::Regex;
use std::collections::HashSet;

use crate::config::ClassifierConfig;

/// Trim and lowercase. All membership comparisons happen on this form.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Verdict for a single email address. Pure function of the address and
/// the configured domain lists; carries no repository state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmailVerdict {
    pub is_valid: bool,
    pub normalized: String,
    pub domain: String,
    pub is_disposable: bool,
    pub is_corporate: bool,
    pub trust_score: f64,
    pub rejection_reason: Option<String>,
}

impl EmailVerdict {
    fn rejected(normalized: String, domain: String, reason: &str) -> Self {
        Self {
            is_valid: false,
            normalized,
            domain,
            is_disposable: false,
            is_corporate: false,
            trust_score: 0.0,
            rejection_reason: Some(reason.to_string()),
        }
    }
}

pub struct EmailClassifier {
    syntax: Regex,
    disposable_domains: HashSet<String>,
    webmail_domains: HashSet<String>,
    role_prefixes: Vec<String>,
    webmail_trust: f64,
    custom_domain_trust: f64,
}

impl EmailClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            syntax: Regex::new(r"^[a-z0-9!#$%&'*+/=?^_`{}~.-]+@[a-z0-9.-]+\.[a-z]{2,}$").unwrap(),
            disposable_domains: config.disposable_domains.iter().cloned().collect(),
            webmail_domains: config.webmail_domains.iter().cloned().collect(),
            role_prefixes: config.role_prefixes.clone(),
            webmail_trust: config.webmail_trust,
            custom_domain_trust: config.custom_domain_trust,
        }
    }

    pub fn classify(&self, raw: &str) -> EmailVerdict {
        let normalized = normalize_email(raw);
        if normalized.is_empty() {
            return EmailVerdict::rejected(normalized, String::new(), "empty address");
        }

        let (local, domain) = match normalized.split_once('@') {
            Some((l, d)) if !l.is_empty() && !d.is_empty() => (l.to_string(), d.to_string()),
            _ => {
                return EmailVerdict::rejected(normalized, String::new(), "malformed address");
            }
        };

        if normalized.len() > 254 {
            return EmailVerdict::rejected(normalized, domain, "address exceeds 254 characters");
        }
        if local.len() > 64 {
            return EmailVerdict::rejected(normalized, domain, "local part exceeds 64 characters");
        }
        if normalized.contains("..") {
            return EmailVerdict::rejected(normalized, domain, "consecutive dots");
        }
        if !self.syntax.is_match(&normalized) {
            return EmailVerdict::rejected(normalized, domain, "failed syntax check");
        }
        if local.starts_with('.') || local.ends_with('.') || domain.starts_with('.') {
            return EmailVerdict::rejected(normalized, domain, "misplaced dot");
        }
        if self.is_role_address(&local) {
            return EmailVerdict::rejected(normalized, domain, "role or system address");
        }

        if self.disposable_domains.contains(&domain) {
            return EmailVerdict {
                is_valid: false,
                normalized,
                domain,
                is_disposable: true,
                is_corporate: false,
                trust_score: 0.0,
                rejection_reason: Some("disposable domain".to_string()),
            };
        }

        let is_corporate = self.webmail_domains.contains(&domain);
        let trust_score = if is_corporate {
            self.webmail_trust
        } else {
            self.custom_domain_trust
        };

        EmailVerdict {
            is_valid: true,
            normalized,
            domain,
            is_disposable: false,
            is_corporate,
            trust_score,
            rejection_reason: None,
        }
    }

    /// System mailboxes never join a repository, well-formed or not.
    fn is_role_address(&self, local: &str) -> bool {
        self.role_prefixes.iter().any(|prefix| {
            local == prefix
                || local.starts_with(&format!("{}+", prefix))
                || local.starts_with(&format!("{}-", prefix))
                || local.starts_with(&format!("{}.", prefix))
        })
    }
}
