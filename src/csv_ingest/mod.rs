use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::classifier::EmailClassifier;
use crate::config::IngestionConfig;

pub mod import_job;
pub mod row;

use row::{decode_bytes, detect_delimiter, parse_subscribed, parse_tags, split_line, RawRow};

/// Fatal problems that abort the whole import before any row is admitted.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralError {
    FileTooLarge { size: usize, limit: usize },
    TooManyRows { rows: usize, limit: usize },
    MissingEmailHeader,
    DuplicateHeader(String),
    EmptyFile,
    NoValidEmails,
}

impl std::fmt::Display for StructuralError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralError::FileTooLarge { size, limit } => {
                write!(f, "file is {} bytes, limit is {}", size, limit)
            }
            StructuralError::TooManyRows { rows, limit } => {
                write!(f, "file has {} data rows, limit is {}", rows, limit)
            }
            StructuralError::MissingEmailHeader => {
                write!(f, "header row must contain an 'email' column")
            }
            StructuralError::DuplicateHeader(name) => {
                write!(f, "duplicate header column '{}'", name)
            }
            StructuralError::EmptyFile => write!(f, "file contains no header row"),
            StructuralError::NoValidEmails => {
                write!(f, "no valid email addresses remain after validation")
            }
        }
    }
}

/// One row that survived validation and is ready for admission.
#[derive(Debug, Clone)]
pub struct ValidRecord {
    pub row_number: usize,
    pub email: String,
    pub domain: String,
    pub trust_score: f64,
    pub name: Option<String>,
    pub organization: Option<String>,
    pub tags: Vec<String>,
    pub subscribed: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CsvMetadata {
    pub total_rows: usize,
    pub valid_emails: usize,
    pub invalid_emails: usize,
    pub duplicate_emails: usize,
    pub headers: Vec<String>,
    pub encoding: String,
    pub delimiter: char,
}

#[derive(Debug)]
pub struct CsvValidationResult {
    pub is_valid: bool,
    pub errors: Vec<StructuralError>,
    pub warnings: Vec<String>,
    pub records: Vec<ValidRecord>,
    pub metadata: CsvMetadata,
}

const KNOWN_COLUMNS: [&str; 5] = ["email", "name", "organization", "tags", "subscribed"];

pub struct CsvValidator {
    max_file_bytes: usize,
    max_rows: usize,
    max_tags_per_row: usize,
    max_tag_length: usize,
    classifier: EmailClassifier,
}

impl CsvValidator {
    pub fn new(config: &IngestionConfig, classifier: EmailClassifier) -> Self {
        Self {
            max_file_bytes: config.max_file_bytes,
            max_rows: config.max_rows,
            max_tags_per_row: config.max_tags_per_row,
            max_tag_length: config.max_tag_length,
            classifier,
        }
    }

    pub fn classifier(&self) -> &EmailClassifier {
        &self.classifier
    }

    /// Single pass over the file: structural checks first, then per-row
    /// normalization, classification, and in-file dedup. Row problems
    /// become warnings; only structural problems fail the whole file.
    pub fn validate(&self, bytes: &[u8], declared_size: usize) -> CsvValidationResult {
        let mut warnings = Vec::new();

        let actual = bytes.len().max(declared_size);
        if actual > self.max_file_bytes {
            return self.structural_failure(
                StructuralError::FileTooLarge {
                    size: actual,
                    limit: self.max_file_bytes,
                },
                "unknown",
            );
        }

        let (text, encoding) = decode_bytes(bytes);
        let lines: Vec<&str> = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect();

        let Some(header_line) = lines.first() else {
            return self.structural_failure(StructuralError::EmptyFile, encoding);
        };

        let delimiter = detect_delimiter(header_line);
        let headers: Vec<String> = split_line(header_line, delimiter)
            .into_iter()
            .map(|h| h.to_lowercase())
            .collect();

        let mut column_index: HashMap<String, usize> = HashMap::new();
        for (idx, header) in headers.iter().enumerate() {
            if column_index.insert(header.clone(), idx).is_some() {
                return self.structural_failure_with(
                    StructuralError::DuplicateHeader(header.clone()),
                    headers.clone(),
                    encoding,
                    delimiter,
                );
            }
            if !KNOWN_COLUMNS.contains(&header.as_str()) {
                warnings.push(format!("unknown column '{}' will be ignored", header));
            }
        }

        if !column_index.contains_key("email") {
            return self.structural_failure_with(
                StructuralError::MissingEmailHeader,
                headers,
                encoding,
                delimiter,
            );
        }

        let data_rows = lines.len() - 1;
        if data_rows > self.max_rows {
            return self.structural_failure_with(
                StructuralError::TooManyRows {
                    rows: data_rows,
                    limit: self.max_rows,
                },
                headers,
                encoding,
                delimiter,
            );
        }

        let mut records = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut invalid_emails = 0usize;
        let mut duplicate_emails = 0usize;

        for (offset, line) in lines[1..].iter().enumerate() {
            let row_number = offset + 2; // 1-based, counting the header
            let fields = split_line(line, delimiter);
            let raw = self.raw_row(&fields, &column_index);

            let verdict = self.classifier.classify(&raw.email);
            if !verdict.is_valid {
                invalid_emails += 1;
                let reason = verdict
                    .rejection_reason
                    .unwrap_or_else(|| "invalid".to_string());
                warnings.push(format!(
                    "row {}: invalid email '{}' ({})",
                    row_number,
                    raw.email.trim(),
                    reason
                ));
                continue;
            }

            if !seen.insert(verdict.normalized.clone()) {
                duplicate_emails += 1;
                warnings.push(format!(
                    "row {}: duplicate email '{}'",
                    row_number, verdict.normalized
                ));
                continue;
            }

            let subscribed = match raw.subscribed.as_deref() {
                None | Some("") => true,
                Some(value) => match parse_subscribed(value) {
                    Some(flag) => flag,
                    None => {
                        warnings.push(format!(
                            "row {}: unparseable subscribed value '{}', defaulting to true",
                            row_number, value
                        ));
                        true
                    }
                },
            };

            let tags = raw
                .tags
                .as_deref()
                .map(|t| parse_tags(t, self.max_tags_per_row, self.max_tag_length))
                .unwrap_or_default();

            records.push(ValidRecord {
                row_number,
                email: verdict.normalized,
                domain: verdict.domain,
                trust_score: verdict.trust_score,
                name: raw.name,
                organization: raw.organization,
                tags,
                subscribed,
            });
        }

        let metadata = CsvMetadata {
            total_rows: data_rows,
            valid_emails: records.len(),
            invalid_emails,
            duplicate_emails,
            headers,
            encoding: encoding.to_string(),
            delimiter,
        };

        debug!(
            "CSV validated: {} rows, {} valid, {} invalid, {} duplicate ({})",
            metadata.total_rows,
            metadata.valid_emails,
            metadata.invalid_emails,
            metadata.duplicate_emails,
            metadata.encoding
        );

        if records.is_empty() {
            return CsvValidationResult {
                is_valid: false,
                errors: vec![StructuralError::NoValidEmails],
                warnings,
                records,
                metadata,
            };
        }

        CsvValidationResult {
            is_valid: true,
            errors: Vec::new(),
            warnings,
            records,
            metadata,
        }
    }

    fn raw_row(&self, fields: &[String], column_index: &HashMap<String, usize>) -> RawRow {
        let cell = |name: &str| -> Option<String> {
            column_index
                .get(name)
                .and_then(|&idx| fields.get(idx))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        RawRow {
            email: cell("email").unwrap_or_default(),
            name: cell("name"),
            organization: cell("organization"),
            tags: cell("tags"),
            subscribed: cell("subscribed"),
        }
    }

    fn structural_failure(&self, error: StructuralError, encoding: &str) -> CsvValidationResult {
        self.structural_failure_with(error, Vec::new(), encoding, ',')
    }

    fn structural_failure_with(
        &self,
        error: StructuralError,
        headers: Vec<String>,
        encoding: &str,
        delimiter: char,
    ) -> CsvValidationResult {
        CsvValidationResult {
            is_valid: false,
            errors: vec![error],
            warnings: Vec::new(),
            records: Vec::new(),
            metadata: CsvMetadata {
                total_rows: 0,
                valid_emails: 0,
                invalid_emails: 0,
                duplicate_emails: 0,
                headers,
                encoding: encoding.to_string(),
                delimiter,
            },
        }
    }
}
