//! Failure classification and the immutable error context.
//!
//! Classification is a pure function of the error message. Categories are
//! checked in a fixed order (network, database, external service, validation,
//! system) so a message matching several keyword sets always lands in the same
//! bucket. Nothing here can fail: unmatched messages are `Unknown` / `Low`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use angelhub_core::{InvestmentId, JobId, StartupId, UserId};

/// Broad failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Database,
    ExternalService,
    Validation,
    System,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Database => "database",
            ErrorCategory::ExternalService => "external_service",
            ErrorCategory::Validation => "validation",
            ErrorCategory::System => "system",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl core::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl core::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "econnrefused",
    "econnreset",
    "enotfound",
    "etimedout",
    "connection refused",
    "connection reset",
    "socket hang up",
    "dns",
];

const DATABASE_KEYWORDS: &[&str] = &[
    "database",
    "prisma",
    "sql",
    "deadlock",
    "unique constraint",
    "foreign key",
    "transaction",
    "connection lost",
    "corruption",
];

const EXTERNAL_SERVICE_KEYWORDS: &[&str] = &[
    "external",
    "third-party",
    "stripe",
    "sendgrid",
    "twilio",
    "docusign",
    "webhook",
    "service unavailable",
    "bad gateway",
    "rate limit",
    "unauthorized",
];

// Matched as whole words so "capital" or "rapid" don't count.
const EXTERNAL_SERVICE_WORDS: &[&str] = &["api"];

const VALIDATION_KEYWORDS: &[&str] = &[
    "validation",
    "invalid",
    "required",
    "must be",
    "malformed",
    "schema",
    "bad request",
];

const SYSTEM_KEYWORDS: &[&str] = &[
    "system",
    "out of memory",
    "heap",
    "disk space",
    "enospc",
    "too many open files",
];

/// Classify a failure message. Matching is case-insensitive.
pub fn classify(message: &str) -> ErrorCategory {
    let message = message.to_lowercase();
    let table: [(&[&str], &[&str], ErrorCategory); 5] = [
        (NETWORK_KEYWORDS, &[], ErrorCategory::Network),
        (DATABASE_KEYWORDS, &[], ErrorCategory::Database),
        (EXTERNAL_SERVICE_KEYWORDS, EXTERNAL_SERVICE_WORDS, ErrorCategory::ExternalService),
        (VALIDATION_KEYWORDS, &[], ErrorCategory::Validation),
        (SYSTEM_KEYWORDS, &[], ErrorCategory::System),
    ];

    table
        .iter()
        .find(|(keywords, words, _)| contains_any(&message, keywords) || contains_word(&message, words))
        .map(|(_, _, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Severity of a failure given its message and category.
pub fn severity(message: &str, category: ErrorCategory) -> ErrorSeverity {
    let message = message.to_lowercase();

    if category == ErrorCategory::System || contains_any(&message, &["out of memory", "disk space"]) {
        ErrorSeverity::Critical
    } else if category == ErrorCategory::Database
        || contains_any(&message, &["connection lost", "corruption"])
    {
        ErrorSeverity::High
    } else if category == ErrorCategory::ExternalService
        || contains_any(&message, &["rate limit", "unauthorized"])
    {
        ErrorSeverity::Medium
    } else {
        ErrorSeverity::Low
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn contains_word(haystack: &str, words: &[&str]) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| words.contains(&token))
}

/// Optional caller-supplied details about a failure.
///
/// The engine turns this into an [`ErrorContext`] once classification is done.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub operation: Option<String>,
    pub user_id: Option<UserId>,
    pub investment_id: Option<InvestmentId>,
    pub startup_id: Option<StartupId>,
    pub metadata: BTreeMap<String, JsonValue>,
}

impl FailureContext {
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_investment(mut self, investment_id: InvestmentId) -> Self {
        self.investment_id = Some(investment_id);
        self
    }

    pub fn with_startup(mut self, startup_id: StartupId) -> Self {
        self.startup_id = Some(startup_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Immutable record of one failed execution attempt.
///
/// Built once per failure by [`ErrorContext::capture`]; there are no mutators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub job_id: JobId,
    pub queue: String,
    pub operation: String,
    pub user_id: Option<UserId>,
    pub investment_id: Option<InvestmentId>,
    pub startup_id: Option<StartupId>,
    pub timestamp: DateTime<Utc>,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub metadata: BTreeMap<String, JsonValue>,
}

impl ErrorContext {
    /// Classify `error` and freeze the context for this failure.
    ///
    /// The operation defaults to the job name when the caller didn't supply one.
    pub fn capture(
        job_id: JobId,
        queue: &str,
        job_name: &str,
        error: &str,
        failure: FailureContext,
        at: DateTime<Utc>,
    ) -> Self {
        let category = classify(error);
        let severity = severity(error, category);

        Self {
            job_id,
            queue: queue.to_string(),
            operation: failure.operation.unwrap_or_else(|| job_name.to_string()),
            user_id: failure.user_id,
            investment_id: failure.investment_id,
            startup_id: failure.startup_id,
            timestamp: at,
            severity,
            category,
            metadata: failure.metadata,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == ErrorSeverity::Critical
    }
}
