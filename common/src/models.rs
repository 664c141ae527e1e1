// Domain models for watches, execution results and failure records

use crate::errors::ValidationError;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

/// Number of digits in an official docket number
pub const DOCKET_NUMBER_LEN: usize = 23;

// ============================================================================
// Frequency tiers
// ============================================================================

/// FrequencyTier decides how often a watch is refreshed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyTier {
    Daily,
    Weekly,
    Monthly,
}

impl FrequencyTier {
    pub const ALL: [FrequencyTier; 3] = [
        FrequencyTier::Daily,
        FrequencyTier::Weekly,
        FrequencyTier::Monthly,
    ];

    /// Time that must pass between two refreshes of a watch in this tier
    pub fn interval(&self) -> Duration {
        match self {
            FrequencyTier::Daily => Duration::hours(24),
            FrequencyTier::Weekly => Duration::days(7),
            FrequencyTier::Monthly => Duration::days(30),
        }
    }

    /// Watches last executed at or before this instant are due
    pub fn due_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.interval()
    }

    /// Check whether a watch with the given last execution is due at `now`
    pub fn is_due(&self, last_execution: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_execution {
            None => true,
            Some(last) => last <= self.due_cutoff(now),
        }
    }
}

impl std::fmt::Display for FrequencyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrequencyTier::Daily => write!(f, "daily"),
            FrequencyTier::Weekly => write!(f, "weekly"),
            FrequencyTier::Monthly => write!(f, "monthly"),
        }
    }
}

impl FromStr for FrequencyTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(FrequencyTier::Daily),
            "weekly" => Ok(FrequencyTier::Weekly),
            "monthly" => Ok(FrequencyTier::Monthly),
            _ => Err(format!("Invalid frequency tier: {}", s)),
        }
    }
}

impl TryFrom<String> for FrequencyTier {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

// ============================================================================
// Watch Models
// ============================================================================

/// SearchMode selects which criterion a watch searches by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    ByDocket,
    ByPartyName,
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchMode::ByDocket => write!(f, "by_docket"),
            SearchMode::ByPartyName => write!(f, "by_party_name"),
        }
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "by_docket" => Ok(SearchMode::ByDocket),
            "by_party_name" => Ok(SearchMode::ByPartyName),
            _ => Err(format!("Invalid search mode: {}", s)),
        }
    }
}

impl TryFrom<String> for SearchMode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Watch is a standing subscription to a judicial case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Watch {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub alias: Option<String>,
    #[sqlx(try_from = "String")]
    pub search_mode: SearchMode,
    pub docket_number: Option<String>,
    pub party_name: Option<String>,
    #[sqlx(try_from = "String")]
    pub tier: FrequencyTier,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
}

impl Watch {
    /// Create an active watch that searches by docket number
    pub fn by_docket(owner_id: Uuid, docket_number: impl Into<String>, tier: FrequencyTier) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            alias: None,
            search_mode: SearchMode::ByDocket,
            docket_number: Some(docket_number.into()),
            party_name: None,
            tier,
            active: true,
            created_at: Utc::now(),
            last_execution: None,
        }
    }

    /// Create an active watch that searches by party name
    pub fn by_party_name(owner_id: Uuid, party_name: impl Into<String>, tier: FrequencyTier) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            alias: None,
            search_mode: SearchMode::ByPartyName,
            docket_number: None,
            party_name: Some(party_name.into()),
            tier,
            active: true,
            created_at: Utc::now(),
            last_execution: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Check whether this watch should be picked up by its tier's heartbeat
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.tier.is_due(self.last_execution, now)
    }

    /// Build the search criterion handed to the document source
    pub fn criterion(&self) -> Result<SearchCriterion, ValidationError> {
        match self.search_mode {
            SearchMode::ByDocket => {
                let raw = self
                    .docket_number
                    .as_deref()
                    .ok_or_else(|| ValidationError::MissingField("docket_number".to_string()))?;
                SearchCriterion::docket(raw)
            }
            SearchMode::ByPartyName => {
                let raw = self
                    .party_name
                    .as_deref()
                    .ok_or_else(|| ValidationError::MissingField("party_name".to_string()))?;
                SearchCriterion::party_name(raw)
            }
        }
    }
}

/// SearchCriterion is what the document source is asked to look up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchCriterion {
    Docket { number: String },
    PartyName { name: String },
}

impl SearchCriterion {
    /// Normalize a docket number; separators are dropped and exactly 23 digits must remain
    pub fn docket(raw: &str) -> Result<Self, ValidationError> {
        if raw.chars().any(|c| !(c.is_ascii_digit() || c == '-' || c == ' ' || c == '.')) {
            return Err(ValidationError::InvalidFieldValue {
                field: "docket_number".to_string(),
                reason: "only digits and separators are allowed".to_string(),
            });
        }

        let number: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if number.len() != DOCKET_NUMBER_LEN {
            return Err(ValidationError::InvalidFieldValue {
                field: "docket_number".to_string(),
                reason: format!(
                    "expected {} digits, got {}",
                    DOCKET_NUMBER_LEN,
                    number.len()
                ),
            });
        }

        Ok(SearchCriterion::Docket { number })
    }

    /// Normalize a party name by collapsing whitespace
    pub fn party_name(raw: &str) -> Result<Self, ValidationError> {
        let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "party_name".to_string(),
                reason: "must not be blank".to_string(),
            });
        }

        Ok(SearchCriterion::PartyName { name })
    }

    pub fn mode(&self) -> SearchMode {
        match self {
            SearchCriterion::Docket { .. } => SearchMode::ByDocket,
            SearchCriterion::PartyName { .. } => SearchMode::ByPartyName,
        }
    }
}

// ============================================================================
// Execution Result Models
// ============================================================================

/// CaseFields holds the data extracted for a case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFields {
    /// Full case identifier as published by the court
    pub case_number: String,
    /// Court or chamber handling the case
    pub court: String,
    /// Date of the last procedural action
    pub last_action_date: Option<NaiveDate>,
    pub status: Option<String>,
}

/// ExtractionOutcome classifies a stored execution result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Success,
    NoChange,
    NotFound,
    Failed,
}

impl std::fmt::Display for ExtractionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionOutcome::Success => write!(f, "success"),
            ExtractionOutcome::NoChange => write!(f, "no_change"),
            ExtractionOutcome::NotFound => write!(f, "not_found"),
            ExtractionOutcome::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ExtractionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExtractionOutcome::Success),
            "no_change" => Ok(ExtractionOutcome::NoChange),
            "not_found" => Ok(ExtractionOutcome::NotFound),
            "failed" => Ok(ExtractionOutcome::Failed),
            _ => Err(format!("Invalid extraction outcome: {}", s)),
        }
    }
}

/// ExecutionResult is one append-only entry in a watch's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub watch_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub fields: Option<CaseFields>,
    pub outcome: ExtractionOutcome,
}

impl ExecutionResult {
    pub fn new(
        watch_id: Uuid,
        executed_at: DateTime<Utc>,
        fields: Option<CaseFields>,
        outcome: ExtractionOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            watch_id,
            executed_at,
            fields,
            outcome,
        }
    }

    /// Result recorded when a refresh exhausted its retries
    pub fn failed(watch_id: Uuid, executed_at: DateTime<Utc>) -> Self {
        Self::new(watch_id, executed_at, None, ExtractionOutcome::Failed)
    }
}

/// FailureRecord is the operator-facing trace of a terminal refresh failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub watch_id: Uuid,
    pub lease_token: Uuid,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(watch_id: Uuid, lease_token: Uuid, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            watch_id,
            lease_token,
            attempts,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}
