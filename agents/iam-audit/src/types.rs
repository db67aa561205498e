//! IAM Inventory Types
//!
//! Core types for policies, roles, their attachments and the rows the
//! collector and classifier produce.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InventoryError;

/// Which policies to enumerate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    /// Customer-managed policies
    #[default]
    Local,
    /// AWS-managed policies
    Aws,
    All,
}

impl PolicyScope {
    /// Value of the `Scope` parameter in the IAM Query API
    pub fn as_query_value(&self) -> &'static str {
        match self {
            PolicyScope::Local => "Local",
            PolicyScope::Aws => "AWS",
            PolicyScope::All => "All",
        }
    }
}

impl std::fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyScope::Local => write!(f, "local"),
            PolicyScope::Aws => write!(f, "aws"),
            PolicyScope::All => write!(f, "all"),
        }
    }
}

/// A managed policy as returned by the policy listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub name: String,
    pub arn: String,
}

/// A role attached to a policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    pub name: String,
}

/// A role as returned by the role listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSummary {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A managed policy attached to a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedPolicy {
    pub name: String,
    pub arn: String,
}

/// One page of a paginated listing
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Marker for the next page, `None` on the last page
    pub next_marker: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_marker: None,
        }
    }
}

/// An exhausted listing, possibly cut short by a failing page
#[derive(Debug)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub pages: usize,
    /// Set when a page failed; `items` holds everything read before it
    pub error: Option<InventoryError>,
}

impl<T> Listing<T> {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// A policy joined with at most one attached role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRow {
    pub policy_name: String,
    pub policy_arn: String,
    pub policy_last_used: Option<DateTime<Utc>>,
    /// Empty when the policy has no attached roles
    pub attached_role_name: String,
    pub role_last_used: Option<DateTime<Utc>>,
}

impl EnrichedRow {
    /// Row for a policy with no attached roles
    pub fn unattached(policy: &PolicySummary, policy_last_used: Option<DateTime<Utc>>) -> Self {
        Self {
            policy_name: policy.name.clone(),
            policy_arn: policy.arn.clone(),
            policy_last_used,
            attached_role_name: String::new(),
            role_last_used: None,
        }
    }

    pub fn has_role(&self) -> bool {
        !self.attached_role_name.is_empty()
    }
}

/// Role-oriented input to the classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRecord {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub attached_policies: Vec<String>,
}

/// Governance action for a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    Keep,
    Review,
    Remove,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Keep => write!(f, "Keep"),
            Action::Review => write!(f, "Review"),
            Action::Remove => write!(f, "Remove"),
        }
    }
}

/// Why a role got its action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    AbandonedRoles,
    StaleRoles,
    CleanupCandidates,
    None,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::AbandonedRoles => write!(f, "Abandoned Roles"),
            Category::StaleRoles => write!(f, "Stale Roles"),
            Category::CleanupCandidates => write!(f, "Cleanup Candidates"),
            Category::None => write!(f, "None"),
        }
    }
}

/// Action and category produced by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Verdict {
    pub action: Action,
    pub category: Category,
}

impl Verdict {
    pub const fn new(action: Action, category: Category) -> Self {
        Self { action, category }
    }
}

/// A role with derived staleness figures and its verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedRecord {
    pub role_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub days_since_last_used: Option<i64>,
    pub days_since_creation: Option<i64>,
    pub attached_policies: Vec<String>,
    pub action: Action,
    pub category: Category,
}

/// Parse an IAM or inventory-file timestamp
///
/// Accepts RFC 3339 (`2024-01-05T10:00:00Z`), the spreadsheet export format
/// `2024-01-05 10:00:00+00:00`, and a bare `2024-01-05 10:00:00` read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Render a timestamp for CSV output, empty when absent
pub fn format_timestamp(ts: Option<&DateTime<Utc>>) -> String {
    ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}
