//! Role classification
//!
//! Maps a role record to a governance [`Verdict`] by walking an ordered rule
//! table; the first matching rule wins and a role matching none is kept.
//! Classification is pure: the same record, configuration and evaluation date
//! always produce the same verdict.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Action, Category, ClassifiedRecord, RoleRecord, Verdict};

/// Roles whose name lacks this prefix are flagged for review
pub const DEFAULT_REQUIRED_PREFIX: &str = "2FA-otp-trigger-workflow-";

pub const DEFAULT_ABANDONED_AFTER_DAYS: i64 = 90;

pub const DEFAULT_STALE_AFTER_DAYS: i64 = 180;

/// How a role with no last-used timestamp is treated by the abandonment rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AbsentLastUsed {
    /// Never used means abandoned
    #[default]
    Abandoned,
    /// Read the rule literally: an absent timestamp has no age, so the
    /// abandonment rule never fires and later rules decide
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub required_prefix: String,
    pub abandoned_after_days: i64,
    pub stale_after_days: i64,
    pub absent_last_used: AbsentLastUsed,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            required_prefix: DEFAULT_REQUIRED_PREFIX.to_string(),
            abandoned_after_days: DEFAULT_ABANDONED_AFTER_DAYS,
            stale_after_days: DEFAULT_STALE_AFTER_DAYS,
            absent_last_used: AbsentLastUsed::default(),
        }
    }
}

/// Inputs a rule looks at
#[derive(Debug, Clone, Copy)]
pub struct Facts<'a> {
    pub name: &'a str,
    pub last_used_known: bool,
    pub days_since_last_used: Option<i64>,
    pub has_attached_policies: bool,
}

/// One entry in the rule table
pub struct Rule {
    pub name: &'static str,
    pub verdict: Verdict,
    pub matches: fn(&Facts<'_>, &ClassifierConfig) -> bool,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("verdict", &self.verdict)
            .finish()
    }
}

/// Verdict for a role no rule matched
pub const FALLBACK: Verdict = Verdict::new(Action::Keep, Category::None);

/// Ordered rule table, first match wins
pub const RULES: &[Rule] = &[
    Rule {
        name: "abandoned",
        verdict: Verdict::new(Action::Remove, Category::AbandonedRoles),
        matches: is_abandoned,
    },
    Rule {
        name: "stale",
        verdict: Verdict::new(Action::Remove, Category::StaleRoles),
        matches: is_stale,
    },
    Rule {
        name: "cleanup",
        verdict: Verdict::new(Action::Review, Category::CleanupCandidates),
        matches: needs_cleanup,
    },
];

fn is_abandoned(facts: &Facts<'_>, config: &ClassifierConfig) -> bool {
    if facts.last_used_known {
        return false;
    }
    match config.absent_last_used {
        AbsentLastUsed::Abandoned => true,
        // No timestamp means no day count, and no day count exceeds anything
        AbsentLastUsed::Unreachable => facts
            .days_since_last_used
            .is_some_and(|days| days > config.abandoned_after_days),
    }
}

fn is_stale(facts: &Facts<'_>, config: &ClassifierConfig) -> bool {
    facts
        .days_since_last_used
        .is_some_and(|days| days > config.stale_after_days)
}

fn needs_cleanup(facts: &Facts<'_>, config: &ClassifierConfig) -> bool {
    !facts.name.starts_with(&config.required_prefix) || !facts.has_attached_policies
}

/// Whole days from the timestamp's UTC date to `today`
pub fn days_between(ts: Option<&DateTime<Utc>>, today: NaiveDate) -> Option<i64> {
    ts.map(|t| (today - t.date_naive()).num_days())
}

/// Rule evaluator pinned to one configuration and evaluation date
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    today: NaiveDate,
}

impl Classifier {
    pub fn new(config: ClassifierConfig, today: NaiveDate) -> Self {
        Self { config, today }
    }

    /// Evaluate as of the current UTC date
    pub fn today(config: ClassifierConfig) -> Self {
        Self::new(config, Utc::now().date_naive())
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn evaluation_date(&self) -> NaiveDate {
        self.today
    }

    /// The first matching rule, `None` when the fallback applies
    pub fn matching_rule(&self, role: &RoleRecord) -> Option<&'static Rule> {
        let facts = Facts {
            name: &role.name,
            last_used_known: role.last_used.is_some(),
            days_since_last_used: days_between(role.last_used.as_ref(), self.today),
            has_attached_policies: !role.attached_policies.is_empty(),
        };
        RULES.iter().find(|rule| (rule.matches)(&facts, &self.config))
    }

    pub fn verdict(&self, role: &RoleRecord) -> Verdict {
        self.matching_rule(role).map(|rule| rule.verdict).unwrap_or(FALLBACK)
    }

    pub fn classify(&self, role: &RoleRecord) -> ClassifiedRecord {
        let verdict = self.verdict(role);
        ClassifiedRecord {
            role_name: role.name.clone(),
            created_at: role.created_at,
            last_used: role.last_used,
            days_since_last_used: days_between(role.last_used.as_ref(), self.today),
            days_since_creation: days_between(role.created_at.as_ref(), self.today),
            attached_policies: role.attached_policies.clone(),
            action: verdict.action,
            category: verdict.category,
        }
    }

    pub fn classify_all(&self, roles: &[RoleRecord]) -> Vec<ClassifiedRecord> {
        roles.iter().map(|role| self.classify(role)).collect()
    }
}
