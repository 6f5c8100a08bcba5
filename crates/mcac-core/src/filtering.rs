//! Allow/deny rules for metric and event names.
//!
//! A [`FilteringRule`] pairs a [`Policy`] with a case-insensitive regular expression and a
//! [`Scope`]. [`apply_filters`] picks the rule that governs a name according to the
//! following precedence:
//!
//! - an empty rule list allows everything globally;
//! - a matching deny rule always outranks a matching allow rule;
//! - among rules of the same policy a later match replaces an earlier one, except that a
//!   restricted match never replaces a global one;
//! - when nothing matches, a list made only of deny rules allows globally while any other
//!   list filters globally.

use std::fmt;

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("policy must be 'allow' or 'deny', found '{0}'")]
    InvalidPolicy(String),
    #[error("scope must be 'global' or 'datalog', found '{0}'")]
    InvalidScope(String),
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Policy {
    Allow,
    Deny,
}

/// Where an allowed name may be delivered.
///
/// `Global` names go everywhere; `Restricted` names only reach the insight-filtered path
/// (the daemon's local data log). Configuration spells the latter `datalog`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Scope {
    #[strum(serialize = "global")]
    Global,
    #[strum(serialize = "datalog")]
    Restricted,
}

/// Routing destination derived from the rule governing a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    /// Sent on every tick, to both the sample and the insight outputs.
    Unrestricted,
    /// Sent only on the insight-filtered path.
    Restricted,
    /// Never sent.
    Denied,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "RawFilteringRule", into = "RawFilteringRule")]
pub struct FilteringRule {
    policy: Policy,
    pattern: String,
    scope: Scope,
    regex: Regex,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilteringRule {
    policy: String,
    pattern: String,
    scope: String,
}

impl TryFrom<RawFilteringRule> for FilteringRule {
    type Error = FilterError;

    fn try_from(raw: RawFilteringRule) -> Result<Self, Self::Error> {
        FilteringRule::parse(&raw.policy, &raw.pattern, &raw.scope)
    }
}

impl From<FilteringRule> for RawFilteringRule {
    fn from(rule: FilteringRule) -> Self {
        RawFilteringRule {
            policy: rule.policy.to_string(),
            pattern: rule.pattern,
            scope: rule.scope.to_string(),
        }
    }
}

lazy_static! {
    static ref ALLOWED_GLOBALLY: FilteringRule =
        FilteringRule::match_all(Policy::Allow, Scope::Global);
    static ref FILTERED_GLOBALLY: FilteringRule =
        FilteringRule::match_all(Policy::Deny, Scope::Global);
    static ref ALLOWED_INSIGHTS: FilteringRule =
        FilteringRule::match_all(Policy::Allow, Scope::Restricted);
    static ref FILTERED_INSIGHTS: FilteringRule =
        FilteringRule::match_all(Policy::Deny, Scope::Restricted);
}

impl FilteringRule {
    pub fn new(policy: Policy, pattern: &str, scope: Scope) -> Result<Self, FilterError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|err| FilterError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            policy,
            pattern: pattern.to_string(),
            scope,
            regex,
        })
    }

    /// Builds a rule from its textual configuration form. Policy and scope are
    /// case-insensitive.
    pub fn parse(policy: &str, pattern: &str, scope: &str) -> Result<Self, FilterError> {
        let policy = policy
            .parse::<Policy>()
            .map_err(|_| FilterError::InvalidPolicy(policy.to_string()))?;
        let scope = scope
            .parse::<Scope>()
            .map_err(|_| FilterError::InvalidScope(scope.to_string()))?;
        Self::new(policy, pattern, scope)
    }

    fn match_all(policy: Policy, scope: Scope) -> Self {
        Self::new(policy, ".*", scope).expect("match-all pattern compiles")
    }

    pub fn allowed_globally() -> &'static FilteringRule {
        &ALLOWED_GLOBALLY
    }

    pub fn filtered_globally() -> &'static FilteringRule {
        &FILTERED_GLOBALLY
    }

    pub fn allowed_insights() -> &'static FilteringRule {
        &ALLOWED_INSIGHTS
    }

    pub fn filtered_insights() -> &'static FilteringRule {
        &FILTERED_INSIGHTS
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_allow_rule(&self) -> bool {
        self.policy == Policy::Allow
    }

    pub fn is_global(&self) -> bool {
        self.scope == Scope::Global
    }

    /// True when the pattern occurs anywhere in `name`.
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// An allow rule allows the names it matches. A deny rule does not object to the
    /// names it does not match.
    pub fn is_allowed(&self, name: &str) -> bool {
        match self.policy {
            Policy::Allow => self.matches(name),
            Policy::Deny => !self.matches(name),
        }
    }

    pub fn channel(&self) -> Channel {
        match (self.policy, self.scope) {
            (Policy::Allow, Scope::Global) => Channel::Unrestricted,
            (Policy::Deny, Scope::Global) => Channel::Denied,
            (_, Scope::Restricted) => Channel::Restricted,
        }
    }
}

impl PartialEq for FilteringRule {
    fn eq(&self, other: &Self) -> bool {
        self.policy == other.policy && self.pattern == other.pattern && self.scope == other.scope
    }
}

impl Eq for FilteringRule {}

impl fmt::Debug for FilteringRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteringRule")
            .field("policy", &self.policy)
            .field("pattern", &self.pattern)
            .field("scope", &self.scope)
            .finish()
    }
}

impl fmt::Display for FilteringRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' ({})", self.policy, self.pattern, self.scope)
    }
}

/// The rule chosen for one name and its position in the configured list.
///
/// Canonical defaults that do not come from the list carry no index and therefore rank
/// below every configured rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEvaluation {
    pub rule: FilteringRule,
    pub index: Option<usize>,
}

impl RuleEvaluation {
    fn configured(rules: &[FilteringRule], index: usize) -> Self {
        Self {
            rule: rules[index].clone(),
            index: Some(index),
        }
    }

    fn canonical(rule: &'static FilteringRule) -> Self {
        Self {
            rule: rule.clone(),
            index: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.rule.is_allow_rule()
    }

    pub fn channel(&self) -> Channel {
        self.rule.channel()
    }
}

/// Selects the rule governing `name`.
pub fn apply_filters(name: &str, rules: &[FilteringRule]) -> RuleEvaluation {
    if rules.is_empty() {
        return RuleEvaluation::canonical(FilteringRule::allowed_globally());
    }

    let mut best_allow: Option<usize> = None;
    let mut best_deny: Option<usize> = None;

    for (index, rule) in rules.iter().enumerate() {
        let (fired, best) = match rule.policy {
            Policy::Allow => (rule.is_allowed(name), &mut best_allow),
            Policy::Deny => (!rule.is_allowed(name), &mut best_deny),
        };
        if !fired {
            continue;
        }
        let keep_previous = matches!(*best, Some(previous) if rules[previous].is_global() && !rule.is_global());
        if !keep_previous {
            *best = Some(index);
        }
    }

    if let Some(index) = best_deny {
        log::trace!("Applying rule {} for name {name}", rules[index]);
        return RuleEvaluation::configured(rules, index);
    }
    if let Some(index) = best_allow {
        log::trace!("Applying rule {} for name {name}", rules[index]);
        return RuleEvaluation::configured(rules, index);
    }

    let only_deny_rules = rules.iter().all(|rule| rule.policy == Policy::Deny);
    if only_deny_rules {
        RuleEvaluation::canonical(FilteringRule::allowed_globally())
    } else {
        RuleEvaluation::canonical(FilteringRule::filtered_globally())
    }
}
