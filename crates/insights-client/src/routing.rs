use mcac_core::filtering::{Channel, FilteringRule, RuleEvaluation, apply_filters};

use crate::clean::clean;

/// Combines the evaluations of the raw and the cleaned form of one name.
///
/// The rule configured last wins; on equal positions a denial beats an allowance, then a
/// global rule beats a restricted one.
pub fn reconcile(raw: RuleEvaluation, cleaned: RuleEvaluation) -> RuleEvaluation {
    if raw.index != cleaned.index {
        return if raw.index > cleaned.index { raw } else { cleaned };
    }
    if raw.is_allowed() != cleaned.is_allowed() {
        return if raw.is_allowed() { cleaned } else { raw };
    }
    if raw.rule.is_global() != cleaned.rule.is_global() {
        return if raw.rule.is_global() { raw } else { cleaned };
    }
    raw
}

/// Rule governing `name`, considering both its raw and its cleaned form.
pub fn evaluate(name: &str, rules: &[FilteringRule]) -> RuleEvaluation {
    let raw = apply_filters(name, rules);
    let cleaned = apply_filters(&clean(name), rules);
    let applied = reconcile(raw, cleaned);
    log::debug!("Using filtering rule {} for name '{name}'", applied.rule);
    applied
}

pub fn route(name: &str, rules: &[FilteringRule]) -> Channel {
    evaluate(name, rules).channel()
}

#[cfg(test)]
mod tests {
    use mcac_core::filtering::{Policy, Scope};

    use super::*;

    fn rule(policy: Policy, pattern: &str) -> FilteringRule {
        FilteringRule::new(policy, pattern, Scope::Global).unwrap()
    }

    const METRIC1: &str = "org.apache.cassandra.metrics.ClientRequest.Latency.metric1";
    const METRIC2: &str = "org.apache.cassandra.metrics.ClientRequest.Latency.metric2";
    const METRIC3: &str = "org.apache.cassandra.metrics.Whatever.metric3";

    #[test]
    fn later_rule_wins_across_raw_and_cleaned_names() {
        let rules = vec![
            rule(Policy::Deny, "org.apache.cassandra.metrics.ClientRequest"),
            rule(Policy::Allow, "client_request.latency.metric1"),
        ];
        assert!(evaluate(METRIC1, &rules).is_allowed());
        assert_eq!(route(METRIC1, &rules), Channel::Unrestricted);

        let reversed: Vec<_> = rules.into_iter().rev().collect();
        assert!(!evaluate(METRIC1, &reversed).is_allowed());
        assert_eq!(route(METRIC1, &reversed), Channel::Denied);
    }

    #[test]
    fn mixed_rules() {
        let rules = vec![
            rule(Policy::Allow, "whatever.metric3"),
            rule(Policy::Allow, "client_request.latency.metric1"),
            rule(Policy::Deny, "org.apache.cassandra.metrics.ClientRequest"),
            rule(Policy::Allow, "client_request.latency.metric2"),
        ];
        assert!(!evaluate(METRIC1, &rules).is_allowed());
        assert!(evaluate(METRIC2, &rules).is_allowed());
        assert!(evaluate(METRIC3, &rules).is_allowed());
    }

    #[test]
    fn equal_positions_prefer_denial_then_global() {
        let allow = RuleEvaluation {
            rule: FilteringRule::allowed_globally().clone(),
            index: None,
        };
        let deny = RuleEvaluation {
            rule: FilteringRule::filtered_globally().clone(),
            index: None,
        };
        assert_eq!(reconcile(allow.clone(), deny.clone()), deny);
        assert_eq!(reconcile(deny.clone(), allow.clone()), deny);

        let restricted = RuleEvaluation {
            rule: FilteringRule::allowed_insights().clone(),
            index: None,
        };
        assert_eq!(reconcile(restricted.clone(), allow.clone()), allow);
        assert_eq!(reconcile(allow.clone(), restricted), allow);
    }

    #[test]
    fn configured_rule_outranks_default() {
        let rules = vec![FilteringRule::new(Policy::Allow, "latency", Scope::Restricted).unwrap()];
        assert_eq!(route(METRIC1, &rules), Channel::Restricted);
        assert_eq!(route("org.apache.cassandra.metrics.Table.Reads", &rules), Channel::Denied);
    }
}
