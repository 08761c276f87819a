//! Safety validator: the fixed rule chain over a bound plan.
//!
//! Every rule is one entry in an ordered table of the same function shape.
//! Hard rules abort the chain at the first violation; soft rules repair a
//! working copy of the plan and keep going. The only way to obtain a
//! `ValidatedPlan` is to pass the whole chain.

use serde_json::Value;
use tracing::{info, warn};

use hestia_common::{
    Action, AutomationPlan, Domain, ResolveError, RuleId, RuleSeverity, Trigger, ValidatedPlan,
    ValidationVerdict,
};

/// Services that change a security or safety posture. Actions calling one
/// must carry an explicit confirmation.
const DESTRUCTIVE_SERVICES: &[&str] = &[
    "lock.unlock",
    "lock.open",
    "cover.open_cover",
    "camera.turn_off",
];

/// Trigger-domain / action-domain pairs that may not appear in one plan:
/// passive or presence-ish devices must never drive a lock open.
const UNSAFE_PAIRS: &[(Domain, Domain)] = &[
    (Domain::BinarySensor, Domain::Lock),
    (Domain::Sensor, Domain::Lock),
    (Domain::Camera, Domain::Lock),
    (Domain::MediaPlayer, Domain::Lock),
];

/// Keys in action payloads that indicate leaked secrets.
const SENSITIVE_KEYS: &[&str] = &["password", "pin", "token", "api_key", "secret", "access_code"];

/// Floor for repeat-interval triggers.
const MIN_INTERVAL_SECS: u64 = 60;

enum RuleOutcome {
    Pass,
    Fail(String),
    /// Soft repair applied to the working copy: (reason, fix description)
    Fixed(String, String),
}

type RuleFn = fn(&mut AutomationPlan) -> RuleOutcome;

/// The chain, in evaluation order. Severity comes from the rule id itself.
const RULES: &[(RuleId, RuleFn)] = &[
    (RuleId::DestructiveConfirmation, rule_destructive_confirmation),
    (RuleId::EntityDomainMismatch, rule_entity_domain_mismatch),
    (RuleId::RepeatFrequency, rule_repeat_frequency),
    (RuleId::UnsafeDevicePair, rule_unsafe_device_pair),
    (RuleId::PrivacyExposure, rule_privacy_exposure),
    (RuleId::ImpossibleTime, rule_impossible_time),
];

fn rule_destructive_confirmation(plan: &mut AutomationPlan) -> RuleOutcome {
    for action in &plan.actions {
        if DESTRUCTIVE_SERVICES.contains(&action.service.as_str()) && !action.confirmed {
            return RuleOutcome::Fail(format!(
                "destructive service {} on {} requires explicit confirmation",
                action.service, action.entity_id
            ));
        }
    }
    RuleOutcome::Pass
}

fn rule_entity_domain_mismatch(plan: &mut AutomationPlan) -> RuleOutcome {
    for action in &plan.actions {
        let service_domain = action.service_domain();
        let entity_domain = Domain::from_entity_id(&action.entity_id);
        if let (Some(s), Some(e)) = (service_domain, entity_domain) {
            if s != e {
                return RuleOutcome::Fail(format!(
                    "service {} cannot target {}",
                    action.service, action.entity_id
                ));
            }
        }
    }
    RuleOutcome::Pass
}

fn rule_repeat_frequency(plan: &mut AutomationPlan) -> RuleOutcome {
    let mut clamped = vec![];
    for trigger in &mut plan.triggers {
        if let Trigger::Interval { every_seconds } = trigger {
            if *every_seconds < MIN_INTERVAL_SECS {
                clamped.push(*every_seconds);
                *every_seconds = MIN_INTERVAL_SECS;
            }
        }
    }
    if clamped.is_empty() {
        RuleOutcome::Pass
    } else {
        RuleOutcome::Fixed(
            format!("interval trigger below {MIN_INTERVAL_SECS}s floor"),
            format!("clamped {} interval(s) to {MIN_INTERVAL_SECS}s", clamped.len()),
        )
    }
}

fn rule_unsafe_device_pair(plan: &mut AutomationPlan) -> RuleOutcome {
    for trigger in &plan.triggers {
        let Some(trigger_domain) = trigger.entity_id().and_then(Domain::from_entity_id) else {
            continue;
        };
        for action in &plan.actions {
            let Some(action_domain) = Domain::from_entity_id(&action.entity_id) else {
                continue;
            };
            if UNSAFE_PAIRS.contains(&(trigger_domain, action_domain)) {
                return RuleOutcome::Fail(format!(
                    "{} trigger may not drive {} action",
                    trigger_domain.as_str(),
                    action_domain.as_str()
                ));
            }
        }
    }
    RuleOutcome::Pass
}

fn rule_privacy_exposure(plan: &mut AutomationPlan) -> RuleOutcome {
    fn scan(value: &Value) -> Option<String> {
        match value {
            Value::Object(map) => {
                for (key, nested) in map {
                    let lowered = key.to_lowercase();
                    if SENSITIVE_KEYS.iter().any(|k| lowered.contains(k)) {
                        return Some(key.clone());
                    }
                    if let Some(hit) = scan(nested) {
                        return Some(hit);
                    }
                }
                None
            }
            Value::Array(items) => items.iter().find_map(scan),
            _ => None,
        }
    }

    for action in &plan.actions {
        if let Some(key) = scan(&action.data) {
            return RuleOutcome::Fail(format!(
                "action payload for {} exposes sensitive key \"{key}\"",
                action.entity_id
            ));
        }
    }
    RuleOutcome::Pass
}

fn rule_impossible_time(plan: &mut AutomationPlan) -> RuleOutcome {
    let mut fixes = vec![];
    for trigger in &mut plan.triggers {
        let Trigger::Time { at } = trigger else {
            continue;
        };
        if let Some(clamped) = clamp_time(at) {
            if clamped != *at {
                fixes.push(format!("{at} -> {clamped}"));
                *at = clamped;
            }
        } else {
            fixes.push(format!("{at} -> 00:00"));
            *at = "00:00".into();
        }
    }
    if fixes.is_empty() {
        RuleOutcome::Pass
    } else {
        RuleOutcome::Fixed(
            "time trigger outside the valid range".into(),
            fixes.join(", "),
        )
    }
}

/// Clamp "HH:MM" / "HH:MM:SS" components into range. `None` when the text
/// is not a time at all.
fn clamp_time(at: &str) -> Option<String> {
    let parts: Vec<u32> = at
        .split(':')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<Vec<u32>>>()?;
    match parts.as_slice() {
        [h, m] => Some(format!("{:02}:{:02}", h.min(&23), m.min(&59))),
        [h, m, s] => Some(format!("{:02}:{:02}:{:02}", h.min(&23), m.min(&59), s.min(&59))),
        _ => None,
    }
}

/// Run the chain over `plan`.
///
/// Returns the approved plan (with soft fixes applied) or
/// `ValidationHardFail` carrying every verdict up to and including the
/// violation. Validation never mutates the input; approval of an already
/// conformant plan is idempotent.
pub fn validate(plan: &AutomationPlan) -> Result<ValidatedPlan, ResolveError> {
    let mut working = plan.clone();
    let mut verdicts = vec![];

    for (rule, eval) in RULES {
        match eval(&mut working) {
            RuleOutcome::Pass => verdicts.push(ValidationVerdict::pass(*rule)),
            RuleOutcome::Fixed(reason, fix) => {
                debug_assert_eq!(rule.severity(), RuleSeverity::Soft);
                info!(plan_id = %plan.id, rule = %rule, fix = %fix, "soft rule auto-fix applied");
                verdicts.push(ValidationVerdict::fixed(*rule, reason, fix));
            }
            RuleOutcome::Fail(reason) => {
                warn!(plan_id = %plan.id, rule = %rule, reason = %reason, "plan rejected");
                verdicts.push(ValidationVerdict::fail(*rule, reason));
                return Err(ResolveError::ValidationHardFail { verdicts });
            }
        }
    }

    info!(plan_id = %plan.id, "plan approved");
    Ok(ValidatedPlan::approve(working, verdicts))
}

/// Whether an action needs the explicit-confirmation flag before it can pass
/// rule 1. Exposed so callers can prompt for confirmation up front.
pub fn requires_confirmation(action: &Action) -> bool {
    DESTRUCTIVE_SERVICES.contains(&action.service.as_str())
}
