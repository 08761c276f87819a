//! Safety-validation verdicts.

use serde::{Deserialize, Serialize};

/// The fixed safety rules, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    /// Destructive actions must carry an explicit confirmation
    DestructiveConfirmation,
    /// Trigger and action entities must not contradict each other
    EntityDomainMismatch,
    /// Repeat triggers must not fire excessively often
    RepeatFrequency,
    /// Deny-listed device combinations may not appear in one plan
    UnsafeDevicePair,
    /// Action payloads must not expose privacy-sensitive data
    PrivacyExposure,
    /// Time specifications must be realistic
    ImpossibleTime,
}

impl RuleId {
    pub fn severity(&self) -> RuleSeverity {
        match self {
            Self::DestructiveConfirmation
            | Self::EntityDomainMismatch
            | Self::UnsafeDevicePair
            | Self::PrivacyExposure => RuleSeverity::Hard,
            Self::RepeatFrequency | Self::ImpossibleTime => RuleSeverity::Soft,
        }
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DestructiveConfirmation => "destructive_confirmation",
            Self::EntityDomainMismatch => "entity_domain_mismatch",
            Self::RepeatFrequency => "repeat_frequency",
            Self::UnsafeDevicePair => "unsafe_device_pair",
            Self::PrivacyExposure => "privacy_exposure",
            Self::ImpossibleTime => "impossible_time",
        };
        f.write_str(s)
    }
}

/// Hard failures abort the plan; soft failures are auto-fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    Hard,
    Soft,
}

/// One rule's result for one validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub rule: RuleId,
    pub passed: bool,
    /// Human-readable reason, deterministic wording
    pub reason: String,
    /// Description of the applied auto-fix, for soft failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_fix: Option<String>,
}

impl ValidationVerdict {
    pub fn pass(rule: RuleId) -> Self {
        Self {
            rule,
            passed: true,
            reason: "ok".into(),
            auto_fix: None,
        }
    }

    pub fn fail(rule: RuleId, reason: impl Into<String>) -> Self {
        Self {
            rule,
            passed: false,
            reason: reason.into(),
            auto_fix: None,
        }
    }

    pub fn fixed(rule: RuleId, reason: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            rule,
            passed: true,
            reason: reason.into(),
            auto_fix: Some(fix.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities() {
        assert_eq!(RuleId::DestructiveConfirmation.severity(), RuleSeverity::Hard);
        assert_eq!(RuleId::UnsafeDevicePair.severity(), RuleSeverity::Hard);
        assert_eq!(RuleId::RepeatFrequency.severity(), RuleSeverity::Soft);
        assert_eq!(RuleId::ImpossibleTime.severity(), RuleSeverity::Soft);
    }

    #[test]
    fn verdict_serialization() {
        let v = ValidationVerdict::fixed(
            RuleId::RepeatFrequency,
            "interval below minimum",
            "clamped to 60s",
        );
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("repeat_frequency"));
        assert!(json.contains("clamped to 60s"));
    }
}
