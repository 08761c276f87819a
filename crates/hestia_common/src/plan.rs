//! Automation plan skeletons.
//!
//! A plan binds verified entity ids into a trigger/condition/action shape.
//! Plans are immutable once constructed; a new resolution always produces a
//! new plan. Rendering to deployable config is out of scope here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::Domain;
use crate::verdict::ValidationVerdict;

/// What starts the automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum Trigger {
    /// Entity state change ("light.office" → "on")
    State { entity_id: String, to: String },
    /// Wall-clock time, "HH:MM" or "HH:MM:SS"
    Time { at: String },
    /// Fixed repeat interval
    Interval { every_seconds: u64 },
}

impl Trigger {
    /// Entity referenced by the trigger, if any.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::State { entity_id, .. } => Some(entity_id),
            _ => None,
        }
    }
}

/// Gate that must hold for actions to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub entity_id: String,
    pub state: String,
}

/// One service call bound to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Service in `<domain>.<service>` form ("light.turn_on")
    pub service: String,
    pub entity_id: String,
    /// Service payload
    #[serde(default)]
    pub data: serde_json::Value,
    /// Whether the user explicitly confirmed this action.
    /// Required for destructive services.
    #[serde(default)]
    pub confirmed: bool,
}

impl Action {
    pub fn new(service: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entity_id: entity_id.into(),
            data: serde_json::Value::Null,
            confirmed: false,
        }
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Domain prefix of the service ("light.turn_on" → `Light`).
    pub fn service_domain(&self) -> Option<Domain> {
        Domain::from_entity_id(&self.service)
    }
}

/// Trigger/condition/action skeleton with entity references bound from a
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationPlan {
    pub id: Uuid,
    pub name: String,
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    /// Query this plan was resolved from
    pub source_query_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl AutomationPlan {
    pub fn new(name: impl Into<String>, source_query_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            triggers: vec![],
            conditions: vec![],
            actions: vec![],
            source_query_id,
            created_at: Utc::now(),
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Every entity id the plan references, triggers and actions alike.
    pub fn bound_entities(&self) -> Vec<&str> {
        self.triggers
            .iter()
            .filter_map(|t| t.entity_id())
            .chain(self.actions.iter().map(|a| a.entity_id.as_str()))
            .chain(self.conditions.iter().map(|c| c.entity_id.as_str()))
            .collect()
    }
}

/// An approved plan plus the verdicts that approved it. The only form the
/// (out-of-scope) renderer accepts; constructing one outside the safety
/// validator is not possible.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedPlan {
    plan: AutomationPlan,
    verdicts: Vec<ValidationVerdict>,
    approved_at: DateTime<Utc>,
}

impl ValidatedPlan {
    /// Crate-visible constructor; called by the safety validator only.
    #[doc(hidden)]
    pub fn approve(plan: AutomationPlan, verdicts: Vec<ValidationVerdict>) -> Self {
        Self {
            plan,
            verdicts,
            approved_at: Utc::now(),
        }
    }

    pub fn plan(&self) -> &AutomationPlan {
        &self.plan
    }

    pub fn verdicts(&self) -> &[ValidationVerdict] {
        &self.verdicts
    }

    pub fn approved_at(&self) -> DateTime<Utc> {
        self.approved_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_entities_covers_all_sections() {
        let plan = AutomationPlan::new("test", Uuid::new_v4())
            .with_trigger(Trigger::State {
                entity_id: "binary_sensor.door".into(),
                to: "on".into(),
            })
            .with_trigger(Trigger::Time { at: "07:00".into() })
            .with_condition(Condition {
                entity_id: "sensor.lux".into(),
                state: "low".into(),
            })
            .with_action(Action::new("light.turn_on", "light.office"));

        let bound = plan.bound_entities();
        assert_eq!(
            bound,
            vec!["binary_sensor.door", "light.office", "sensor.lux"]
        );
    }

    #[test]
    fn action_service_domain() {
        let a = Action::new("lock.unlock", "lock.front_door");
        assert_eq!(a.service_domain(), Some(Domain::Lock));
    }

    #[test]
    fn plan_roundtrips_through_json() {
        let plan = AutomationPlan::new("office", Uuid::new_v4())
            .with_action(Action::new("light.turn_on", "light.office").confirmed());
        let json = serde_json::to_string(&plan).unwrap();
        let back: AutomationPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }
}
