//! Ground-truth verifier.
//!
//! Confirms shortlisted candidates against the live registry with a bounded
//! concurrent fan-out under the cycle deadline. An entity is verified only
//! on a non-error, non-stale response for its exact id; everything else is
//! dropped with a logged reason. Candidates still pending at the deadline
//! are unverifiable, never "verified by default".

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Duration, Instant};
use tracing::{debug, warn};

use hestia_common::{ResolveError, StateSnapshot};

use crate::collaborators::{DeviceRegistry, RegistryResponse};
use crate::config::VerifyConfig;

/// Why a candidate was dropped from the shortlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NotFound,
    Unreachable,
    Stale,
    Deadline,
}

/// A candidate the registry confirmed, with the state it reported.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEntity {
    pub entity_id: String,
    pub state: StateSnapshot,
}

/// Outcome of one verification pass over a shortlist.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub verified: Vec<VerifiedEntity>,
    pub dropped: Vec<(String, DropReason)>,
}

impl VerificationReport {
    pub fn is_verified(&self, entity_id: &str) -> bool {
        self.verified.iter().any(|v| v.entity_id == entity_id)
    }

    pub fn verified_ids(&self) -> Vec<String> {
        self.verified.iter().map(|v| v.entity_id.clone()).collect()
    }
}

enum CallOutcome {
    Verified(StateSnapshot),
    Dropped(DropReason),
}

/// Verify a shortlist of entity ids against the registry.
///
/// Fan-out is bounded by `config.concurrency`; every call gets its own
/// timeout, one retry with a short backoff on transport errors, and the
/// shared `deadline` caps everything. Fails closed with
/// `RegistryUnavailable` when every single candidate errored at transport
/// level — a dead registry must not look like "no matching devices".
pub async fn verify_shortlist(
    registry: Arc<dyn DeviceRegistry>,
    ids: &[String],
    config: &VerifyConfig,
    deadline: Instant,
) -> Result<VerificationReport, ResolveError> {
    if ids.is_empty() {
        return Ok(VerificationReport::default());
    }

    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (pos, id) in ids.iter().enumerate() {
        let registry = Arc::clone(&registry);
        let semaphore = Arc::clone(&semaphore);
        let id = id.clone();
        let config = config.clone();
        tasks.spawn(async move {
            let _permit = match semaphore.acquire().await {
                Ok(p) => p,
                Err(_) => return (pos, id, CallOutcome::Dropped(DropReason::Deadline)),
            };
            let outcome = verify_one(registry.as_ref(), &id, &config, deadline).await;
            (pos, id, outcome)
        });
    }

    let mut outcomes: Vec<Option<(String, CallOutcome)>> = (0..ids.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((pos, id, outcome)) => outcomes[pos] = Some((id, outcome)),
            Err(e) => warn!(error = %e, "verification task failed to join"),
        }
    }

    let mut report = VerificationReport::default();
    let mut transport_failures = 0usize;
    for slot in outcomes.into_iter() {
        let Some((id, outcome)) = slot else { continue };
        match outcome {
            CallOutcome::Verified(state) => {
                debug!(entity_id = %id, "candidate verified");
                report.verified.push(VerifiedEntity {
                    entity_id: id,
                    state,
                });
            }
            CallOutcome::Dropped(reason) => {
                warn!(entity_id = %id, reason = ?reason, "candidate dropped from shortlist");
                if reason == DropReason::Unreachable {
                    transport_failures += 1;
                }
                report.dropped.push((id, reason));
            }
        }
    }

    if report.verified.is_empty() && transport_failures == ids.len() {
        return Err(ResolveError::RegistryUnavailable {
            reason: "all verification calls failed".into(),
        });
    }

    Ok(report)
}

/// One registry call with per-call timeout and a single retry.
async fn verify_one(
    registry: &dyn DeviceRegistry,
    entity_id: &str,
    config: &VerifyConfig,
    deadline: Instant,
) -> CallOutcome {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let call_deadline = deadline.min(Instant::now() + Duration::from_millis(config.call_timeout_ms));
        if Instant::now() >= call_deadline {
            return CallOutcome::Dropped(DropReason::Deadline);
        }

        match timeout_at(call_deadline, registry.get_state(entity_id)).await {
            Ok(Ok(RegistryResponse::Found(state))) => {
                if state.is_stale(Utc::now(), config.max_state_age_secs) {
                    return CallOutcome::Dropped(DropReason::Stale);
                }
                return CallOutcome::Verified(state);
            }
            Ok(Ok(RegistryResponse::NotFound)) => {
                return CallOutcome::Dropped(DropReason::NotFound);
            }
            Ok(Err(_)) if attempts == 1 => {
                // One retry with a short backoff, still under the deadline.
                sleep(Duration::from_millis(config.retry_backoff_ms)).await;
            }
            Ok(Err(_)) => return CallOutcome::Dropped(DropReason::Unreachable),
            Err(_) => {
                // Per-call or cycle deadline elapsed
                let reason = if Instant::now() >= deadline {
                    DropReason::Deadline
                } else if attempts > 1 {
                    DropReason::Unreachable
                } else {
                    DropReason::Deadline
                };
                return CallOutcome::Dropped(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::FakeDeviceRegistry;
    use hestia_common::{Domain, EntityRecord};

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn inventory() -> Vec<EntityRecord> {
        vec![
            EntityRecord::new("light.a", Domain::Light, "A"),
            EntityRecord::new("light.b", Domain::Light, "B"),
            EntityRecord::new("light.c", Domain::Light, "C"),
        ]
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn verifies_live_entities() {
        let reg: Arc<dyn DeviceRegistry> = Arc::new(FakeDeviceRegistry::new(inventory()));
        let report = verify_shortlist(
            reg,
            &ids(&["light.a", "light.b"]),
            &VerifyConfig::default(),
            far_deadline(),
        )
        .await
        .unwrap();
        assert_eq!(report.verified.len(), 2);
        assert!(report.dropped.is_empty());
    }

    #[tokio::test]
    async fn drops_missing_stale_and_unreachable_with_reasons() {
        let reg: Arc<dyn DeviceRegistry> = Arc::new(
            FakeDeviceRegistry::new(inventory())
                .not_found("light.a")
                .stale("light.b", 3_600)
                .unreachable("light.c"),
        );
        let mut config = VerifyConfig::default();
        config.retry_backoff_ms = 1;
        let report = verify_shortlist(
            reg,
            &ids(&["light.a", "light.b", "light.c"]),
            &config,
            far_deadline(),
        )
        .await
        .unwrap();
        assert!(report.verified.is_empty());
        assert_eq!(report.dropped.len(), 3);
        let reason_for = |id: &str| {
            report
                .dropped
                .iter()
                .find(|(i, _)| i == id)
                .map(|(_, r)| *r)
                .unwrap()
        };
        assert_eq!(reason_for("light.a"), DropReason::NotFound);
        assert_eq!(reason_for("light.b"), DropReason::Stale);
        assert_eq!(reason_for("light.c"), DropReason::Unreachable);
    }

    #[tokio::test]
    async fn retries_transport_errors_once() {
        let fake = FakeDeviceRegistry::new(inventory()).unreachable("light.a");
        let calls = fake.state_call_count("light.a");
        assert_eq!(calls, 0);
        let reg = Arc::new(fake);
        let reg_ref = Arc::clone(&reg);
        let mut config = VerifyConfig::default();
        config.retry_backoff_ms = 1;
        let report = verify_shortlist(
            reg as Arc<dyn DeviceRegistry>,
            &ids(&["light.a", "light.b"]),
            &config,
            far_deadline(),
        )
        .await
        .unwrap();
        assert_eq!(reg_ref.state_call_count("light.a"), 2);
        assert!(report.is_verified("light.b"));
    }

    #[tokio::test]
    async fn fails_closed_when_registry_is_down() {
        let reg: Arc<dyn DeviceRegistry> =
            Arc::new(FakeDeviceRegistry::new(inventory()).all_unreachable());
        let mut config = VerifyConfig::default();
        config.retry_backoff_ms = 1;
        let err = verify_shortlist(
            reg,
            &ids(&["light.a", "light.b"]),
            &config,
            far_deadline(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResolveError::RegistryUnavailable { .. }));
    }

    #[tokio::test]
    async fn expired_deadline_drops_pending_candidates() {
        let reg: Arc<dyn DeviceRegistry> = Arc::new(FakeDeviceRegistry::new(inventory()));
        let report = verify_shortlist(
            reg,
            &ids(&["light.a"]),
            &VerifyConfig::default(),
            Instant::now(), // already elapsed
        )
        .await
        .unwrap();
        assert!(report.verified.is_empty());
        assert_eq!(report.dropped, vec![("light.a".to_string(), DropReason::Deadline)]);
    }

    #[tokio::test]
    async fn empty_shortlist_is_a_noop() {
        let reg: Arc<dyn DeviceRegistry> = Arc::new(FakeDeviceRegistry::new(vec![]));
        let report = verify_shortlist(reg, &[], &VerifyConfig::default(), far_deadline())
            .await
            .unwrap();
        assert!(report.verified.is_empty());
        assert!(report.dropped.is_empty());
    }
}
