// TrafficArbiter answers decision requests from the policy cache

use crate::channel::DecisionHandler;
use crate::events::{EventLog, FirewallEvent};
use crate::policy::{PolicyDecision, PolicyStore};
use netto_common::ConnectionRequest;
use std::sync::{Mutex, MutexGuard};

/// Verdict applied to applications with no cached decision
pub const DEFAULT_ALLOW: bool = true;

/// Decides flows per application and records every outcome.
///
/// Owns the policy store and the event log; all mutations go through here,
/// which makes the arbiter the single writer of both.
pub struct TrafficArbiter {
    policies: Mutex<PolicyStore>,
    events: Mutex<EventLog>,
    default_allow: bool,
}

impl TrafficArbiter {
    pub fn new(policies: PolicyStore, events: EventLog, default_allow: bool) -> Self {
        if default_allow {
            log::info!("Unknown applications are allowed on first contact");
        } else {
            log::info!("Unknown applications are denied on first contact");
        }

        Self {
            policies: Mutex::new(policies),
            events: Mutex::new(events),
            default_allow,
        }
    }

    fn policy_store(&self) -> MutexGuard<'_, PolicyStore> {
        self.policies.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn event_log(&self) -> MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide one flow.
    ///
    /// A cached decision is returned as is. Otherwise the default policy is
    /// stored for the application and returned, so the flow is never left
    /// waiting on anything but a map lookup.
    pub fn arbitrate(&self, request: &ConnectionRequest) -> bool {
        let allowed = {
            let mut policies = self.policy_store();
            match policies.get(&request.app_id) {
                Some(decision) => decision.allowed,
                None => {
                    log::info!(
                        "First contact from {}, applying default ({})",
                        request.app_id,
                        if self.default_allow { "allow" } else { "deny" }
                    );
                    policies.apply_default(&request.app_id, self.default_allow);
                    self.default_allow
                }
            }
        };

        let event = self.event_log().record(request, allowed).clone();
        log::debug!(
            "{} {} {}:{} -> {:?}",
            event.source_app_identifier,
            event.direction,
            event.address,
            event.port,
            event.status
        );

        allowed
    }

    /// Explicit user choice; replaces any default
    pub fn set_policy(&self, app_id: &str, allowed: bool) {
        log::info!(
            "Policy for {} set to {}",
            app_id,
            if allowed { "allow" } else { "deny" }
        );
        self.policy_store().set(app_id, allowed);
    }

    pub fn policy(&self, app_id: &str) -> Option<PolicyDecision> {
        self.policy_store().get(app_id).cloned()
    }

    pub fn policies(&self) -> Vec<PolicyDecision> {
        self.policy_store().all()
    }

    /// Recent events, newest first
    pub fn events(&self) -> Vec<FirewallEvent> {
        self.event_log().snapshot()
    }

    /// Wait for pending policy writes to reach disk.
    ///
    /// The store lock is released before waiting, so decisions keep being
    /// answered from memory meanwhile.
    pub fn flush(&self) {
        let pending = self.policy_store().pending_writes();
        pending.wait();
    }
}

impl DecisionHandler for TrafficArbiter {
    fn decide(&self, request: ConnectionRequest) -> bool {
        self.arbitrate(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStatus;
    use crate::policy::DecisionSource;
    use netto_common::Direction;

    fn arbiter(dir: &tempfile::TempDir, default_allow: bool) -> TrafficArbiter {
        let store = PolicyStore::open(dir.path().join("settings.json")).unwrap();
        TrafficArbiter::new(store, EventLog::new(100), default_allow)
    }

    fn request(app: &str) -> ConnectionRequest {
        ConnectionRequest::new(app, "example.com", 443, Direction::Outbound)
    }

    #[test]
    fn test_first_contact_applies_and_persists_default() {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = arbiter(&dir, true);

        assert!(arbiter.arbitrate(&request("com.apple.Safari")));

        let decision = arbiter.policy("com.apple.Safari").unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Default);

        arbiter.flush();
        let reopened = PolicyStore::open(dir.path().join("settings.json")).unwrap();
        assert!(reopened.get("com.apple.Safari").unwrap().is_default());
    }

    #[test]
    fn test_second_request_uses_cached_value() {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = arbiter(&dir, false);

        assert!(!arbiter.arbitrate(&request("org.example.tool")));
        assert!(!arbiter.arbitrate(&request("org.example.tool")));

        assert_eq!(arbiter.policies().len(), 1);
        assert_eq!(arbiter.events().len(), 2);
    }

    #[test]
    fn test_user_choice_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = arbiter(&dir, true);

        assert!(arbiter.arbitrate(&request("com.example.chatty")));
        arbiter.set_policy("com.example.chatty", false);
        assert!(!arbiter.arbitrate(&request("com.example.chatty")));

        let decision = arbiter.policy("com.example.chatty").unwrap();
        assert_eq!(decision.source, DecisionSource::User);
    }

    #[test]
    fn test_every_outcome_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = arbiter(&dir, true);
        arbiter.set_policy("blocked", false);

        arbiter.arbitrate(&request("blocked"));
        arbiter.arbitrate(&request("fresh"));

        let events = arbiter.events();
        assert_eq!(events[0].source_app_identifier, "fresh");
        assert_eq!(events[0].status, EventStatus::Allowed);
        assert_eq!(events[1].source_app_identifier, "blocked");
        assert_eq!(events[1].status, EventStatus::Rejected);
    }

    #[test]
    fn test_flush_does_not_hold_up_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = arbiter(&dir, true);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..50 {
                    arbiter.set_policy(&format!("user.app{}", i), false);
                    arbiter.flush();
                }
            });
            for i in 0..50 {
                assert!(arbiter.arbitrate(&request(&format!("fresh.app{}", i))));
            }
        });

        arbiter.flush();
        assert_eq!(arbiter.events().len(), 50);
        let reopened = PolicyStore::open(dir.path().join("settings.json")).unwrap();
        assert_eq!(reopened.len(), 100);
        assert!(!reopened.get("user.app49").unwrap().allowed);
    }
}
