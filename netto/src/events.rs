// Live activity view of recent arbitration outcomes

use crate::classifier::{self, TrafficCategory};
use chrono::{DateTime, Utc};
use netto_common::{ConnectionRequest, Direction};
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of events kept
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Allowed,
    Rejected,
}

impl From<bool> for EventStatus {
    fn from(allowed: bool) -> Self {
        if allowed {
            EventStatus::Allowed
        } else {
            EventStatus::Rejected
        }
    }
}

/// One arbitration outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub address: String,
    pub port: u16,
    pub source_app_identifier: String,
    pub status: EventStatus,
    pub direction: Direction,
    pub category: Option<TrafficCategory>,
}

/// Fixed-capacity, newest-first ring buffer of events.
///
/// Not persisted; lost on restart.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    events: VecDeque<FirewallEvent>,
    next_id: u64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
            next_id: 1,
        }
    }

    /// Record the outcome of one request, evicting the oldest event when full
    pub fn record(&mut self, request: &ConnectionRequest, allowed: bool) -> &FirewallEvent {
        let event = FirewallEvent {
            id: self.next_id,
            timestamp: Utc::now(),
            address: request.remote_host.clone(),
            port: request.remote_port,
            source_app_identifier: request.app_id.clone(),
            status: allowed.into(),
            direction: request.direction,
            category: classifier::categorize_host(&request.remote_host),
        };
        self.next_id += 1;

        self.events.push_front(event);
        self.events.truncate(self.capacity);

        &self.events[0]
    }

    /// Copy of the current events, newest first
    pub fn snapshot(&self) -> Vec<FirewallEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(app: &str) -> ConnectionRequest {
        ConnectionRequest::new(app, "93.184.216.34", 443, Direction::Outbound)
    }

    #[test]
    fn test_newest_first() {
        let mut log = EventLog::new(10);
        log.record(&request("a"), true);
        log.record(&request("b"), false);

        let events = log.snapshot();
        assert_eq!(events[0].source_app_identifier, "b");
        assert_eq!(events[0].status, EventStatus::Rejected);
        assert_eq!(events[1].source_app_identifier, "a");
        assert_eq!(events[1].category, Some(TrafficCategory::Internet));
    }

    #[test]
    fn test_capacity_evicts_exactly_oldest() {
        let mut log = EventLog::new(3);
        for app in ["a", "b", "c"] {
            log.record(&request(app), true);
        }
        assert_eq!(log.len(), 3);

        log.record(&request("d"), true);
        assert_eq!(log.len(), 3);

        let apps: Vec<_> = log
            .snapshot()
            .into_iter()
            .map(|e| e.source_app_identifier)
            .collect();
        assert_eq!(apps, vec!["d", "c", "b"]);
    }

    #[test]
    fn test_never_exceeds_default_capacity() {
        let mut log = EventLog::default();
        for i in 0..250 {
            log.record(&request(&format!("app{i}")), i % 2 == 0);
            assert!(log.len() <= DEFAULT_EVENT_CAPACITY);
        }
        assert_eq!(log.len(), DEFAULT_EVENT_CAPACITY);
        assert_eq!(log.snapshot()[0].id, 250);
        assert_eq!(log.snapshot()[99].id, 151);
    }
}
