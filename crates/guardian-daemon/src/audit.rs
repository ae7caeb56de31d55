//! Bounded audit trail of protection events

use crate::event::ProtectionEvent;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use uuid::Uuid;

/// Most recent events, oldest dropped first once `capacity` is reached
#[derive(Debug)]
pub struct AuditTrail {
    entries: RwLock<VecDeque<ProtectionEvent>>,
    capacity: usize,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&self, event: ProtectionEvent) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Newest first
    pub fn recent(&self, count: usize) -> Vec<ProtectionEvent> {
        self.entries.read().iter().rev().take(count).cloned().collect()
    }

    /// Every retained event about one action, oldest first
    pub fn for_action(&self, action_id: Uuid) -> Vec<ProtectionEvent> {
        self.entries
            .read()
            .iter()
            .filter(|event| event.action_id() == Some(action_id))
            .cloned()
            .collect()
    }

    /// Events recorded within `window` of now, oldest first
    pub fn within(&self, window: Duration) -> Vec<ProtectionEvent> {
        let cutoff = Utc::now() - window;
        self.entries
            .read()
            .iter()
            .filter(|event| event.at() >= cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Retained events as a JSON array, oldest first
    pub fn export_json(&self) -> serde_json::Result<String> {
        let entries = self.entries.read();
        serde_json::to_string_pretty(&*entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_core::types::now;

    fn blocked(action_id: Uuid) -> ProtectionEvent {
        ProtectionEvent::Blocked {
            action_id,
            reason: "lockdown".to_string(),
            at: now(),
        }
    }

    #[test]
    fn test_trail_is_bounded() {
        let trail = AuditTrail::new(3);
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            trail.append(blocked(*id));
        }
        assert_eq!(trail.len(), 3);
        let recent = trail.recent(10);
        assert_eq!(recent[0].action_id(), Some(ids[4]));
        assert_eq!(recent[2].action_id(), Some(ids[2]));
        assert!(trail.for_action(ids[0]).is_empty());
    }

    #[test]
    fn test_for_action_and_export() {
        let trail = AuditTrail::new(10);
        let id = Uuid::new_v4();
        trail.append(ProtectionEvent::Started { at: now() });
        trail.append(blocked(id));
        trail.append(blocked(Uuid::new_v4()));

        assert_eq!(trail.for_action(id).len(), 1);
        let exported: serde_json::Value = serde_json::from_str(&trail.export_json().unwrap()).unwrap();
        assert_eq!(exported.as_array().unwrap().len(), 3);
        assert_eq!(exported[0]["kind"], "started");
    }

    #[test]
    fn test_within_window() {
        let trail = AuditTrail::new(10);
        let id = Uuid::new_v4();
        trail.append(ProtectionEvent::Blocked {
            action_id: Uuid::new_v4(),
            reason: "lockdown".to_string(),
            at: now() - Duration::hours(2),
        });
        trail.append(blocked(id));

        let last_hour = trail.within(Duration::hours(1));
        assert_eq!(last_hour.len(), 1);
        assert_eq!(last_hour[0].action_id(), Some(id));
        assert_eq!(trail.within(Duration::days(1)).len(), 2);
    }
}
