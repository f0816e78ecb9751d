//! Bounded recent-task history.
//!
//! Local observability only: records are never re-delivered to the
//! controller. Entries are pruned by age (measured from start time) and by
//! count on every insert and by the periodic sweep.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use control_link_core::{EventStore, SharedClock, TaskRecord};
use serde_json::Value;

/// Default maximum task age.
pub const MAX_TASK_AGE: Duration = Duration::from_secs(5 * 60);

/// Default maximum number of retained tasks.
pub const MAX_TASKS: usize = 50;

/// Handle identifying one history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(u64);

#[derive(Default)]
struct Entries {
    records: VecDeque<(TaskHandle, TaskRecord)>,
    next: u64,
}

/// Recent-task history.
pub struct TaskHistory {
    entries: Mutex<Entries>,
    clock: SharedClock,
    events: Option<Arc<EventStore>>,
    max_age_ms: i64,
    max_entries: usize,
}

impl TaskHistory {
    /// Create a history with the default limits.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            clock,
            events: None,
            max_age_ms: duration_ms(MAX_TASK_AGE),
            max_entries: MAX_TASKS,
        }
    }

    /// Publish record changes to an event store.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventStore>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the limits.
    #[must_use]
    pub fn with_limits(mut self, max_age: Duration, max_entries: usize) -> Self {
        self.max_age_ms = duration_ms(max_age);
        self.max_entries = max_entries;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a task as running.
    pub fn begin(&self, command_id: &str, command_type: &str, params: Value) -> TaskHandle {
        let record = TaskRecord::running(command_id, command_type, params, self.clock.now_millis());
        let handle = {
            let mut entries = self.lock();
            let handle = TaskHandle(entries.next);
            entries.next += 1;
            entries.records.push_back((handle, record.clone()));
            self.prune_locked(&mut entries);
            handle
        };
        self.publish(record);
        handle
    }

    /// Settle a task. No-op if it has already been pruned.
    pub fn finish(&self, handle: TaskHandle, error: Option<String>) {
        let now = self.clock.now_millis();
        let settled = {
            let mut entries = self.lock();
            entries
                .records
                .iter_mut()
                .find(|(h, _)| *h == handle)
                .map(|(_, record)| {
                    record.finish(now, error);
                    record.clone()
                })
        };
        if let Some(record) = settled {
            self.publish(record);
        }
    }

    /// Drop expired and excess entries. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut entries = self.lock();
        self.prune_locked(&mut entries)
    }

    fn prune_locked(&self, entries: &mut Entries) -> usize {
        let before = entries.records.len();
        let cutoff = self.clock.now_millis() - self.max_age_ms;
        entries.records.retain(|(_, r)| r.start_time >= cutoff);
        while entries.records.len() > self.max_entries {
            entries.records.pop_front();
        }
        before - entries.records.len()
    }

    /// Snapshot, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<TaskRecord> {
        self.lock().records.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Most recent record for a command id.
    #[must_use]
    pub fn get(&self, command_id: &str) -> Option<TaskRecord> {
        self.lock()
            .records
            .iter()
            .rev()
            .find(|(_, r)| r.command_id == command_id)
            .map(|(_, r)| r.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn publish(&self, record: TaskRecord) {
        if let Some(events) = &self.events {
            events.push_task(record);
        }
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use control_link_core::{Clock, LocalEvent, ManualClock, TaskStatus};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_history_bound_by_age_and_count() {
        let clock = ManualClock::new(1_000_000);
        let history = TaskHistory::new(clock.clone());

        // 60 tasks over 10 minutes.
        for i in 0..60 {
            let handle = history.begin(&format!("c{i}"), "click", json!({}));
            history.finish(handle, None);
            clock.advance(Duration::from_secs(10));
        }
        history.prune();

        let records = history.list();
        assert!(records.len() <= MAX_TASKS);
        let cutoff = clock.now_millis() - 5 * 60 * 1000;
        assert!(records.iter().all(|r| r.start_time >= cutoff));
        assert_eq!(records.last().unwrap().command_id, "c59");
    }

    #[test]
    fn test_count_cap_drops_oldest() {
        let clock = ManualClock::new(0);
        let history = TaskHistory::new(clock).with_limits(MAX_TASK_AGE, 3);
        for i in 0..5 {
            history.begin(&format!("c{i}"), "t", Value::Null);
        }
        let ids: Vec<_> = history.list().into_iter().map(|r| r.command_id).collect();
        assert_eq!(ids, vec!["c2", "c3", "c4"]);
    }

    #[test]
    fn test_finish_settles_and_publishes() {
        let clock = ManualClock::new(100);
        let events = Arc::new(EventStore::new());
        let history = TaskHistory::new(clock.clone()).with_events(events.clone());

        let handle = history.begin("c1", "navigate", json!({ "url": "https://a.test" }));
        assert_eq!(history.get("c1").unwrap().status, TaskStatus::Running);

        clock.advance(Duration::from_millis(250));
        history.finish(handle, Some("element not found".to_string()));

        let record = history.get("c1").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.end_time, Some(350));
        assert_eq!(record.error.as_deref(), Some("element not found"));

        let tasks: Vec<_> = events
            .history()
            .into_iter()
            .filter(|e| matches!(e, LocalEvent::Task(_)))
            .collect();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_finish_after_prune_is_noop() {
        let clock = ManualClock::new(0);
        let history = TaskHistory::new(clock.clone());
        let handle = history.begin("old", "t", Value::Null);
        clock.advance(Duration::from_secs(301));
        assert_eq!(history.prune(), 1);
        history.finish(handle, None);
        assert!(history.is_empty());
    }
}
