//! Task tracking for multi-step operations.
//!
//! The tracker is a shared state container; every mutation produces a full
//! snapshot that is broadcast to the client as a `task_snapshot` event.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: String,
    pub subject: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub description: String,
}

/// Thread-safe task list. Mutating methods return `(task, snapshot)` under
/// one lock acquisition so snapshots can never interleave.
#[derive(Default)]
pub struct TaskTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    tasks: Vec<TaskItem>,
    next_id: u64,
}

impl TrackerInner {
    fn snapshot(&self) -> Vec<Value> {
        let mut tasks: Vec<&TaskItem> = self.tasks.iter().collect();
        // "1. ..." subjects sort numerically when every task carries one;
        // otherwise insertion order stands.
        if !tasks.is_empty() && tasks.iter().all(|t| numbered_prefix(&t.subject).is_some()) {
            tasks.sort_by_key(|t| numbered_prefix(&t.subject).unwrap_or(u64::MAX));
        }
        tasks
            .into_iter()
            .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
            .collect()
    }
}

fn numbered_prefix(subject: &str) -> Option<u64> {
    let (digits, rest) = subject.split_once(". ")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let _ = rest;
    digits.parse().ok()
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, subject: &str, description: &str) -> (TaskItem, Vec<Value>) {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let task = TaskItem {
            id: inner.next_id.to_string(),
            subject: subject.to_owned(),
            status: TaskStatus::Pending,
            description: description.to_owned(),
        };
        inner.tasks.push(task.clone());
        (task, inner.snapshot())
    }

    pub fn update(
        &self,
        task_id: &str,
        status: Option<TaskStatus>,
        subject: Option<&str>,
    ) -> Result<(TaskItem, Vec<Value>), String> {
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| format!("Task {task_id} not found"))?;
        if let Some(status) = status {
            task.status = status;
        }
        if let Some(subject) = subject {
            task.subject = subject.to_owned();
        }
        let task = task.clone();
        Ok((task, inner.snapshot()))
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.inner.lock().snapshot()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_sequential_ids() {
        let tracker = TaskTracker::new();
        let (t1, _) = tracker.create("first", "");
        let (t2, snapshot) = tracker.create("second", "");
        assert_eq!(t1.id, "1");
        assert_eq!(t2.id, "2");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0]["status"], "pending");
    }

    #[test]
    fn update_changes_status_and_snapshots() {
        let tracker = TaskTracker::new();
        let (task, _) = tracker.create("do the thing", "");
        let (updated, snapshot) = tracker
            .update(&task.id, Some(TaskStatus::InProgress), None)
            .unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert_eq!(snapshot[0]["status"], "in_progress");
    }

    #[test]
    fn update_unknown_task_errors() {
        let tracker = TaskTracker::new();
        assert!(tracker.update("99", Some(TaskStatus::Completed), None).is_err());
    }

    #[test]
    fn numbered_subjects_sort_numerically() {
        let tracker = TaskTracker::new();
        tracker.create("2. second", "");
        tracker.create("10. tenth", "");
        tracker.create("1. first", "");

        let snapshot = tracker.snapshot();
        let subjects: Vec<&str> = snapshot
            .iter()
            .map(|t| t["subject"].as_str().unwrap())
            .collect();
        assert_eq!(subjects, vec!["1. first", "2. second", "10. tenth"]);
    }

    #[test]
    fn mixed_subjects_keep_insertion_order() {
        let tracker = TaskTracker::new();
        tracker.create("2. numbered", "");
        tracker.create("unnumbered", "");

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[0]["subject"], "2. numbered");
        assert_eq!(snapshot[1]["subject"], "unnumbered");
    }

    #[test]
    fn status_parsing() {
        assert_eq!(TaskStatus::parse("pending"), Some(TaskStatus::Pending));
        assert_eq!(TaskStatus::parse("in_progress"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse("done"), None);
    }
}
