//! Chat registry — per-chat run state, cancellation, and supersession.
//!
//! All per-chat runtime state (output directory, last folded memory, the
//! active cancel token) lives in one shared map keyed by chat id. Nothing
//! is stored in task-local context: a detached task (keepalive timers, file
//! listing at stream end) reads the same entries the tool dispatchers
//! mutate, so writes are always visible to the next reader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::memory::AgentMemory;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CancelToken
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A hierarchical cancellation token.
///
/// Cloning shares state. `child()` derives a token that also trips when any
/// ancestor is cancelled, without letting the child cancel its parent —
/// sub-agents get children of the run token.
#[derive(Clone)]
pub struct CancelToken {
    /// Ancestor flags first, own flag last.
    flags: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flags: vec![Arc::new(AtomicBool::new(false))],
        }
    }

    /// Signal cancellation of this token (and all its descendants).
    pub fn cancel(&self) {
        if let Some(own) = self.flags.last() {
            own.store(true, Ordering::Release);
        }
    }

    /// Check if this token or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.flags.iter().any(|f| f.load(Ordering::Acquire))
    }

    /// Derive a child token. Cancelling the parent cancels the child;
    /// cancelling the child leaves the parent running.
    pub fn child(&self) -> Self {
        let mut flags = self.flags.clone();
        flags.push(Arc::new(AtomicBool::new(false)));
        Self { flags }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-process state for one in-flight message dispatch.
struct RunState {
    run_id: u64,
    cancel: CancelToken,
    /// Set by the run worker when it has fully wound down.
    finished: Arc<AtomicBool>,
    output_dir: PathBuf,
    last_memory: Option<AgentMemory>,
}

/// Handle returned by [`ChatRegistry::start_run`]. The run worker marks the
/// run finished through it; dropping without `finish()` also marks it so a
/// panicking worker cannot wedge supersession.
pub struct RunHandle {
    pub run_id: u64,
    pub cancel: CancelToken,
    finished: Arc<AtomicBool>,
}

impl RunHandle {
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::Release);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChatRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared map of chat id → run state. At most one active run per chat.
pub struct ChatRegistry {
    runs: Mutex<HashMap<String, RunState>>,
    grace_period: Duration,
}

impl ChatRegistry {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            grace_period,
        }
    }

    /// Install a new run for a chat, superseding any active predecessor.
    ///
    /// The predecessor's cancel token is tripped and we wait up to the
    /// grace period for its worker to wind down before the new run state
    /// replaces it.
    pub async fn start_run(&self, chat_id: &str, output_dir: PathBuf) -> RunHandle {
        // Cancel the predecessor, if it is still running.
        let predecessor = {
            let runs = self.runs.lock();
            runs.get(chat_id).and_then(|state| {
                if state.finished.load(Ordering::Acquire) {
                    None
                } else {
                    tracing::info!(
                        chat_id = %chat_id,
                        run_id = state.run_id,
                        "superseding in-flight run"
                    );
                    state.cancel.cancel();
                    Some(state.finished.clone())
                }
            })
        };

        if let Some(finished) = predecessor {
            let deadline = tokio::time::Instant::now() + self.grace_period;
            while !finished.load(Ordering::Acquire) {
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(chat_id = %chat_id, "superseded run did not stop within grace period");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }

        let cancel = CancelToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let mut runs = self.runs.lock();
        let run_id = runs.get(chat_id).map(|s| s.run_id + 1).unwrap_or(1);
        runs.insert(
            chat_id.to_owned(),
            RunState {
                run_id,
                cancel: cancel.clone(),
                finished: finished.clone(),
                output_dir,
                last_memory: None,
            },
        );

        RunHandle {
            run_id,
            cancel,
            finished,
        }
    }

    /// Cancel the active run for a chat (explicit endpoint or disconnect).
    /// Returns whether an active run was found.
    pub fn cancel_run(&self, chat_id: &str) -> bool {
        let runs = self.runs.lock();
        match runs.get(chat_id) {
            Some(state) if !state.finished.load(Ordering::Acquire) => {
                tracing::info!(chat_id = %chat_id, run_id = state.run_id, "cancelling run");
                state.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Whether the chat currently has a live run.
    pub fn is_running(&self, chat_id: &str) -> bool {
        self.runs
            .lock()
            .get(chat_id)
            .is_some_and(|s| !s.finished.load(Ordering::Acquire))
    }

    /// The output directory of the chat's most recent run.
    pub fn output_dir(&self, chat_id: &str) -> Option<PathBuf> {
        self.runs.lock().get(chat_id).map(|s| s.output_dir.clone())
    }

    /// Store the folded memory produced by a finished run, keyed by run id
    /// so a superseded run cannot clobber its successor's slot.
    pub fn set_last_memory(&self, chat_id: &str, run_id: u64, memory: AgentMemory) {
        let mut runs = self.runs.lock();
        if let Some(state) = runs.get_mut(chat_id) {
            if state.run_id == run_id {
                state.last_memory = Some(memory);
            }
        }
    }

    /// Take (and clear) the last folded memory for a chat.
    pub fn pop_last_memory(&self, chat_id: &str) -> Option<AgentMemory> {
        self.runs
            .lock()
            .get_mut(chat_id)
            .and_then(|s| s.last_memory.take())
    }

    /// Drop all state for a chat (delete). Cancels any active run first.
    pub fn remove(&self, chat_id: &str) {
        let mut runs = self.runs.lock();
        if let Some(state) = runs.remove(chat_id) {
            state.cancel.cancel();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ChatRegistry {
        ChatRegistry::new(Duration::from_millis(200))
    }

    #[test]
    fn cancel_token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_token_clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn parent_cancellation_reaches_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancellation_spares_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn start_run_installs_state() {
        let reg = registry();
        let handle = reg.start_run("c1", PathBuf::from("/tmp/out")).await;
        assert_eq!(handle.run_id, 1);
        assert!(reg.is_running("c1"));
        assert_eq!(reg.output_dir("c1"), Some(PathBuf::from("/tmp/out")));

        handle.finish();
        assert!(!reg.is_running("c1"));
    }

    #[tokio::test]
    async fn supersession_cancels_predecessor() {
        let reg = registry();
        let first = reg.start_run("c1", PathBuf::from("/tmp/a")).await;
        assert!(!first.cancel.is_cancelled());

        // Simulate the first worker finishing once it observes cancellation.
        let first_cancel = first.cancel.clone();
        let handle = tokio::spawn(async move {
            while !first_cancel.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            first.finish();
        });

        let second = reg.start_run("c1", PathBuf::from("/tmp/b")).await;
        handle.await.unwrap();

        assert_eq!(second.run_id, 2);
        assert!(!second.cancel.is_cancelled());
        assert!(reg.is_running("c1"));
        // The new run's output dir replaced the old one.
        assert_eq!(reg.output_dir("c1"), Some(PathBuf::from("/tmp/b")));
    }

    #[tokio::test]
    async fn supersession_proceeds_after_grace_period() {
        let reg = ChatRegistry::new(Duration::from_millis(50));
        let stuck = reg.start_run("c1", PathBuf::from("/tmp/a")).await;

        // The predecessor never finishes; the new run must still install.
        let second = reg.start_run("c1", PathBuf::from("/tmp/b")).await;
        assert!(stuck.cancel.is_cancelled());
        assert_eq!(second.run_id, 2);
    }

    #[tokio::test]
    async fn cancel_run_trips_token() {
        let reg = registry();
        let handle = reg.start_run("c1", PathBuf::from("/tmp")).await;
        assert!(reg.cancel_run("c1"));
        assert!(handle.cancel.is_cancelled());

        handle.finish();
        assert!(!reg.cancel_run("c1"));
        assert!(!reg.cancel_run("ghost"));
    }

    #[tokio::test]
    async fn mutations_visible_across_detached_tasks() {
        // Per-chat state is keyed in the shared map, so a write made by one
        // task is seen by any other task that reads the registry afterwards
        // (the keepalive/dispatcher isolation rule).
        let reg = Arc::new(registry());
        let _handle = reg.start_run("c1", PathBuf::from("/tmp/one")).await;

        let reg2 = reg.clone();
        tokio::spawn(async move {
            reg2.set_last_memory("c1", 1, AgentMemory::default());
        })
        .await
        .unwrap();

        assert!(reg.pop_last_memory("c1").is_some());
        // pop clears the slot
        assert!(reg.pop_last_memory("c1").is_none());
    }

    #[tokio::test]
    async fn stale_run_cannot_store_memory() {
        let reg = ChatRegistry::new(Duration::from_millis(10));
        let first = reg.start_run("c1", PathBuf::from("/a")).await;
        let _second = reg.start_run("c1", PathBuf::from("/b")).await;

        // Run 1 finishing late must not overwrite run 2's slot.
        reg.set_last_memory("c1", first.run_id, AgentMemory::default());
        assert!(reg.pop_last_memory("c1").is_none());
    }

    #[tokio::test]
    async fn remove_cancels_and_clears() {
        let reg = registry();
        let handle = reg.start_run("c1", PathBuf::from("/tmp")).await;
        reg.remove("c1");
        assert!(handle.cancel.is_cancelled());
        assert!(!reg.is_running("c1"));
        assert!(reg.output_dir("c1").is_none());
    }
}
