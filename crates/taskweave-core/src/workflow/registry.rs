//! Execution lifecycle registry.
//!
//! Tracks which executions are running or parked, keyed by execution ID, and
//! keeps a bounded history of finished states. A running execution's state is
//! owned by its step loop, not by the registry; only parked states (retry
//! requested, user input required) are stored here until resumed or swept.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use taskweave_types::execution::{ExecutionMetadata, ExecutionOutcome, ExecutionState};
use uuid::Uuid;

use super::engine::EngineError;

/// A suspended execution waiting for `resume_execution`.
#[derive(Debug, Clone)]
pub struct ParkedExecution {
    pub state: ExecutionState,
    pub outcome: ExecutionOutcome,
    pub metadata: ExecutionMetadata,
    /// Fan-out bound the execution was started with.
    pub fan_out_limit: usize,
    /// Deadline the execution was started with, reused on resume.
    pub deadline: Option<Instant>,
    pub parked_at: Instant,
}

#[derive(Debug)]
enum Slot {
    Running { workflow_id: String },
    Parked(Box<ParkedExecution>),
}

/// Registry of active executions plus bounded history.
#[derive(Debug)]
pub struct ExecutionRegistry {
    active: DashMap<Uuid, Slot>,
    history: Mutex<VecDeque<ExecutionState>>,
    history_capacity: usize,
}

impl ExecutionRegistry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            active: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(history_capacity.min(1024))),
            history_capacity,
        }
    }

    /// Record a new running execution.
    pub fn start(&self, execution_id: Uuid, workflow_id: &str) {
        self.active.insert(
            execution_id,
            Slot::Running {
                workflow_id: workflow_id.to_string(),
            },
        );
    }

    /// Park an execution until it is resumed or swept.
    pub fn park(&self, parked: ParkedExecution) {
        self.active
            .insert(parked.state.execution_id, Slot::Parked(Box::new(parked)));
    }

    /// Take a parked execution for resumption, marking it running again.
    pub fn take_parked(&self, execution_id: Uuid) -> Result<ParkedExecution, EngineError> {
        let Some(mut slot) = self.active.get_mut(&execution_id) else {
            return Err(if self.finished(execution_id).is_some() {
                EngineError::ExecutionNotResumable(execution_id)
            } else {
                EngineError::ExecutionNotFound(execution_id)
            });
        };

        let Slot::Parked(parked) = &*slot else {
            return Err(EngineError::ExecutionNotResumable(execution_id));
        };
        let workflow_id = parked.state.workflow_id.clone();
        let Slot::Parked(parked) = std::mem::replace(&mut *slot, Slot::Running { workflow_id })
        else {
            return Err(EngineError::ExecutionNotResumable(execution_id));
        };
        Ok(*parked)
    }

    /// Move a finished execution out of the active set into history.
    pub fn finish(&self, state: ExecutionState) {
        self.active.remove(&state.execution_id);
        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock().expect("execution history lock poisoned");
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(state);
    }

    /// Drop a running execution whose step loop went away without finishing.
    ///
    /// Returns `false` if the execution is parked, finished, or unknown.
    pub fn abandon(&self, execution_id: Uuid) -> bool {
        self.active
            .remove_if(&execution_id, |_, slot| matches!(slot, Slot::Running { .. }))
            .is_some()
    }

    /// Remove and return parked executions idle for at least `ttl`.
    pub fn take_expired(&self, ttl: Duration) -> Vec<ParkedExecution> {
        let expired: Vec<Uuid> = self
            .active
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Parked(p) if p.parked_at.elapsed() >= ttl => Some(*entry.key()),
                _ => None,
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                self.active
                    .remove_if(&id, |_, slot| matches!(slot, Slot::Parked(_)))
            })
            .filter_map(|(_, slot)| match slot {
                Slot::Parked(parked) => Some(*parked),
                Slot::Running { .. } => None,
            })
            .collect()
    }

    /// The parked state of an execution, or its final state from history.
    pub fn get(&self, execution_id: Uuid) -> Option<ExecutionState> {
        if let Some(slot) = self.active.get(&execution_id)
            && let Slot::Parked(parked) = slot.value()
        {
            return Some(parked.state.clone());
        }
        self.finished(execution_id)
    }

    fn finished(&self, execution_id: Uuid) -> Option<ExecutionState> {
        self.history
            .lock()
            .expect("execution history lock poisoned")
            .iter()
            .rev()
            .find(|s| s.execution_id == execution_id)
            .cloned()
    }

    /// Whether the execution is currently running (not parked).
    pub fn is_running(&self, execution_id: Uuid) -> bool {
        self.active
            .get(&execution_id)
            .is_some_and(|slot| matches!(slot.value(), Slot::Running { .. }))
    }

    /// Workflow ID of a running or parked execution.
    pub fn workflow_of(&self, execution_id: Uuid) -> Option<String> {
        self.active.get(&execution_id).map(|slot| match slot.value() {
            Slot::Running { workflow_id } => workflow_id.clone(),
            Slot::Parked(p) => p.state.workflow_id.clone(),
        })
    }

    /// Running plus parked executions.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Finished executions, oldest first.
    pub fn history(&self) -> Vec<ExecutionState> {
        self.history
            .lock()
            .expect("execution history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use taskweave_types::execution::ExecutionStatus;

    fn state(workflow_id: &str) -> ExecutionState {
        ExecutionState::new(Uuid::now_v7(), workflow_id, vec!["a".to_string()], Map::new())
    }

    fn parked(state: ExecutionState) -> ParkedExecution {
        ParkedExecution {
            outcome: ExecutionOutcome::RetryRequested {
                step_id: "a".to_string(),
                reason: "timeout".to_string(),
            },
            state,
            metadata: ExecutionMetadata::default(),
            fan_out_limit: 5,
            deadline: None,
            parked_at: Instant::now(),
        }
    }

    #[test]
    fn park_and_resume() {
        let registry = ExecutionRegistry::new(10);
        let s = state("wf");
        let id = s.execution_id;
        registry.start(id, "wf");
        assert!(registry.is_running(id));
        assert!(registry.get(id).is_none(), "running state is owned by the step loop");

        registry.park(parked(s));
        assert!(!registry.is_running(id));
        assert_eq!(registry.get(id).unwrap().workflow_id, "wf");
        assert_eq!(registry.active_count(), 1);

        let taken = registry.take_parked(id).unwrap();
        assert_eq!(taken.state.execution_id, id);
        assert!(registry.is_running(id));
        assert!(matches!(
            registry.take_parked(id),
            Err(EngineError::ExecutionNotResumable(_))
        ));
    }

    #[test]
    fn unknown_and_finished_executions() {
        let registry = ExecutionRegistry::new(10);
        assert!(matches!(
            registry.take_parked(Uuid::now_v7()),
            Err(EngineError::ExecutionNotFound(_))
        ));

        let mut s = state("wf");
        s.status = ExecutionStatus::Completed;
        let id = s.execution_id;
        registry.start(id, "wf");
        registry.finish(s);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.get(id).unwrap().status, ExecutionStatus::Completed);
        assert!(matches!(
            registry.take_parked(id),
            Err(EngineError::ExecutionNotResumable(_))
        ));
    }

    #[test]
    fn history_is_bounded() {
        let registry = ExecutionRegistry::new(2);
        let ids: Vec<Uuid> = (0..3)
            .map(|_| {
                let s = state("wf");
                let id = s.execution_id;
                registry.finish(s);
                id
            })
            .collect();
        let history = registry.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].execution_id, ids[1]);
        assert_eq!(history[1].execution_id, ids[2]);
    }

    #[test]
    fn take_expired_only_returns_parked() {
        let registry = ExecutionRegistry::new(10);
        let running = Uuid::now_v7();
        registry.start(running, "wf");
        let s = state("wf");
        let parked_id = s.execution_id;
        registry.park(parked(s));

        assert!(registry.take_expired(Duration::from_secs(3600)).is_empty());
        let expired = registry.take_expired(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].state.execution_id, parked_id);
        assert!(registry.is_running(running));
        assert_eq!(registry.workflow_of(running).as_deref(), Some("wf"));
    }

    #[test]
    fn abandon_only_releases_running_slots() {
        let registry = ExecutionRegistry::new(10);
        let running = Uuid::now_v7();
        registry.start(running, "wf");
        let s = state("wf");
        let parked_id = s.execution_id;
        registry.park(parked(s));

        assert!(registry.abandon(running));
        assert!(!registry.abandon(running));
        assert!(!registry.abandon(parked_id));
        assert_eq!(registry.active_count(), 1);
        assert!(registry.history().is_empty());
    }
}
