use relaycell_core::Result;
use relaycell_storage::{Store, Task, TaskStatus};
use relaycell_tools::CancelOps;
use tracing::{info, warn};

/// Cancellation backed by task status in the Store. Cancelling a requester
/// handle marks every pending task routed to it, and child tasks inherit
/// their root's handle, so one call stops a whole tree. Nothing is held in
/// memory, so a later request on the same handle cannot revive the tree.
pub struct CancellationRegistry {
    store: Store,
}

impl CancellationRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Returns the tasks this call cancelled.
    pub fn cancel(&self, handle: &str) -> Result<Vec<Task>> {
        let cancelled = self.store.cancel_tasks_for_channel(handle)?;
        info!(handle = %handle, tasks = cancelled.len(), "Cancellation requested");
        Ok(cancelled)
    }
}

impl CancelOps for CancellationRegistry {
    fn is_cancelled(&self, task_id: &str) -> bool {
        match self.store.get_task(task_id) {
            Ok(Some(task)) => task.status == TaskStatus::Cancelled,
            Ok(None) => false,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Cancel check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycell_storage::NewTask;

    #[test]
    fn test_cancel_marks_the_tree() {
        let store = Store::open_in_memory().unwrap();
        let registry = CancellationRegistry::new(store.clone());
        let root = store
            .create_task(NewTask::root("user", "gui:1", "planner", "plan"))
            .unwrap();
        let child = store
            .create_task(NewTask::child(&root, "researcher", "dig"))
            .unwrap();
        assert!(!registry.is_cancelled(&root.task_id));

        assert_eq!(registry.cancel("gui:1").unwrap().len(), 2);
        assert!(registry.is_cancelled(&root.task_id));
        assert!(registry.is_cancelled(&child.task_id));
        assert!(registry.cancel("gui:1").unwrap().is_empty());
    }

    #[test]
    fn test_later_request_on_same_handle_is_not_cancelled() {
        let store = Store::open_in_memory().unwrap();
        let registry = CancellationRegistry::new(store.clone());
        let old = store
            .create_task(NewTask::root("user", "gui:1", "planner", "first"))
            .unwrap();
        registry.cancel("gui:1").unwrap();

        let fresh = store
            .create_task(NewTask::root("user", "gui:1", "planner", "second"))
            .unwrap();
        assert!(registry.is_cancelled(&old.task_id));
        assert!(!registry.is_cancelled(&fresh.task_id));
        assert!(!registry.is_cancelled("no-such-task"));
    }
}
