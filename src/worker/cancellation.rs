use std::{collections::HashMap, sync::Mutex};

use triggered::{Listener, Trigger};

/// One-shot cancellation hooks keyed by task id. Firing a hook interrupts
/// every suspend point of the task holding its listener; late or repeated
/// cancels are ignored.
#[derive(Default)]
pub struct CancellationRegistry {
    triggers: Mutex<HashMap<String, Trigger>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: &str) -> Listener {
        let (trigger, listener) = triggered::trigger();
        self.triggers.lock().unwrap().insert(task_id.to_string(), trigger);
        listener
    }

    pub fn deregister(&self, task_id: &str) {
        self.triggers.lock().unwrap().remove(task_id);
    }

    pub fn cancel(&self, task_id: &str) {
        if let Some(trigger) = self.triggers.lock().unwrap().remove(task_id) {
            trigger.trigger();
        }
    }

    pub fn cancel_all(&self) {
        for (_, trigger) in self.triggers.lock().unwrap().drain() {
            trigger.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CancellationRegistry;

    #[test]
    fn test_cancel_fires_listener() {
        let registry = CancellationRegistry::new();
        let listener = registry.register("t1");

        assert!(!listener.is_triggered());
        registry.cancel("t1");
        assert!(listener.is_triggered());
    }

    #[test]
    fn test_cancel_unknown_task_is_ignored() {
        let registry = CancellationRegistry::new();
        registry.cancel("missing");
    }

    #[test]
    fn test_deregister_disarms() {
        let registry = CancellationRegistry::new();
        let listener = registry.register("t1");
        registry.deregister("t1");

        registry.cancel("t1");
        assert!(!listener.is_triggered());
    }

    #[test]
    fn test_cancel_all() {
        let registry = CancellationRegistry::new();
        let first = registry.register("t1");
        let second = registry.register("t2");

        registry.cancel_all();
        assert!(first.is_triggered());
        assert!(second.is_triggered());
    }
}
