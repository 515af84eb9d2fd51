use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Component trait
pub trait Component: Send {
    fn name(&self) -> &str;
    /// Return to the power-on state.
    fn reset(&mut self);
    fn is_running(&self) -> bool {
        false
    }
    fn stop(&mut self) {}
}

/// Shared bookkeeping for components that own a worker thread.
#[derive(Debug, Clone)]
pub struct BaseComponent {
    pub name: String,
    running: Arc<AtomicBool>,
}

impl BaseComponent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Handle the worker thread polls to find out when to exit.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}
