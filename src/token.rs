use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation signal shared between a caller and the store.
///
/// Cancellation is level-triggered and one-way: once cancelled, a token
/// stays cancelled. Each `add` checks its token before acquiring the write
/// lock and while awaiting durable completion, alongside the store-wide
/// cancel-on-dispose token; bytes already staged are written and accounted
/// regardless.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
