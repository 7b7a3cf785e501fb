//! Cooperative pause/abort handle shared between the caller and a session.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    pub paused: bool,
    pub aborted: bool,
}

/// Clonable handle; every clone controls the same session.
#[derive(Debug, Clone)]
pub struct DfuController {
    tx: Arc<watch::Sender<ControlState>>,
}

impl DfuController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Suspend the transfer at the next chunk boundary.
    pub fn pause(&self) {
        info!("DFU pause requested");
        self.tx.send_modify(|state| state.paused = true);
    }

    pub fn resume(&self) {
        info!("DFU resume requested");
        self.tx.send_modify(|state| state.paused = false);
    }

    /// Wake every pending wait and fail the next step with `Aborted`.
    pub fn abort(&self) {
        info!("DFU abort requested");
        self.tx.send_modify(|state| state.aborted = true);
    }

    pub fn is_paused(&self) -> bool {
        self.tx.borrow().paused
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().aborted
    }

    /// Resolve once `abort()` has been called.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let aborted = rx.borrow_and_update().aborted;
            if aborted || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Receiver woken on every pause/resume/abort.
    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.tx.subscribe()
    }
}

impl Default for DfuController {
    fn default() -> Self {
        Self::new()
    }
}
