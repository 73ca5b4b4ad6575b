use eyre::Result;
use tokio::signal::unix::{Signal, SignalKind, signal};

/// SIGINT/SIGTERM watcher; its `wait_terminate` future is handed to the
/// control API server as the graceful-shutdown trigger.
#[derive(Debug)]
pub struct Signals {
    int: Signal,
    term: Signal,
}

impl Signals {
    pub fn new() -> Result<Self> {
        Ok(Self {
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
        })
    }

    pub async fn wait_terminate(mut self) {
        tokio::select! {
            _ = self.int.recv() => {},
            _ = self.term.recv() => {},
        }
    }
}
