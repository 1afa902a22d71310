//! Remote execution channel.
//!
//! - [`RemoteSession`]: runs shell commands on a host with start/stop marker
//!   completion detection and timeouts
//! - file helpers (`get`, `put`, `put_tree`, `get_tree`, ...) over a separate
//!   copy channel
//! - [`LogSink`]: shared buffer collecting streamed output for later storage

mod script;
mod session;
mod transfer;
mod transport;

use std::sync::{Arc, Mutex};

pub use script::{build_script, shell_quote, Markers};
pub use session::{ExecOptions, ExecOutput, RemoteSession};
pub(crate) use session::is_lock_contention;
pub use transport::{CopyDirection, Target};

/// Output lines streamed from one or more sessions.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.into());
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
