//! Collaborators that consume inbound frames
//!
//! The session loop hands tasks to a [`TaskExecutor`] and status text to a
//! [`StatusSink`]. Delivery is fire-and-forget; nothing is acknowledged back
//! to the server.

use async_trait::async_trait;
use tracing::info;

/// Executes lifecycle tasks pushed by the server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `command` for task `task_id`
    async fn execute(&self, task_id: &str, command: &str);
}

/// Receives informational status from the server
#[cfg_attr(test, mockall::automock)]
pub trait StatusSink: Send + Sync {
    /// Record a status message
    fn status(&self, message: &str);
}

/// Executor that only logs received tasks
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExecutor;

#[async_trait]
impl TaskExecutor for LoggingExecutor {
    async fn execute(&self, task_id: &str, command: &str) {
        info!(task_id = %task_id, command = %command, "Received task");
    }
}

/// Status sink that logs at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStatusSink;

impl StatusSink for LoggingStatusSink {
    fn status(&self, message: &str) {
        info!(message = %message, "Server status");
    }
}
