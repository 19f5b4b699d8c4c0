//! Restart handler backed by an external command.
//!
//! The command is expected to bring the device down. If it returns at all,
//! its exit status decides the reported outcome; a real reboot never returns
//! and the EXECUTING operation is settled by startup reconciliation instead.

use async_trait::async_trait;
use devagent_core::{fragments, OperationStatus, TypedOperation};
use tokio::process::Command;
use tracing::info;

use crate::service::error::HandlerError;
use crate::service::handler::OperationHandler;
use crate::service::registry::ManagedService;

/// Executes `c8y_Restart` operations by running a configured program.
#[derive(Debug, Clone)]
pub struct RestartHandler {
    program: String,
    args: Vec<String>,
}

impl RestartHandler {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parses a whitespace-separated command line such as `"sudo reboot"`.
    /// Returns `None` for a blank line.
    #[must_use]
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl ManagedService for RestartHandler {
    fn name(&self) -> &str {
        "restart"
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OperationHandler for RestartHandler {
    fn supported_operations(&self) -> Vec<String> {
        vec![fragments::RESTART.to_string()]
    }

    async fn execute(&self, operation: TypedOperation) -> Result<OperationStatus, HandlerError> {
        let TypedOperation::Restart(restart) = operation else {
            return Err(HandlerError::Unsupported {
                kind: operation.kind().to_string(),
            });
        };

        info!(operation_id = %restart.header.id, program = %self.program, "restarting device");
        let status = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| {
                HandlerError::Internal(
                    anyhow::Error::new(e).context(format!("failed to run {}", self.program)),
                )
            })?;

        if status.success() {
            Ok(OperationStatus::Successful)
        } else {
            Err(HandlerError::Failed(format!(
                "restart command {} exited with {status}",
                self.program
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use devagent_core::Operation;
    use serde_json::json;

    use super::*;

    fn typed(kind: &str) -> TypedOperation {
        let op = Operation::new("1").with_fragment(kind, json!({}));
        TypedOperation::from_operation(&op, kind).unwrap()
    }

    #[test]
    fn parses_command_line() {
        let handler = RestartHandler::from_command_line("  sudo  reboot now ").unwrap();
        assert_eq!(handler.program(), "sudo");
        assert_eq!(handler.args, vec!["reboot", "now"]);
        assert!(RestartHandler::from_command_line("   ").is_none());
    }

    #[test]
    fn supports_only_restart() {
        let handler = RestartHandler::new("true", Vec::new());
        assert_eq!(handler.supported_operations(), vec![fragments::RESTART]);
    }

    #[tokio::test]
    async fn rejects_other_kinds() {
        let handler = RestartHandler::new("true", Vec::new());
        let err = handler.execute(typed("acme_Blink")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Unsupported { kind } if kind == "acme_Blink"));
    }

    #[tokio::test]
    async fn missing_program_is_an_internal_error() {
        let handler = RestartHandler::new("/nonexistent/devagent-reboot", Vec::new());
        let err = handler.execute(typed(fragments::RESTART)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Internal(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_decides_outcome() {
        let ok = RestartHandler::new("true", Vec::new());
        assert_eq!(
            ok.execute(typed(fragments::RESTART)).await.unwrap(),
            OperationStatus::Successful
        );

        let failing = RestartHandler::new("false", Vec::new());
        let err = failing.execute(typed(fragments::RESTART)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
    }
}
