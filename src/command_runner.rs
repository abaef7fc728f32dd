//! Helper command execution
//!
//! Every external helper the engine relies on goes through [`run_command`]:
//!
//! - Process group isolation (helpers die with us)
//! - PID registration in the [`ChildRegistry`] for signal cleanup
//! - Captured stdout/stderr and exit code, never an error for a non-zero exit

use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Execute `program` with `args`, capturing its output.
///
/// # Returns
///
/// - `Ok(output)` - the helper ran; check `output.success`
/// - `Err` - the helper could not be spawned or waited for
pub fn run_command(program: &str, args: &[String]) -> Result<CommandOutput> {
    debug!("run_command: {} args={:?}", program, args);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;
    let pid = child.id();

    if let Ok(mut guard) = ChildRegistry::global().lock() {
        guard.register(pid);
    }

    let output = child.wait_with_output();

    if let Ok(mut guard) = ChildRegistry::global().lock() {
        guard.unregister(pid);
    }

    let output = output.with_context(|| format!("Failed waiting for {}", program))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };

    if result.success {
        debug!("{} exited successfully", program);
    } else {
        info!("{} failed with exit code {}", program, result.code());
    }

    Ok(result)
}

/// Run a shell snippet with `sh -c`.
///
/// Used for custom rule scripts, whose stdout becomes a fact value.
pub fn run_shell(script: &str) -> Result<CommandOutput> {
    run_command("sh", &["-c".to_string(), script.to_string()])
}

/// Output from a helper execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Exit code with signal termination mapped to -1.
    pub fn code(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }

    /// Check if the helper succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                self.code(),
                self.stderr.trim()
            )
        }
    }
}
