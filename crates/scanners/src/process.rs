use std::{io, path::Path, process::Stdio};

use tokio::process::Command;

const STDERR_TAIL: usize = 500;

pub(crate) enum CommandError {
    NotFound,
    Spawn(io::Error),
}

#[derive(Debug)]
pub(crate) struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Trailing part of stderr, formatted for appending to an error message.
    pub fn stderr_tail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            return String::new();
        }
        let mut start = stderr.len().saturating_sub(STDERR_TAIL);
        while !stderr.is_char_boundary(start) {
            start += 1;
        }
        format!(": {}", &stderr[start..])
    }
}

/// Run a program to completion, capturing its output.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
) -> Result<CommandOutput, CommandError> {
    tracing::debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CommandError::NotFound,
            _ => CommandError::Spawn(e),
        })?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
