//! Small helpers for running the external archive and mount tools.

use crate::error::{Error, Result};
use std::process::{Command, ExitStatus, Stdio};

/// Run a command to completion, discarding stdout. The child's stderr goes
/// straight to ours so tool diagnostics reach the operator.
pub(crate) fn run_status(argv: &[String]) -> Result<ExitStatus> {
    let (cmd, args) = split(argv)?;
    tracing::debug!(command = %argv.join(" "), "running");
    Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .map_err(|e| Error::process(argv.join(" "), e.to_string()))
}

/// Run a command to completion and capture stdout. A non-zero exit turns
/// into a `Process` error carrying the captured stderr.
pub(crate) fn run_output(argv: &[String]) -> Result<Vec<u8>> {
    let (cmd, args) = split(argv)?;
    tracing::debug!(command = %argv.join(" "), "running");
    let output = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::process(argv.join(" "), e.to_string()))?;
    if !output.status.success() {
        return Err(Error::process(
            argv.join(" "),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(output.stdout)
}

fn split(argv: &[String]) -> Result<(&String, &[String])> {
    argv.split_first()
        .ok_or_else(|| Error::Validation("empty command template".into()))
}
