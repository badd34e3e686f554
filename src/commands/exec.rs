//! Local command execution for beacon taskings.

use std::io;

use tokio::process::Command;

/// Runs a whitespace-split command line and returns combined stdout
/// and stderr. An empty command is a no-op.
pub async fn execute_command(command_line: &str) -> io::Result<String> {
    let mut parts = command_line.split_whitespace();
    let program = match parts.next() {
        Some(program) => program,
        None => return Ok(String::new()),
    };

    let output = Command::new(program).args(parts).output().await?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(combined)
}
