//! Platform shell selection for interactive sessions.

use std::io;
use std::process::Stdio;

use tokio::process::{Child, Command};

/// Spawns the platform's interactive shell with all three stdio
/// streams piped. The child is killed if the handle is dropped.
pub fn spawn_shell() -> io::Result<Child> {
    let mut command = if cfg!(target_os = "windows") {
        Command::new("cmd.exe")
    } else if cfg!(target_os = "linux") {
        let mut c = Command::new("/bin/bash");
        c.arg("-i");
        c
    } else {
        let mut c = Command::new("/bin/sh");
        c.arg("-i");
        c
    };
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_shell_starts_and_dies() {
        let mut child = spawn_shell().unwrap();
        assert!(child.stdin.is_some());
        assert!(child.stdout.is_some());
        child.kill().await.unwrap();
    }
}
