//! Host tool invocation shared by the command-line flashing strategies.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Locate `bin` on the host. Paths are checked directly; bare names are
/// searched on `PATH`.
pub fn find_tool(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(bin);
        return path.is_file().then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

/// Last `n` non-empty lines of tool output.
pub fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}

/// Run a tool to completion within `limit`. `Ok` carries a short success
/// detail, `Err` the reason the tool failed.
pub async fn run_tool(program: &Path, args: &[String], limit: Duration) -> Result<String, String> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| format!("failed to start {}: {}", program.display(), e))?;

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| format!("{} failed: {}", program.display(), e))?,
        Err(_) => return Err(format!("{} timed out after {}ms", program.display(), limit.as_millis())),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if output.status.success() {
        Ok(tail(&stdout, 2))
    } else {
        let detail = tail(&format!("{}\n{}", stdout, stderr), 4);
        Err(format!("exit code {:?}: {}", output.status.code(), detail))
    }
}
