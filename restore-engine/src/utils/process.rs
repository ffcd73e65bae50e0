//! Synchronous child process execution.
//!
//! External tools (duplicity, apt, mysql) are run to completion and their
//! combined output is captured for the transcript.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    /// stdout followed by stderr
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Build a command from a configured program string. The string may carry
/// leading arguments (`"sudo -n apt-get"`), split on whitespace.
pub fn command(program: &str) -> Command {
    let mut words = program.split_whitespace();
    let mut cmd = Command::new(words.next().unwrap_or(program));
    cmd.args(words);
    cmd
}

/// Render a command as a shell-like line for the transcript
pub fn command_line(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Run a command and capture stdout and stderr
pub fn run(cmd: &mut Command) -> io::Result<CommandOutput> {
    debug!("Running: {}", command_line(cmd));
    let out = cmd.stdin(Stdio::null()).output()?;
    Ok(collect(out))
}

/// Run a command with stdin fed from a file
pub fn run_with_input(cmd: &mut Command, input: &Path) -> io::Result<CommandOutput> {
    debug!("Running: {} < {}", command_line(cmd), input.display());
    let out = cmd.stdin(File::open(input)?).output()?;
    Ok(collect(out))
}

/// Run a command with stdout written to a file; only stderr is captured
pub fn run_to_file(cmd: &mut Command, output: &Path) -> io::Result<CommandOutput> {
    debug!("Running: {} > {}", command_line(cmd), output.display());
    let out = cmd
        .stdin(Stdio::null())
        .stdout(File::create(output)?)
        .stderr(Stdio::piped())
        .output()?;
    Ok(collect(out))
}

fn collect(out: std::process::Output) -> CommandOutput {
    let mut output = String::from_utf8_lossy(&out.stdout).to_string();
    output.push_str(&String::from_utf8_lossy(&out.stderr));
    CommandOutput {
        status: out.status,
        output,
    }
}
