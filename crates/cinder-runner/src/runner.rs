//! Shared runner types.

use cinder_core::workflow::EnvMap;
use tracing::warn;

/// Environment variable naming the file a step writes its outputs to.
pub const OUTPUT_ENV: &str = "CINDER_OUTPUT";

/// Configuration for the shell runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Pass the runner's own environment through to steps.
    pub inherit_env: bool,
    /// How long to wait for output pipes to close after a step is killed.
    pub drain_grace: std::time::Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            inherit_env: true,
            drain_grace: std::time::Duration::from_secs(5),
        }
    }
}

/// Program and leading arguments for running `script` under `shell`.
pub fn shell_command(shell: &str, script: &str) -> (String, Vec<String>) {
    let args = match shell {
        "bash" => vec!["--noprofile", "--norc", "-eo", "pipefail", "-c"],
        "sh" => vec!["-e", "-c"],
        "pwsh" | "powershell" => vec!["-NoProfile", "-Command"],
        "python" | "python3" => vec!["-c"],
        _ => vec!["-c"],
    };
    let mut args: Vec<String> = args.into_iter().map(str::to_string).collect();
    args.push(script.to_string());
    (shell.to_string(), args)
}

/// Parse the contents of a step's output file.
///
/// Each line is `key=value`. A multi-line value is written as `key<<DELIM`, the value
/// lines, then `DELIM` alone on a line. Later writes to the same key win.
pub fn parse_outputs(content: &str) -> EnvMap {
    let mut outputs = EnvMap::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some((key, delimiter)) = line.split_once("<<")
            && !key.contains('=')
        {
            let mut value = Vec::new();
            let mut closed = false;
            for next in lines.by_ref() {
                if next == delimiter {
                    closed = true;
                    break;
                }
                value.push(next);
            }
            if !closed {
                warn!(key = %key, "Unterminated multi-line output");
            }
            outputs.insert(key.trim().to_string(), value.join("\n"));
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                outputs.insert(key.trim().to_string(), value.to_string());
            }
            _ => warn!(line = %line, "Ignoring malformed output line"),
        }
    }

    outputs
}
