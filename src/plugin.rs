//! Monitoring plugin conventions: exit statuses and output text.

use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::panic;
use std::process;

use crate::error::CheckError;
use crate::winrm::CommandOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Warning = 1,
    Critical = 2,
    Unknown = 3,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// `None` for codes outside the plugin range.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Warning),
            2 => Some(Status::Critical),
            3 => Some(Status::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Critical => "CRITICAL",
            Status::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Text to print and process exit code for a finished check.
///
/// The remote exit code is passed through unchanged; stderr is only shown
/// when `show_stderr` is set.
pub fn render(outcome: &Result<CommandOutput, CheckError>, show_stderr: bool) -> (String, i32) {
    match outcome {
        Ok(output) => {
            let mut text = output.stdout.clone();
            if show_stderr && !output.stderr.is_empty() {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str("stderr contained:\n");
                text.push_str(&output.stderr);
            }
            (text, output.exit_code)
        }
        Err(err) => (format!("{}: {err}\n", Status::Unknown), Status::Unknown.code()),
    }
}

/// Prints `UNKNOWN: <message>` and exits with the UNKNOWN status.
pub fn exit_unknown(message: impl fmt::Display) -> ! {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{}: {message}", Status::Unknown);
    let _ = stdout.flush();
    process::exit(Status::Unknown.code())
}

/// Any panic ends the process as UNKNOWN instead of the default abort text.
pub fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let message = panic_message(info.payload());
        match info.location() {
            Some(location) => tracing::debug!(%location, "panicked"),
            None => tracing::debug!("panicked"),
        }
        exit_unknown(message)
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unexpected panic".to_string()
    }
}
