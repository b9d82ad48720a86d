//! Worker output buffering.
//!
//! Lines read from the worker's stdout/stderr accumulate here until the next
//! drain attaches them to a setup result or a prediction response. Lines the
//! worker tags with [`INTERNAL_MARKER`] are its own control chatter and are
//! never handed to callers.
//!
//! The buffer itself is not synchronized: it lives inside the runner state and
//! shares that lock with everything else a drain has to be atomic with.

use std::io::Write;

/// Substring the worker prefixes its own log records with.
pub const INTERNAL_MARKER: &str = "[COG]";

/// Which worker stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Vec<String>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a line. Returns false if it was filtered as internal.
    pub fn append(&mut self, line: &str) -> bool {
        if is_internal(line) {
            return false;
        }
        self.lines.push(line.to_string());
        true
    }

    /// Join everything buffered with `\n` and clear the buffer.
    pub fn drain(&mut self) -> String {
        let logs = self.lines.join("\n");
        self.lines.clear();
        logs
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub fn is_internal(line: &str) -> bool {
    line.contains(INTERNAL_MARKER)
}

/// Echo a raw worker line to our own stdout, markers included.
pub fn echo(line: &str) {
    echo_to(&mut std::io::stdout().lock(), line);
}

pub fn echo_to<W: Write>(out: &mut W, line: &str) {
    let _ = writeln!(out, "{}", line);
}
