use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::fmt;
use std::io::{self, Write};
use uuid::Uuid;

pub const TRACE_TARGET: &str = "datastore_probe::trace";

/// Human-readable record of one inspected request.
#[derive(Debug, Clone)]
pub struct Trace {
    id: Uuid,
    received_at: DateTime<Utc>,
    lines: Vec<Vec<u8>>,
    errors: usize,
}

impl Trace {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            lines: Vec::new(),
            errors: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `# id <uuid> at <rfc3339>`
    pub fn stamp(&self) -> String {
        format!(
            "# id {} at {}",
            self.id,
            self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    /// Lines are kept as bytes; decoded payloads are shown exactly as decoded.
    pub fn line(&mut self, line: impl Into<Vec<u8>>) {
        self.lines.push(line.into());
    }

    /// Same as [`Trace::line`], and counted as a failure.
    pub fn error(&mut self, line: impl Into<Vec<u8>>) {
        self.errors += 1;
        self.line(line);
    }

    pub fn lines(&self) -> &[Vec<u8>] {
        &self.lines
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn contains(&self, needle: &str) -> bool {
        let needle = needle.as_bytes();
        self.lines
            .iter()
            .any(|l| needle.is_empty() || l.windows(needle.len()).any(|w| w == needle))
    }

    /// Every line followed by `\n`, bytes untouched.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            out.extend_from_slice(line);
            out.push(b'\n');
        }
        out
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", String::from_utf8_lossy(line))?;
        }
        Ok(())
    }
}

/// Where finished traces go.
pub trait TraceSink: Send + Sync {
    fn emit(&self, trace: &Trace);
}

/// Writes each trace, raw, to stdout in one locked write.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl TraceSink for StdoutSink {
    fn emit(&self, trace: &Trace) {
        let rendered = trace.render();
        let mut out = io::stdout().lock();
        if let Err(err) = out.write_all(&rendered).and_then(|_| out.flush()) {
            tracing::warn!(request_id = %trace.id(), error = %err, "Failed to write trace");
        }
    }
}

/// Sends each trace through `tracing` under [`TRACE_TARGET`]; non-UTF-8 bytes
/// are replaced.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn emit(&self, trace: &Trace) {
        tracing::info!(target: TRACE_TARGET, request_id = %trace.id(), "\n{}", trace);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceOutput {
    #[default]
    Stdout,
    Log,
}

impl TraceOutput {
    pub fn sink(self) -> std::sync::Arc<dyn TraceSink> {
        match self {
            TraceOutput::Stdout => std::sync::Arc::new(StdoutSink),
            TraceOutput::Log => std::sync::Arc::new(LogSink),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_line_each_and_counts_errors() {
        let mut trace = Trace::new();
        trace.line("######");
        trace.error("# multipart error: boom");
        trace.line("");
        assert_eq!(trace.render(), b"######\n# multipart error: boom\n\n");
        assert_eq!(trace.error_count(), 1);
        assert!(trace.contains("boom"));
    }

    #[test]
    fn binary_lines_are_rendered_as_is() {
        let mut trace = Trace::new();
        let payload = vec![0xc3, 0xff, 0x00, b'x'];
        trace.line(payload.clone());
        let mut expected = payload;
        expected.push(b'\n');
        assert_eq!(trace.render(), expected);
        assert_eq!(trace.to_string(), "\u{fffd}\u{fffd}\0x\n");
    }

    #[test]
    fn stamp_carries_id() {
        let trace = Trace::new();
        assert!(trace.stamp().starts_with(&format!("# id {} at ", trace.id())));
        assert!(trace.stamp().ends_with('Z'));
    }
}
