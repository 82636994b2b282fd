use crate::services::logger::Logger;
use std::sync::{Arc, Mutex};

/// Receives the remote process's error stream. `write` may be called many
/// times; `close` is called once, when the exec channel ends.
pub trait DiagnosticSink: Send + Sync {
    fn write(&self, chunk: &[u8]);

    fn close(&self);
}

/// Forwards complete stderr lines to the logger. A trailing partial line is
/// held until more data or `close` arrives.
pub struct LoggerSink {
    logger: Logger,
    target_id: String,
    pending: Mutex<Vec<u8>>,
}

impl LoggerSink {
    pub fn new(logger: Logger, target_id: &str) -> Self {
        Self {
            logger: logger.child("remote"),
            target_id: target_id.to_string(),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\r');
        if text.is_empty() {
            return;
        }
        self.logger.info(
            text,
            Some(&serde_json::json!({"target_id": self.target_id, "stream": "stderr"})),
        );
    }
}

impl DiagnosticSink for LoggerSink {
    fn write(&self, chunk: &[u8]) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        pending.extend_from_slice(chunk);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
    }

    fn close(&self) {
        let rest = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        self.emit(&rest);
    }
}

#[derive(Default)]
struct MemoryState {
    data: Vec<u8>,
    writes: usize,
    closed: bool,
}

/// Buffers everything written; used by embedders that surface diagnostics
/// themselves, and by tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.state
            .lock()
            .map(|state| state.data.clone())
            .unwrap_or_default()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).to_string()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().map(|state| state.writes).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|state| state.closed).unwrap_or(false)
    }
}

impl DiagnosticSink for MemorySink {
    fn write(&self, chunk: &[u8]) {
        if let Ok(mut state) = self.state.lock() {
            state.data.extend_from_slice(chunk);
            state.writes += 1;
        }
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DiagnosticSink, LoggerSink, MemorySink};
    use crate::services::logger::Logger;

    #[test]
    fn logger_sink_emits_whole_lines_only() {
        let logger = Logger::capturing("test");
        let sink = LoggerSink::new(logger.clone(), "node-1");
        sink.write(b"Exception in ");
        assert!(logger.captured().is_empty());
        sink.write(b"thread main\nCaused by");
        let lines = logger.captured();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Exception in thread main"));
        sink.close();
        assert!(logger.captured()[1].contains("Caused by"));
    }

    #[test]
    fn memory_sink_tracks_close() {
        let sink = MemorySink::new();
        sink.write(b"a");
        sink.write(b"b");
        assert_eq!(sink.text(), "ab");
        assert_eq!(sink.write_count(), 2);
        assert!(!sink.is_closed());
        sink.close();
        assert!(sink.is_closed());
    }
}
