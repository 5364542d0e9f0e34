// Optional callbacks receiving assembled output and progress notifications.

use arc_swap::ArcSwapOption;
use std::sync::Arc;

use crate::protocol::TransferProgress;

pub type OutputSink = Box<dyn Fn(&str) + Send + Sync>;
pub type ProgressSink = Box<dyn Fn(&TransferProgress) + Send + Sync>;

/// Sinks may be swapped while the dispatcher is running; emitting with no
/// sink attached does nothing.
#[derive(Default)]
pub struct EventSinks {
    output: ArcSwapOption<OutputSink>,
    progress: ArcSwapOption<ProgressSink>,
}

impl EventSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_output<F>(&self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.output.store(Some(Arc::new(Box::new(sink))));
    }

    pub fn set_progress<F>(&self, sink: F)
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.progress.store(Some(Arc::new(Box::new(sink))));
    }

    pub fn clear(&self) {
        self.output.store(None);
        self.progress.store(None);
    }

    pub fn emit_line(&self, line: &str) {
        if let Some(sink) = self.output.load().as_ref() {
            sink(line);
        }
    }

    pub fn emit_progress(&self, progress: &TransferProgress) {
        if let Some(sink) = self.progress.load().as_ref() {
            sink(progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProgressOperation, ProgressSide};
    use std::sync::Mutex;

    #[test]
    fn test_emit_without_sink_is_noop() {
        let sinks = EventSinks::new();
        sinks.emit_line("nobody listens");
    }

    #[test]
    fn test_sink_can_be_replaced() {
        let sinks = EventSinks::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let captured = Arc::clone(&first);
        sinks.set_output(move |line| captured.lock().unwrap().push(line.to_string()));
        sinks.emit_line("one");

        let captured = Arc::clone(&second);
        sinks.set_output(move |line| captured.lock().unwrap().push(line.to_string()));
        sinks.emit_line("two");

        assert_eq!(*first.lock().unwrap(), vec!["one"]);
        assert_eq!(*second.lock().unwrap(), vec!["two"]);

        sinks.clear();
        sinks.emit_line("three");
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_progress_sink_receives_notification() {
        let sinks = EventSinks::new();
        let seen = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&seen);
        sinks.set_progress(move |progress| {
            *captured.lock().unwrap() = Some(progress.clone());
        });

        let progress = TransferProgress {
            operation: ProgressOperation::Transfer,
            side: ProgressSide::Remote,
            file_name: "report.pdf".to_string(),
            directory: "/upload".to_string(),
            overall_progress: 0.5,
            file_progress: 0.75,
            bytes_per_second: 1024,
        };
        sinks.emit_progress(&progress);
        assert_eq!(seen.lock().unwrap().as_ref(), Some(&progress));
    }
}
