//! Reassembles print fragments from the child into whole output lines.
//!
//! The child redraws progress-style lines by printing "from beginning". Such a
//! message is held back until the next print, so that a further redraw can
//! replace it. A from-beginning message starting with a line feed closes the
//! previous redraw and starts a new one.

use log::trace;

#[derive(Debug, Default)]
pub struct OutputAssembler {
    incomplete_line: String,
    pending_from_beginning: Option<String>,
}

impl OutputAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one print event, returning the lines it completed in arrival order.
    pub fn feed(&mut self, message: &str, from_beginning: bool) -> Vec<String> {
        let mut lines = Vec::new();

        if from_beginning && !message.starts_with('\n') {
            trace!("[OUTPUT] Buffered from-beginning message [{}]", message);
            self.pending_from_beginning = Some(message.to_string());
            return lines;
        }

        if let Some(pending) = self.pending_from_beginning.take() {
            if !pending.is_empty() {
                self.append(&pending, &mut lines);
            }
        }

        if from_beginning {
            // Starts with a line feed here.
            self.append("\n", &mut lines);
            let rest = &message[1..];
            trace!("[OUTPUT] Buffered from-beginning message [{}]", rest);
            self.pending_from_beginning = Some(rest.to_string());
        } else {
            self.append(message, &mut lines);
        }

        lines
    }

    /// Flush everything still held back once no more output will arrive.
    pub fn finish(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(pending) = self.pending_from_beginning.take() {
            if !pending.is_empty() {
                self.append(&pending, &mut lines);
            }
        }
        let tail = std::mem::take(&mut self.incomplete_line);
        if !tail.is_empty() {
            lines.push(tail);
        }
        lines
    }

    /// The trailing fragment not yet terminated by a line feed.
    pub fn incomplete_line(&self) -> &str {
        &self.incomplete_line
    }

    fn append(&mut self, message: &str, lines: &mut Vec<String>) {
        self.incomplete_line.push_str(message);
        while let Some(index) = self.incomplete_line.find('\n') {
            let rest = self.incomplete_line.split_off(index + 1);
            let mut line = std::mem::replace(&mut self.incomplete_line, rest);
            line.pop();
            lines.push(line);
        }
    }
}
