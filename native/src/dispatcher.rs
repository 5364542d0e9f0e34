use log::{debug, info, trace};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::error::Result;
use crate::input_queue::InputQueue;
use crate::logging::log_critical_error;
use crate::output::OutputAssembler;
use crate::protocol::{ChoicePrompt, ConsoleEvent, EventReply, StdTransport, TransferProgress};
use crate::sinks::EventSinks;

/// Answers events posted by the child. Runs on the dispatcher thread.
pub trait EventHandler: Send {
    /// Produce the reply for `event`. Long waits must poll `should_stop`.
    fn handle(&mut self, event: ConsoleEvent, should_stop: &dyn Fn() -> bool) -> EventReply;

    /// Called once when the loop ends, however it ends.
    fn finish(&mut self) {}
}

/// Drains the channel one event at a time until told to stop.
pub struct EventDispatcher<H: EventHandler> {
    channel: Arc<Channel>,
    handler: H,
    poll_interval: Duration,
}

impl<H: EventHandler> EventDispatcher<H> {
    pub fn new(channel: Arc<Channel>, handler: H, poll_interval: Duration) -> Self {
        Self {
            channel,
            handler,
            poll_interval,
        }
    }

    /// Run until `should_stop` returns true. A protocol error ends the loop
    /// without answering the offending event.
    pub fn run(&mut self, should_stop: &dyn Fn() -> bool) -> Result<()> {
        info!(
            "[DISPATCH] Event loop started on channel {}",
            self.channel.instance_name()
        );

        let result = self.run_loop(should_stop);
        self.handler.finish();

        match &result {
            Ok(()) => info!("[DISPATCH] Event loop stopped"),
            Err(e) => log_critical_error("Console event loop", &e.to_string()),
        }
        result
    }

    fn run_loop(&mut self, should_stop: &dyn Fn() -> bool) -> Result<()> {
        while !should_stop() {
            if self.channel.wait_request(self.poll_interval)? {
                self.dispatch_one(should_stop)?;
            }
        }
        Ok(())
    }

    fn dispatch_one(&mut self, should_stop: &dyn Fn() -> bool) -> Result<()> {
        let event = self.channel.with_envelope(|envelope| envelope.decode_event())?;
        trace!("[DISPATCH] Received {} event", event.kind().name());

        let reply = self.handler.handle(event, should_stop);

        self.channel
            .with_envelope(|envelope| envelope.encode_reply(&reply))?;
        self.channel.signal_response()
    }
}

/// Event policies of a console session.
pub struct SessionHandler {
    queue: Arc<InputQueue>,
    sinks: Arc<EventSinks>,
    output: OutputAssembler,
    wants_progress: bool,
    poll_interval: Duration,
}

impl SessionHandler {
    pub fn new(
        queue: Arc<InputQueue>,
        sinks: Arc<EventSinks>,
        wants_progress: bool,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            sinks,
            output: OutputAssembler::new(),
            wants_progress,
            poll_interval,
        }
    }

    fn print(&mut self, message: &str, from_beginning: bool) {
        for line in self.output.feed(message, from_beginning) {
            self.sinks.emit_line(&line);
        }
    }

    fn input(&mut self, should_stop: &dyn Fn() -> bool) -> EventReply {
        loop {
            if let Some(command) = self.queue.dequeue_if_any() {
                debug!("[INPUT] Answering input prompt with [{}]", command);
                // Local echo of the command.
                self.print(&format!("{}\n", command), false);
                return EventReply::Input {
                    accepted: true,
                    answer: command,
                };
            }
            if should_stop() {
                debug!("[INPUT] Input prompt abandoned");
                return EventReply::Input {
                    accepted: false,
                    answer: String::new(),
                };
            }
            self.queue.wait_for_input(self.poll_interval);
        }
    }

    // There is no surface to ask the operator, so a choice is either let
    // expire or cancelled.
    fn choice(&self, prompt: &ChoicePrompt, should_stop: &dyn Fn() -> bool) -> EventReply {
        if !prompt.timeouting {
            return EventReply::Choice {
                result: prompt.break_value,
            };
        }

        debug!("[DISPATCH] Letting choice time out after {:?}", prompt.timeout);
        let deadline = Instant::now() + prompt.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if should_stop() {
                return EventReply::Choice {
                    result: prompt.break_value,
                };
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
        EventReply::Choice {
            result: prompt.timeouted_value,
        }
    }
}

impl EventHandler for SessionHandler {
    fn handle(&mut self, event: ConsoleEvent, should_stop: &dyn Fn() -> bool) -> EventReply {
        match event {
            ConsoleEvent::Print {
                message,
                from_beginning,
            } => {
                self.print(&message, from_beginning);
                EventReply::Ack
            }
            ConsoleEvent::Input { .. } => self.input(should_stop),
            ConsoleEvent::Choice(prompt) => self.choice(&prompt, should_stop),
            ConsoleEvent::Title { title } => {
                debug!("[DISPATCH] Console title [{}]", title);
                EventReply::Ack
            }
            ConsoleEvent::Init => EventReply::Init {
                input: StdTransport::Pipe,
                output: StdTransport::Pipe,
                wants_progress: self.wants_progress,
            },
            ConsoleEvent::Progress(report) => {
                trace!(
                    "[DISPATCH] File [{}] directory [{}] overall {}% file {}% cps {}",
                    report.file_name,
                    report.directory,
                    report.overall_percent,
                    report.file_percent,
                    report.bytes_per_second
                );
                self.sinks.emit_progress(&TransferProgress::from(&report));
                EventReply::Ack
            }
        }
    }

    fn finish(&mut self) {
        for line in self.output.finish() {
            self.sinks.emit_line(&line);
        }
    }
}
