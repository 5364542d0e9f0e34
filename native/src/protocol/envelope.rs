//! Shared memory layout exchanged with the child.
//!
//! The layout is the wire contract: both sides must agree on every field,
//! capacity and tag value. Bump [`PROTOCOL_VERSION`] on any change.

use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::mem::size_of;
use std::time::Duration;

use super::event::{
    ChoicePrompt, ConsoleEvent, EventKind, EventReply, ProgressEvent, ProgressOperation,
    ProgressSide, StdTransport,
};
use super::text::{read_wide, write_wide};
use crate::error::{ProtocolError, TextError};

pub const PROTOCOL_VERSION: u32 = 0x0001;

/// Bytes reserved for the mapped region.
pub const ENVELOPE_SIZE: usize = 32 * 1024;

// Field capacities in UTF-16 code units, terminating NUL included.
pub const PRINT_CAPACITY: usize = 10240;
pub const INPUT_CAPACITY: usize = 10240;
pub const TITLE_CAPACITY: usize = 10240;
pub const PATH_CAPACITY: usize = 1024;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PrintPayload {
    pub message: [u16; PRINT_CAPACITY],
    pub from_beginning: u8,
    pub error: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputPayload {
    pub echo: u8,
    pub result: u8,
    /// Prompt on the way in, answer on the way out.
    pub text: [u16; INPUT_CAPACITY],
    pub timer: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChoicePayload {
    pub timeouting: u8,
    pub timer: u32,
    pub break_value: i32,
    pub timeouted_value: i32,
    pub result: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TitlePayload {
    pub title: [u16; TITLE_CAPACITY],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct InitPayload {
    pub input_type: u32,
    pub output_type: u32,
    pub wants_progress: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProgressPayload {
    pub operation: u32,
    pub side: u32,
    pub file_name: [u16; PATH_CAPACITY],
    pub directory: [u16; PATH_CAPACITY],
    pub overall_progress: u32,
    pub file_progress: u32,
    pub cps: u32,
    pub cancel: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union EventPayload {
    pub print: PrintPayload,
    pub input: InputPayload,
    pub choice: ChoicePayload,
    pub title: TitlePayload,
    pub init: InitPayload,
    pub progress: ProgressPayload,
}

#[repr(C)]
pub struct RawEnvelope {
    pub size: u32,
    pub version: u32,
    pub event: u32,
    pub payload: EventPayload,
}

const _: () = assert!(size_of::<RawEnvelope>() <= ENVELOPE_SIZE);
const _: () = assert!(INPUT_CAPACITY > 1 && PRINT_CAPACITY > 1 && PATH_CAPACITY > 1);

// Every payload variant is built from integers and integer arrays, so any bit
// pattern in the union is a valid value of any variant. That is what makes the
// `unsafe` union field accesses below sound.

impl RawEnvelope {
    /// Heap-allocated, all-zero envelope for in-process use.
    pub fn zeroed() -> Box<Self> {
        let layout = Layout::new::<Self>();
        // SAFETY: all-zero is a valid RawEnvelope (see above), and the pointer
        // comes from the global allocator with the layout Box expects.
        unsafe {
            let ptr = alloc_zeroed(layout).cast::<Self>();
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        }
    }

    pub fn init_header(&mut self) {
        self.size = size_of::<RawEnvelope>() as u32;
        self.version = PROTOCOL_VERSION;
        self.event = EventKind::None as u32;
    }

    fn check_header(&self) -> Result<(), ProtocolError> {
        if self.size != size_of::<RawEnvelope>() as u32 || self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::HeaderMismatch {
                size: self.size,
                version: self.version,
            });
        }
        Ok(())
    }

    /// Validated tag of the event currently in the envelope.
    pub fn kind(&self) -> Result<EventKind, ProtocolError> {
        self.check_header()?;
        EventKind::try_from(self.event)
    }

    /// Controller side: read the pending event.
    pub fn decode_event(&self) -> Result<ConsoleEvent, ProtocolError> {
        let event = match self.kind()? {
            EventKind::None => return Err(ProtocolError::UnknownEvent(EventKind::None as u32)),
            EventKind::Print => {
                let print = unsafe { &self.payload.print };
                ConsoleEvent::Print {
                    message: read_wide(&print.message),
                    from_beginning: print.from_beginning != 0,
                }
            }
            EventKind::Input => {
                let input = unsafe { &self.payload.input };
                ConsoleEvent::Input {
                    prompt: read_wide(&input.text),
                    echo: input.echo != 0,
                }
            }
            EventKind::Choice => {
                let choice = unsafe { &self.payload.choice };
                ConsoleEvent::Choice(ChoicePrompt {
                    timeouting: choice.timeouting != 0,
                    timeout: Duration::from_millis(u64::from(choice.timer)),
                    break_value: choice.break_value,
                    timeouted_value: choice.timeouted_value,
                })
            }
            EventKind::Title => {
                let title = unsafe { &self.payload.title };
                ConsoleEvent::Title {
                    title: read_wide(&title.title),
                }
            }
            EventKind::Init => ConsoleEvent::Init,
            EventKind::Progress => {
                let progress = unsafe { &self.payload.progress };
                ConsoleEvent::Progress(ProgressEvent {
                    operation: ProgressOperation::from_wire(progress.operation)?,
                    side: ProgressSide::from_wire(progress.side)?,
                    file_name: read_wide(&progress.file_name),
                    directory: read_wide(&progress.directory),
                    overall_percent: progress.overall_progress,
                    file_percent: progress.file_progress,
                    bytes_per_second: progress.cps,
                })
            }
        };
        Ok(event)
    }

    /// Controller side: write the answer for the pending event.
    pub fn encode_reply(&mut self, reply: &EventReply) -> Result<(), ProtocolError> {
        let kind = self.kind()?;
        match (kind, reply) {
            (EventKind::Print | EventKind::Title | EventKind::Progress, EventReply::Ack) => {}
            (EventKind::Input, EventReply::Input { accepted, answer }) => {
                let input = unsafe { &mut self.payload.input };
                if *accepted {
                    write_wide("input answer", &mut input.text, answer)?;
                }
                input.result = u8::from(*accepted);
            }
            (EventKind::Choice, EventReply::Choice { result }) => {
                let choice = unsafe { &mut self.payload.choice };
                choice.result = *result;
            }
            (
                EventKind::Init,
                EventReply::Init {
                    input,
                    output,
                    wants_progress,
                },
            ) => {
                let init = unsafe { &mut self.payload.init };
                init.input_type = *input as u32;
                init.output_type = *output as u32;
                init.wants_progress = u8::from(*wants_progress);
            }
            (kind, _) => return Err(ProtocolError::ReplyMismatch(kind.name())),
        }
        Ok(())
    }

    /// Child side: post an event into the envelope.
    pub fn encode_event(&mut self, event: &ConsoleEvent) -> Result<(), TextError> {
        self.init_header();
        match event {
            ConsoleEvent::Print {
                message,
                from_beginning,
            } => {
                let print = unsafe { &mut self.payload.print };
                write_wide("print message", &mut print.message, message)?;
                print.from_beginning = u8::from(*from_beginning);
                print.error = 0;
            }
            ConsoleEvent::Input { prompt, echo } => {
                let input = unsafe { &mut self.payload.input };
                write_wide("input prompt", &mut input.text, prompt)?;
                input.echo = u8::from(*echo);
                input.result = 0;
                input.timer = 0;
            }
            ConsoleEvent::Choice(prompt) => {
                let choice = unsafe { &mut self.payload.choice };
                choice.timeouting = u8::from(prompt.timeouting);
                choice.timer = u32::try_from(prompt.timeout.as_millis()).unwrap_or(u32::MAX);
                choice.break_value = prompt.break_value;
                choice.timeouted_value = prompt.timeouted_value;
                choice.result = 0;
            }
            ConsoleEvent::Title { title } => {
                let payload = unsafe { &mut self.payload.title };
                write_wide("title", &mut payload.title, title)?;
            }
            ConsoleEvent::Init => {
                let init = unsafe { &mut self.payload.init };
                init.input_type = StdTransport::Off as u32;
                init.output_type = StdTransport::Off as u32;
                init.wants_progress = 0;
            }
            ConsoleEvent::Progress(report) => {
                let progress = unsafe { &mut self.payload.progress };
                write_wide("progress file name", &mut progress.file_name, &report.file_name)?;
                write_wide("progress directory", &mut progress.directory, &report.directory)?;
                progress.operation = report.operation.to_wire();
                progress.side = report.side.to_wire();
                progress.overall_progress = report.overall_percent;
                progress.file_progress = report.file_percent;
                progress.cps = report.bytes_per_second;
                progress.cancel = 0;
            }
        }
        self.event = event.kind() as u32;
        Ok(())
    }

    /// Child side: read the controller's answer to the posted event.
    pub fn decode_reply(&self) -> Result<EventReply, ProtocolError> {
        let reply = match self.kind()? {
            EventKind::None => return Err(ProtocolError::UnknownEvent(EventKind::None as u32)),
            EventKind::Print | EventKind::Title | EventKind::Progress => EventReply::Ack,
            EventKind::Input => {
                let input = unsafe { &self.payload.input };
                let accepted = input.result != 0;
                EventReply::Input {
                    accepted,
                    answer: if accepted {
                        read_wide(&input.text)
                    } else {
                        String::new()
                    },
                }
            }
            EventKind::Choice => EventReply::Choice {
                result: unsafe { self.payload.choice.result },
            },
            EventKind::Init => {
                let init = unsafe { &self.payload.init };
                EventReply::Init {
                    input: StdTransport::try_from(init.input_type)?,
                    output: StdTransport::try_from(init.output_type)?,
                    wants_progress: init.wants_progress != 0,
                }
            }
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapacityError;

    fn envelope_with(event: &ConsoleEvent) -> Box<RawEnvelope> {
        let mut envelope = RawEnvelope::zeroed();
        envelope.encode_event(event).expect("event fits");
        envelope
    }

    #[test]
    fn test_print_event_decodes() {
        let event = ConsoleEvent::Print {
            message: "Connecting...".to_string(),
            from_beginning: true,
        };
        let mut envelope = envelope_with(&event);
        assert_eq!(envelope.decode_event(), Ok(event));

        envelope.encode_reply(&EventReply::Ack).expect("ack");
        assert_eq!(envelope.decode_reply(), Ok(EventReply::Ack));
    }

    #[test]
    fn test_input_answer_overwrites_prompt() {
        let mut envelope = envelope_with(&ConsoleEvent::Input {
            prompt: "winscp> ".to_string(),
            echo: true,
        });
        assert_eq!(
            envelope.decode_event(),
            Ok(ConsoleEvent::Input {
                prompt: "winscp> ".to_string(),
                echo: true,
            })
        );

        let reply = EventReply::Input {
            accepted: true,
            answer: "ls".to_string(),
        };
        envelope.encode_reply(&reply).expect("answer fits");
        assert_eq!(envelope.decode_reply(), Ok(reply));
    }

    #[test]
    fn test_rejected_input_reads_back_empty() {
        let mut envelope = envelope_with(&ConsoleEvent::Input {
            prompt: "prompt".to_string(),
            echo: false,
        });
        envelope
            .encode_reply(&EventReply::Input {
                accepted: false,
                answer: String::new(),
            })
            .expect("reply");
        assert_eq!(
            envelope.decode_reply(),
            Ok(EventReply::Input {
                accepted: false,
                answer: String::new(),
            })
        );
    }

    #[test]
    fn test_init_reply() {
        let mut envelope = envelope_with(&ConsoleEvent::Init);
        let reply = EventReply::Init {
            input: StdTransport::Pipe,
            output: StdTransport::Pipe,
            wants_progress: true,
        };
        envelope.encode_reply(&reply).expect("reply");
        assert_eq!(envelope.decode_reply(), Ok(reply));
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let mut envelope = envelope_with(&ConsoleEvent::Init);
        envelope.event = 77;
        assert_eq!(envelope.decode_event(), Err(ProtocolError::UnknownEvent(77)));
    }

    #[test]
    fn test_header_mismatch_is_fatal() {
        let mut envelope = envelope_with(&ConsoleEvent::Init);
        envelope.version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            envelope.decode_event(),
            Err(ProtocolError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_progress_side_is_fatal() {
        let mut envelope = envelope_with(&ConsoleEvent::Progress(ProgressEvent {
            operation: ProgressOperation::Transfer,
            side: ProgressSide::Remote,
            file_name: "file.bin".to_string(),
            directory: "/home".to_string(),
            overall_percent: 10,
            file_percent: 20,
            bytes_per_second: 100,
        }));
        envelope.payload.progress.side = 9;
        assert_eq!(envelope.decode_event(), Err(ProtocolError::UnknownSide(9)));
    }

    #[test]
    fn test_reply_must_match_event() {
        let mut envelope = envelope_with(&ConsoleEvent::Title {
            title: "session".to_string(),
        });
        assert_eq!(
            envelope.encode_reply(&EventReply::Choice { result: 1 }),
            Err(ProtocolError::ReplyMismatch("title"))
        );
    }

    #[test]
    fn test_oversized_print_is_rejected() {
        let mut envelope = RawEnvelope::zeroed();
        let message = "x".repeat(PRINT_CAPACITY);
        let err = envelope
            .encode_event(&ConsoleEvent::Print {
                message,
                from_beginning: false,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            TextError::Capacity(CapacityError { capacity, .. }) if capacity == PRINT_CAPACITY
        ));
    }

    #[test]
    fn test_answer_with_nul_is_rejected() {
        let mut envelope = envelope_with(&ConsoleEvent::Input {
            prompt: "> ".to_string(),
            echo: true,
        });
        let err = envelope
            .encode_reply(&EventReply::Input {
                accepted: true,
                answer: "rm a\0b".to_string(),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Text(TextError::EmbeddedNul { position: 4, .. })
        ));
    }
}
