// Typed console events and the replies the controller writes back.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ProtocolError;

/// Discriminator stored in the envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    None = 0,
    Print = 1,
    Input = 2,
    Choice = 3,
    Title = 4,
    Init = 5,
    Progress = 6,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::None => "none",
            EventKind::Print => "print",
            EventKind::Input => "input",
            EventKind::Choice => "choice",
            EventKind::Title => "title",
            EventKind::Init => "init",
            EventKind::Progress => "progress",
        }
    }
}

impl TryFrom<u32> for EventKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventKind::None),
            1 => Ok(EventKind::Print),
            2 => Ok(EventKind::Input),
            3 => Ok(EventKind::Choice),
            4 => Ok(EventKind::Title),
            5 => Ok(EventKind::Init),
            6 => Ok(EventKind::Progress),
            other => Err(ProtocolError::UnknownEvent(other)),
        }
    }
}

/// How the child should treat its standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum StdTransport {
    Off = 0,
    Console = 1,
    Binary = 2,
    Pipe = 3,
}

impl TryFrom<u32> for StdTransport {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StdTransport::Off),
            1 => Ok(StdTransport::Console),
            2 => Ok(StdTransport::Binary),
            3 => Ok(StdTransport::Pipe),
            other => Err(ProtocolError::UnknownTransport(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressOperation {
    Transfer,
}

impl ProgressOperation {
    pub(crate) fn from_wire(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(ProgressOperation::Transfer),
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }

    pub(crate) fn to_wire(self) -> u32 {
        match self {
            ProgressOperation::Transfer => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressSide {
    Local,
    Remote,
}

impl ProgressSide {
    pub(crate) fn from_wire(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(ProgressSide::Local),
            1 => Ok(ProgressSide::Remote),
            other => Err(ProtocolError::UnknownSide(other)),
        }
    }

    pub(crate) fn to_wire(self) -> u32 {
        match self {
            ProgressSide::Local => 0,
            ProgressSide::Remote => 1,
        }
    }
}

/// Choice prompt as posted by the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoicePrompt {
    pub timeouting: bool,
    pub timeout: Duration,
    pub break_value: i32,
    pub timeouted_value: i32,
}

/// Raw progress report, percentages in whole percent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub operation: ProgressOperation,
    pub side: ProgressSide,
    pub file_name: String,
    pub directory: String,
    pub overall_percent: u32,
    pub file_percent: u32,
    pub bytes_per_second: u32,
}

/// One event occupying the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Print { message: String, from_beginning: bool },
    Input { prompt: String, echo: bool },
    Choice(ChoicePrompt),
    Title { title: String },
    Init,
    Progress(ProgressEvent),
}

impl ConsoleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConsoleEvent::Print { .. } => EventKind::Print,
            ConsoleEvent::Input { .. } => EventKind::Input,
            ConsoleEvent::Choice(_) => EventKind::Choice,
            ConsoleEvent::Title { .. } => EventKind::Title,
            ConsoleEvent::Init => EventKind::Init,
            ConsoleEvent::Progress(_) => EventKind::Progress,
        }
    }
}

/// Controller answer written back into the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventReply {
    /// Print, Title and Progress carry no out-fields.
    Ack,
    Input { accepted: bool, answer: String },
    Choice { result: i32 },
    Init {
        input: StdTransport,
        output: StdTransport,
        wants_progress: bool,
    },
}

/// Side-neutral progress notification handed to the progress sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub operation: ProgressOperation,
    pub side: ProgressSide,
    pub file_name: String,
    pub directory: String,
    /// 0.0 to 1.0
    pub overall_progress: f64,
    /// 0.0 to 1.0
    pub file_progress: f64,
    pub bytes_per_second: u32,
}

impl From<&ProgressEvent> for TransferProgress {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            operation: event.operation,
            side: event.side,
            file_name: event.file_name.clone(),
            directory: event.directory.clone(),
            overall_progress: f64::from(event.overall_percent) / 100.0,
            file_progress: f64::from(event.file_percent) / 100.0,
            bytes_per_second: event.bytes_per_second,
        }
    }
}
