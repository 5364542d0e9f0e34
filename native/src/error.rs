use thiserror::Error;

/// A text value that does not fit its fixed-capacity envelope field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field} is too long ({length} code units, {capacity} limit)")]
pub struct CapacityError {
    pub field: &'static str,
    pub length: usize,
    pub capacity: usize,
}

/// A text value that cannot be stored in an envelope field unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TextError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error("{field} contains a NUL character at position {position}")]
    EmbeddedNul {
        field: &'static str,
        position: usize,
    },
}

/// Envelope contents that break the controller/child contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown console event {0}")]
    UnknownEvent(u32),
    #[error("Envelope header mismatch (size {size}, version {version})")]
    HeaderMismatch { size: u32, version: u32 },
    #[error("Unknown progress operation {0}")]
    UnknownOperation(u32),
    #[error("Unknown progress side {0}")]
    UnknownSide(u32),
    #[error("Unknown std transport {0}")]
    UnknownTransport(u32),
    #[error("Reply does not match {0} event")]
    ReplyMismatch(&'static str),
    #[error(transparent)]
    Text(#[from] TextError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config directory not accessible")]
    ConfigDirError,
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Cannot find unique name for event object after {attempts} attempts")]
    NameCollision { attempts: u32 },
    #[error("{kind} {name} already exists")]
    ResourceExists { kind: &'static str, name: String },
    #[error("Cannot create {kind} {name}: {source}")]
    ResourceCreation {
        kind: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot open {kind} {name}: {source}")]
    ResourceOpen {
        kind: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Error resolving account {user}: {reason}")]
    IdentityResolution { user: String, reason: String },
    #[error("Error granting access to {target}: {reason}")]
    AccessGrant { target: String, reason: String },
    #[error("Cannot start {executable}: {reason}")]
    Spawn { executable: String, reason: String },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Text(#[from] TextError),
    #[error("Input [{text}] is too long ({limit} limit)")]
    InputTooLong { text: String, limit: usize },
    #[error("Input contains a NUL character at position {position}")]
    InputContainsNul { position: usize },
    #[error("No response from controller within {0:?}")]
    ResponseTimeout(std::time::Duration),
    #[error("Session already started")]
    AlreadyStarted,
    #[error("Session not started")]
    NotStarted,
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
