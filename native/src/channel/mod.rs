//! The named objects shared by controller and child: request, response and
//! cancel signals plus the shared envelope.

mod negotiate;

pub use negotiate::ChannelNegotiator;

use log::{debug, info, warn};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::config::ChannelPrefixes;
use crate::error::{BridgeError, Result};
use crate::protocol::{RawEnvelope, ENVELOPE_SIZE};
use crate::sys::{object_name, NamedEvent, SharedSegment};

/// Object names derived from one instance name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub instance: String,
    pub mapping: String,
    pub request: String,
    pub response: String,
    pub cancel: String,
    pub job: String,
}

impl ChannelNames {
    pub fn new(prefixes: &ChannelPrefixes, instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            mapping: object_name(&prefixes.mapping, instance),
            request: object_name(&prefixes.request, instance),
            response: object_name(&prefixes.response, instance),
            cancel: object_name(&prefixes.cancel, instance),
            job: object_name(&prefixes.job, instance),
        }
    }
}

/// One negotiated channel. Fields drop in declaration order, which is the
/// teardown order: request, response, cancel, then the segment.
pub struct Channel {
    request: NamedEvent,
    response: NamedEvent,
    cancel: NamedEvent,
    segment: SharedSegment,
    envelope_lock: Mutex<()>,
    names: ChannelNames,
}

impl Channel {
    pub(crate) fn from_parts(
        names: ChannelNames,
        request: NamedEvent,
        response: NamedEvent,
        cancel: NamedEvent,
        segment: SharedSegment,
    ) -> Self {
        Self {
            request,
            response,
            cancel,
            segment,
            envelope_lock: Mutex::new(()),
            names,
        }
    }

    /// Open the objects of an existing channel from the child side.
    pub fn attach(instance: &str, prefixes: &ChannelPrefixes) -> Result<Self> {
        let names = ChannelNames::new(prefixes, instance);
        let request = NamedEvent::open(&names.request)?;
        let response = NamedEvent::open(&names.response)?;
        let cancel = NamedEvent::open(&names.cancel)?;
        let segment = SharedSegment::open(&names.mapping, ENVELOPE_SIZE)?;
        debug!("[CHANNEL] Attached to channel {}", instance);
        Ok(Self::from_parts(names, request, response, cancel, segment))
    }

    pub fn instance_name(&self) -> &str {
        &self.names.instance
    }

    pub fn names(&self) -> &ChannelNames {
        &self.names
    }

    /// Run `f` with exclusive access to the envelope.
    pub(crate) fn with_envelope<R>(&self, f: impl FnOnce(&mut RawEnvelope) -> R) -> R {
        let _guard = self
            .envelope_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // SAFETY: the segment is ENVELOPE_SIZE bytes, page aligned and checked
        // at compile time to hold a RawEnvelope. Any bit pattern is a valid
        // RawEnvelope. In-process access is serialized by envelope_lock and
        // cross-process access by the request/response handshake.
        let envelope = unsafe { &mut *self.segment.as_ptr().cast::<RawEnvelope>() };
        f(envelope)
    }

    pub(crate) fn wait_request(&self, timeout: Duration) -> Result<bool> {
        self.request.wait(timeout)
    }

    pub(crate) fn signal_request(&self) -> Result<()> {
        self.request.set()
    }

    pub(crate) fn wait_response(&self, timeout: Duration) -> Result<bool> {
        self.response.wait(timeout)
    }

    pub(crate) fn signal_response(&self) -> Result<()> {
        self.response.set()
    }

    pub(crate) fn signal_cancel(&self) -> Result<()> {
        self.cancel.set()
    }

    pub(crate) fn cancel_requested(&self) -> Result<bool> {
        self.cancel.wait(Duration::ZERO)
    }

    /// Release every object in order. With `verify`, check afterwards that
    /// each name is free again; the outcome is only logged.
    pub fn close(self, verify: bool) {
        let names = self.names.clone();
        drop(self);
        info!("[CHANNEL] Channel {} closed", names.instance);

        if verify {
            verify_event_released(&names.request);
            verify_event_released(&names.response);
            verify_event_released(&names.cancel);
            verify_segment_released(&names.mapping);
        }
    }
}

fn verify_event_released(name: &str) {
    match NamedEvent::create(name, None) {
        Ok(Some(_event)) => debug!("[CHANNEL] Event {} was released", name),
        Ok(None) => warn!("[CHANNEL] Event {} is still open", name),
        Err(e) => warn!("[CHANNEL] Cannot verify event {}: {}", name, e),
    }
}

fn verify_segment_released(name: &str) {
    match SharedSegment::create(name, ENVELOPE_SIZE, None) {
        Ok(_segment) => debug!("[CHANNEL] Shared memory {} was released", name),
        Err(BridgeError::ResourceExists { .. }) => {
            warn!("[CHANNEL] Shared memory {} is still open", name)
        }
        Err(e) => warn!("[CHANNEL] Cannot verify shared memory {}: {}", name, e),
    }
}
