use log::{debug, info};
use rand::Rng;
use std::collections::HashSet;
use uuid::Uuid;

use super::{Channel, ChannelNames};
use crate::config::{ChannelPrefixes, DEFAULT_MAX_NAME_ATTEMPTS};
use crate::error::{BridgeError, Result};
use crate::protocol::ENVELOPE_SIZE;
use crate::security::Identity;
use crate::sys::{NamedEvent, SharedSegment};

type SaltSource = Box<dyn FnMut() -> u32 + Send>;

/// Picks a free instance name and creates the channel objects under it.
///
/// Names look like `_{pid}_{controller}_{salt}`. The request event is created
/// first with fail-if-exists semantics and decides whether a name is free;
/// any later object already existing means a leak and is fatal.
pub struct ChannelNegotiator {
    prefixes: ChannelPrefixes,
    max_attempts: u32,
    identity: Option<Identity>,
    controller_id: String,
    salt: SaltSource,
    used_names: HashSet<String>,
}

impl ChannelNegotiator {
    pub fn new(prefixes: ChannelPrefixes) -> Self {
        let mut controller_id = Uuid::new_v4().simple().to_string();
        controller_id.truncate(8);
        Self {
            prefixes,
            max_attempts: DEFAULT_MAX_NAME_ATTEMPTS,
            identity: None,
            controller_id,
            salt: Box::new(|| rand::thread_rng().gen_range(0..1000)),
            used_names: HashSet::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Grant `identity` full access to every object created.
    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_salt<F>(mut self, salt: F) -> Self
    where
        F: FnMut() -> u32 + Send + 'static,
    {
        self.salt = Box::new(salt);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_controller_id(mut self, controller_id: &str) -> Self {
        self.controller_id = controller_id.to_string();
        self
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    fn candidate_name(&mut self) -> String {
        format!(
            "_{}_{}_{}",
            std::process::id(),
            self.controller_id,
            (self.salt)()
        )
    }

    pub fn negotiate(&mut self) -> Result<Channel> {
        for attempt in 1..=self.max_attempts {
            let instance = self.candidate_name();
            if self.used_names.contains(&instance) {
                debug!(
                    "[CHANNEL] Instance name {} already used by this controller (attempt {}/{})",
                    instance, attempt, self.max_attempts
                );
                continue;
            }

            let names = ChannelNames::new(&self.prefixes, &instance);
            match NamedEvent::create(&names.request, self.identity.as_ref())? {
                Some(request) => {
                    self.used_names.insert(instance);
                    return self.complete(names, request);
                }
                None => debug!(
                    "[CHANNEL] Event {} already exists (attempt {}/{})",
                    names.request, attempt, self.max_attempts
                ),
            }
        }

        Err(BridgeError::NameCollision {
            attempts: self.max_attempts,
        })
    }

    fn complete(&self, names: ChannelNames, request: NamedEvent) -> Result<Channel> {
        let identity = self.identity.as_ref();
        let response = create_unique_event(&names.response, identity)?;
        let cancel = create_unique_event(&names.cancel, identity)?;
        let segment = SharedSegment::create(&names.mapping, ENVELOPE_SIZE, identity)?;

        let channel = Channel::from_parts(names, request, response, cancel, segment);
        channel.with_envelope(|envelope| envelope.init_header());
        info!(
            "[CHANNEL] Negotiated channel {} ({} bytes shared)",
            channel.instance_name(),
            ENVELOPE_SIZE
        );
        Ok(channel)
    }
}

fn create_unique_event(name: &str, identity: Option<&Identity>) -> Result<NamedEvent> {
    NamedEvent::create(name, identity)?.ok_or_else(|| BridgeError::ResourceExists {
        kind: "event",
        name: name.to_string(),
    })
}
