//! Child side of a channel: post one event, wait for the controller's reply.

use log::debug;
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::config::ChannelPrefixes;
use crate::error::{BridgeError, Result};
use crate::protocol::{ConsoleEvent, EventReply};

const RESPONSE_POLL: Duration = Duration::from_millis(100);

pub struct ConsoleClient {
    channel: Channel,
    response_timeout: Option<Duration>,
}

impl ConsoleClient {
    pub fn attach(instance: &str, prefixes: &ChannelPrefixes) -> Result<Self> {
        Ok(Self {
            channel: Channel::attach(instance, prefixes)?,
            response_timeout: None,
        })
    }

    /// Give up on a reply after `timeout`. `None` waits as long as it takes,
    /// which Input events may need.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn instance_name(&self) -> &str {
        self.channel.instance_name()
    }

    /// Post `event` and block until the controller answers it.
    pub fn send(&self, event: &ConsoleEvent) -> Result<EventReply> {
        self.channel
            .with_envelope(|envelope| envelope.encode_event(event))?;
        self.exchange()?;
        Ok(self
            .channel
            .with_envelope(|envelope| envelope.decode_reply())?)
    }

    #[cfg(test)]
    pub(crate) fn send_raw(
        &self,
        fill: impl FnOnce(&mut crate::protocol::RawEnvelope),
    ) -> Result<()> {
        self.channel.with_envelope(fill);
        self.exchange()
    }

    fn exchange(&self) -> Result<()> {
        self.channel.signal_request()?;

        let started = Instant::now();
        loop {
            let slice = match self.response_timeout {
                Some(timeout) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(BridgeError::ResponseTimeout(timeout));
                    }
                    RESPONSE_POLL.min(timeout - elapsed)
                }
                None => RESPONSE_POLL,
            };
            if self.channel.wait_response(slice)? {
                return Ok(());
            }
        }
    }

    /// Whether the controller asked the child to cancel. Consumes the signal.
    pub fn cancel_requested(&self) -> Result<bool> {
        let cancelled = self.channel.cancel_requested()?;
        if cancelled {
            debug!("[CHANNEL] Cancel requested by controller");
        }
        Ok(cancelled)
    }
}

/// Value of `switch=value` among `args`, as passed to the child.
pub fn instance_from_args<I, S>(args: I, switch: &str) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let prefix = format!("{}=", switch);
    args.into_iter()
        .find_map(|arg| arg.as_ref().strip_prefix(&prefix).map(str::to_string))
}
