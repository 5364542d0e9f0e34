use log::debug;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::protocol::text::{find_nul, wide_len};
use crate::protocol::INPUT_CAPACITY;

/// Commands waiting to be handed to the child on its next Input event.
#[derive(Debug, Default)]
pub struct InputQueue {
    items: Mutex<VecDeque<String>>,
    available: Condvar,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a command. Text that cannot fit the Input payload, or that the
    /// child would read only up to an embedded NUL, is rejected and the queue
    /// is left as it was.
    pub fn enqueue(&self, text: &str) -> Result<()> {
        if let Some(position) = find_nul(text) {
            return Err(BridgeError::InputContainsNul { position });
        }
        if wide_len(text) >= INPUT_CAPACITY {
            return Err(BridgeError::InputTooLong {
                text: text.to_string(),
                limit: INPUT_CAPACITY - 1,
            });
        }

        let mut items = self.lock();
        items.push_back(text.to_string());
        debug!("[INPUT] Queued command ({} pending)", items.len());
        drop(items);

        self.available.notify_all();
        Ok(())
    }

    pub fn dequeue_if_any(&self) -> Option<String> {
        self.lock().pop_front()
    }

    /// Block until the queue is non-empty or `timeout` passes.
    /// Returns whether input is available.
    pub fn wait_for_input(&self, timeout: Duration) -> bool {
        let items = self.lock();
        let (items, _) = self
            .available
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
