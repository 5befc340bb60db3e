//! Buffer items until a readiness point, then hand them over exactly once.
//!
//! Used for outbound signalling messages (held while the channel is not
//! connected) and for remote ICE candidates (held until the remote answer is
//! applied).

use std::collections::VecDeque;

#[derive(Debug)]
pub struct ReadyBuffer<T> {
    pending: VecDeque<T>,
    ready: bool,
}

impl<T> Default for ReadyBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadyBuffer<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            ready: false,
        }
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Offer an item. Returns it back when the buffer is ready, meaning the
    /// caller should deliver it immediately; otherwise it is held.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.ready {
            Some(item)
        } else {
            self.pending.push_back(item);
            None
        }
    }

    /// Mark ready and take everything held so far, in arrival order.
    pub fn open(&mut self) -> Vec<T> {
        self.ready = true;
        self.pending.drain(..).collect()
    }

    /// Return to buffering. `unsent` items go back to the front, ahead of
    /// anything buffered since, preserving the original order.
    pub fn pause<I>(&mut self, unsent: I)
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: DoubleEndedIterator,
    {
        self.ready = false;
        for item in unsent.into_iter().rev() {
            self.pending.push_front(item);
        }
    }

    /// Drop everything and return to the initial buffering state.
    pub fn clear(&mut self) {
        self.ready = false;
        self.pending.clear();
    }
}
