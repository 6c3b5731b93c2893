use std::{fmt, sync::Arc};

use log::trace;
use semaphore::{primitives::Lock, Semaphore};

use crate::ring::Ring;

/// One subscriber's private view of the broadcast stream.
pub(crate) struct Channel<T> {
    id: u64,
    ring: Lock<Ring<T>>,
    // free slots, starts full
    empty_slots: Semaphore,
    // buffered items, starts empty
    filled_slots: Semaphore,
}

impl<T> Channel<T> {
    pub(crate) fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            ring: Lock::new(Ring::new(capacity))
                .unwrap_or_else(|e| panic!("creating subscriber {id}: {e:#}")),
            empty_slots: Semaphore::full(format!("subscriber-{id}-empty"), capacity),
            filled_slots: Semaphore::empty(format!("subscriber-{id}-filled"), capacity),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Parks until there is room, then buffers `item`. Returns `false` if the
    /// channel was closed before room appeared; the item is dropped then.
    pub(crate) fn deliver(&self, item: T) -> bool {
        if !self.empty_slots.acquire() {
            return false;
        }
        let pos = self.ring.lock().push(item);
        trace!("subscriber {}: buffered item at {pos}", self.id);
        self.filled_slots.release();
        true
    }

    fn take(&self) -> Option<(T, usize)> {
        if !self.filled_slots.acquire() {
            return None;
        }
        self.pop()
    }

    fn try_take(&self) -> Option<(T, usize)> {
        match self.filled_slots.try_acquire() {
            Some(true) => self.pop(),
            Some(false) | None => None,
        }
    }

    // caller holds a filled-slot token
    fn pop(&self) -> Option<(T, usize)> {
        let taken = self.ring.lock().pop();
        self.empty_slots.release();
        taken
    }

    /// Abandons buffered items and wakes both a parked reader and a parked
    /// publisher.
    pub(crate) fn close(&self) {
        self.empty_slots.close();
        self.filled_slots.close();
        self.ring.lock().clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        !self.filled_slots.is_valid()
    }

    // closing keeps the tokens but clears the ring, so count nothing then
    fn buffered(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.filled_slots.available()
    }
}

/// Handle returned by [`crate::BroadcastQueue::subscribe`].
///
/// Reads this subscriber's copy of the stream in publish order. Cloning the
/// handle shares the same buffer; it does not create a new subscriber.
pub struct Subscriber<T> {
    pub(crate) channel: Arc<Channel<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<T> Subscriber<T> {
    pub(crate) fn new(channel: Arc<Channel<T>>) -> Self {
        Self { channel }
    }

    pub fn id(&self) -> u64 {
        self.channel.id
    }

    /// Takes the next item and the ring slot it was read from, parking while
    /// nothing is buffered.
    ///
    /// Returns `None` once the subscriber has been closed, including when the
    /// close happens while this call is parked.
    pub fn read(&self) -> Option<(T, usize)> {
        self.channel.take()
    }

    /// Like [`Subscriber::read`] but returns `None` instead of parking.
    pub fn try_read(&self) -> Option<(T, usize)> {
        self.channel.try_take()
    }

    /// Slot the next [`Subscriber::read`] will take from.
    pub fn position(&self) -> usize {
        self.channel.ring.lock().read_cursor()
    }

    pub fn capacity(&self) -> usize {
        self.channel.ring.lock().capacity()
    }

    /// Items published to this subscriber and not read yet.
    pub fn buffered(&self) -> usize {
        self.channel.buffered()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id())
            .field("buffered", &self.buffered())
            .field("closed", &self.is_closed())
            .finish()
    }
}
