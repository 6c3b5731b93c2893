/// Fixed-size circular buffer with independent write and read cursors.
///
/// Occupancy is tracked by the semaphores around it, not here: callers only
/// push into a slot they hold an empty-slot token for and only pop a slot
/// they hold a filled-slot token for.
#[derive(Debug)]
pub(crate) struct Ring<T> {
    slots: Box<[Option<T>]>,
    write: usize,
    read: usize,
}

impl<T> Ring<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            write: 0,
            read: 0,
        }
    }

    /// Stores `item` at the write cursor, returning the slot it went to.
    pub(crate) fn push(&mut self, item: T) -> usize {
        let pos = self.write;
        self.slots[pos] = Some(item);
        self.write = (pos + 1) % self.slots.len();
        pos
    }

    /// Takes the item under the read cursor together with its slot.
    pub(crate) fn pop(&mut self) -> Option<(T, usize)> {
        let pos = self.read;
        let item = self.slots[pos].take()?;
        self.read = (pos + 1) % self.slots.len();
        Some((item, pos))
    }

    pub(crate) fn read_cursor(&self) -> usize {
        self.read
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}
