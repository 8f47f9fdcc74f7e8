/// Index bookkeeping for a fixed-capacity circular buffer.
///
/// `head` is the first occupied slot, `tail` the next free slot after the
/// last occupied one. Every method returns the slot index it touched, or
/// `None` when the ring is full (push) or empty (pop/peek), leaving the
/// indices untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Ring {
    pub head: usize,
    pub tail: usize,
    pub count: usize,
    pub capacity: usize,
}

impl Ring {
    pub fn new(capacity: usize) -> Ring {
        Ring {
            head: 0,
            tail: 0,
            count: 0,
            capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    /// Checks indices read back from shared memory.
    pub fn is_consistent(&self) -> bool {
        self.capacity > 0
            && self.head < self.capacity
            && self.tail < self.capacity
            && self.count <= self.capacity
            && (self.head + self.count) % self.capacity == self.tail
    }

    #[inline]
    fn next(&self, index: usize) -> usize {
        (index + 1) % self.capacity
    }

    #[inline]
    fn prev(&self, index: usize) -> usize {
        if index == 0 {
            self.capacity - 1
        } else {
            index - 1
        }
    }

    pub fn push_back(&mut self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let slot = self.tail;
        self.tail = self.next(self.tail);
        self.count += 1;
        Some(slot)
    }

    pub fn push_front(&mut self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        self.head = self.prev(self.head);
        self.count += 1;
        Some(self.head)
    }

    pub fn pop_front(&mut self) -> Option<usize> {
        let slot = self.front()?;
        self.head = self.next(self.head);
        self.count -= 1;
        Some(slot)
    }

    pub fn pop_back(&mut self) -> Option<usize> {
        let slot = self.back()?;
        self.tail = slot;
        self.count -= 1;
        Some(slot)
    }

    pub fn front(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.head)
        }
    }

    pub fn back(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.prev(self.tail))
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }
}
