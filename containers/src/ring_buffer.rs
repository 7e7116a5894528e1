/// A fixed capacity FIFO ring buffer.
///
/// Entries are pushed at the write head and popped from the read head. Storage is allocated once
/// and recycled, the buffer never grows.
#[derive(Debug)]
pub struct RingBuffer<T> {
    entries: Vec<Option<T>>,
    read: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "Ring buffer capacity must be non-zero");
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            read: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Position of the write head in the backing storage.
    pub fn write_head(&self) -> usize {
        (self.read + self.len) % self.capacity()
    }

    pub fn read_head(&self) -> usize {
        self.read
    }

    /// Pushes at the write head, handing the element back when the buffer is full.
    pub fn push_back(&mut self, element: T) -> Result<(), T> {
        if self.is_full() {
            return Err(element);
        }
        let write = self.write_head();
        self.entries[write] = Some(element);
        self.len += 1;
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let element = self.entries[self.read].take();
        self.read = (self.read + 1) % self.capacity();
        self.len -= 1;
        element
    }

    /// Element `index` positions after the read head.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.entries[(self.read + index) % self.capacity()].as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        let capacity = self.capacity();
        self.entries[(self.read + index) % capacity].as_mut()
    }

    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |index| self.get(index))
    }
}
