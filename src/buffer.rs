//! Fixed-capacity receive buffer with explicit consumed/pending regions.
//!
//! ```text
//! [ consumed | pending | spare ]
//! 0       consumed   filled   capacity
//! ```
//!
//! Bytes are appended at `filled` and released at `consumed`; neither cursor
//! ever moves backwards until [`ReadBuffer::clear`] recycles the whole buffer
//! for the next request on a kept-alive connection.

#[derive(Debug)]
pub struct ReadBuffer {
    data: Vec<u8>,
    capacity: usize,
    filled: usize,
    consumed: usize,
}

impl ReadBuffer {
    /// Storage is allocated on first write so idle slots cost nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            filled: 0,
            consumed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn is_full(&self) -> bool {
        self.filled >= self.capacity
    }

    /// Writable tail; follow a successful read with [`ReadBuffer::commit`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.data.len() < self.capacity {
            self.data.resize(self.capacity, 0);
        }
        &mut self.data[self.filled..self.capacity]
    }

    pub fn commit(&mut self, n: usize) {
        assert!(
            self.filled + n <= self.capacity,
            "commit past buffer capacity"
        );
        self.filled += n;
    }

    /// Received bytes not yet consumed.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.consumed..self.filled]
    }

    /// Bytes between two absolute offsets, both within the filled region.
    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        assert!(start <= end && end <= self.filled, "slice outside filled region");
        &self.data[start..end]
    }

    /// Mark `n` pending bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        assert!(
            self.consumed + n <= self.filled,
            "consume past received bytes"
        );
        self.consumed += n;
    }

    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    pub fn clear(&mut self) {
        self.filled = 0;
        self.consumed = 0;
    }
}
