//! Fixed-capacity rolling window of recent frames.

/// Ring buffer holding the last `capacity` frames of some per-frame state.
///
/// Pushing beyond capacity overwrites the oldest slot in place, so steady
/// state tracking does not reallocate per frame.
#[derive(Debug, Clone)]
pub struct FrameWindow<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> FrameWindow<T> {
    /// Create a window holding up to `capacity` frames. Capacity must be at
    /// least 2 so a previous frame is always available once two are pushed.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "frame window needs capacity >= 2");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Push the newest frame, evicting the oldest when full.
    pub fn push(&mut self, value: T) {
        let capacity = self.capacity();
        self.slots[self.head] = Some(value);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    /// Frame `back` steps behind the newest; `back == 0` is the newest.
    pub fn get_back(&self, back: usize) -> Option<&T> {
        if back >= self.len {
            return None;
        }
        let capacity = self.capacity();
        let index = (self.head + capacity - 1 - back) % capacity;
        self.slots[index].as_ref()
    }

    /// The most recently pushed frame.
    pub fn latest(&self) -> Option<&T> {
        self.get_back(0)
    }

    /// The frame before the newest.
    pub fn previous(&self) -> Option<&T> {
        self.get_back(1)
    }
}
