//! Append-only hash-consing table.
//!
//! Values are stored once and addressed by a stable index. Cell `0` is a
//! sentry, so valid indices start at `1` and `0` doubles as the "empty"
//! marker in bucket chains.

use std::cmp::min;
use std::ops::Index;

use crate::utils::MyHash;

#[derive(Clone)]
struct Entry<T> {
    value: T,
    next: usize,
}

impl<T> Entry<T> {
    fn new(value: T) -> Self {
        Self { value, next: 0 }
    }
}

pub struct Table<T> {
    data: Vec<Entry<T>>,

    buckets: Vec<usize>,
    bitmask: u64,
}

impl<T> Table<T>
where
    T: Default,
{
    /// Create a new table with `2^min(bits, 16)` buckets.
    ///
    /// The table itself grows on demand; `bits` only sizes the bucket array
    /// and the initial allocation.
    pub fn new(bits: usize) -> Self {
        assert!(bits <= 31, "Table bits should be in the range 0..=31");

        let mut data = Vec::with_capacity(1 << min(bits, 20));
        data.push(Entry::new(T::default())); // Sentry.

        let buckets_bits = min(bits, 16);
        let buckets_size = 1 << buckets_bits;
        let buckets = vec![0; buckets_size];
        let bitmask = (buckets_size - 1) as u64;

        Self {
            data,
            buckets,
            bitmask,
        }
    }
}

impl<T> Table<T> {
    /// Number of stored values (the sentry excluded).
    pub fn len(&self) -> usize {
        self.data.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the reference to the value at the given index.
    pub fn value(&self, index: usize) -> &T {
        assert_ne!(index, 0, "Index is 0");
        assert!(index < self.data.len(), "Index {} is not allocated", index);
        &self.data[index].value
    }

    /// Get the index of the next cell in the same bucket chain.
    pub fn next(&self, index: usize) -> usize {
        assert_ne!(index, 0, "Index is 0");
        self.data[index].next
    }

    fn set_next(&mut self, index: usize, next: usize) {
        assert_ne!(index, 0, "Index is 0");
        self.data[index].next = next;
    }

    fn add(&mut self, value: T) -> usize {
        self.data.push(Entry::new(value));
        self.data.len() - 1
    }
}

impl<T> Table<T>
where
    T: MyHash,
{
    fn bucket_index(&self, value: &T) -> usize {
        (value.hash() & self.bitmask) as usize
    }

    /// Find the index of a value equal to `value`, if it was stored before.
    pub fn find(&self, value: &T) -> Option<usize>
    where
        T: Eq,
    {
        let mut index = self.buckets[self.bucket_index(value)];
        while index != 0 {
            if value == self.value(index) {
                return Some(index);
            }
            index = self.next(index);
        }
        None
    }

    /// Put a value into the table and return its index.
    ///
    /// Equal values always get the same index.
    pub fn put(&mut self, value: T) -> usize
    where
        T: Eq,
    {
        let bucket_index = self.bucket_index(&value);
        let mut index = self.buckets[bucket_index];

        if index == 0 {
            // First value in this bucket.
            let i = self.add(value);
            self.buckets[bucket_index] = i;
            return i;
        }

        loop {
            if &value == self.value(index) {
                // Already stored.
                return index;
            }

            let next = self.next(index);

            if next == 0 {
                // Append to the bucket chain.
                let i = self.add(value);
                self.set_next(index, i);
                return i;
            } else {
                index = next;
            }
        }
    }
}

impl<T> Index<usize> for Table<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        self.value(index)
    }
}
