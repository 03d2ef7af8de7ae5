use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Capped list that evicts the oldest entry once full
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedLog<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::new(),
        }
    }

    /// Append an entry, returning whatever was evicted to make room
    pub fn push(&mut self, item: T) -> Vec<T> {
        self.items.push_back(item);
        let mut evicted = Vec::new();
        while self.items.len() > self.capacity {
            if let Some(old) = self.items.pop_front() {
                evicted.push(old);
            }
        }
        evicted
    }

    /// Change the cap, trimming the oldest entries if needed
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<T> {
        self.capacity = capacity;
        let mut evicted = Vec::new();
        while self.items.len() > self.capacity {
            if let Some(old) = self.items.pop_front() {
                evicted.push(old);
            }
        }
        evicted
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.items.iter_mut()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Remove and return every entry matching the predicate, keeping order
    pub fn drain_where<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut kept = VecDeque::with_capacity(self.items.len());
        let mut removed = Vec::new();
        for item in self.items.drain(..) {
            if pred(&item) {
                removed.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        removed
    }
}

impl<T: Clone> BoundedLog<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest() {
        let mut log = BoundedLog::new(3);
        for i in 0..5 {
            log.push(i);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn test_push_reports_evicted() {
        let mut log = BoundedLog::new(1);
        assert!(log.push("a").is_empty());
        assert_eq!(log.push("b"), vec!["a"]);
        assert_eq!(log.last(), Some(&"b"));
    }

    #[test]
    fn test_drain_where_keeps_order() {
        let mut log = BoundedLog::new(10);
        for i in 0..6 {
            log.push(i);
        }
        let evens = log.drain_where(|i| i % 2 == 0);
        assert_eq!(evens, vec![0, 2, 4]);
        assert_eq!(log.to_vec(), vec![1, 3, 5]);
    }

    #[test]
    fn test_shrink_capacity() {
        let mut log = BoundedLog::new(5);
        for i in 0..5 {
            log.push(i);
        }
        assert_eq!(log.set_capacity(2), vec![0, 1, 2]);
        assert_eq!(log.to_vec(), vec![3, 4]);
    }
}
