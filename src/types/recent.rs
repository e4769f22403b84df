use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// The most recent `capacity` idempotency keys, each with the position it was
/// first seen at. The oldest key is forgotten first.
#[derive(Debug, Clone)]
pub struct RecentKeys {
    capacity: usize,
    order: VecDeque<Uuid>,
    positions: HashMap<Uuid, u64>,
}

impl RecentKeys {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(4096)),
            positions: HashMap::new(),
        }
    }

    /// Rebuild from `(key, position)` pairs, oldest first.
    pub fn from_entries(capacity: usize, entries: impl IntoIterator<Item = (Uuid, u64)>) -> Self {
        let mut keys = Self::new(capacity);
        for (key, position) in entries {
            keys.insert(key, position);
        }
        keys
    }

    /// Remember `key`. Returns false if it is already remembered.
    pub fn insert(&mut self, key: Uuid, position: u64) -> bool {
        if self.positions.contains_key(&key) {
            return false;
        }
        self.order.push_back(key);
        self.positions.insert(key, position);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.positions.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, key: &Uuid) -> bool {
        self.positions.contains_key(key)
    }

    pub fn position(&self, key: &Uuid) -> Option<u64> {
        self.positions.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<(Uuid, u64)> {
        self.order
            .iter()
            .filter_map(|k| self.positions.get(k).map(|p| (*k, *p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_key_is_forgotten_first() {
        let mut keys = RecentKeys::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(keys.insert(a, 1));
        assert!(keys.insert(b, 2));
        assert!(!keys.insert(a, 9));
        assert_eq!(keys.position(&a), Some(1));

        assert!(keys.insert(c, 3));
        assert_eq!(keys.len(), 2);
        assert!(!keys.contains(&a));
        assert_eq!(keys.entries(), vec![(b, 2), (c, 3)]);
    }

    #[test]
    fn test_rebuild_keeps_only_the_newest() {
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let keys = RecentKeys::from_entries(3, ids.iter().copied().zip(1..));
        assert_eq!(keys.len(), 3);
        assert!(!keys.contains(&ids[1]));
        assert_eq!(keys.position(&ids[4]), Some(5));
    }
}
