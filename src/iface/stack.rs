use core::fmt;

use heapless::Vec;

use crate::config::IFACE_STACK_ENTRY_COUNT;
use crate::phy::IfIndex;

/// Error returned by [`InterfaceStack`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    TableFull,
    Exists,
    NotFound,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StackError::TableFull => write!(f, "interface stack full"),
            StackError::Exists => write!(f, "stack entry exists"),
            StackError::NotFound => write!(f, "stack entry not found"),
        }
    }
}

impl core::error::Error for StackError {}

/// A layering relation: `lower` carries traffic for `higher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEntry {
    pub higher: IfIndex,
    pub lower: IfIndex,
    /// The lower layer has joined and may carry traffic.
    pub active: bool,
}

impl StackEntry {
    fn key(&self) -> (IfIndex, IfIndex) {
        (self.higher, self.lower)
    }
}

/// The interface stack table.
///
/// Entries are kept sorted by (higher, lower), so all links of one bundle are
/// adjacent and [`get_next`](#method.get_next) walks them in a stable order.
#[derive(Debug, Default)]
pub struct InterfaceStack {
    entries: Vec<StackEntry, IFACE_STACK_ENTRY_COUNT>,
}

impl InterfaceStack {
    /// Creates a new empty interface stack.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Record that `lower` sits under `higher`. The entry starts inactive.
    pub fn add_entry(&mut self, higher: IfIndex, lower: IfIndex) -> Result<(), StackError> {
        let key = (higher, lower);
        let position = match self.entries.binary_search_by_key(&key, StackEntry::key) {
            Ok(_) => return Err(StackError::Exists),
            Err(position) => position,
        };
        self.entries
            .insert(
                position,
                StackEntry {
                    higher,
                    lower,
                    active: false,
                },
            )
            .map_err(|_| StackError::TableFull)
    }

    pub fn remove_entry(
        &mut self,
        higher: IfIndex,
        lower: IfIndex,
    ) -> Result<StackEntry, StackError> {
        let position = self
            .entries
            .binary_search_by_key(&(higher, lower), StackEntry::key)
            .map_err(|_| StackError::NotFound)?;
        Ok(self.entries.remove(position))
    }

    /// Mark an entry as carrying traffic.
    pub fn activate(&mut self, higher: IfIndex, lower: IfIndex) -> Result<(), StackError> {
        let position = self
            .entries
            .binary_search_by_key(&(higher, lower), StackEntry::key)
            .map_err(|_| StackError::NotFound)?;
        self.entries[position].active = true;
        Ok(())
    }

    pub fn contains(&self, higher: IfIndex, lower: IfIndex) -> bool {
        self.entries
            .binary_search_by_key(&(higher, lower), StackEntry::key)
            .is_ok()
    }

    /// Return the entry that has `lower` as its lower layer.
    pub fn get_higher(&self, lower: IfIndex) -> Option<StackEntry> {
        self.entries.iter().find(|e| e.lower == lower).copied()
    }

    /// Return the first entry that has `higher` as its higher layer.
    pub fn get_lower(&self, higher: IfIndex) -> Option<StackEntry> {
        self.entries.iter().find(|e| e.higher == higher).copied()
    }

    /// Return the entry following `entry` in table order, or the first entry
    /// when `entry` is `None`. The given entry need not still be present.
    pub fn get_next(&self, entry: Option<&StackEntry>) -> Option<StackEntry> {
        match entry {
            None => self.entries.first().copied(),
            Some(entry) => {
                let key = entry.key();
                self.entries.iter().find(|e| e.key() > key).copied()
            }
        }
    }

    /// Iterate over the active lower layers of `higher`, in table order.
    pub fn lowers(&self, higher: IfIndex) -> impl Iterator<Item = IfIndex> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.higher == higher && e.active)
            .map(|e| e.lower)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_entries_sorted() {
        let mut stack = InterfaceStack::new();
        stack.add_entry(9, 3).unwrap();
        stack.add_entry(9, 1).unwrap();
        stack.add_entry(4, 2).unwrap();
        assert_eq!(stack.add_entry(9, 1), Err(StackError::Exists));

        let first = stack.get_next(None).unwrap();
        assert_eq!((first.higher, first.lower), (4, 2));
        let second = stack.get_next(Some(&first)).unwrap();
        assert_eq!((second.higher, second.lower), (9, 1));
        let third = stack.get_next(Some(&second)).unwrap();
        assert_eq!((third.higher, third.lower), (9, 3));
        assert_eq!(stack.get_next(Some(&third)), None);
    }

    #[test]
    fn test_lookups() {
        let mut stack = InterfaceStack::new();
        stack.add_entry(9, 3).unwrap();
        stack.add_entry(9, 2).unwrap();
        stack.add_entry(9, 1).unwrap();
        stack.activate(9, 3).unwrap();
        stack.activate(9, 1).unwrap();
        assert_eq!(stack.get_higher(3).map(|e| e.higher), Some(9));
        assert_eq!(stack.get_lower(9).map(|e| e.lower), Some(1));
        assert_eq!(stack.lowers(9).collect::<std::vec::Vec<_>>(), [1, 3]);
        assert_eq!(stack.get_higher(7), None);
    }

    #[test]
    fn test_get_next_after_removal() {
        let mut stack = InterfaceStack::new();
        stack.add_entry(9, 1).unwrap();
        stack.add_entry(9, 2).unwrap();
        stack.add_entry(9, 3).unwrap();
        let removed = stack.remove_entry(9, 2).unwrap();
        assert_eq!(stack.get_next(Some(&removed)).map(|e| e.lower), Some(3));
    }

    #[test]
    fn test_activate() {
        let mut stack = InterfaceStack::new();
        stack.add_entry(9, 1).unwrap();
        assert!(!stack.get_higher(1).unwrap().active);
        stack.activate(9, 1).unwrap();
        assert!(stack.get_higher(1).unwrap().active);
        assert_eq!(stack.activate(9, 2), Err(StackError::NotFound));
        assert_eq!(stack.remove_entry(9, 2), Err(StackError::NotFound));
    }

    #[test]
    fn test_table_full() {
        let mut stack = InterfaceStack::new();
        for lower in 0..IFACE_STACK_ENTRY_COUNT as IfIndex {
            stack.add_entry(100, lower).unwrap();
        }
        assert_eq!(stack.add_entry(100, 999), Err(StackError::TableFull));
    }
}
