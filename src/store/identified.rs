//! Ordered collection keyed by an identifier carried by its elements.

use serde::Serialize;

pub trait Identified {
    type Id: PartialEq + Clone;

    fn id(&self) -> Self::Id;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct IdentifiedVec<T> {
    items: Vec<T>,
}

impl<T> Default for IdentifiedVec<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Identified> IdentifiedVec<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the element with the same id in place, or appends `item`.
    pub fn update_or_append(&mut self, item: T) {
        let id = item.id();
        match self.items.iter_mut().find(|existing| existing.id() == id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    pub fn get(&self, id: &T::Id) -> Option<&T> {
        self.items.iter().find(|item| item.id() == *id)
    }

    pub fn remove_all(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry(u8, &'static str);

    impl Identified for Entry {
        type Id = u8;

        fn id(&self) -> u8 {
            self.0
        }
    }

    #[test]
    fn test_update_keeps_position() {
        let mut entries = IdentifiedVec::new();
        entries.update_or_append(Entry(1, "a"));
        entries.update_or_append(Entry(2, "b"));
        entries.update_or_append(Entry(1, "c"));

        let ordered: Vec<_> = entries.iter().cloned().collect();
        assert_eq!(ordered, vec![Entry(1, "c"), Entry(2, "b")]);
        assert_eq!(entries.get(&2), Some(&Entry(2, "b")));
        assert_eq!(entries.get(&3), None);
    }

    #[test]
    fn test_remove_all() {
        let mut entries = IdentifiedVec::new();
        entries.update_or_append(Entry(1, "a"));
        entries.remove_all();
        assert!(entries.is_empty());
        assert_eq!(entries.len(), 0);
    }
}
