//! Arena for contexts handed across a process or FFI boundary as plain
//! integer tokens instead of pointers. Slots are reused, but a token
//! carries the generation it was issued under, so a stale token can
//! never address a value that replaced its own.

use slab::Slab;

/// Copyable reference to a registry slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    index: usize,
    generation: u64,
}

struct Entry<T> {
    generation: u64,
    value: T,
}

/// Slab of live values addressed by generational [`Token`]s.
pub struct Registry<T> {
    entries: Slab<Entry<T>>,
    next_generation: u64,
}

impl<T> Registry<T> {
    pub fn new() -> Registry<T> {
        Registry {
            entries: Slab::new(),
            next_generation: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Token {
        self.next_generation += 1;
        let generation = self.next_generation;
        let index = self.entries.insert(Entry { generation, value });
        Token { index, generation }
    }

    pub fn get(&self, token: Token) -> Option<&T> {
        self.entries
            .get(token.index)
            .filter(|e| e.generation == token.generation)
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.entries
            .get_mut(token.index)
            .filter(|e| e.generation == token.generation)
            .map(|e| &mut e.value)
    }

    /// Remove and return the value if the token is still current.
    pub fn remove(&mut self, token: Token) -> Option<T> {
        match self.entries.get(token.index) {
            Some(e) if e.generation == token.generation => {
                Some(self.entries.remove(token.index).value)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get() {
        let mut reg = Registry::new();
        let t = reg.insert("ctx");
        assert_eq!(reg.get(t), Some(&"ctx"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn get_mut_mutates_in_place() {
        let mut reg = Registry::new();
        let t = reg.insert(1u32);
        *reg.get_mut(t).unwrap() += 41;
        assert_eq!(reg.get(t), Some(&42));
    }

    #[test]
    fn stale_token_cannot_address_a_reused_slot() {
        let mut reg = Registry::new();
        let old = reg.insert("a");
        assert_eq!(reg.remove(old), Some("a"));
        let new = reg.insert("b");
        // The slab reuses the slot, the generation disambiguates.
        assert_eq!(reg.get(old), None);
        assert_eq!(reg.remove(old), None);
        assert_eq!(reg.get(new), Some(&"b"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_is_single_shot() {
        let mut reg = Registry::new();
        let t = reg.insert(7);
        assert_eq!(reg.remove(t), Some(7));
        assert_eq!(reg.remove(t), None);
        assert!(reg.is_empty());
    }
}
