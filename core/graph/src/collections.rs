use std::collections::HashMap;

use crate::topic::TopicHandle;

/// Ordered, key-unique set of topics. Keeps the insertion order in a vector
/// and a parallel case-insensitive index from key to handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyedTopicCollection {
    items: Vec<TopicHandle>,
    index: HashMap<String, TopicHandle>,
    keys: HashMap<TopicHandle, String>,
}

impl KeyedTopicCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TopicHandle> + '_ {
        self.items.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<TopicHandle> {
        self.items.clone()
    }

    pub fn get(&self, key: &str) -> Option<TopicHandle> {
        self.index.get(&key.to_ascii_lowercase()).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(&key.to_ascii_lowercase())
    }

    pub fn contains(&self, handle: TopicHandle) -> bool {
        self.keys.contains_key(&handle)
    }

    pub fn position(&self, handle: TopicHandle) -> Option<usize> {
        self.items.iter().position(|item| *item == handle)
    }

    pub fn key_of(&self, handle: TopicHandle) -> Option<&str> {
        self.keys.get(&handle).map(String::as_str)
    }

    /// Insert at `position` (or append). Fails with the handle already
    /// registered under `key`, leaving the collection untouched.
    pub(crate) fn insert(
        &mut self,
        position: Option<usize>,
        key: &str,
        handle: TopicHandle,
    ) -> Result<(), TopicHandle> {
        let normalized = key.to_ascii_lowercase();
        if let Some(existing) = self.index.get(&normalized) {
            return Err(*existing);
        }

        match position {
            Some(position) if position < self.items.len() => self.items.insert(position, handle),
            _ => self.items.push(handle),
        }
        self.index.insert(normalized, handle);
        self.keys.insert(handle, key.to_string());
        Ok(())
    }

    pub(crate) fn remove(&mut self, handle: TopicHandle) -> bool {
        let Some(key) = self.keys.remove(&handle) else {
            return false;
        };
        self.index.remove(&key.to_ascii_lowercase());
        self.items.retain(|item| *item != handle);
        true
    }

    /// Re-register `handle` under `new_key` without touching its position
    pub(crate) fn change_key(&mut self, handle: TopicHandle, new_key: &str) -> Result<(), TopicHandle> {
        let normalized = new_key.to_ascii_lowercase();
        match self.index.get(&normalized) {
            Some(existing) if *existing != handle => return Err(*existing),
            _ => {}
        }
        let Some(old_key) = self.keys.get(&handle) else {
            return Ok(());
        };
        self.index.remove(&old_key.to_ascii_lowercase());
        self.index.insert(normalized, handle);
        self.keys.insert(handle, new_key.to_string());
        Ok(())
    }

    pub(crate) fn clear(&mut self) -> Vec<TopicHandle> {
        self.index.clear();
        self.keys.clear();
        std::mem::take(&mut self.items)
    }
}
