//! Bidirectional mapping between an observer's local chalkline id and the
//! canonical id assigned by the shared line registry.
//!
//! Each observer names and numbers its own chalklines independently; the
//! registry learns both directions as events arrive and installs a mapping
//! the moment both a local id and a canonical id are known for the same
//! line name. Until then, `resolve` reports the local id as unmapped and
//! the Ingestor treats that as a skippable warning, never a
//! hard failure.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LineRegistryError {
    #[error("local line id {0} has no canonical mapping yet")]
    Unmapped(u32),
}

#[derive(Debug, Default)]
pub struct LineRegistry {
    /// local_id -> line name, as learned from `LINE` events.
    source_names: HashMap<u32, String>,
    /// line name -> canonical id, as learned from the persisted registry.
    dest_ids: HashMap<String, u32>,
    /// local_id -> canonical_id, installed once both directions agree.
    mapping: HashMap<u32, u32>,
}

impl LineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a local id -> name mapping learned from a `LINE` event.
    /// If the registry already knows a canonical id for `name`, installs the
    /// mapping immediately and returns it.
    pub fn add_source(&mut self, local_id: u32, name: &str) -> Option<u32> {
        self.source_names.insert(local_id, name.to_owned());
        if let Some(&canonical) = self.dest_ids.get(name) {
            self.mapping.insert(local_id, canonical);
            return Some(canonical);
        }
        None
    }

    /// Registers a canonical id -> name mapping learned from the persisted
    /// `chalkline` table. Installs mappings for any local ids already
    /// waiting on this name and returns their local ids.
    pub fn add_dest(&mut self, canonical_id: u32, name: &str) -> Vec<u32> {
        self.dest_ids.insert(name.to_owned(), canonical_id);
        let newly_mapped: Vec<u32> = self
            .source_names
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(&local_id, _)| local_id)
            .collect();
        for &local_id in &newly_mapped {
            self.mapping.insert(local_id, canonical_id);
        }
        newly_mapped
    }

    /// Resolves a local chalkline id to its canonical id, or
    /// `Unmapped` if no prior `LINE` event ever registered it.
    pub fn resolve(&self, local_id: u32) -> Result<u32, LineRegistryError> {
        self.mapping
            .get(&local_id)
            .copied()
            .ok_or(LineRegistryError::Unmapped(local_id))
    }

    /// True if the registry has ever seen a `LINE` event naming this local id,
    /// regardless of whether the mapping has resolved yet.
    pub fn knows_local(&self, local_id: u32) -> bool {
        self.source_names.contains_key(&local_id)
    }

    pub fn name_for_local(&self, local_id: u32) -> Option<&str> {
        self.source_names.get(&local_id).map(String::as_str)
    }
}
