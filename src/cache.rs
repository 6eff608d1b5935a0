// ============================================================================
// TEMPLATE CACHE
// ============================================================================
// Registry templates keyed by UUID. The aggregate size stands in for "the
// tag list changed": tags are refetched only when it moves. Entries are
// upserted and never evicted.
// ============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::{Template, TemplateTag};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateEntry {
    pub name: String,
    pub size: u64,
    pub tags: Vec<TemplateTag>,
}

#[derive(Debug, Default)]
pub struct TemplateCache {
    entries: Mutex<HashMap<String, TemplateEntry>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every cached template
    pub fn get_all(&self) -> HashMap<String, TemplateEntry> {
        self.entries.lock().clone()
    }

    pub fn get(&self, uuid: &str) -> Option<TemplateEntry> {
        self.entries.lock().get(uuid).cloned()
    }

    pub fn name_of(&self, uuid: &str) -> Option<String> {
        self.entries.lock().get(uuid).map(|e| e.name.clone())
    }

    /// Cached tags for `uuid` when the cached size still matches `size`.
    /// `None` means the tag list must be fetched again.
    pub fn tags_if_unchanged(&self, uuid: &str, size: u64) -> Option<Vec<TemplateTag>> {
        self.entries
            .lock()
            .get(uuid)
            .filter(|entry| entry.size == size)
            .map(|entry| entry.tags.clone())
    }

    /// Upsert every template by UUID
    pub fn merge(&self, templates: &[Template]) {
        let mut entries = self.entries.lock();
        for template in templates {
            entries.insert(
                template.uuid.clone(),
                TemplateEntry {
                    name: template.name.clone(),
                    size: template.size,
                    tags: template.tags.clone(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
