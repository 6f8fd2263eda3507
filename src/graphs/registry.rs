//! Registry of published graph definitions.

use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};

use super::model::GraphDefinition;

/// Thread-safe map of published, immutable definitions keyed by
/// `definition_id`. Publishing the same id again replaces the definition
/// for *new* submissions; live streams keep the `Arc` they resolved.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<FxHashMap<String, Arc<GraphDefinition>>>,
}

impl DefinitionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, definition: GraphDefinition) -> Arc<GraphDefinition> {
        let definition = Arc::new(definition);
        self.definitions
            .write()
            .expect("definition registry lock poisoned")
            .insert(definition.definition_id.clone(), Arc::clone(&definition));
        definition
    }

    #[must_use]
    pub fn resolve(&self, definition_id: &str) -> Option<Arc<GraphDefinition>> {
        self.definitions
            .read()
            .expect("definition registry lock poisoned")
            .get(definition_id)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, definition_id: &str) -> bool {
        self.definitions
            .read()
            .expect("definition registry lock poisoned")
            .contains_key(definition_id)
    }
}
