//! Name-to-reducer resolution.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use super::{JoinReducer, MapMerge};

/// Registry resolving the reducer names parallel nodes declare.
///
/// Starts with [`MapMerge`] registered as `"merge"`; additional reducers
/// are registered before the engine starts.
pub struct ReducerRegistry {
    reducers: FxHashMap<String, Arc<dyn JoinReducer>>,
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        let mut reducers: FxHashMap<String, Arc<dyn JoinReducer>> = FxHashMap::default();
        reducers.insert(MapMerge::NAME.to_string(), Arc::new(MapMerge));
        Self { reducers }
    }
}

impl ReducerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, reducer: Arc<dyn JoinReducer>) {
        self.reducers.insert(name.into(), reducer);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn JoinReducer>> {
        self.reducers.get(name).cloned()
    }
}
