//! Scripted stats source for end-to-end scenarios.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use cvsampler_config::Config;

use crate::bootstrap::SourceProvider;
use crate::pipeline::{Collected, CollectionError, StatsSource};

/// Hands out queued documents in order, repeating the last one forever.
#[derive(Clone, Default)]
pub struct ScriptedSourceProvider {
    state: Arc<Mutex<Script>>,
}

#[derive(Default)]
struct Script {
    queued: VecDeque<Value>,
    last: Option<Value>,
}

impl ScriptedSourceProvider {
    /// Appends a document to the script.
    pub fn push(&self, document: Value) {
        self.state
            .lock()
            .expect("script mutex poisoned")
            .queued
            .push_back(document);
    }
}

impl StatsSource for ScriptedSourceProvider {
    fn collect(&self) -> Collected {
        let mut script = self.state.lock().expect("script mutex poisoned");
        if let Some(next) = script.queued.pop_front() {
            script.last = Some(next);
        }
        match script.last.clone() {
            Some(document) => Collected::Sample(document),
            None => Collected::NoData(CollectionError::EmptyCommand),
        }
    }
}

impl SourceProvider for ScriptedSourceProvider {
    fn stats_source(&self, _config: &Config) -> Result<Arc<dyn StatsSource>, CollectionError> {
        Ok(Arc::new(self.clone()))
    }

    fn definition_source(
        &self,
        _config: &Config,
    ) -> Result<Arc<dyn StatsSource>, CollectionError> {
        Ok(Arc::new(self.clone()))
    }
}
