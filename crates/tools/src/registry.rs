//! Tool registry with trait-policy filtering.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use casc_domain::cascade::Traits;
use casc_domain::message::ToolDefinition;

use crate::tool::Tool;

/// Process-wide registry of callable tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!(tool = %name, "registered tool");
        self.tools.write().insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    /// Select the catalog a cell exposes to the model.
    ///
    /// - explicit list → exactly those tools (unknown names are skipped
    ///   with a warning)
    /// - `"manifest"` → every tool tagged `manifest`
    /// - no traits → no registry tools (control tools are added by the
    ///   cell loop separately)
    pub fn select(&self, traits: Option<&Traits>) -> Vec<Arc<dyn Tool>> {
        let tools = self.tools.read();
        match traits {
            None => Vec::new(),
            Some(Traits::Explicit(names)) => names
                .iter()
                .filter_map(|name| {
                    let found = tools.get(name).cloned();
                    if found.is_none() {
                        tracing::warn!(tool = %name, "cell names an unregistered tool");
                    }
                    found
                })
                .collect(),
            Some(Traits::Mode(_)) => {
                let mut selected: Vec<Arc<dyn Tool>> = tools
                    .values()
                    .filter(|t| t.tags().iter().any(|tag| tag == "manifest"))
                    .cloned()
                    .collect();
                selected.sort_by(|a, b| a.name().cmp(b.name()));
                selected
            }
        }
    }

    pub fn definitions(&self, traits: Option<&Traits>) -> Vec<ToolDefinition> {
        self.select(traits).iter().map(|t| t.describe()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }
}
