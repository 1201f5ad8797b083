//! Name-to-descriptor map built at startup. Lookups are O(1).

use super::ToolDescriptor;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(|s| s.as_str())
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    /// Builds a filtered registry containing exactly `allowed ∖ disallowed`.
    /// `allowed` of `None` is the wildcard "*" (every registered tool).
    pub fn filtered(&self, allowed: Option<&[String]>, disallowed: &[String]) -> Self {
        let mut out = Self::new();
        for (name, descriptor) in &self.tools {
            let is_allowed = match allowed {
                None => true,
                Some(list) => list.iter().any(|a| a == name),
            };
            let is_disallowed = disallowed.iter().any(|d| d == name);
            if is_allowed && !is_disallowed {
                out.register(descriptor.clone());
            }
        }
        out
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Convenience wrapper for sharing a registry across concurrently-executing
/// tool calls without cloning its contents.
pub type SharedRegistry = Arc<ToolRegistry>;
