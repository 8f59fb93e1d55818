//! Incremental-build dependency graph
//!
//! Persisted between runs so the driver can decide what to recompile. The
//! graph is keyed by absolute file path and serialized as a two-map JSON
//! document: `forward` (file -> dependencies) and `reverse` (file ->
//! dependents), both sets serialized as arrays with no guaranteed ordering.
//! Writes are atomic (temp file + rename); there is no concurrent-writer
//! discipline beyond that.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepGraph {
    forward: BTreeMap<String, BTreeSet<String>>,
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl DepGraph {
    pub fn new() -> Self {
        DepGraph::default()
    }

    /// Record that `file` depends on `dep`; both maps stay in sync.
    pub fn add_dependency(&mut self, file: &str, dep: &str) {
        self.forward
            .entry(file.to_string())
            .or_default()
            .insert(dep.to_string());
        self.reverse
            .entry(dep.to_string())
            .or_default()
            .insert(file.to_string());
    }

    pub fn dependencies_of(&self, file: &str) -> Option<&BTreeSet<String>> {
        self.forward.get(file)
    }

    pub fn dependents_of(&self, file: &str) -> Option<&BTreeSet<String>> {
        self.reverse.get(file)
    }

    /// Drop a file and every edge touching it.
    pub fn remove_file(&mut self, file: &str) {
        if let Some(deps) = self.forward.remove(file) {
            for d in deps {
                if let Some(r) = self.reverse.get_mut(&d) {
                    r.remove(file);
                    if r.is_empty() {
                        self.reverse.remove(&d);
                    }
                }
            }
        }
        if let Some(dependents) = self.reverse.remove(file) {
            for d in dependents {
                if let Some(f) = self.forward.get_mut(&d) {
                    f.remove(file);
                    if f.is_empty() {
                        self.forward.remove(&d);
                    }
                }
            }
        }
    }

    /// Every file that transitively depends on `file` (what must rebuild
    /// when `file` changes).
    pub fn transitive_dependents(&self, file: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack = vec![file.to_string()];
        while let Some(f) = stack.pop() {
            if let Some(dependents) = self.reverse.get(&f) {
                for d in dependents {
                    if out.insert(d.clone()) {
                        stack.push(d.clone());
                    }
                }
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize dependency graph: {}", e))
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json)
            .map_err(|e| format!("Failed to parse dependency graph: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            format!("Failed to read dependency graph '{}': {}", path.display(), e)
        })?;
        Self::from_json(&content)
    }

    /// Atomic save: write a temp file next to the target, then rename.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let json = self.to_json()?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| {
            format!("Failed to write dependency graph '{}': {}", tmp.display(), e)
        })?;
        std::fs::rename(&tmp, path).map_err(|e| {
            format!("Failed to move dependency graph into place: {}", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> DepGraph {
        let mut g = DepGraph::new();
        g.add_dependency("/app/main.rb", "/app/util.rb");
        g.add_dependency("/app/main.rb", "/app/model.rb");
        g.add_dependency("/app/model.rb", "/app/util.rb");
        g
    }

    #[test]
    fn test_forward_and_reverse_stay_in_sync() {
        let g = sample();
        assert!(g.dependencies_of("/app/main.rb").unwrap().contains("/app/util.rb"));
        assert!(g.dependents_of("/app/util.rb").unwrap().contains("/app/main.rb"));
        assert!(g.dependents_of("/app/util.rb").unwrap().contains("/app/model.rb"));
    }

    #[test]
    fn test_round_trip() {
        let g = sample();
        let restored = DepGraph::from_json(&g.to_json().unwrap()).unwrap();
        assert_eq!(g, restored);
    }

    #[test]
    fn test_transitive_dependents() {
        let g = sample();
        let affected = g.transitive_dependents("/app/util.rb");
        assert!(affected.contains("/app/main.rb"));
        assert!(affected.contains("/app/model.rb"));
        assert_eq!(affected.len(), 2);
    }

    #[test]
    fn test_remove_file_cleans_both_maps() {
        let mut g = sample();
        g.remove_file("/app/model.rb");
        assert!(g.dependencies_of("/app/model.rb").is_none());
        assert!(!g
            .dependents_of("/app/util.rb")
            .unwrap()
            .contains("/app/model.rb"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.json");
        let g = sample();
        g.save(&path).unwrap();
        let loaded = DepGraph::load(&path).unwrap();
        assert_eq!(g, loaded);
        // atomic write leaves no temp file behind
        assert!(!path.with_extension("json.tmp").exists());
    }
}
