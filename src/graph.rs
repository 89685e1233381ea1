//! The dependency graph: nodes, their stamp triple, and the forward/reverse
//! edge sets that drive scheduling.
//!
//! Nodes are addressed by a stable [`NodeId`] (an arena index) rather than by
//! pointer, per the design note on representing the `deps`/`deps_dyn`/
//! `blocking` cycle: a name→id [`OrderedStringMap`] resolves references, and
//! every edge set stores ids ordered by name so iteration order stays
//! deterministic without re-deriving names from the arena on every
//! comparison.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::time::SystemTime;

use thiserror::Error;

use crate::ordmap::OrderedStringMap;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency '{0}' not defined")]
    UndefinedDependency(String),
    #[error("node '{0}' redeclared with a different type")]
    TypeConflict(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeType {
    Src,
    Out,
    Sys,
    Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// An edge key orders purely by node name, so a `BTreeSet<NodeKey>` walks in
/// the lexicographic order the "determinism of plan" law requires without
/// needing to look names up in the arena during comparisons.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeKey {
    pub name: String,
    pub id: NodeId,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub node_type: NodeType,

    pub stamp_updated: i64,
    pub stamp_changed: i64,
    pub stamp_want: i64,

    pub deps: BTreeSet<NodeKey>,
    pub deps_dyn: BTreeSet<NodeKey>,
    pub blocking: BTreeSet<NodeKey>,

    pub cmd: Vec<String>,
    pub cmd_hash: u64,

    pub visited: bool,
    pub failed: bool,
    pub dirty: bool,
    pub frozen: bool,
    pub waiting: i32,
}

impl Node {
    fn new(name: String, node_type: NodeType) -> Self {
        Node {
            name,
            node_type,
            stamp_updated: 0,
            stamp_changed: 0,
            stamp_want: 0,
            deps: BTreeSet::new(),
            deps_dyn: BTreeSet::new(),
            blocking: BTreeSet::new(),
            cmd: Vec::new(),
            cmd_hash: 0,
            visited: false,
            failed: false,
            dirty: false,
            frozen: false,
            waiting: 0,
        }
    }

    pub fn set_stamps(&mut self, value: i64) {
        self.stamp_want = value;
        self.stamp_changed = value;
        self.stamp_updated = value;
    }

    /// Content hash of `cmd`, stable across runs (see `env::Variable::content_hash`).
    pub fn hash_cmd(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        for v in &self.cmd {
            hasher.update(v.as_bytes());
            hasher.update(b"\0");
        }
        let digest = hasher.finalize();
        u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
    }
}

/// Name-addressed arena of nodes. A `node_t*` in the original is a `NodeId`
/// here; every edge set stores `NodeKey`s rather than raw ids so it can be
/// iterated without a second lookup.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    by_name: OrderedStringMap<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates all nodes in lexicographic name order (the order
    /// `graph_dump` and the scheduler's tiebreak both rely on).
    pub fn iter_by_name(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.by_name.iter().map(|(_, id)| *id)
    }

    fn key_of(&self, id: NodeId) -> NodeKey {
        NodeKey { name: self.nodes[id.0].name.clone(), id }
    }

    /// Returns the existing node named `name`, or creates one of `node_type`.
    pub fn add(&mut self, name: &str, node_type: NodeType) -> NodeId {
        if let Some(id) = self.get(name) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name.to_string(), node_type));
        self.by_name.insert(name, id);
        id
    }

    /// Resolves `name` to a node, creating a `src`/`sys` node and seeding its
    /// stamps from the filesystem if it doesn't exist yet (mirrors
    /// `graph_find_file`/the resolver called from `graph_add_dep`). An
    /// absolute path that fails to `stat` becomes `sys` rather than `src`.
    pub fn resolve_or_create_file(&mut self, name: &str) -> NodeId {
        if let Some(id) = self.get(name) {
            return id;
        }
        let mut node_type = if name.starts_with('/') { NodeType::Sys } else { NodeType::Src };
        let stamp = stat_mtime(name);
        let id = self.add(name, node_type);
        match stamp {
            Some(mtime) => self.node_mut(id).set_stamps(mtime),
            None => node_type = NodeType::Sys,
        }
        self.node_mut(id).node_type = node_type;
        self.node_mut(id).frozen = true;
        id
    }

    /// Adds `dep` (by name) as a static or dynamic dependency of `node`,
    /// resolving/creating the dependency node as a file reference first.
    pub fn add_dep(&mut self, node: NodeId, dep_name: &str, dynamic: bool) {
        let dep_id = self.resolve_or_create_file(dep_name);
        let key = self.key_of(dep_id);
        if dynamic {
            self.node_mut(node).deps_dyn.insert(key);
        } else {
            self.node_mut(node).deps.insert(key);
        }
    }

    /// Adds `dep`, failing if it does not already name a known node -- used
    /// by the rule loader's `dep` command, which requires the target to
    /// already be declared (§4.6.1).
    pub fn add_declared_dep(&mut self, node: NodeId, dep_name: &str, dynamic: bool) -> Result<(), GraphError> {
        let dep_id = self
            .get(dep_name)
            .ok_or_else(|| GraphError::UndefinedDependency(dep_name.to_string()))?;
        let key = self.key_of(dep_id);
        if dynamic {
            self.node_mut(node).deps_dyn.insert(key);
        } else {
            self.node_mut(node).deps.insert(key);
        }
        Ok(())
    }

    pub fn add_blocking(&mut self, dep: NodeId, dependent: NodeId) {
        let key = self.key_of(dependent);
        self.node_mut(dep).blocking.insert(key);
    }

    pub fn remove_blocking(&mut self, dep: NodeId, dependent: NodeId) {
        let key = self.key_of(dependent);
        self.node_mut(dep).blocking.remove(&key);
    }

    pub fn clear_deps_dyn(&mut self, node: NodeId) {
        self.node_mut(node).deps_dyn.clear();
    }

    /// Plain-text dump used for `--dump`/`gib.debug` and for boundary tests.
    /// Format: one line per node (`<type> <name> updated=.. changed=.. want=..
    /// dirty=.. failed=..`), its deps/dyn-deps indented one space below.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for id in self.iter_by_name() {
            let n = self.node(id);
            let type_tag = match n.node_type {
                NodeType::Src => "src",
                NodeType::Out => "out",
                NodeType::Sys => "sys",
                NodeType::Meta => "meta",
            };
            let _ = writeln!(
                out,
                "{type_tag} {} updated={:x} changed={:x} want={:x} dirty={} failed={}",
                n.name, n.stamp_updated, n.stamp_changed, n.stamp_want, n.dirty, n.failed
            );
            for dep in &n.deps {
                let _ = writeln!(out, " dep: {}", dep.name);
            }
            for dep in &n.deps_dyn {
                let _ = writeln!(out, " dyn: {}", dep.name);
            }
            if !n.cmd.is_empty() {
                let _ = writeln!(out, " cmd: {}", n.cmd.join(" "));
            }
        }
        out
    }
}

/// Exposed so the queue's restat pass can re-derive stamps with the same
/// mtime-to-seconds convention used at node creation.
pub(crate) fn stat_mtime(path: &str) -> Option<i64> {
    let meta = fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let secs = modified.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs();
    Some(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_by_name() {
        let mut g = Graph::new();
        let a = g.add("x", NodeType::Out);
        let b = g.add("x", NodeType::Out);
        assert_eq!(a, b);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn iter_by_name_is_lexicographic() {
        let mut g = Graph::new();
        g.add("c", NodeType::Out);
        g.add("a", NodeType::Out);
        g.add("b", NodeType::Out);
        let names: Vec<_> = g.iter_by_name().map(|id| g.node(id).name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn add_declared_dep_rejects_unknown_name() {
        let mut g = Graph::new();
        let out = g.add("all", NodeType::Meta);
        let err = g.add_declared_dep(out, "missing", false).unwrap_err();
        assert!(matches!(err, GraphError::UndefinedDependency(_)));
    }

    #[test]
    fn blocking_edges_are_reciprocal_to_deps() {
        let mut g = Graph::new();
        let dep = g.add("y", NodeType::Src);
        let out = g.add("x", NodeType::Out);
        g.node_mut(out).deps.insert(NodeKey { name: "y".into(), id: dep });
        g.add_blocking(dep, out);
        assert_eq!(g.node(dep).blocking.len(), 1);
        g.remove_blocking(dep, out);
        assert!(g.node(dep).blocking.is_empty());
    }

    #[test]
    fn hash_cmd_changes_when_cmd_changes() {
        let mut g = Graph::new();
        let out = g.add("x", NodeType::Out);
        g.node_mut(out).cmd = vec!["echo".into(), "hi".into()];
        let h1 = g.node(out).hash_cmd();
        g.node_mut(out).cmd = vec!["echo".into(), "bye".into()];
        let h2 = g.node(out).hash_cmd();
        assert_ne!(h1, h2);
    }

    #[test]
    fn resolve_or_create_file_marks_absolute_missing_path_as_sys() {
        let mut g = Graph::new();
        let id = g.resolve_or_create_file("/nonexistent/path/for/test-9f2c");
        assert_eq!(g.node(id).node_type, NodeType::Sys);
    }
}
