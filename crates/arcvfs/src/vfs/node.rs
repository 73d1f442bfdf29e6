//! In-memory node tree mirroring a container's directory structure.
//!
//! Nodes live in an arena owned by [`NodeTree`] and refer to each other by
//! [`NodeId`]. Parents own their children through the name-keyed child map;
//! the parent link is a plain index back reference.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::backends::archive::ArchiveEntry;
use super::backends::dex::ClassEntry;
use super::error::{VfsError, VfsResult};
use super::path;
use super::types::EntryKind;

/// Extra attribute key holding a modification time in unix milliseconds.
pub const EXTRA_MTIME: &str = "mtime";

/// Convert unix milliseconds to a timestamp. Negative values clamp to the epoch.
pub fn millis_to_time(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(millis).unwrap_or(0))
}

/// Convert a timestamp to unix milliseconds. Pre-epoch times clamp to zero.
pub fn time_to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Index of a node inside its [`NodeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Backend-native descriptor of a physical file.
#[derive(Debug, Clone)]
pub enum EntryDescriptor {
    /// Central-directory record of a zip-like archive.
    Archive(ArchiveEntry),
    /// Class table record of a bytecode container.
    Class(ClassEntry),
}

impl EntryDescriptor {
    /// Uncompressed size declared by the container.
    pub fn size(&self) -> u64 {
        match self {
            EntryDescriptor::Archive(entry) => entry.size,
            EntryDescriptor::Class(entry) => u64::from(entry.length),
        }
    }

    /// Modification time declared by the container, if it records one.
    pub fn modified(&self) -> Option<SystemTime> {
        match self {
            EntryDescriptor::Archive(entry) => entry.modified,
            EntryDescriptor::Class(_) => None,
        }
    }
}

/// What a node is. Directories cannot carry a descriptor.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Directory.
    Directory,
    /// File, with its descriptor when it is backed by container content.
    File(Option<EntryDescriptor>),
}

/// One tree entry.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    kind: NodeKind,
    physical: bool,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    extras: BTreeMap<String, i64>,
}

impl Node {
    /// Create a detached directory node.
    pub fn directory(name: impl Into<String>, physical: bool) -> Self {
        Self::new(name.into(), NodeKind::Directory, physical)
    }

    /// Create a detached file node.
    pub fn file(
        name: impl Into<String>,
        descriptor: Option<EntryDescriptor>,
        physical: bool,
    ) -> Self {
        Self::new(name.into(), NodeKind::File(descriptor), physical)
    }

    /// Create a detached node of the given kind, without a descriptor.
    pub fn of_kind(name: impl Into<String>, kind: EntryKind, physical: bool) -> Self {
        match kind {
            EntryKind::File => Self::file(name, None, physical),
            EntryKind::Directory => Self::directory(name, physical),
        }
    }

    fn new(name: String, kind: NodeKind, physical: bool) -> Self {
        Self {
            name,
            kind,
            physical,
            parent: None,
            children: BTreeMap::new(),
            extras: BTreeMap::new(),
        }
    }

    /// Attach an extra attribute.
    pub fn with_extra(mut self, key: impl Into<String>, value: i64) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// Single path segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node kind.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// File or directory.
    pub fn entry_kind(&self) -> EntryKind {
        match self.kind {
            NodeKind::Directory => EntryKind::Directory,
            NodeKind::File(_) => EntryKind::File,
        }
    }

    /// Returns true for directories.
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    /// Returns true for files.
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File(_))
    }

    /// Whether the node exists in the original container.
    pub fn is_physical(&self) -> bool {
        self.physical
    }

    /// Backend descriptor, files only.
    pub fn descriptor(&self) -> Option<&EntryDescriptor> {
        match &self.kind {
            NodeKind::File(descriptor) => descriptor.as_ref(),
            NodeKind::Directory => None,
        }
    }

    /// Parent node, `None` for the root and detached nodes.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Number of direct children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Extra attribute.
    pub fn extra(&self, key: &str) -> Option<i64> {
        self.extras.get(key).copied()
    }

    /// Set an extra attribute.
    pub fn set_extra(&mut self, key: impl Into<String>, value: i64) {
        self.extras.insert(key.into(), value);
    }

    /// The [`EXTRA_MTIME`] attribute as a timestamp.
    pub fn extra_mtime(&self) -> Option<SystemTime> {
        self.extra(EXTRA_MTIME).map(millis_to_time)
    }
}

/// Arena-backed hierarchical index with a single root.
#[derive(Debug, Clone)]
pub struct NodeTree {
    slots: Vec<Option<Node>>,
    root: NodeId,
    live: usize,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    /// Create a tree holding only the root directory.
    pub fn new() -> Self {
        Self {
            slots: vec![Some(Node::directory(path::ROOT, true))],
            root: NodeId(0),
            live: 1,
        }
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Always false; the root is never removed.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Mutably borrow a node.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Child of `parent` named `name`.
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent)?.children.get(name).copied()
    }

    /// Children of a node, ordered by name.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id)
            .into_iter()
            .flat_map(|node| node.children.values().copied())
    }

    /// Resolve a canonical path by walking from the root.
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for segment in path::segments(path) {
            current = self.child(current, segment)?;
        }
        Some(current)
    }

    /// Reconstruct the canonical path of a node from its parent links.
    pub fn full_path(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            if cur == self.root {
                break;
            }
            match self.node(cur) {
                Some(node) => {
                    names.push(node.name.as_str());
                    current = node.parent;
                }
                None => break,
            }
        }
        if names.is_empty() {
            return path::ROOT.to_string();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Add `node` under `parent`, replacing any same-named child subtree.
    pub fn add_child(&mut self, parent: NodeId, mut node: Node) -> VfsResult<NodeId> {
        self.ensure_directory(parent)?;
        if let Some(existing) = self.child(parent, &node.name) {
            self.remove(existing);
        }
        node.parent = Some(parent);
        let name = node.name.clone();
        let id = NodeId(self.slots.len());
        self.slots.push(Some(node));
        self.live += 1;
        if let Some(p) = self.node_mut(parent) {
            p.children.insert(name, id);
        }
        Ok(id)
    }

    /// Insert `leaf` at the end of `segments`, creating physical intermediate
    /// directories on the way. New intermediate directories inherit the
    /// leaf's extras.
    ///
    /// A directory leaf that already exists is kept as-is.
    pub fn insert_path(&mut self, segments: &[&str], leaf: Node) -> VfsResult<NodeId> {
        let Some((last, dirs)) = segments.split_last() else {
            return Err(VfsError::invalid_path("empty entry name"));
        };
        let mut current = self.root;
        for segment in dirs {
            current = match self.child(current, segment) {
                Some(id) => {
                    if !self.node(id).is_some_and(Node::is_directory) {
                        return Err(VfsError::format(format!(
                            "entry {} is used both as a file and as a directory",
                            self.full_path(id)
                        )));
                    }
                    id
                }
                None => {
                    let mut dir = Node::directory(*segment, true);
                    dir.extras = leaf.extras.clone();
                    self.add_child(current, dir)?
                }
            };
        }
        if let Some(existing) = self.child(current, last) {
            let existing_is_dir = self.node(existing).is_some_and(Node::is_directory);
            if leaf.is_directory() && existing_is_dir {
                return Ok(existing);
            }
        }
        let mut leaf = leaf;
        leaf.name = (*last).to_string();
        self.add_child(current, leaf)
    }

    /// Unlink a node from its parent without freeing it.
    pub fn detach(&mut self, id: NodeId) -> VfsResult<()> {
        if id == self.root {
            return Err(VfsError::illegal_state("cannot detach the root"));
        }
        let node = self
            .node_mut(id)
            .ok_or_else(|| VfsError::illegal_state("detaching a freed node"))?;
        let parent = node.parent.take();
        let name = node.name.clone();
        if let Some(parent) = parent.and_then(|p| self.node_mut(p)) {
            parent.children.remove(&name);
        }
        Ok(())
    }

    /// Link a detached node under `parent` with a new name.
    pub fn attach(&mut self, parent: NodeId, id: NodeId, name: &str) -> VfsResult<()> {
        self.ensure_directory(parent)?;
        if self.child(parent, name).is_some() {
            return Err(VfsError::illegal_state(format!(
                "attach target {} already exists",
                path::join(&self.full_path(parent), name)
            )));
        }
        let node = self
            .node_mut(id)
            .ok_or_else(|| VfsError::illegal_state("attaching a freed node"))?;
        if node.parent.is_some() {
            return Err(VfsError::illegal_state("attaching a node that has a parent"));
        }
        node.name = name.to_string();
        node.parent = Some(parent);
        if let Some(p) = self.node_mut(parent) {
            p.children.insert(name.to_string(), id);
        }
        Ok(())
    }

    /// Unlink and free a node with its whole subtree. Returns the number of
    /// nodes freed.
    pub fn remove(&mut self, id: NodeId) -> usize {
        if id == self.root {
            return 0;
        }
        let doomed = self.subtree(id);
        // Ignoring the error: freed or already-detached nodes are fine here.
        let _ = self.detach(id);
        for node in &doomed {
            if let Some(slot) = self.slots.get_mut(node.0) {
                *slot = None;
            }
        }
        self.live -= doomed.len();
        doomed.len()
    }

    /// A node and all its descendants, pre-order, parents before children.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.node(cur) {
                out.push(cur);
                stack.extend(node.children.values().rev().copied());
            }
        }
        out
    }

    fn ensure_directory(&self, id: NodeId) -> VfsResult<()> {
        match self.node(id) {
            Some(node) if node.is_directory() => Ok(()),
            Some(_) => Err(VfsError::not_a_directory(self.full_path(id))),
            None => Err(VfsError::illegal_state("parent node was freed")),
        }
    }
}
