//! Data Node Arena
//!
//! Every channel's data lives in a tree of nodes owned by a [`DataStore`].
//! A node is one of:
//! - *unresolved*: nothing is known about it yet
//! - *branch*: an array of fixed `degree` whose slots fill in over time
//! - *leaf*: exactly one [`DataValue`]
//!
//! Nodes are addressed by [`NodeId`] and never removed. Each node caches
//! whether its whole subtree has arrived; the flag is propagated to the
//! parent when the last missing child becomes ready, so readiness checks
//! cost one lookup per path step.

use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_yaml::Value as YamlValue;
use thiserror::Error;

use super::path::DataPath;
use super::value::{DataContents, DataType, DataValue, ValueError};

/// Data stores are shared between the engine and every channel reading them.
pub type SharedDataStore = Arc<RwLock<DataStore>>;

/// Handle to a node inside a [`DataStore`].
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataNodeError {
    #[error("degree mismatch: node has degree {expected} but {found} was requested")]
    DegreeMismatch { expected: usize, found: usize },

    #[error("index {index} is out of range for degree {degree}")]
    IndexOutOfRange { index: usize, degree: usize },

    #[error("expected a branch but found a leaf")]
    UnexpectedLeafNode,

    #[error("expected a leaf but found a branch")]
    UnexpectedBranchNode,

    #[error("a value already exists at {path}")]
    LeafAlreadyExists { path: DataPath },

    #[error("the root already holds a value")]
    RootDataAlreadyExists,

    #[error("no data has arrived at {path} yet")]
    MissingBranch { path: DataPath },

    #[error("cannot address a child of a node whose degree is unknown")]
    UnknownDegree,

    #[error("channel holds {expected} data but a {found} value was written")]
    TypeMismatch { expected: DataType, found: DataType },

    #[error("unknown data node {0:?}")]
    UnknownNode(NodeId),

    #[error(transparent)]
    Value(#[from] ValueError),
}

impl DataNodeError {
    /// True for the "data has not arrived yet" condition.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingBranch { .. })
    }
}

#[derive(Debug, Clone)]
enum NodeContent {
    Unresolved,
    Branch {
        degree: usize,
        children: Vec<Option<NodeId>>,
    },
    Leaf(DataValue),
}

#[derive(Debug, Clone)]
struct DataNode {
    parent: Option<NodeId>,
    index: usize,
    data_type: DataType,
    content: NodeContent,
    ready: bool,
    ready_children: usize,
}

impl DataNode {
    fn blank(parent: Option<NodeId>, index: usize, data_type: DataType) -> Self {
        Self {
            parent,
            index,
            data_type,
            content: NodeContent::Unresolved,
            ready: false,
            ready_children: 0,
        }
    }
}

/// Arena holding the data trees of every channel.
#[derive(Debug, Default)]
pub struct DataStore {
    nodes: Vec<DataNode>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a new, empty store for sharing across threads.
    pub fn shared() -> SharedDataStore {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Number of nodes allocated so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Creates an unresolved root for a new channel.
    pub fn create_root(&mut self, data_type: DataType) -> NodeId {
        self.push(DataNode::blank(None, 0, data_type))
    }

    pub fn data_type(&self, id: NodeId) -> Result<DataType, DataNodeError> {
        Ok(self.node(id)?.data_type)
    }

    /// The degree of a branch, `None` for leaves and unresolved nodes.
    pub fn degree(&self, id: NodeId) -> Result<Option<usize>, DataNodeError> {
        Ok(match &self.node(id)?.content {
            NodeContent::Branch { degree, .. } => Some(*degree),
            _ => None,
        })
    }

    /// Ensures a branch child with `degree` exists at `index` of `parent`.
    ///
    /// Returns the existing child when it already is a branch of the same
    /// degree, so repeated calls yield the same [`NodeId`].
    pub fn add_branch(
        &mut self,
        parent: NodeId,
        index: usize,
        degree: usize,
    ) -> Result<NodeId, DataNodeError> {
        let existing = match &self.node(parent)?.content {
            NodeContent::Unresolved => return Err(DataNodeError::UnknownDegree),
            NodeContent::Leaf(_) => return Err(DataNodeError::UnexpectedLeafNode),
            NodeContent::Branch {
                degree: parent_degree,
                children,
            } => {
                if index >= *parent_degree {
                    return Err(DataNodeError::IndexOutOfRange {
                        index,
                        degree: *parent_degree,
                    });
                }
                children[index]
            }
        };

        if let Some(child) = existing {
            self.check_can_branch(child, degree)?;
        }

        let child = self.child_or_blank(parent, index)?;
        self.resolve_branch(child, degree)?;
        Ok(child)
    }

    /// Writes `value` at `path` below `root`, creating branches on the way.
    ///
    /// The whole walk is checked before anything is created, so an error
    /// leaves the tree exactly as it was.
    pub fn add_data_object(
        &mut self,
        root: NodeId,
        path: &DataPath,
        value: DataValue,
    ) -> Result<NodeId, DataNodeError> {
        let expected = self.data_type(root)?;
        if value.data_type() != expected {
            return Err(DataNodeError::TypeMismatch {
                expected,
                found: value.data_type(),
            });
        }

        if let Some(existing) = self.check_walk(root, path)? {
            match &self.node(existing)?.content {
                NodeContent::Leaf(_) if path.is_root() => {
                    return Err(DataNodeError::RootDataAlreadyExists)
                }
                NodeContent::Leaf(_) => {
                    return Err(DataNodeError::LeafAlreadyExists { path: path.clone() })
                }
                NodeContent::Branch { .. } => return Err(DataNodeError::UnexpectedBranchNode),
                NodeContent::Unresolved => {}
            }
        }

        let leaf = self.vivify(root, path)?;
        self.nodes[leaf.0].content = NodeContent::Leaf(value);
        self.mark_ready(leaf);
        Ok(leaf)
    }

    /// Makes sure a branch of `degree` exists at `path`. Used to record
    /// arrays whose length is known before (or without) any element, most
    /// importantly empty arrays.
    pub fn ensure_branch(
        &mut self,
        root: NodeId,
        path: &DataPath,
        degree: usize,
    ) -> Result<NodeId, DataNodeError> {
        if let Some(existing) = self.check_walk(root, path)? {
            self.check_can_branch(existing, degree)?;
        }

        let node = self.vivify(root, path)?;
        self.resolve_branch(node, degree)?;
        Ok(node)
    }

    /// Writes a YAML value (scalar or arbitrarily nested sequence) at `path`.
    pub fn add_yaml(
        &mut self,
        root: NodeId,
        path: &DataPath,
        value: &YamlValue,
    ) -> Result<(), DataNodeError> {
        match value {
            YamlValue::Sequence(items) if items.is_empty() => {
                self.ensure_branch(root, path, 0)?;
            }
            YamlValue::Sequence(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.add_yaml(root, &path.child(index, items.len()), item)?;
                }
            }
            scalar => {
                let data_value = DataValue::from_yaml(self.data_type(root)?, scalar)?;
                self.add_data_object(root, path, data_value)?;
            }
        }
        Ok(())
    }

    /// Finds the node at `path`.
    ///
    /// Fails with [`DataNodeError::MissingBranch`] when part of the path has
    /// not been created yet.
    pub fn get_node(&self, root: NodeId, path: &DataPath) -> Result<NodeId, DataNodeError> {
        let mut current = root;
        self.node(root)?;

        for (depth, step) in path.steps().iter().enumerate() {
            match &self.nodes[current.0].content {
                NodeContent::Unresolved => {
                    return Err(DataNodeError::MissingBranch {
                        path: path.prefix(depth),
                    })
                }
                NodeContent::Leaf(_) => return Err(DataNodeError::UnexpectedLeafNode),
                NodeContent::Branch { degree, children } => {
                    if *degree != step.degree {
                        return Err(DataNodeError::DegreeMismatch {
                            expected: *degree,
                            found: step.degree,
                        });
                    }
                    if step.index >= *degree {
                        return Err(DataNodeError::IndexOutOfRange {
                            index: step.index,
                            degree: *degree,
                        });
                    }
                    current = children[step.index].ok_or_else(|| DataNodeError::MissingBranch {
                        path: path.prefix(depth + 1),
                    })?;
                }
            }
        }

        Ok(current)
    }

    /// Reads the value stored at `path`.
    pub fn get_data_object(&self, root: NodeId, path: &DataPath) -> Result<DataValue, DataNodeError> {
        let node = self.get_node(root, path)?;
        self.value(node).map_err(|err| match err {
            DataNodeError::MissingBranch { .. } => DataNodeError::MissingBranch { path: path.clone() },
            other => other,
        })
    }

    /// The value of a leaf node.
    pub fn value(&self, id: NodeId) -> Result<DataValue, DataNodeError> {
        match &self.node(id)?.content {
            NodeContent::Leaf(value) => Ok(value.clone()),
            NodeContent::Branch { .. } => Err(DataNodeError::UnexpectedBranchNode),
            NodeContent::Unresolved => Err(DataNodeError::MissingBranch {
                path: self.path_of(id),
            }),
        }
    }

    /// True when everything at and below `path` has arrived.
    pub fn is_ready(&self, root: NodeId, path: &DataPath) -> bool {
        self.get_node(root, path)
            .map(|id| self.nodes[id.0].ready)
            .unwrap_or(false)
    }

    /// Ready nodes under `seed`, one per distinct leaf path with its last
    /// `gather_depth` steps removed.
    ///
    /// Paths never shrink above `seed`. An empty branch counts as an array
    /// with no elements: it contributes an item only when gathered.
    pub fn ready_items(
        &self,
        root: NodeId,
        seed: &DataPath,
        gather_depth: usize,
    ) -> Vec<(DataPath, NodeId)> {
        let Ok(seed_node) = self.get_node(root, seed) else {
            return Vec::new();
        };

        let mut terminals = Vec::new();
        self.collect_terminal_paths(seed_node, seed.clone(), &mut terminals);

        let mut items = Vec::new();
        let mut last_checked: Option<DataPath> = None;

        for terminal in terminals {
            let keep = terminal.len().saturating_sub(gather_depth).max(seed.len());
            let path = terminal.prefix(keep);
            if last_checked.as_ref() == Some(&path) {
                continue;
            }

            if let Ok(node) = self.get_node(root, &path) {
                if self.nodes[node.0].ready {
                    items.push((path.clone(), node));
                }
            }
            last_checked = Some(path);
        }

        items
    }

    /// All leaf values below `id`, in index order.
    pub fn flattened(&self, id: NodeId) -> Result<Vec<DataValue>, DataNodeError> {
        let mut values = Vec::new();
        self.collect_values(id, &mut values)?;
        Ok(values)
    }

    /// Contents of a fully arrived node: a scalar for leaves, the flattened
    /// values for branches. `None` while anything is still missing.
    pub fn ready_contents(&self, id: NodeId) -> Option<DataContents> {
        let node = self.node(id).ok()?;
        if !node.ready {
            return None;
        }
        match &node.content {
            NodeContent::Leaf(value) => Some(DataContents::Scalar(value.clone())),
            _ => self.flattened(id).ok().map(DataContents::Array),
        }
    }

    /// Reconstructs the path from the tree root down to `id`.
    pub fn path_of(&self, id: NodeId) -> DataPath {
        let mut reversed = Vec::new();
        let mut current = id;

        while let Some(node) = self.nodes.get(current.0) {
            let Some(parent) = node.parent else { break };
            let degree = match &self.nodes[parent.0].content {
                NodeContent::Branch { degree, .. } => *degree,
                _ => 0,
            };
            reversed.push((node.index, degree));
            current = parent;
        }

        reversed.reverse();
        DataPath::from_pairs(&reversed)
    }

    /// Paths of every zero-length array under `root`.
    pub fn empty_branches(&self, root: NodeId) -> Vec<DataPath> {
        let mut found = Vec::new();
        let mut pending = vec![(root, DataPath::root())];

        while let Some((id, path)) = pending.pop() {
            let Some(node) = self.nodes.get(id.0) else { continue };
            if let NodeContent::Branch { degree, children } = &node.content {
                if *degree == 0 {
                    found.push(path);
                    continue;
                }
                for (index, child) in children.iter().enumerate() {
                    if let Some(child) = child {
                        pending.push((*child, path.child(index, *degree)));
                    }
                }
            }
        }

        found.sort();
        found
    }

    fn node(&self, id: NodeId) -> Result<&DataNode, DataNodeError> {
        self.nodes.get(id.0).ok_or(DataNodeError::UnknownNode(id))
    }

    fn push(&mut self, node: DataNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Checks that `path` could be materialized and returns the node that
    /// already sits at its end, if any.
    fn check_walk(&self, root: NodeId, path: &DataPath) -> Result<Option<NodeId>, DataNodeError> {
        let mut current = Some(self.node(root).map(|_| root)?);

        for step in path.steps() {
            if step.index >= step.degree {
                return Err(DataNodeError::IndexOutOfRange {
                    index: step.index,
                    degree: step.degree,
                });
            }

            current = match current {
                None => None,
                Some(id) => match &self.nodes[id.0].content {
                    NodeContent::Unresolved => None,
                    NodeContent::Leaf(_) => return Err(DataNodeError::UnexpectedLeafNode),
                    NodeContent::Branch { degree, children } => {
                        if *degree != step.degree {
                            return Err(DataNodeError::DegreeMismatch {
                                expected: *degree,
                                found: step.degree,
                            });
                        }
                        children[step.index]
                    }
                },
            };
        }

        Ok(current)
    }

    fn check_can_branch(&self, id: NodeId, degree: usize) -> Result<(), DataNodeError> {
        match &self.node(id)?.content {
            NodeContent::Leaf(_) => Err(DataNodeError::UnexpectedLeafNode),
            NodeContent::Branch { degree: existing, .. } if *existing != degree => {
                Err(DataNodeError::DegreeMismatch {
                    expected: *existing,
                    found: degree,
                })
            }
            _ => Ok(()),
        }
    }

    fn vivify(&mut self, root: NodeId, path: &DataPath) -> Result<NodeId, DataNodeError> {
        let mut current = root;
        for step in path.steps() {
            self.resolve_branch(current, step.degree)?;
            current = self.child_or_blank(current, step.index)?;
        }
        Ok(current)
    }

    fn resolve_branch(&mut self, id: NodeId, degree: usize) -> Result<(), DataNodeError> {
        self.check_can_branch(id, degree)?;
        let node = &mut self.nodes[id.0];
        if let NodeContent::Unresolved = node.content {
            node.content = NodeContent::Branch {
                degree,
                children: vec![None; degree],
            };
            if degree == 0 {
                self.mark_ready(id);
            }
        }
        Ok(())
    }

    fn child_or_blank(&mut self, parent: NodeId, index: usize) -> Result<NodeId, DataNodeError> {
        let data_type = self.node(parent)?.data_type;
        let existing = match &self.nodes[parent.0].content {
            NodeContent::Branch { degree, children } => {
                if index >= *degree {
                    return Err(DataNodeError::IndexOutOfRange {
                        index,
                        degree: *degree,
                    });
                }
                children[index]
            }
            NodeContent::Leaf(_) => return Err(DataNodeError::UnexpectedLeafNode),
            NodeContent::Unresolved => return Err(DataNodeError::UnknownDegree),
        };

        if let Some(child) = existing {
            return Ok(child);
        }

        let child = self.push(DataNode::blank(Some(parent), index, data_type));
        if let NodeContent::Branch { children, .. } = &mut self.nodes[parent.0].content {
            children[index] = Some(child);
        }
        Ok(child)
    }

    fn mark_ready(&mut self, id: NodeId) {
        let mut current = id;
        loop {
            let node = &mut self.nodes[current.0];
            if node.ready {
                return;
            }
            node.ready = true;

            let Some(parent) = node.parent else { return };
            let parent_node = &mut self.nodes[parent.0];
            parent_node.ready_children += 1;

            let complete = match &parent_node.content {
                NodeContent::Branch { degree, .. } => parent_node.ready_children == *degree,
                _ => false,
            };
            if !complete {
                return;
            }
            current = parent;
        }
    }

    fn collect_terminal_paths(&self, id: NodeId, path: DataPath, out: &mut Vec<DataPath>) {
        match &self.nodes[id.0].content {
            NodeContent::Leaf(_) => out.push(path),
            NodeContent::Unresolved => {}
            NodeContent::Branch { degree: 0, .. } => out.push(path.child(0, 0)),
            NodeContent::Branch { degree, children } => {
                for (index, child) in children.iter().enumerate() {
                    if let Some(child) = child {
                        self.collect_terminal_paths(*child, path.child(index, *degree), out);
                    }
                }
            }
        }
    }

    fn collect_values(&self, id: NodeId, out: &mut Vec<DataValue>) -> Result<(), DataNodeError> {
        match &self.node(id)?.content {
            NodeContent::Leaf(value) => out.push(value.clone()),
            NodeContent::Unresolved => {
                return Err(DataNodeError::MissingBranch {
                    path: self.path_of(id),
                })
            }
            NodeContent::Branch { degree, children } => {
                for (index, child) in children.iter().enumerate() {
                    let child = child.ok_or_else(|| DataNodeError::MissingBranch {
                        path: self.path_of(id).child(index, *degree),
                    })?;
                    self.collect_values(child, out)?;
                }
            }
        }
        Ok(())
    }
}
