//! Pane split tree of a workspace.
//!
//! Nodes live in an arena keyed by [`PaneId`] with parent links, so a leaf can
//! be split or removed in place without moving its surface. Document order is
//! a depth-first walk, first child before second.
//!
//! ```text
//!        split(H, 0.5)              left  │ right
//!        ├── leaf A   ──────►    ┌────────┬────────┐
//!        └── leaf B              │   A    │   B    │
//!                                └────────┴────────┘
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{EntityKind, PaneId, SurfaceId};
use crate::surface::Surface;

/// Smallest share a split may give either child.
pub const MIN_SPLIT_RATIO: f64 = 0.1;
/// Largest share a split may give its first child.
pub const MAX_SPLIT_RATIO: f64 = 0.9;
pub const DEFAULT_SPLIT_RATIO: f64 = 0.5;

/// Clamp a requested ratio into the allowed range.
#[must_use]
pub fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(MIN_SPLIT_RATIO, MAX_SPLIT_RATIO)
    } else {
        DEFAULT_SPLIT_RATIO
    }
}

// =============================================================================
// Geometry vocabulary
// =============================================================================

/// Axis along which a split lays out its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Left to right.
    Horizontal,
    /// Top to bottom.
    Vertical,
}

impl Orientation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Horizontal => "horizontal",
            Self::Vertical => "vertical",
        }
    }
}

/// Which child slot the new pane takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    First,
    Second,
}

/// Split direction as named on the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Left,
    #[default]
    Right,
    Up,
    Down,
}

impl Direction {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "left" | "l" => Some(Self::Left),
            "right" | "r" => Some(Self::Right),
            "up" | "u" | "top" => Some(Self::Up),
            "down" | "d" | "bottom" => Some(Self::Down),
            _ => None,
        }
    }

    /// Orientation of the resulting split and the slot of the new pane.
    #[must_use]
    pub const fn split_params(self) -> (Orientation, Placement) {
        match self {
            Self::Left => (Orientation::Horizontal, Placement::First),
            Self::Right => (Orientation::Horizontal, Placement::Second),
            Self::Up => (Orientation::Vertical, Placement::First),
            Self::Down => (Orientation::Vertical, Placement::Second),
        }
    }
}

// =============================================================================
// Tree
// =============================================================================

/// A node of the split tree.
#[derive(Debug, Clone)]
pub enum Node {
    /// Hosts exactly one surface.
    Leaf { surface: Surface },
    /// Exactly two children.
    Split {
        orientation: Orientation,
        ratio: f64,
        first: PaneId,
        second: PaneId,
    },
}

#[derive(Debug, Clone)]
struct Slot {
    parent: Option<PaneId>,
    node: Node,
}

/// Owned nested description of a tree, used to rebuild one from a snapshot.
#[derive(Debug)]
pub enum NodeSeed {
    Leaf {
        id: PaneId,
        surface: Surface,
    },
    Split {
        id: PaneId,
        orientation: Orientation,
        ratio: f64,
        first: Box<NodeSeed>,
        second: Box<NodeSeed>,
    },
}

/// What [`PaneTree::remove_leaf`] took out of the tree.
#[derive(Debug)]
pub struct RemovedLeaf {
    /// The split node that disappeared with the leaf.
    pub split: PaneId,
    /// The sibling that took the split's place.
    pub promoted: PaneId,
    pub surface: Surface,
}

/// Binary split tree of panes.
#[derive(Debug, Clone)]
pub struct PaneTree {
    root: PaneId,
    slots: HashMap<PaneId, Slot>,
}

impl PaneTree {
    /// A tree holding a single leaf.
    #[must_use]
    pub fn new(root: PaneId, surface: Surface) -> Self {
        let mut slots = HashMap::new();
        slots.insert(
            root.clone(),
            Slot {
                parent: None,
                node: Node::Leaf { surface },
            },
        );
        Self { root, slots }
    }

    /// Rebuild a tree from a nested seed. Duplicate pane IDs are rejected.
    pub fn from_seed(seed: NodeSeed) -> Result<Self> {
        let root = match &seed {
            NodeSeed::Leaf { id, .. } | NodeSeed::Split { id, .. } => id.clone(),
        };
        let mut tree = Self {
            root,
            slots: HashMap::new(),
        };
        tree.plant(seed, None)?;
        Ok(tree)
    }

    fn plant(&mut self, seed: NodeSeed, parent: Option<PaneId>) -> Result<PaneId> {
        match seed {
            NodeSeed::Leaf { id, surface } => {
                self.insert_slot(&id, parent, Node::Leaf { surface })?;
                Ok(id)
            }
            NodeSeed::Split {
                id,
                orientation,
                ratio,
                first,
                second,
            } => {
                if self.slots.contains_key(&id) {
                    return Err(Error::invalid(format!("duplicate pane id {id}")));
                }
                let first = self.plant(*first, Some(id.clone()))?;
                let second = self.plant(*second, Some(id.clone()))?;
                let node = Node::Split {
                    orientation,
                    ratio: clamp_ratio(ratio),
                    first,
                    second,
                };
                self.insert_slot(&id, parent, node)?;
                Ok(id)
            }
        }
    }

    fn insert_slot(&mut self, id: &PaneId, parent: Option<PaneId>, node: Node) -> Result<()> {
        if self.slots.contains_key(id) {
            return Err(Error::invalid(format!("duplicate pane id {id}")));
        }
        self.slots.insert(id.clone(), Slot { parent, node });
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &PaneId {
        &self.root
    }

    #[must_use]
    pub fn node(&self, id: &PaneId) -> Option<&Node> {
        self.slots.get(id).map(|slot| &slot.node)
    }

    #[must_use]
    pub fn contains(&self, id: &PaneId) -> bool {
        self.slots.contains_key(id)
    }

    #[must_use]
    pub fn is_leaf(&self, id: &PaneId) -> bool {
        matches!(self.node(id), Some(Node::Leaf { .. }))
    }

    #[must_use]
    pub fn parent(&self, id: &PaneId) -> Option<&PaneId> {
        self.slots.get(id).and_then(|slot| slot.parent.as_ref())
    }

    /// Total node count, splits included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All node IDs, pre-order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<PaneId> {
        let mut out = Vec::with_capacity(self.slots.len());
        self.walk(&self.root, &mut |id, _| out.push(id.clone()));
        out
    }

    /// Leaf IDs in document order.
    #[must_use]
    pub fn leaves(&self) -> Vec<PaneId> {
        let mut out = Vec::new();
        self.walk(&self.root, &mut |id, node| {
            if matches!(node, Node::Leaf { .. }) {
                out.push(id.clone());
            }
        });
        out
    }

    /// First leaf of the subtree rooted at `id`, in document order.
    #[must_use]
    pub fn first_leaf_of(&self, id: &PaneId) -> Option<PaneId> {
        let mut current = id;
        loop {
            match self.node(current)? {
                Node::Leaf { .. } => return Some(current.clone()),
                Node::Split { first, .. } => current = first,
            }
        }
    }

    fn walk<'a>(&'a self, id: &'a PaneId, visit: &mut impl FnMut(&'a PaneId, &'a Node)) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        visit(id, &slot.node);
        if let Node::Split { first, second, .. } = &slot.node {
            self.walk(first, visit);
            self.walk(second, visit);
        }
    }

    #[must_use]
    pub fn surface(&self, pane: &PaneId) -> Option<&Surface> {
        match self.node(pane)? {
            Node::Leaf { surface } => Some(surface),
            Node::Split { .. } => None,
        }
    }

    pub fn surface_mut(&mut self, pane: &PaneId) -> Option<&mut Surface> {
        match &mut self.slots.get_mut(pane)?.node {
            Node::Leaf { surface } => Some(surface),
            Node::Split { .. } => None,
        }
    }

    /// Surfaces with their panes, in document order.
    #[must_use]
    pub fn surfaces(&self) -> Vec<(PaneId, &Surface)> {
        let mut out = Vec::new();
        self.walk(&self.root, &mut |id, node| {
            if let Node::Leaf { surface } = node {
                out.push((id.clone(), surface));
            }
        });
        out
    }

    /// Every surface, in no particular order.
    pub fn surfaces_mut(&mut self) -> impl Iterator<Item = &mut Surface> {
        self.slots.values_mut().filter_map(|slot| match &mut slot.node {
            Node::Leaf { surface } => Some(surface),
            Node::Split { .. } => None,
        })
    }

    /// Pane hosting `surface`.
    #[must_use]
    pub fn pane_of_surface(&self, surface: &SurfaceId) -> Option<PaneId> {
        self.slots.iter().find_map(|(id, slot)| match &slot.node {
            Node::Leaf { surface: s } if s.id() == surface => Some(id.clone()),
            _ => None,
        })
    }

    /// Turn leaf `target` into a split node with ID `split_id`.
    ///
    /// `target` keeps its ID and surface and becomes one child; `new_leaf`
    /// hosting `surface` becomes the other, in the slot named by `placement`.
    pub fn split(
        &mut self,
        target: &PaneId,
        split_id: PaneId,
        new_leaf: PaneId,
        surface: Surface,
        orientation: Orientation,
        placement: Placement,
        ratio: f64,
    ) -> Result<()> {
        let Some(slot) = self.slots.get(target) else {
            return Err(Error::not_found(EntityKind::Pane, target.as_str()));
        };
        if !matches!(slot.node, Node::Leaf { .. }) {
            return Err(Error::invalid(format!("pane {target} is a split, not a leaf")));
        }
        if self.slots.contains_key(&split_id) || self.slots.contains_key(&new_leaf) {
            return Err(Error::invalid("split would reuse an existing pane id"));
        }
        let parent = slot.parent.clone();

        let (first, second) = match placement {
            Placement::First => (new_leaf.clone(), target.clone()),
            Placement::Second => (target.clone(), new_leaf.clone()),
        };
        if let Some(parent) = &parent {
            self.replace_child(parent, target, &split_id);
        } else {
            self.root = split_id.clone();
        }
        self.slots.insert(
            split_id.clone(),
            Slot {
                parent,
                node: Node::Split {
                    orientation,
                    ratio: clamp_ratio(ratio),
                    first,
                    second,
                },
            },
        );
        self.slots.insert(
            new_leaf,
            Slot {
                parent: Some(split_id.clone()),
                node: Node::Leaf { surface },
            },
        );
        if let Some(slot) = self.slots.get_mut(target) {
            slot.parent = Some(split_id);
        }
        Ok(())
    }

    /// Remove leaf `target`; its sibling takes the parent split's place.
    ///
    /// The root leaf cannot be removed: a workspace always owns a pane.
    pub fn remove_leaf(&mut self, target: &PaneId) -> Result<RemovedLeaf> {
        let Some(slot) = self.slots.get(target) else {
            return Err(Error::not_found(EntityKind::Pane, target.as_str()));
        };
        if !matches!(slot.node, Node::Leaf { .. }) {
            return Err(Error::invalid(format!("pane {target} is a split, not a leaf")));
        }
        let Some(split) = slot.parent.clone() else {
            return Err(Error::invalid("cannot remove the only pane of a workspace"));
        };
        let Some(Slot {
            parent: grandparent,
            node: Node::Split { first, second, .. },
        }) = self.slots.remove(&split)
        else {
            return Err(Error::invalid(format!("pane {split} is not a split")));
        };
        let promoted = if &first == target { second } else { first };

        let Some(Slot {
            node: Node::Leaf { surface },
            ..
        }) = self.slots.remove(target)
        else {
            return Err(Error::invalid(format!("pane {target} vanished during removal")));
        };

        if let Some(slot) = self.slots.get_mut(&promoted) {
            slot.parent.clone_from(&grandparent);
        }
        match &grandparent {
            Some(grandparent) => self.replace_child(grandparent, &split, &promoted),
            None => self.root = promoted.clone(),
        }
        Ok(RemovedLeaf {
            split,
            promoted,
            surface,
        })
    }

    fn replace_child(&mut self, parent: &PaneId, old: &PaneId, new: &PaneId) {
        if let Some(Slot {
            node: Node::Split { first, second, .. },
            ..
        }) = self.slots.get_mut(parent)
        {
            if first == old {
                *first = new.clone();
            } else if second == old {
                *second = new.clone();
            }
        }
    }

    /// Set the ratio of split `id`; returns the clamped value stored.
    pub fn set_ratio(&mut self, id: &PaneId, ratio: f64) -> Result<f64> {
        match self.slots.get_mut(id).map(|slot| &mut slot.node) {
            Some(Node::Split { ratio: stored, .. }) => {
                *stored = clamp_ratio(ratio);
                Ok(*stored)
            }
            Some(Node::Leaf { .. }) => Err(Error::invalid(format!("pane {id} is not a split"))),
            None => Err(Error::not_found(EntityKind::Pane, id.as_str())),
        }
    }

    /// Check structural consistency. Returns the first violation found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let root = self
            .slots
            .get(&self.root)
            .ok_or_else(|| format!("root {} missing", self.root))?;
        if root.parent.is_some() {
            return Err(format!("root {} has a parent", self.root));
        }
        let reachable = self.node_ids();
        if reachable.len() != self.slots.len() {
            return Err(format!(
                "{} nodes stored but {} reachable from the root",
                self.slots.len(),
                reachable.len()
            ));
        }
        for id in &reachable {
            let Some(slot) = self.slots.get(id) else {
                continue;
            };
            if let Node::Split {
                first,
                second,
                ratio,
                ..
            } = &slot.node
            {
                if first == second {
                    return Err(format!("split {id} has the same child twice"));
                }
                if !(MIN_SPLIT_RATIO..=MAX_SPLIT_RATIO).contains(ratio) {
                    return Err(format!("split {id} ratio {ratio} out of range"));
                }
                for child in [first, second] {
                    if self.parent(child) != Some(id) {
                        return Err(format!("child {child} does not point back to {id}"));
                    }
                }
            }
        }
        Ok(())
    }
}
