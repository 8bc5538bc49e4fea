//! Cycle pre-checks for reference edits.
//!
//! Two rules are enforced before any mutation happens:
//!
//! - **Self reference** (every reference field): a source may not refer to
//!   itself or to one of its owners.
//! - **Component cycles** (fields declared `acyclic`): following acyclic
//!   references between top-level objects must never lead back to where it
//!   started. The check builds a [`ComponentGraph`] of top-level objects
//!   reachable from the proposed target and searches it for a path back to
//!   the source.
//!
//! Merges check the graph as it will look afterwards: a [`Redirect`] maps
//! every entity of the absorbed subtree onto the surviving top-level object
//! and hides the edges the merge drops.

use std::collections::{HashSet, VecDeque};

use petgraph::algo::astar;
use petgraph::graphmap::DiGraphMap;

use lexgraph_core::{EntityId, FieldDef, FieldId};
use lexgraph_store::EntityStore;

use crate::error::IntegrityError;

/// Checks that `referrer.field = target` would not close a cycle.
pub fn check_reference(
    store: &dyn EntityStore,
    referrer: EntityId,
    def: &FieldDef,
    target: EntityId,
) -> Result<(), IntegrityError> {
    if target == referrer {
        return Err(IntegrityError::CyclicReference {
            referrer,
            target,
            path: vec![referrer],
        });
    }
    let chain = store.owner_chain(referrer)?;
    if let Some(depth) = chain.iter().position(|&owner| owner == target) {
        let mut path = vec![referrer];
        path.extend_from_slice(&chain[..=depth]);
        return Err(IntegrityError::CyclicReference {
            referrer,
            target,
            path,
        });
    }
    if !def.acyclic {
        return Ok(());
    }

    let from = store.root_of(target)?;
    let to = chain.last().copied().unwrap_or(referrer);
    if from == to {
        return Err(IntegrityError::CyclicReference {
            referrer,
            target,
            path: vec![from],
        });
    }
    let graph = ComponentGraph::explore(store, from, None)?;
    if let Some(path) = graph.path(from, to) {
        tracing::debug!(%referrer, %target, hops = path.len(), "component cycle rejected");
        return Err(IntegrityError::CyclicReference {
            referrer,
            target,
            path,
        });
    }
    Ok(())
}

/// How a pending merge reshapes the component graph.
#[derive(Debug, Clone)]
pub struct Redirect {
    /// The entity being absorbed.
    pub secondary: EntityId,
    /// Subtree of `secondary`.
    pub absorbed: HashSet<EntityId>,
    /// Subtree of the surviving entity.
    pub primary_subtree: HashSet<EntityId>,
    /// The surviving entity and its owners.
    pub upper: HashSet<EntityId>,
    /// Top-level object the absorbed entities end up under.
    pub into_node: EntityId,
}

impl Redirect {
    /// Builds the redirect for absorbing `secondary` into `primary`.
    pub fn for_merge(
        store: &dyn EntityStore,
        primary: EntityId,
        secondary: EntityId,
    ) -> Result<Self, IntegrityError> {
        let mut upper: HashSet<EntityId> = store.owner_chain(primary)?.into_iter().collect();
        upper.insert(primary);
        Ok(Redirect {
            secondary,
            absorbed: store.subtree(secondary)?.into_iter().collect(),
            primary_subtree: store.subtree(primary)?.into_iter().collect(),
            upper,
            into_node: store.root_of(primary)?,
        })
    }

    fn on_primary_side(&self, entity: EntityId) -> bool {
        self.primary_subtree.contains(&entity) || self.upper.contains(&entity)
    }

    /// Returns `true` if the edge links the two merging sides directly.
    pub fn crosses(&self, source: EntityId, target: EntityId) -> bool {
        (self.absorbed.contains(&source) && self.on_primary_side(target))
            || (self.on_primary_side(source) && self.absorbed.contains(&target))
    }

    /// Returns `true` if the merge removes this edge instead of carrying it
    /// over: acyclic edges across the two sides, and edges across the sides
    /// that would end up pointing at their own source or one of its owners.
    pub fn drops(&self, source: EntityId, def: &FieldDef, target: EntityId) -> bool {
        if !self.crosses(source, target) {
            return false;
        }
        def.acyclic
            || (self.absorbed.contains(&source) && self.upper.contains(&target))
            || (target == self.secondary && self.primary_subtree.contains(&source))
    }
}

/// Directed graph of top-level objects linked by acyclic reference fields.
///
/// An edge `a -> b` labelled with a field means some entity owned by `a`
/// (or `a` itself) lists an entity owned by `b` in that field.
#[derive(Debug, Default)]
pub struct ComponentGraph {
    graph: DiGraphMap<EntityId, FieldId>,
}

impl ComponentGraph {
    /// Builds the part of the graph reachable from `start`.
    pub fn explore(
        store: &dyn EntityStore,
        start: EntityId,
        redirect: Option<&Redirect>,
    ) -> Result<Self, IntegrityError> {
        let schema = store.schema();
        let acyclic: Vec<&FieldDef> = schema
            .all_fields()
            .filter(|def| def.is_reference() && def.acyclic)
            .collect();

        let mut graph = DiGraphMap::new();
        graph.add_node(start);
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(node) = queue.pop_front() {
            for member in members_of(store, node, redirect)? {
                let entity = store.get(member)?;
                for def in &acyclic {
                    let Ok(value) = entity.value(def.id) else {
                        continue;
                    };
                    for target in value.targets() {
                        if redirect.is_some_and(|r| r.drops(member, def, target)) {
                            continue;
                        }
                        let next = node_of(store, target, redirect)?;
                        graph.add_edge(node, next, def.id);
                        if visited.insert(next) {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }
        Ok(ComponentGraph { graph })
    }

    /// Shortest chain of top-level objects leading from `from` to `to`.
    pub fn path(&self, from: EntityId, to: EntityId) -> Option<Vec<EntityId>> {
        if !self.graph.contains_node(from) || !self.graph.contains_node(to) {
            return None;
        }
        astar(&self.graph, from, |n| n == to, |_| 1u32, |_| 0u32).map(|(_, path)| path)
    }

    /// A cycle passing through `node`, starting and ending at it.
    pub fn cycle_through(&self, node: EntityId) -> Option<Vec<EntityId>> {
        let mut best: Option<Vec<EntityId>> = None;
        for next in self.graph.neighbors(node) {
            let candidate = if next == node {
                Some(vec![node, node])
            } else {
                self.path(next, node).map(|rest| {
                    let mut cycle = vec![node];
                    cycle.extend(rest);
                    cycle
                })
            };
            if let Some(cycle) = candidate {
                if best.as_ref().map_or(true, |b| cycle.len() < b.len()) {
                    best = Some(cycle);
                }
            }
        }
        best
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

/// The graph node an entity belongs to.
fn node_of(
    store: &dyn EntityStore,
    entity: EntityId,
    redirect: Option<&Redirect>,
) -> Result<EntityId, IntegrityError> {
    if let Some(r) = redirect {
        if r.absorbed.contains(&entity) {
            return Ok(r.into_node);
        }
    }
    Ok(store.root_of(entity)?)
}

/// Entities whose outgoing references count as edges of `node`.
fn members_of(
    store: &dyn EntityStore,
    node: EntityId,
    redirect: Option<&Redirect>,
) -> Result<Vec<EntityId>, IntegrityError> {
    let mut members = store.subtree(node)?;
    if let Some(r) = redirect {
        members.retain(|m| !r.absorbed.contains(m));
        if node == r.into_node {
            members.extend(r.absorbed.iter().copied());
        }
    }
    Ok(members)
}
