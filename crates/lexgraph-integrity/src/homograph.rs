//! Homograph numbering.
//!
//! Entries of the configured homograph kind are grouped by the
//! [`HomographKey`] the host computes for them. Within a group of `N > 1`
//! members the numbers are exactly `{1..N}`; a lone member gets 0, and
//! every member of the sentinel "no form" group gets 0.
//!
//! Groups are never stored. [`HomographRegistry`] rebuilds a group from
//! the live instances whenever it is asked about one and returns the number
//! writes as a plan of [`NumberChange`]s; the engine applies them so that
//! each write is reported to the transaction boundary.

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use lexgraph_core::{EntityId, FieldId, FieldRole, HomographKey, KindId};
use lexgraph_store::EntityStore;

use crate::error::IntegrityError;

/// Host callback computing the homograph key of an entry.
pub trait KeyFunction {
    fn key_of(&self, store: &dyn EntityStore, entity: EntityId) -> HomographKey;
}

impl<F> KeyFunction for F
where
    F: Fn(&dyn EntityStore, EntityId) -> HomographKey,
{
    fn key_of(&self, store: &dyn EntityStore, entity: EntityId) -> HomographKey {
        self(store, entity)
    }
}

/// Which entities are numbered and where the number is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomographConfig {
    pub kind: KindId,
    /// Integer field on `kind` holding the homograph number.
    pub number_field: FieldId,
}

/// A single planned number write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberChange {
    pub entity: EntityId,
    pub old: u32,
    pub new: u32,
}

/// Result of [`renumber`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenumberOutcome {
    /// New number for each member, in member order.
    pub numbers: Vec<u32>,
    /// `true` when a gap could not be filled and the whole group was
    /// renumbered from scratch.
    pub full_renumber: bool,
}

/// Computes the numbering of one group from its members' current numbers.
///
/// `current` is in member order (creation order). Members keeping a number
/// in `1..=N` are left alone; each gap takes the first unnumbered member.
/// If some gap has no unnumbered member left, members are stably sorted by
/// current number and numbered `1..N` in that order.
pub fn renumber(current: &[u32]) -> RenumberOutcome {
    match current.len() {
        0 => {
            return RenumberOutcome {
                numbers: Vec::new(),
                full_renumber: false,
            }
        }
        1 => {
            return RenumberOutcome {
                numbers: vec![0],
                full_renumber: false,
            }
        }
        _ => {}
    }

    let size = current.len() as u32;
    let mut numbers = current.to_vec();
    let mut unfillable = false;
    for n in 1..=size {
        if numbers.contains(&n) {
            continue;
        }
        match numbers.iter().position(|&m| m == 0) {
            Some(slot) => numbers[slot] = n,
            None => {
                unfillable = true;
                break;
            }
        }
    }

    if unfillable {
        let mut order: Vec<usize> = (0..current.len()).collect();
        order.sort_by_key(|&i| current[i]);
        for (rank, member) in order.into_iter().enumerate() {
            numbers[member] = rank as u32 + 1;
        }
    }

    RenumberOutcome {
        numbers,
        full_renumber: unfillable,
    }
}

/// A group whose stored numbers break the density rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupViolation {
    pub key: HomographKey,
    /// Members and their stored numbers, in member order.
    pub members: Vec<(EntityId, u32)>,
}

impl fmt::Display for GroupViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.key)?;
        for (entity, number) in &self.members {
            write!(f, " {}={}", entity, number)?;
        }
        Ok(())
    }
}

/// Groups entries by key and plans their numbering.
pub struct HomographRegistry {
    config: HomographConfig,
    key_fn: Box<dyn KeyFunction>,
    missing_marker: String,
}

impl fmt::Debug for HomographRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HomographRegistry")
            .field("config", &self.config)
            .field("missing_marker", &self.missing_marker)
            .finish_non_exhaustive()
    }
}

impl HomographRegistry {
    /// Creates a registry, checking that the number field is an integer
    /// field present on the homograph kind.
    pub fn new(
        store: &dyn EntityStore,
        config: HomographConfig,
        key_fn: Box<dyn KeyFunction>,
        missing_marker: impl Into<String>,
    ) -> Result<Self, IntegrityError> {
        let schema = store.schema();
        schema.require_kind(config.kind)?;
        let field = schema.require_field(config.number_field)?;
        if field.role != FieldRole::Integer {
            return Err(IntegrityError::HomographConfig {
                reason: format!("number field '{}' is not an integer field", field.name),
            });
        }
        if !schema.is_a(config.kind, field.owner) {
            return Err(IntegrityError::HomographConfig {
                reason: format!(
                    "number field '{}' is not declared on the homograph kind",
                    field.name
                ),
            });
        }
        Ok(HomographRegistry {
            config,
            key_fn,
            missing_marker: missing_marker.into(),
        })
    }

    pub fn config(&self) -> HomographConfig {
        self.config
    }

    pub fn missing_marker(&self) -> &str {
        &self.missing_marker
    }

    pub(crate) fn set_missing_marker(&mut self, marker: impl Into<String>) {
        self.missing_marker = marker.into();
    }

    /// Returns `true` if `entity` is an instance of the homograph kind.
    pub fn is_numbered(&self, store: &dyn EntityStore, entity: EntityId) -> bool {
        store
            .get(entity)
            .is_ok_and(|e| store.schema().is_a(e.kind(), self.config.kind))
    }

    /// The key of `entity`. Every exempt key collapses to
    /// [`HomographKey::sentinel`], so all formless entries share one group.
    pub fn key_of(&self, store: &dyn EntityStore, entity: EntityId) -> HomographKey {
        let key = self.key_fn.key_of(store, entity);
        if self.is_sentinel(&key) {
            HomographKey::sentinel()
        } else {
            key
        }
    }

    pub fn is_sentinel(&self, key: &HomographKey) -> bool {
        key.is_sentinel(&self.missing_marker)
    }

    /// The stored number of `entity`; 0 for unreadable or out-of-range values.
    pub fn number_of(&self, store: &dyn EntityStore, entity: EntityId) -> u32 {
        store
            .get(entity)
            .and_then(|e| Ok(e.integer(self.config.number_field)?))
            .map(|n| u32::try_from(n).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Live members of the group for `key`, in creation order.
    pub fn group(
        &self,
        store: &dyn EntityStore,
        key: &HomographKey,
        excluding: &HashSet<EntityId>,
    ) -> Vec<EntityId> {
        store
            .all_instances_of(self.config.kind)
            .into_iter()
            .filter(|id| !excluding.contains(id))
            .filter(|&id| self.key_of(store, id) == *key)
            .collect()
    }

    /// Plans the numbering of the group for `key`.
    ///
    /// `entering` is treated as unnumbered so it takes the lowest vacant
    /// number instead of keeping one from its previous group.
    pub fn plan_group(
        &self,
        store: &dyn EntityStore,
        key: &HomographKey,
        excluding: &HashSet<EntityId>,
        entering: Option<EntityId>,
    ) -> Vec<NumberChange> {
        let members = self.group(store, key, excluding);
        let stored: Vec<u32> = members.iter().map(|&m| self.number_of(store, m)).collect();

        let numbers = if self.is_sentinel(key) {
            vec![0; members.len()]
        } else {
            let current: Vec<u32> = members
                .iter()
                .zip(&stored)
                .map(|(&m, &n)| if Some(m) == entering { 0 } else { n })
                .collect();
            let outcome = renumber(&current);
            if outcome.full_renumber {
                tracing::warn!(
                    key = %key,
                    members = members.len(),
                    "homograph group not dense, renumbering from scratch"
                );
            }
            outcome.numbers
        };

        members
            .into_iter()
            .zip(stored)
            .zip(numbers)
            .filter(|((_, old), new)| old != new)
            .map(|((entity, old), new)| NumberChange { entity, old, new })
            .collect()
    }

    /// Plans the number writes after `entity`'s key changed from `old` to
    /// `new` (`None` on creation and deletion respectively).
    pub fn plan_update(
        &self,
        store: &dyn EntityStore,
        entity: EntityId,
        old: Option<&HomographKey>,
        new: Option<&HomographKey>,
        excluding: &HashSet<EntityId>,
    ) -> Vec<NumberChange> {
        if let (Some(old), Some(new)) = (old, new) {
            if old == new {
                return self.plan_group(store, new, excluding, None);
            }
        }
        let mut changes = Vec::new();
        if let Some(old) = old {
            changes.extend(self.plan_group(store, old, excluding, None));
        }
        if let Some(new) = new {
            changes.extend(self.plan_group(store, new, excluding, Some(entity)));
        }
        changes
    }

    /// Every live member grouped by key, groups in order of first member.
    pub fn all_groups(
        &self,
        store: &dyn EntityStore,
        excluding: &HashSet<EntityId>,
    ) -> IndexMap<HomographKey, Vec<EntityId>> {
        let mut groups: IndexMap<HomographKey, Vec<EntityId>> = IndexMap::new();
        for id in store.all_instances_of(self.config.kind) {
            if excluding.contains(&id) {
                continue;
            }
            groups.entry(self.key_of(store, id)).or_default().push(id);
        }
        groups
    }

    /// Plans a renumbering of every group.
    pub fn plan_all(
        &self,
        store: &dyn EntityStore,
        excluding: &HashSet<EntityId>,
    ) -> Vec<NumberChange> {
        self.all_groups(store, excluding)
            .keys()
            .flat_map(|key| self.plan_group(store, key, excluding, None))
            .collect()
    }

    /// Groups whose stored numbers are not dense. Mutates nothing.
    pub fn audit(&self, store: &dyn EntityStore) -> Vec<GroupViolation> {
        let none = HashSet::new();
        self.all_groups(store, &none)
            .into_iter()
            .filter_map(|(key, members)| {
                let numbered: Vec<(EntityId, u32)> = members
                    .iter()
                    .map(|&m| (m, self.number_of(store, m)))
                    .collect();
                let ok = if self.is_sentinel(&key) || numbered.len() == 1 {
                    numbered.iter().all(|&(_, n)| n == 0)
                } else {
                    let mut numbers: Vec<u32> = numbered.iter().map(|&(_, n)| n).collect();
                    numbers.sort_unstable();
                    numbers.iter().copied().eq(1..=numbered.len() as u32)
                };
                (!ok).then_some(GroupViolation {
                    key,
                    members: numbered,
                })
            })
            .collect()
    }
}
