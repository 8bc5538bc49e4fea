//! Kind and field metadata for the lexicon object graph.
//!
//! The [`Schema`] answers every structural question the integrity engine
//! asks about a field: is it owning or a plain reference, what cardinality
//! does it have, which kind may it point at, and is it one half of a
//! coupled subset/superset pair. Kinds may derive from a base kind; a field
//! declared on a base kind is present on every derived kind, and a field
//! targeting a base kind accepts instances of every derived kind.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{FieldId, KindId};

/// Whether a field owns its values, refers to them, or stores a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldRole {
    /// Tree-structured: at most one owner, deleting the owner deletes the value.
    Owning,
    /// Graph-structured: arbitrary fan-in, no ownership implied.
    Reference,
    /// Scalar string.
    Text,
    /// Scalar integer.
    Integer,
}

impl FieldRole {
    /// Returns `true` for fields whose values are entity ids.
    pub fn holds_objects(self) -> bool {
        matches!(self, FieldRole::Owning | FieldRole::Reference)
    }
}

/// Field cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    /// Zero or one value.
    Atomic,
    /// Unordered set of unique values.
    Collection,
    /// Ordered list; positions are meaningful.
    Sequence,
}

/// Which half of a coupled pair a field is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoupledSide {
    /// The full set (e.g. all components of a complex form).
    Superset,
    /// Constrained to be a subset of the partner (e.g. primary components).
    Subset,
}

/// Link from one field of a coupled pair to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coupling {
    pub partner: FieldId,
    pub side: CoupledSide,
}

/// A declared object kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindDef {
    pub id: KindId,
    pub name: String,
    /// Base kind, `None` for roots of the kind hierarchy.
    pub base: Option<KindId>,
}

/// Full metadata for a declared field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: FieldId,
    /// Kind that declares this field.
    pub owner: KindId,
    pub name: String,
    pub role: FieldRole,
    pub cardinality: Cardinality,
    /// Kind of entity this field may hold. `None` for scalar fields.
    pub target: Option<KindId>,
    /// Sequences only: whether the same target may appear more than once.
    pub allow_duplicates: bool,
    /// Reference fields only: edges through this field must never form a
    /// cycle between top-level objects (component-of relations).
    pub acyclic: bool,
    /// Reference sequences/collections only: the owning object is deleted
    /// when the last value is removed.
    pub delete_owner_when_empty: bool,
    /// Atomic owning fields only: owning field on the same kind that
    /// receives a displaced value during merge.
    pub alternates: Option<FieldId>,
    pub coupling: Option<Coupling>,
}

impl FieldDef {
    pub fn is_reference(&self) -> bool {
        self.role == FieldRole::Reference
    }

    pub fn is_owning(&self) -> bool {
        self.role == FieldRole::Owning
    }
}

/// Builder-style declaration of a field, consumed by [`Schema::add_field`].
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub owner: KindId,
    pub name: String,
    pub role: FieldRole,
    pub cardinality: Cardinality,
    pub target: Option<KindId>,
    pub allow_duplicates: bool,
    pub acyclic: bool,
    pub delete_owner_when_empty: bool,
    pub alternates: Option<FieldId>,
}

impl FieldSpec {
    fn base(owner: KindId, name: &str, role: FieldRole, cardinality: Cardinality) -> Self {
        FieldSpec {
            owner,
            name: name.to_string(),
            role,
            cardinality,
            target: None,
            allow_duplicates: true,
            acyclic: false,
            delete_owner_when_empty: false,
            alternates: None,
        }
    }

    /// An owning field holding entities of `target`.
    pub fn owning(owner: KindId, name: &str, cardinality: Cardinality, target: KindId) -> Self {
        FieldSpec {
            target: Some(target),
            allow_duplicates: false,
            ..Self::base(owner, name, FieldRole::Owning, cardinality)
        }
    }

    /// A non-owning reference field holding entities of `target`.
    pub fn reference(owner: KindId, name: &str, cardinality: Cardinality, target: KindId) -> Self {
        FieldSpec {
            target: Some(target),
            ..Self::base(owner, name, FieldRole::Reference, cardinality)
        }
    }

    pub fn text(owner: KindId, name: &str) -> Self {
        Self::base(owner, name, FieldRole::Text, Cardinality::Atomic)
    }

    pub fn integer(owner: KindId, name: &str) -> Self {
        Self::base(owner, name, FieldRole::Integer, Cardinality::Atomic)
    }

    pub fn acyclic(mut self) -> Self {
        self.acyclic = true;
        self
    }

    pub fn no_duplicates(mut self) -> Self {
        self.allow_duplicates = false;
        self
    }

    pub fn delete_owner_when_empty(mut self) -> Self {
        self.delete_owner_when_empty = true;
        self
    }

    pub fn alternates(mut self, field: FieldId) -> Self {
        self.alternates = Some(field);
        self
    }
}

/// Registry of kinds and fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Kinds indexed by KindId.0
    kinds: Vec<KindDef>,
    /// Fields indexed by FieldId.0
    fields: Vec<FieldDef>,
    /// Kind name lookup
    kind_names: HashMap<String, KindId>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Declaration
    // -----------------------------------------------------------------------

    /// Declares a kind, optionally deriving from `base`.
    ///
    /// Returns [`CoreError::DuplicateKindName`] if the name is taken.
    pub fn add_kind(&mut self, name: &str, base: Option<KindId>) -> Result<KindId, CoreError> {
        if self.kind_names.contains_key(name) {
            return Err(CoreError::DuplicateKindName {
                name: name.to_string(),
            });
        }
        if let Some(base) = base {
            self.require_kind(base)?;
        }
        let id = KindId(self.kinds.len() as u32);
        self.kinds.push(KindDef {
            id,
            name: name.to_string(),
            base,
        });
        self.kind_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Declares a field and returns its id.
    pub fn add_field(&mut self, spec: FieldSpec) -> Result<FieldId, CoreError> {
        self.require_kind(spec.owner)?;
        if self.field_by_name(spec.owner, &spec.name).is_some() {
            return Err(CoreError::DuplicateFieldName {
                kind: spec.owner,
                name: spec.name,
            });
        }

        let invalid = |reason: &str| CoreError::InvalidField {
            name: spec.name.clone(),
            reason: reason.to_string(),
        };

        match spec.role {
            FieldRole::Owning | FieldRole::Reference => {
                let target = spec.target.ok_or_else(|| invalid("object field needs a target kind"))?;
                self.require_kind(target)?;
            }
            FieldRole::Text | FieldRole::Integer => {
                if spec.target.is_some() || spec.cardinality != Cardinality::Atomic {
                    return Err(invalid("scalar fields are atomic and have no target"));
                }
            }
        }
        if spec.acyclic && spec.role != FieldRole::Reference {
            return Err(invalid("only reference fields can be acyclic"));
        }
        if spec.delete_owner_when_empty
            && (spec.role != FieldRole::Reference || spec.cardinality == Cardinality::Atomic)
        {
            return Err(invalid(
                "delete-owner-when-empty needs a reference collection or sequence",
            ));
        }
        if let Some(alt) = spec.alternates {
            if spec.role != FieldRole::Owning || spec.cardinality != Cardinality::Atomic {
                return Err(invalid("only atomic owning fields can name an alternates field"));
            }
            let alt_def = self.require_field(alt)?;
            if alt_def.role != FieldRole::Owning
                || alt_def.cardinality == Cardinality::Atomic
                || !self.is_a(spec.owner, alt_def.owner)
            {
                return Err(invalid(
                    "alternates field must be an owning collection or sequence on the same kind",
                ));
            }
        }

        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldDef {
            id,
            owner: spec.owner,
            name: spec.name,
            role: spec.role,
            cardinality: spec.cardinality,
            target: spec.target,
            allow_duplicates: spec.allow_duplicates,
            acyclic: spec.acyclic,
            delete_owner_when_empty: spec.delete_owner_when_empty,
            alternates: spec.alternates,
            coupling: None,
        });
        Ok(id)
    }

    /// Couples two reference sequences on the same kind: every member of
    /// `subset` must also be a member of `superset`.
    pub fn couple(&mut self, superset: FieldId, subset: FieldId) -> Result<(), CoreError> {
        if superset == subset {
            return Err(CoreError::InvalidCoupling {
                reason: "a field cannot be coupled with itself".into(),
            });
        }
        let sup = self.require_field(superset)?;
        let sub = self.require_field(subset)?;
        for def in [sup, sub] {
            if def.role != FieldRole::Reference || def.cardinality != Cardinality::Sequence {
                return Err(CoreError::InvalidCoupling {
                    reason: format!("field '{}' is not a reference sequence", def.name),
                });
            }
            if def.coupling.is_some() {
                return Err(CoreError::InvalidCoupling {
                    reason: format!("field '{}' is already coupled", def.name),
                });
            }
        }
        if sup.owner != sub.owner {
            return Err(CoreError::InvalidCoupling {
                reason: "coupled fields must be declared on the same kind".into(),
            });
        }

        self.fields[superset.0 as usize].coupling = Some(Coupling {
            partner: subset,
            side: CoupledSide::Superset,
        });
        self.fields[subset.0 as usize].coupling = Some(Coupling {
            partner: superset,
            side: CoupledSide::Subset,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    pub fn kind(&self, id: KindId) -> Option<&KindDef> {
        self.kinds.get(id.0 as usize)
    }

    pub fn kind_by_name(&self, name: &str) -> Option<KindId> {
        self.kind_names.get(name).copied()
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldDef> {
        self.fields.get(id.0 as usize)
    }

    /// Like [`field`](Self::field) but returns [`CoreError::FieldNotFound`].
    pub fn require_field(&self, id: FieldId) -> Result<&FieldDef, CoreError> {
        self.field(id).ok_or(CoreError::FieldNotFound { id })
    }

    /// Like [`kind`](Self::kind) but returns [`CoreError::KindNotFound`].
    pub fn require_kind(&self, id: KindId) -> Result<&KindDef, CoreError> {
        self.kind(id).ok_or(CoreError::KindNotFound { id })
    }

    /// Finds a field declared directly on `kind` by name.
    pub fn field_by_name(&self, kind: KindId, name: &str) -> Option<FieldId> {
        self.fields
            .iter()
            .find(|f| f.owner == kind && f.name == name)
            .map(|f| f.id)
    }

    /// Returns `kind` followed by its base chain.
    pub fn ancestors(&self, kind: KindId) -> Vec<KindId> {
        let mut chain = Vec::new();
        let mut current = Some(kind);
        while let Some(k) = current {
            if chain.contains(&k) {
                break;
            }
            chain.push(k);
            current = self.kind(k).and_then(|def| def.base);
        }
        chain
    }

    /// Returns `true` if `kind` is `ancestor` or derives from it.
    pub fn is_a(&self, kind: KindId, ancestor: KindId) -> bool {
        self.ancestors(kind).contains(&ancestor)
    }

    /// Returns `kind` and every kind deriving from it.
    pub fn descendant_kinds(&self, kind: KindId) -> Vec<KindId> {
        self.kinds
            .iter()
            .filter(|k| self.is_a(k.id, kind))
            .map(|k| k.id)
            .collect()
    }

    /// All fields present on `kind`, base-kind fields first.
    pub fn fields_of(&self, kind: KindId) -> Vec<&FieldDef> {
        let mut chain = self.ancestors(kind);
        chain.reverse();
        chain
            .into_iter()
            .flat_map(|k| self.fields.iter().filter(move |f| f.owner == k))
            .collect()
    }

    /// Reference fields able to hold an instance of `kind`.
    pub fn reference_fields_targeting(&self, kind: KindId) -> Vec<FieldId> {
        self.fields
            .iter()
            .filter(|f| f.role == FieldRole::Reference)
            .filter(|f| f.target.is_some_and(|t| self.is_a(kind, t)))
            .map(|f| f.id)
            .collect()
    }

    /// Returns an iterator over all declared fields.
    pub fn all_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }

    /// Returns an iterator over all declared kinds.
    pub fn all_kinds(&self) -> impl Iterator<Item = &KindDef> {
        self.kinds.iter()
    }
}
