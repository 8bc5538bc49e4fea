//! Shared lexicon fixture for the integration tests.
//!
//! The schema models a small dictionary:
//!
//! - `LexEntry` with a `Form`, a `Note`, the `HomographNumber`, owned
//!   `Senses` and owned `EntryRefs`;
//! - `LexSense` with a `Gloss` and a `SeeAlso` collection of senses;
//! - `LexEntryRef` with `ComponentLexemes` (acyclic, delete owner when
//!   empty) coupled to its subset `PrimaryLexemes`.

#![allow(dead_code)]

use lexgraph_core::{Cardinality, EntityId, FieldId, FieldSpec, HomographKey, KindId, Schema};
use lexgraph_integrity::{EngineConfig, HomographConfig, IntegrityEngine, RecordingBoundary};
use lexgraph_store::{EntityStore, InMemoryStore};

pub type Engine = IntegrityEngine<InMemoryStore, RecordingBoundary>;

/// Kind and field ids of the test schema.
#[derive(Debug, Clone, Copy)]
pub struct Ids {
    pub entry: KindId,
    pub sense: KindId,
    pub entry_ref: KindId,
    pub form: FieldId,
    pub note: FieldId,
    pub number: FieldId,
    pub senses: FieldId,
    pub entry_refs: FieldId,
    pub gloss: FieldId,
    pub see_also: FieldId,
    pub components: FieldId,
    pub primaries: FieldId,
}

pub fn schema() -> (Schema, Ids) {
    let mut schema = Schema::new();
    let entry = schema.add_kind("LexEntry", None).unwrap();
    let sense = schema.add_kind("LexSense", None).unwrap();
    let entry_ref = schema.add_kind("LexEntryRef", None).unwrap();

    let form = schema.add_field(FieldSpec::text(entry, "Form")).unwrap();
    let note = schema.add_field(FieldSpec::text(entry, "Note")).unwrap();
    let number = schema
        .add_field(FieldSpec::integer(entry, "HomographNumber"))
        .unwrap();
    let senses = schema
        .add_field(FieldSpec::owning(entry, "Senses", Cardinality::Sequence, sense))
        .unwrap();
    let entry_refs = schema
        .add_field(FieldSpec::owning(
            entry,
            "EntryRefs",
            Cardinality::Sequence,
            entry_ref,
        ))
        .unwrap();
    let gloss = schema.add_field(FieldSpec::text(sense, "Gloss")).unwrap();
    let see_also = schema
        .add_field(FieldSpec::reference(
            sense,
            "SeeAlso",
            Cardinality::Collection,
            sense,
        ))
        .unwrap();
    let components = schema
        .add_field(
            FieldSpec::reference(entry_ref, "ComponentLexemes", Cardinality::Sequence, entry)
                .acyclic()
                .delete_owner_when_empty(),
        )
        .unwrap();
    let primaries = schema
        .add_field(FieldSpec::reference(
            entry_ref,
            "PrimaryLexemes",
            Cardinality::Sequence,
            entry,
        ))
        .unwrap();
    schema.couple(components, primaries).unwrap();

    let ids = Ids {
        entry,
        sense,
        entry_ref,
        form,
        note,
        number,
        senses,
        entry_refs,
        gloss,
        see_also,
        components,
        primaries,
    };
    (schema, ids)
}

/// Homograph key: the lowercased form.
pub fn form_key(form: FieldId) -> impl Fn(&dyn EntityStore, EntityId) -> HomographKey {
    move |store: &dyn EntityStore, id: EntityId| {
        let text = store
            .get(id)
            .ok()
            .and_then(|e| e.text(form).ok())
            .unwrap_or_default();
        HomographKey::new(text.trim().to_lowercase(), 0)
    }
}

/// Sub-key: a sense is identified by its gloss.
pub fn gloss_key(gloss: FieldId) -> impl Fn(&dyn EntityStore, EntityId) -> Option<String> {
    move |store: &dyn EntityStore, id: EntityId| {
        let text = store.get(id).ok()?.text(gloss).ok()?;
        (!text.is_empty()).then(|| text.to_string())
    }
}

pub struct Lexicon {
    pub engine: Engine,
    pub ids: Ids,
}

impl Lexicon {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        // Several tests share the process; only the first install wins.
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (schema, ids) = schema();
        Self::over(InMemoryStore::new(schema), ids, config)
    }

    /// Wraps an already populated store.
    pub fn over(store: InMemoryStore, ids: Ids, config: EngineConfig) -> Self {
        let engine = IntegrityEngine::with_config(
            store,
            HomographConfig {
                kind: ids.entry,
                number_field: ids.number,
            },
            form_key(ids.form),
            config,
        )
        .unwrap()
        .with_boundary(RecordingBoundary::new())
        .with_sub_key(gloss_key(ids.gloss));
        Lexicon { engine, ids }
    }

    /// Creates an entry and sets its form (left empty when `form` is "").
    pub fn entry(&mut self, form: &str) -> EntityId {
        let id = self.engine.create(self.ids.entry).unwrap();
        if !form.is_empty() {
            self.engine.set_text(id, self.ids.form, form).unwrap();
        }
        id
    }

    pub fn sense(&mut self, owner: EntityId, gloss: &str) -> EntityId {
        let id = self
            .engine
            .create_owned(self.ids.sense, owner, self.ids.senses, None)
            .unwrap();
        self.engine.set_text(id, self.ids.gloss, gloss).unwrap();
        id
    }

    /// Creates an entry ref under `owner` listing `components`.
    pub fn entry_ref(&mut self, owner: EntityId, components: &[EntityId]) -> EntityId {
        let id = self
            .engine
            .create_owned(self.ids.entry_ref, owner, self.ids.entry_refs, None)
            .unwrap();
        for &component in components {
            self.engine
                .push(id, self.ids.components, component)
                .unwrap();
        }
        id
    }

    pub fn numbers(&self, entries: &[EntityId]) -> String {
        entries
            .iter()
            .map(|&e| self.engine.homograph_number(e).unwrap().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn seq(&self, entity: EntityId, field: FieldId) -> Vec<EntityId> {
        self.engine
            .store()
            .get(entity)
            .unwrap()
            .sequence(field)
            .unwrap()
            .to_vec()
    }

    pub fn targets(&self, entity: EntityId, field: FieldId) -> Vec<EntityId> {
        self.engine
            .store()
            .get(entity)
            .unwrap()
            .targets(field)
            .unwrap()
    }

    pub fn text(&self, entity: EntityId, field: FieldId) -> String {
        self.engine
            .store()
            .get(entity)
            .unwrap()
            .text(field)
            .unwrap()
            .to_string()
    }

    pub fn alive(&self, entity: EntityId) -> bool {
        self.engine.store().contains(entity)
    }

    pub fn assert_clean(&self) {
        let report = self.engine.audit().unwrap();
        assert!(report.is_clean(), "audit found problems: {report:?}");
    }
}
