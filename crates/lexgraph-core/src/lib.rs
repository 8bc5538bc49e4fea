pub mod entity;
pub mod error;
pub mod id;
pub mod key;
pub mod schema;
pub mod value;

// Re-export commonly used types
pub use entity::{Entity, OwnerLink};
pub use error::CoreError;
pub use id::{EntityId, FieldId, KindId};
pub use key::{HomographKey, DEFAULT_MISSING_FORM};
pub use schema::{Cardinality, CoupledSide, Coupling, FieldDef, FieldRole, FieldSpec, KindDef, Schema};
pub use value::FieldValue;
