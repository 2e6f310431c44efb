pub mod diff;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod message;
pub mod record;
pub mod schema;
pub mod set;
pub mod value;

pub use diff::{ChangeRecorder, DeltaListener, Detached, Diffable, NestedListener, Transition};
pub use error::CoreError;
pub use field_value::{FieldType, FieldValue};
pub use ids::*;
pub use message::RecordMessage;
pub use set::{ABSENT_POSITION, DiffableSet, ElementDelta, ElementMut, SetDelta, SetKind, SetLocal};
pub use schema::*;
pub use value::DiffValue;
