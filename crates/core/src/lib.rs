pub mod body;
pub mod context;
pub mod error;
pub mod ids;

pub use body::{BodyFields, BodyKind, DeltaSource, ExampleBodyKind, FieldPatch, MovePosition};
pub use context::{CancelHandle, Context};
pub use error::CoreError;
pub use ids::*;
