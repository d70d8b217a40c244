pub mod captions;
pub mod compiler;
pub mod decision;
pub mod error;
pub mod ops;
pub mod reconcile;
pub mod render;
pub mod timeline;

pub use error::{OrchestratorError, OrchestratorResult};
pub use timeline::*;
