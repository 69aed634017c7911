pub mod error;
pub mod ids;
pub mod ledger;
pub mod pricing;
pub mod task;
pub mod workflow;

pub use error::{EngineError, EngineResult};
pub use ids::*;
pub use ledger::*;
pub use pricing::*;
pub use task::*;
pub use workflow::*;
