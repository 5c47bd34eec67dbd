pub mod orchestrator;
pub mod schema;

pub use orchestrator::Orchestrator;
pub use schema::*;
