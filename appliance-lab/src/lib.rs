pub mod errors;
pub mod ledger;
pub mod orchestrator;
pub mod spec;
