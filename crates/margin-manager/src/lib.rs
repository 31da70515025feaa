pub mod ledger;
pub mod policy;
#[cfg(test)]
mod tests;

pub use ledger::MarginLedger;
pub use policy::{evaluate_condition, ActionFailure, EvaluationReport, PolicyContext, PolicyEngine};
