pub mod conditions;
pub mod cooldown;
pub mod engine;
pub mod executor;
pub mod trend;

#[cfg(test)]
pub(crate) mod fake;

pub use engine::RuleEngine;
