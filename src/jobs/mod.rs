pub mod orchestrator;
pub mod resilience;
