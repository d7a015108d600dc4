pub mod engine_setting;
pub mod evolution_event;
pub mod signal;
pub mod strategy;
pub mod trade;
