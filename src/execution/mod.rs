pub mod classifier;
pub mod executor;
pub mod simulator;
pub mod types;

pub use classifier::classify;
pub use executor::TradeExecutor;
pub use simulator::ValidationSimulator;
pub use types::*;
