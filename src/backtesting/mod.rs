pub mod engine;
pub mod types;

pub use engine::ShadowBacktester;
pub use types::*;
