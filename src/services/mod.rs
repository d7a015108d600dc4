pub mod ops;

pub use ops::OpsService;
