pub mod rate_limiting;
pub mod relay;

pub use rate_limiting::*;
