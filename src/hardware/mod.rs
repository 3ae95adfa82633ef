pub mod factory;
pub mod gateway;
pub mod simulated;

pub use factory::*;
pub use gateway::*;
pub use simulated::*;
