pub mod boost;
pub mod constraints;

pub use boost::*;
pub use constraints::*;
