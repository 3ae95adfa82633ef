pub mod device;
pub mod price;
pub mod schedule;
pub mod types;

pub use device::*;
pub use price::*;
pub use schedule::*;
pub use types::*;
