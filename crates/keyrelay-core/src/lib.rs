pub mod arc;
pub mod lru;
pub mod prelude;
pub mod responsechannel;
pub mod ring;

pub use prelude::*;
