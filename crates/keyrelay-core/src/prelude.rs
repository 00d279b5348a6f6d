/// Cheaply-cloneable immutable string, used pervasively for key ids, model
/// names, and provider names so that passing them around request paths never
/// allocates.
pub type Strng = arcstr::ArcStr;

pub use crate::arc::{Atomic, AtomicOption};
