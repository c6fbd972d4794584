pub mod execution;
pub mod rule;
pub mod snapshot;
pub mod zone;

pub use execution::*;
pub use rule::*;
pub use snapshot::*;
pub use zone::*;
