pub mod cached;
pub mod control;
pub mod sqlite;
pub mod traits;

pub use cached::CachedPolicyStore;
pub use control::{ControlRequest, ControlStore};
pub use sqlite::SqlitePolicyStore;
pub use traits::{PolicyStore, StoreFuture};
