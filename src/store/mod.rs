//! Object store: collections and objects over files plus the shared KV
//! store, composed from the directory index, attribute, replay-guard and
//! omap components.

mod attrs;
mod fd_cache;
mod hash_index;
mod object_store;
mod replay_guard;

pub use attrs::AttrStore;
pub use fd_cache::FdCache;
pub use hash_index::{HashIndex, ObjectPlace};
pub use object_store::{ObjectStat, ObjectStore};
pub use replay_guard::{collection_guard_key, object_guard_key, GuardCheck, ReplayGuards};
