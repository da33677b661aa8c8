//! Pluggable cache backends and the memoizing [`CacheProxy`].

mod backend;
mod file;
mod memory;
mod proxy;
mod store;

pub use backend::CacheBackend;
pub use file::FileCache;
pub use memory::MemoryCache;
pub use proxy::{CacheProxy, Cacheable, DEFAULT_EXPIRE};
pub use store::CacheStore;
