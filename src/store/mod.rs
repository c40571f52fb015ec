//! Concrete quota stores.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{AsyncRedisStore, RedisStore};
