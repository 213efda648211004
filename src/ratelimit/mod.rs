//! Token bucket storages.

mod backend;
mod bucket;
pub mod clock;
mod distributed;
mod memory;

pub use backend::{Quota, Storage, TakeResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::RedisStorage;
pub use memory::MemoryStorage;
