pub mod block_param;
pub mod buffer_pool;
pub mod wildcard;

pub use block_param::{BlockParameter, BlockRef, BlockTag};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use wildcard::{wildcard_match, WildcardError, WildcardPattern};
