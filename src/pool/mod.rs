mod buffer;

pub use buffer::{BufferPool, PoolStats};
