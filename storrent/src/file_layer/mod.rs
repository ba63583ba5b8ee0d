pub mod block_cache;
pub mod files;

pub use block_cache::BlockCache;
pub use files::{FileLayer, FileLayerError};
