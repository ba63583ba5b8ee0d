pub mod queue;

pub use queue::{BlockRequest, RequestQueue, RequestQueueError};
