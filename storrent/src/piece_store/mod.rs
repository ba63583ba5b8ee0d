pub mod store;

pub use store::{FinalizeOutcome, PieceStore, PieceStoreError};
