pub mod choking;
pub mod ctx;
pub mod orchestrator;
pub mod peer_pool;
pub mod progress;
pub mod registry;
pub mod supervisor;
pub mod watchdog;
