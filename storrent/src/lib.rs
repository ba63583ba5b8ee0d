pub mod bt_server;
pub mod config;
pub mod file_layer;
pub mod peer;
pub mod piece_store;
pub mod request_queue;
pub mod swarm;
pub mod torrent_parser;
pub mod tracker;

/// Transfer unit for the peer-wire protocol, in bytes.
pub const BLOCK_SIZE: u32 = 16384;
