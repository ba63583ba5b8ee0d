// Setting names accepted in the config file.
pub const TCP_PORT: &str = "TCP_PORT";
pub const DOWNLOAD_DIRECTORY: &str = "DOWNLOAD_DIRECTORY";
pub const MAX_PEERS: &str = "MAX_PEERS";
pub const BLOCK_TIMEOUT_SECS: &str = "BLOCK_TIMEOUT_SECS";
pub const STALL_SECS: &str = "STALL_SECS";
pub const MIN_SPEED_BPS: &str = "MIN_SPEED_BPS";
pub const MIN_SPEED_WINDOW_SECS: &str = "MIN_SPEED_WINDOW_SECS";
pub const MAX_TOTAL_SECS: &str = "MAX_TOTAL_SECS";

// Defaults used when a setting is absent from the config file.
pub const DEFAULT_TCP_PORT: u16 = 6881;
pub const DEFAULT_DOWNLOAD_DIRECTORY: &str = "./downloads";
pub const DEFAULT_MAX_PEERS: usize = 50;
pub const DEFAULT_BLOCK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STALL_SECS: u64 = 300;
pub const DEFAULT_MIN_SPEED_BPS: u64 = 1024;
pub const DEFAULT_MIN_SPEED_WINDOW_SECS: u64 = 600;
/// Zero means "derived from the torrent size": max(24 h, 1 min per MiB).
pub const DEFAULT_MAX_TOTAL_SECS: u64 = 0;
