use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::str::FromStr;

use super::constants;

/// `Cfg` struct containing the client settings.
///
/// - `tcp_port`: port to listen on for incoming peer connections,
/// - `download_directory`: directory where the downloaded files are stored,
/// - `max_peers`: maximum number of simultaneous peer sessions,
/// - `block_timeout_secs`: how long an outstanding block request may stay
///   unanswered before it is returned to the work queue,
/// - `stall_secs`: watchdog limit with no downloaded-byte progress,
/// - `min_speed_bps` / `min_speed_window_secs`: watchdog limit for a
///   sustained below-minimum download speed,
/// - `max_total_secs`: watchdog limit for the whole download; `0` derives
///   the limit from the torrent size.
///
/// Build one from a file with `Cfg::new`, or use `Cfg::default()`.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub tcp_port: u16,
    pub download_directory: String,
    pub max_peers: usize,
    pub block_timeout_secs: u64,
    pub stall_secs: u64,
    pub min_speed_bps: u64,
    pub min_speed_window_secs: u64,
    pub max_total_secs: u64,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            tcp_port: constants::DEFAULT_TCP_PORT,
            download_directory: constants::DEFAULT_DOWNLOAD_DIRECTORY.to_string(),
            max_peers: constants::DEFAULT_MAX_PEERS,
            block_timeout_secs: constants::DEFAULT_BLOCK_TIMEOUT_SECS,
            stall_secs: constants::DEFAULT_STALL_SECS,
            min_speed_bps: constants::DEFAULT_MIN_SPEED_BPS,
            min_speed_window_secs: constants::DEFAULT_MIN_SPEED_WINDOW_SECS,
            max_total_secs: constants::DEFAULT_MAX_TOTAL_SECS,
        }
    }
}

impl Cfg {
    /// Builds a `Cfg` from the config file at the given path.
    /// The format of the config file must be: {setting_name}={setting_value}
    /// (without brackets), one setting per line. Settings that are not
    /// present keep their default value.
    ///
    /// It returns an io::Error if:
    /// - The config file does not exist or could not be read.
    /// - A line is not in NAME=VALUE form.
    /// - A setting name is unknown.
    /// - A setting value does not parse as the expected type.
    pub fn new(path: &str) -> io::Result<Self> {
        let mut cfg = Self::default();

        let file = File::open(path)?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let current_line = line?;
            if current_line.trim().is_empty() {
                continue;
            }
            let setting: Vec<&str> = current_line.split('=').collect();

            if setting.len() != 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config input: {}", current_line),
                ));
            }
            cfg = Self::load_setting(cfg, setting[0].trim(), setting[1].trim())?;
        }
        Ok(cfg)
    }

    fn load_setting(mut self, name: &str, value: &str) -> io::Result<Self> {
        match name {
            constants::TCP_PORT => {
                self.tcp_port = Self::parse_value(value, constants::TCP_PORT)?;
            }
            constants::DOWNLOAD_DIRECTORY => self.download_directory = String::from(value),
            constants::MAX_PEERS => {
                self.max_peers = Self::parse_value(value, constants::MAX_PEERS)?;
            }
            constants::BLOCK_TIMEOUT_SECS => {
                self.block_timeout_secs = Self::parse_value(value, constants::BLOCK_TIMEOUT_SECS)?;
            }
            constants::STALL_SECS => {
                self.stall_secs = Self::parse_value(value, constants::STALL_SECS)?;
            }
            constants::MIN_SPEED_BPS => {
                self.min_speed_bps = Self::parse_value(value, constants::MIN_SPEED_BPS)?;
            }
            constants::MIN_SPEED_WINDOW_SECS => {
                self.min_speed_window_secs =
                    Self::parse_value(value, constants::MIN_SPEED_WINDOW_SECS)?;
            }
            constants::MAX_TOTAL_SECS => {
                self.max_total_secs = Self::parse_value(value, constants::MAX_TOTAL_SECS)?;
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config setting name: {}", name),
                ))
            }
        }
        Ok(self)
    }

    fn parse_value<F>(value: &str, setting: &str) -> io::Result<F>
    where
        F: FromStr,
    {
        value.parse::<F>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid setting: {}, bad value: {}", setting, value),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write};

    #[test]
    fn test_defaults() {
        let cfg = Cfg::default();
        assert_eq!(cfg.tcp_port, constants::DEFAULT_TCP_PORT);
        assert_eq!(cfg.max_peers, 50);
        assert_eq!(cfg.block_timeout_secs, 30);
        assert_eq!(cfg.stall_secs, 300);
    }

    #[test]
    fn test_good_config() {
        let path = "./test_good_config.cfg";
        let contents = b"TCP_PORT=1000\nDOWNLOAD_DIRECTORY=./dl\nMAX_PEERS=10";
        create_and_write_file(path, contents);

        let cfg = Cfg::new(path).unwrap();
        fs::remove_file(path).unwrap();

        assert_eq!(cfg.tcp_port, 1000);
        assert_eq!(cfg.download_directory, "./dl");
        assert_eq!(cfg.max_peers, 10);
        // untouched settings keep their defaults
        assert_eq!(cfg.min_speed_bps, constants::DEFAULT_MIN_SPEED_BPS);
    }

    #[test]
    fn test_bad_path() {
        assert!(Cfg::new("bad path").is_err());
    }

    #[test]
    fn test_setting_doesnt_exist() {
        let path = "./test_setting_doesnt_exist.cfg";
        create_and_write_file(path, b"WRONG_SETTING=1000");

        let cfg = Cfg::new(path);
        fs::remove_file(path).unwrap();
        assert!(cfg.is_err());
    }

    #[test]
    fn test_port_not_a_number() {
        let path = "./test_port_not_a_number.cfg";
        create_and_write_file(path, b"TCP_PORT=abcd");

        let cfg = Cfg::new(path);
        fs::remove_file(path).unwrap();
        assert!(cfg.is_err());
    }

    #[test]
    fn test_bad_format() {
        let path = "./test_bad_format.cfg";
        create_and_write_file(path, b"TCP_PORT=abcd=1234");

        let cfg = Cfg::new(path);
        fs::remove_file(path).unwrap();
        assert!(cfg.is_err());
    }

    // Auxiliary functions

    fn create_and_write_file(path: &str, contents: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }
}
