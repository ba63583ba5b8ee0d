/// `TrackerUrl` struct containing a tracker url information.
///
/// To create a new `TrackerUrl` use the method builder `parse()`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TrackerUrl {
    pub protocol: ConnectionProtocol,
    pub host: String,
    pub port: u16,
    pub endpoint: String,
}

/// Posible `TrackerUrl` connection protocol values.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ConnectionProtocol {
    Http,
    Https,
}

/// Posible `TrackerUrl` errors.
#[derive(Debug, PartialEq, Eq)]
pub enum TrackerUrlError {
    InvalidTrackerUrl,
    UnsupportedConnectionProtocol,
    InvalidPortNumber,
}

impl TrackerUrl {
    /// Parses an announce url into its protocol, host, port and endpoint.
    ///
    /// It returns a `TrackerUrlError` if:
    /// - the url format is invalid.
    /// - the url connection protocol is unsupported (only http/https).
    /// - the url port number is not a number.
    pub fn parse(url: &str) -> Result<Self, TrackerUrlError> {
        let (rest, protocol) = Self::split_protocol(url)?;

        let (authority, endpoint) = rest
            .split_once('/')
            .ok_or(TrackerUrlError::InvalidTrackerUrl)?;

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TrackerUrlError::InvalidPortNumber)?;
                (host, port)
            }
            None => {
                let port = match protocol {
                    ConnectionProtocol::Https => 443,
                    ConnectionProtocol::Http => 80,
                };
                (authority, port)
            }
        };
        if host.is_empty() {
            return Err(TrackerUrlError::InvalidTrackerUrl);
        }

        Ok(Self {
            protocol,
            host: host.to_string(),
            port,
            endpoint: endpoint.to_string(),
        })
    }

    fn split_protocol(url: &str) -> Result<(&str, ConnectionProtocol), TrackerUrlError> {
        let (protocol, rest) = url
            .split_once("://")
            .ok_or(TrackerUrlError::InvalidTrackerUrl)?;

        let protocol = match protocol {
            "http" => ConnectionProtocol::Http,
            "https" => ConnectionProtocol::Https,
            _ => return Err(TrackerUrlError::UnsupportedConnectionProtocol),
        };
        Ok((rest, protocol))
    }
}
