use super::http::http_handler::{HttpHandler, HttpHandlerError};
use super::http::query_params::{AnnounceEvent, QueryParams};
use super::http::url_parser::{ConnectionProtocol, TrackerUrl, TrackerUrlError};
use super::tracker_response::{FromTrackerResponseError, TrackerResponse};
use crate::torrent_parser::torrent::Torrent;

/// Live transfer totals reported with each announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// `TrackerHandler` struct for announcing to the torrent's tracker.
///
/// To create a new `TrackerHandler` use the method builder `new()`. Each
/// `announce()` reports the current totals and returns the tracker's peer
/// list and swarm stats.
#[derive(Debug)]
pub struct TrackerHandler {
    tracker_url: TrackerUrl,
    info_hash: String,
    client_port: u16,
    client_peer_id: String,
}

/// Posible `TrackerHandler` errors.
#[derive(Debug)]
pub enum TrackerHandlerError {
    HttpHandlerError(HttpHandlerError),
    FromTrackerResponseError(FromTrackerResponseError),
    UrlParseError(TrackerUrlError),
}

impl TrackerHandler {
    /// Builds a new `TrackerHandler` from the torrent descriptor and our
    /// listening port.
    ///
    /// It returns a `TrackerHandlerError` if the announce url does not parse.
    pub fn new(
        torrent: &Torrent,
        client_port: u16,
        client_peer_id: String,
    ) -> Result<Self, TrackerHandlerError> {
        let tracker_url = TrackerUrl::parse(torrent.announce_url.as_str())
            .map_err(TrackerHandlerError::UrlParseError)?;

        Ok(Self {
            tracker_url,
            info_hash: torrent.info_hash.clone(),
            client_port,
            client_peer_id,
        })
    }

    /// Announces to the tracker and decodes its response.
    ///
    /// It returns a `TrackerHandlerError` if:
    /// - The request could not be written or the response read.
    /// - The response failed to decode.
    pub fn announce(
        &self,
        stats: AnnounceStats,
        event: Option<AnnounceEvent>,
    ) -> Result<TrackerResponse, TrackerHandlerError> {
        let mut query_params = QueryParams::new(
            self.info_hash.clone(),
            self.client_peer_id.clone(),
            self.client_port,
        );
        query_params.uploaded = stats.uploaded;
        query_params.downloaded = stats.downloaded;
        query_params.left = stats.left;
        query_params.event = event;

        let http_handler = HttpHandler::new(self.tracker_url.clone(), query_params);

        let response = match self.tracker_url.protocol {
            ConnectionProtocol::Https => http_handler.https_request(),
            ConnectionProtocol::Http => http_handler.http_request(),
        }
        .map_err(TrackerHandlerError::HttpHandlerError)?;

        TrackerResponse::from(response).map_err(TrackerHandlerError::FromTrackerResponseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_parser::info::Info;

    #[test]
    fn test_new_parses_announce_url() {
        let torrent = create_test_torrent("https://tracker.example:443/announce");
        let handler =
            TrackerHandler::new(&torrent, 6881, "-qB4250-abcdefghijkl".to_string()).unwrap();
        assert_eq!(handler.tracker_url.host, "tracker.example");
        assert_eq!(handler.tracker_url.port, 443);
    }

    #[test]
    fn test_new_rejects_udp_announce() {
        let torrent = create_test_torrent("udp://tracker.example:6969/announce");
        let result = TrackerHandler::new(&torrent, 6881, "peer".to_string());
        assert!(matches!(
            result,
            Err(TrackerHandlerError::UrlParseError(
                TrackerUrlError::UnsupportedConnectionProtocol
            ))
        ));
    }

    // Auxiliary functions

    fn create_test_torrent(announce: &str) -> Torrent {
        Torrent {
            announce_url: announce.to_string(),
            info: Info {
                length: 100,
                name: "test".to_string(),
                piece_length: 100,
                pieces: vec![0u8; 20],
                files: vec![],
            },
            info_hash: "e82753b6692c4f3f3646b055f70ee390309020e6".to_string(),
        }
    }
}
