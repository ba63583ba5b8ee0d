use bencoding::bencode::{Bencode, BencodeError};

use crate::peer::bt_peer::{BtPeer, BtPeerError};

/// `TrackerResponse` struct containing a decoded announce response.
///
/// To create a new `TrackerResponse` use the method builder `from()`.
#[derive(Debug)]
pub struct TrackerResponse {
    /// Seconds until the tracker wants the next announce.
    pub interval: i64,
    /// Seeders in the swarm.
    pub complete: i64,
    /// Leechers in the swarm.
    pub incomplete: i64,
    pub peers: Vec<BtPeer>,
}

/// Posible `TrackerResponse` errors.
#[derive(Debug)]
pub enum FromTrackerResponseError {
    DecodeResponseError(BencodeError),
    FailureReason(String),
    InvalidPeers(BtPeerError),
    NotADict,
    NotAPeerList,
}

impl TrackerResponse {
    /// Builds a `TrackerResponse` from the raw bencoded response body.
    ///
    /// It returns a `FromTrackerResponseError` if:
    /// - The body is not valid bencode or not a dict.
    /// - The tracker reported a failure reason.
    /// - The peer list is neither a dict list nor a compact string.
    pub fn from(response: Vec<u8>) -> Result<TrackerResponse, FromTrackerResponseError> {
        let decoded = Bencode::decode(&response)
            .map_err(FromTrackerResponseError::DecodeResponseError)?;
        let dict = decoded
            .as_dict()
            .ok_or(FromTrackerResponseError::NotADict)?;

        if let Some(reason) = dict.get(&b"failure reason"[..]).and_then(|v| v.as_bytes()) {
            return Err(FromTrackerResponseError::FailureReason(
                String::from_utf8_lossy(reason).to_string(),
            ));
        }

        let interval = dict
            .get(&b"interval"[..])
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        let complete = dict
            .get(&b"complete"[..])
            .and_then(|v| v.as_int())
            .unwrap_or(0);
        let incomplete = dict
            .get(&b"incomplete"[..])
            .and_then(|v| v.as_int())
            .unwrap_or(0);

        let peers = match dict.get(&b"peers"[..]) {
            Some(Bencode::List(list)) => Self::peers_from_dicts(list)?,
            Some(Bencode::Bytes(compact)) => Self::peers_from_compact(compact),
            Some(_) => return Err(FromTrackerResponseError::NotAPeerList),
            None => vec![],
        };

        Ok(TrackerResponse {
            interval,
            complete,
            incomplete,
            peers,
        })
    }

    fn peers_from_dicts(list: &[Bencode]) -> Result<Vec<BtPeer>, FromTrackerResponseError> {
        list.iter()
            .map(|entry| BtPeer::from(entry).map_err(FromTrackerResponseError::InvalidPeers))
            .collect()
    }

    /// Compact form: 6 bytes per peer, 4 of IPv4 plus 2 of port, big-endian.
    fn peers_from_compact(compact: &[u8]) -> Vec<BtPeer> {
        compact
            .chunks_exact(6)
            .map(|chunk| {
                let ip = format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                BtPeer::new(ip, port)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_dict_peer_list() {
        let peers = vec![
            build_peer_dict(b"id1", "127.0.0.1", 6868),
            build_peer_dict(b"id2", "127.0.0.2", 4242),
        ];

        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), Bencode::Int(1800));
        dict.insert(b"complete".to_vec(), Bencode::Int(10));
        dict.insert(b"incomplete".to_vec(), Bencode::Int(5));
        dict.insert(b"peers".to_vec(), Bencode::List(peers));

        let response = TrackerResponse::from(Bencode::Dict(dict).encode()).unwrap();

        assert_eq!(response.interval, 1800);
        assert_eq!(response.complete, 10);
        assert_eq!(response.incomplete, 5);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[1].port, 4242);
    }

    #[test]
    fn test_from_compact_peer_list() {
        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), Bencode::Int(60));
        dict.insert(
            b"peers".to_vec(),
            Bencode::Bytes(vec![127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1b, 0x39]),
        );

        let response = TrackerResponse::from(Bencode::Dict(dict).encode()).unwrap();

        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].ip, "127.0.0.1");
        assert_eq!(response.peers[0].port, 6881);
        assert_eq!(response.peers[1].ip, "10.0.0.2");
        assert_eq!(response.peers[1].port, 6969);
    }

    #[test]
    fn test_failure_reason() {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"failure reason".to_vec(),
            Bencode::Bytes(b"unregistered torrent".to_vec()),
        );

        let err = TrackerResponse::from(Bencode::Dict(dict).encode()).unwrap_err();
        assert!(matches!(err, FromTrackerResponseError::FailureReason(_)));
    }

    #[test]
    fn test_not_bencode() {
        let err = TrackerResponse::from(b"garbage".to_vec()).unwrap_err();
        assert!(matches!(
            err,
            FromTrackerResponseError::DecodeResponseError(_)
        ));
    }

    // Auxiliary functions

    fn build_peer_dict(peer_id: &[u8], ip: &str, port: i64) -> Bencode {
        let mut peer_dict = BTreeMap::new();
        peer_dict.insert(b"peer id".to_vec(), Bencode::Bytes(peer_id.to_vec()));
        peer_dict.insert(b"ip".to_vec(), Bencode::Bytes(ip.as_bytes().to_vec()));
        peer_dict.insert(b"port".to_vec(), Bencode::Int(port));
        Bencode::Dict(peer_dict)
    }
}
