use bencoding::bencode::Bencode;

/// A swarm peer candidate as discovery hands it to the pool: an address,
/// plus the peer id once a tracker or a handshake supplied one.
#[derive(Debug, Clone)]
pub struct BtPeer {
    pub peer_id: Option<Vec<u8>>,
    pub ip: String,
    pub port: u16,
}

impl PartialEq for BtPeer {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for BtPeer {}

impl std::hash::Hash for BtPeer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

/// Posible `BtPeer` errors.
#[derive(Debug, PartialEq, Eq)]
pub enum BtPeerError {
    InvalidIp,
    InvalidPort,
    NotADict,
}

impl BtPeer {
    pub fn new(ip: String, port: u16) -> Self {
        Self {
            peer_id: None,
            ip,
            port,
        }
    }

    /// The key every shared map uses for this peer.
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Builds a `BtPeer` from one entry of a tracker's dict-form peer list.
    pub fn from(bencode: &Bencode) -> Result<BtPeer, BtPeerError> {
        let dict = bencode.as_dict().ok_or(BtPeerError::NotADict)?;

        let ip = dict
            .get(&b"ip"[..])
            .and_then(|v| v.as_bytes())
            .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
            .ok_or(BtPeerError::InvalidIp)?;

        let port = dict
            .get(&b"port"[..])
            .and_then(|v| v.as_int())
            .and_then(|port| u16::try_from(port).ok())
            .ok_or(BtPeerError::InvalidPort)?;

        let peer_id = dict
            .get(&b"peer id"[..])
            .and_then(|v| v.as_bytes())
            .map(|bytes| bytes.to_vec());

        Ok(BtPeer { peer_id, ip, port })
    }
}
