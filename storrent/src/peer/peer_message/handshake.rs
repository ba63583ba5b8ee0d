/// Posible handshake decoding errors.
#[derive(Debug, PartialEq, Eq)]
pub enum FromHandshakeError {
    InvalidLength,
    InvalidProtocol,
}

/// The fixed 68-byte opening frame of a peer connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Vec<u8>,
    pub peer_id: Vec<u8>,
}

const PSTR: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

impl Handshake {
    pub fn new(info_hash: Vec<u8>, peer_id: Vec<u8>) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Converts the handshake to its 68-byte wire form.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HANDSHAKE_LEN);
        bytes.push(PSTR.len() as u8);
        bytes.extend(PSTR);
        bytes.extend(&self.reserved);
        bytes.extend(&self.info_hash);
        bytes.extend(&self.peer_id);
        bytes
    }

    /// Parses and validates a 68-byte handshake frame. The first byte must
    /// be 0x13 and bytes 1..20 exactly the protocol string; anything else
    /// means the remote is not speaking the peer-wire protocol and the
    /// session must close.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FromHandshakeError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(FromHandshakeError::InvalidLength);
        }
        if bytes[0] != PSTR.len() as u8 || bytes[1..20] != PSTR[..] {
            return Err(FromHandshakeError::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);

        Ok(Self {
            reserved,
            info_hash: bytes[28..48].to_vec(),
            peer_id: bytes[48..68].to_vec(),
        })
    }
}
