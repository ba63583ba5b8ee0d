use super::request::Request;

// IDs of the messages defined in the protocol. Keep-alive frames carry no ID
// (a zero length prefix) and are handled at the framing layer.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

/// A peer-wire message: ID plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// Posible message decoding errors. Frames that fail these checks are
/// malformed and must be dropped by the session.
#[derive(Debug, PartialEq, Eq)]
pub enum MessageError {
    EmptyFrame,
    /// The payload is shorter than the fixed size its ID requires.
    PayloadTooShort(u8),
    /// `request`/`cancel` payloads must be exactly 12 bytes.
    PayloadSizeMismatch(u8),
}

impl Message {
    pub fn new(id: MessageId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn choke() -> Self {
        Self::new(MessageId::Choke, vec![])
    }

    pub fn unchoke() -> Self {
        Self::new(MessageId::Unchoke, vec![])
    }

    pub fn interested() -> Self {
        Self::new(MessageId::Interested, vec![])
    }

    pub fn not_interested() -> Self {
        Self::new(MessageId::NotInterested, vec![])
    }

    pub fn have(piece: u32) -> Self {
        Self::new(MessageId::Have, piece.to_be_bytes().to_vec())
    }

    pub fn bitfield(bytes: Vec<u8>) -> Self {
        Self::new(MessageId::Bitfield, bytes)
    }

    pub fn request(piece: u32, begin: u32, length: u32) -> Self {
        Self::new(MessageId::Request, Request::new(piece, begin, length).as_bytes())
    }

    pub fn cancel(piece: u32, begin: u32, length: u32) -> Self {
        Self::new(MessageId::Cancel, Request::new(piece, begin, length).as_bytes())
    }

    pub fn piece(piece: u32, begin: u32, block: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + block.len());
        payload.extend(piece.to_be_bytes());
        payload.extend(begin.to_be_bytes());
        payload.extend(block);
        Self::new(MessageId::Piece, payload)
    }

    /// Parses a frame body (everything after the length prefix) into a
    /// `Message`.
    ///
    /// Returns `Ok(None)` for unknown message IDs, which the protocol says
    /// to drop silently. Returns a `MessageError` for frames whose payload
    /// is shorter than the fixed size their ID requires.
    pub fn from_bytes(frame: &[u8]) -> Result<Option<Self>, MessageError> {
        let raw_id = *frame.first().ok_or(MessageError::EmptyFrame)?;
        let payload = &frame[1..];

        let id = match raw_id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            _ => return Ok(None),
        };

        match id {
            MessageId::Have if payload.len() < 4 => {
                return Err(MessageError::PayloadTooShort(raw_id))
            }
            MessageId::Request | MessageId::Cancel if payload.len() != 12 => {
                return Err(MessageError::PayloadSizeMismatch(raw_id))
            }
            MessageId::Piece if payload.len() < 8 => {
                return Err(MessageError::PayloadTooShort(raw_id))
            }
            _ => {}
        }

        Ok(Some(Self {
            id,
            payload: payload.to_vec(),
        }))
    }

    /// Converts the message to its wire form: 4-byte big-endian length
    /// prefix, ID byte, payload.
    pub fn as_bytes(&self) -> Vec<u8> {
        let len = self.payload.len() + 1;
        let mut bytes = Vec::with_capacity(4 + len);
        bytes.extend((len as u32).to_be_bytes());
        bytes.push(self.id as u8);
        bytes.extend(&self.payload);
        bytes
    }

    /// The wire form of a keep-alive: a lone zero length prefix.
    pub fn keep_alive_bytes() -> [u8; 4] {
        [0, 0, 0, 0]
    }

    /// Decodes a `have` payload into its piece index.
    pub fn parse_have(&self) -> u32 {
        let mut index = [0u8; 4];
        index.copy_from_slice(&self.payload[0..4]);
        u32::from_be_bytes(index)
    }

    /// Decodes a `piece` payload into `(index, begin, block)`.
    pub fn parse_piece(&self) -> (u32, u32, &[u8]) {
        let mut index = [0u8; 4];
        let mut begin = [0u8; 4];
        index.copy_from_slice(&self.payload[0..4]);
        begin.copy_from_slice(&self.payload[4..8]);
        (
            u32::from_be_bytes(index),
            u32::from_be_bytes(begin),
            &self.payload[8..],
        )
    }

    /// Decodes a `request` or `cancel` payload.
    pub fn parse_request(&self) -> Request {
        Request::from_bytes(&self.payload)
    }
}
