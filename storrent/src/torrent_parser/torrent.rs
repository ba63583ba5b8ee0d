use std::fmt::Write;
use std::num::ParseIntError;

use sha1::{Digest, Sha1};

use bencoding::bencode::Bencode;

use super::info::{FromInfoError, Info};

/// Parsed metainfo document: the torrent descriptor shared read-only by the
/// whole swarm.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Torrent {
    pub announce_url: String,
    pub info: Info,
    /// Hex encoding of the SHA-1 of the bencoded `info` dictionary.
    pub info_hash: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FromTorrentError {
    MissingAnnounce,
    MissingInfo,
    FromInfoError(FromInfoError),
    PiecesCountMismatch,
    NotADict,
}

impl Torrent {
    pub fn from(bencode: Bencode) -> Result<Torrent, FromTorrentError> {
        let dict = bencode.as_dict().ok_or(FromTorrentError::NotADict)?;

        let announce_url = dict
            .get(&b"announce"[..])
            .and_then(|v| v.as_bytes())
            .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
            .ok_or(FromTorrentError::MissingAnnounce)?;

        let info_value = dict
            .get(&b"info"[..])
            .ok_or(FromTorrentError::MissingInfo)?;

        let info = Info::from(info_value).map_err(FromTorrentError::FromInfoError)?;

        // The info dict keeps every decoded key, so re-encoding it gives the
        // canonical bytes the swarm identifier is defined over.
        let info_hash = Self::hash_info(info_value);

        let torrent = Torrent {
            announce_url,
            info,
            info_hash,
        };

        if torrent.info.piece_length > 0
            && torrent.info.pieces.len() as u32 / 20 != torrent.total_pieces()
        {
            return Err(FromTorrentError::PiecesCountMismatch);
        }

        Ok(torrent)
    }

    fn hash_info(info_value: &Bencode) -> String {
        let digest = Sha1::digest(info_value.encode());

        let mut hex_string = String::with_capacity(digest.len() * 2);
        for byte in digest {
            // Writing into a String cannot fail.
            let _ = write!(&mut hex_string, "{:02x}", byte);
        }
        hex_string
    }

    /// Returns the info hash of the torrent as a byte array.
    pub fn info_hash_bytes(&self) -> Result<Vec<u8>, ParseIntError> {
        Self::decode_hex(self.info_hash.as_str())
    }

    fn decode_hex(s: &str) -> Result<Vec<u8>, ParseIntError> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect()
    }

    /// Returns the name of the torrent.
    pub fn name(&self) -> String {
        self.info.name.clone()
    }

    /// Returns the piece size of the torrent, in bytes.
    pub fn piece_length(&self) -> u32 {
        self.info.piece_length as u32
    }

    /// Returns the total payload length in bytes.
    pub fn total_length(&self) -> u64 {
        self.info.length as u64
    }

    /// Returns the number of pieces of the torrent.
    pub fn total_pieces(&self) -> u32 {
        (self.info.length as f64 / self.info.piece_length as f64).ceil() as u32
    }

    /// Returns the size in bytes of the given piece: the piece length for
    /// every piece but possibly the last.
    pub fn piece_size(&self, index: u32) -> u32 {
        if index + 1 == self.total_pieces() {
            let remainder = (self.total_length() % self.piece_length() as u64) as u32;
            if remainder != 0 {
                return remainder;
            }
        }
        self.piece_length()
    }

    /// Returns the expected SHA-1 digest of the given piece.
    pub fn piece_digest(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * 20;
        self.info.pieces.get(start..start + 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_parser::info::TorrentFile;
    use std::collections::BTreeMap;

    #[test]
    fn test_from_torrent_full() {
        let torrent_bencode = build_torrent_bencode(105, 10, 11);

        let torrent = Torrent::from(torrent_bencode.clone()).unwrap();

        assert_eq!(torrent.announce_url, "http://example.com/announce");
        assert_eq!(torrent.info.length, 105);
        assert_eq!(torrent.info.piece_length, 10);

        // the info hash must cover exactly the bencoded info value
        let info_value = torrent_bencode.get(b"info").unwrap();
        let expected = Sha1::digest(info_value.encode());
        assert_eq!(torrent.info_hash_bytes().unwrap(), expected.to_vec());
    }

    #[test]
    fn test_from_torrent_missing_announce() {
        let mut dict = BTreeMap::new();
        dict.insert(b"info".to_vec(), Bencode::Dict(BTreeMap::new()));

        let actual_err = Torrent::from(Bencode::Dict(dict)).unwrap_err();
        assert_eq!(actual_err, FromTorrentError::MissingAnnounce);
    }

    #[test]
    fn test_from_torrent_missing_info() {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"announce".to_vec(),
            Bencode::Bytes(b"http://example.com/announce".to_vec()),
        );

        let actual_err = Torrent::from(Bencode::Dict(dict)).unwrap_err();
        assert_eq!(actual_err, FromTorrentError::MissingInfo);
    }

    #[test]
    fn test_from_torrent_not_a_dict() {
        let actual_err = Torrent::from(Bencode::Bytes(b"test".to_vec())).unwrap_err();
        assert_eq!(actual_err, FromTorrentError::NotADict);
    }

    #[test]
    fn test_from_torrent_pieces_count_mismatch() {
        // 105 bytes in 10-byte pieces needs 11 digests, give 2
        let torrent_bencode = build_torrent_bencode(105, 10, 2);
        let actual_err = Torrent::from(torrent_bencode).unwrap_err();
        assert_eq!(actual_err, FromTorrentError::PiecesCountMismatch);
    }

    #[test]
    fn test_total_pieces() {
        let torrent = build_test_torrent(105, 10);
        assert_eq!(torrent.total_pieces(), 11);
    }

    #[test]
    fn test_piece_size_last_short() {
        let torrent = build_test_torrent(105, 10);
        assert_eq!(torrent.piece_size(0), 10);
        assert_eq!(torrent.piece_size(10), 5);
    }

    #[test]
    fn test_piece_size_exact_multiple() {
        let torrent = build_test_torrent(100, 10);
        assert_eq!(torrent.total_pieces(), 10);
        assert_eq!(torrent.piece_size(9), 10);
    }

    #[test]
    fn test_piece_digest() {
        let mut torrent = build_test_torrent(40, 20);
        torrent.info.pieces = (0..40).collect();
        assert_eq!(torrent.piece_digest(1).unwrap()[0], 20);
        assert!(torrent.piece_digest(2).is_none());
    }

    // Auxiliary functions

    fn build_torrent_bencode(length: i64, piece_length: i64, digests: usize) -> Bencode {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::Int(length));
        info.insert(b"name".to_vec(), Bencode::Bytes(b"example".to_vec()));
        info.insert(b"piece length".to_vec(), Bencode::Int(piece_length));
        info.insert(b"pieces".to_vec(), Bencode::Bytes(vec![0u8; digests * 20]));

        let mut dict = BTreeMap::new();
        dict.insert(
            b"announce".to_vec(),
            Bencode::Bytes(b"http://example.com/announce".to_vec()),
        );
        dict.insert(b"info".to_vec(), Bencode::Dict(info));

        Bencode::Dict(dict)
    }

    fn build_test_torrent(length: i64, piece_length: i64) -> Torrent {
        Torrent {
            announce_url: String::from("http://example.com/announce"),
            info: Info {
                length,
                name: String::from("example"),
                piece_length,
                pieces: vec![],
                files: Vec::<TorrentFile>::new(),
            },
            info_hash: "info_hash".to_string(),
        }
    }
}
