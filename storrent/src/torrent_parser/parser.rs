use std::{
    fs::File,
    io::{BufReader, Error, Read},
    path::Path,
};

use super::torrent::{FromTorrentError, Torrent};
use bencoding::bencode::{Bencode, BencodeError};

#[derive(Debug)]
pub enum ParseError {
    IoError(Error),
    BencodeError(BencodeError),
    FromTorrentError(FromTorrentError),
}

pub struct TorrentParser;

impl TorrentParser {
    /// Given a path to a torrent file, parses the file and returns the
    /// `Torrent` descriptor.
    ///
    /// # Errors
    ///
    /// * `ParseError::IoError` - An error occurred while reading the file
    /// * `ParseError::BencodeError` - An error occurred while decoding the bencode
    /// * `ParseError::FromTorrentError` - An error occurred while building the descriptor
    pub fn parse(filepath: &Path) -> Result<Torrent, ParseError> {
        let buffer = Self::read_file(filepath).map_err(ParseError::IoError)?;
        let bencode = Bencode::decode(&buffer).map_err(ParseError::BencodeError)?;
        Torrent::from(bencode).map_err(ParseError::FromTorrentError)
    }

    fn read_file(filepath: &Path) -> Result<Vec<u8>, Error> {
        let file = File::open(filepath)?;
        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();

        reader.read_to_end(&mut buffer)?;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write, path::PathBuf};

    #[test]
    fn test_parse_torrent() {
        let filepath = PathBuf::from("./test_parse_torrent.torrent");
        // 32-byte payload in 16-byte pieces, two digests
        let contents = [
            &b"d8:announce31:http://tracker.example/announce4:infod6:lengthi32e4:name5:a.bin12:piece lengthi16e6:pieces40:"[..],
            &[0u8; 40][..],
            &b"ee"[..],
        ]
        .concat();
        create_and_write_file(&filepath, &contents);

        let torrent = match TorrentParser::parse(&filepath) {
            Ok(torrent) => torrent,
            Err(e) => {
                fs::remove_file(&filepath).unwrap();
                panic!("{:?}", e);
            }
        };
        fs::remove_file(&filepath).unwrap();

        assert_eq!(torrent.announce_url, "http://tracker.example/announce");
        assert_eq!(torrent.info.length, 32);
        assert_eq!(torrent.info.name, "a.bin");
        assert_eq!(torrent.info.piece_length, 16);
        assert_eq!(torrent.total_pieces(), 2);
        assert_eq!(torrent.info_hash.len(), 40);
    }

    #[test]
    fn test_parse_missing_file() {
        let result = TorrentParser::parse(Path::new("./does_not_exist.torrent"));
        assert!(matches!(result, Err(ParseError::IoError(_))));
    }

    #[test]
    fn test_parse_garbage() {
        let filepath = PathBuf::from("./test_parse_garbage.torrent");
        create_and_write_file(&filepath, b"not bencode at all");

        let result = TorrentParser::parse(&filepath);
        fs::remove_file(&filepath).unwrap();
        assert!(matches!(result, Err(ParseError::BencodeError(_))));
    }

    // Auxiliary functions

    fn create_and_write_file(path: &Path, contents: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }
}
