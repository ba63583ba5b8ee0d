use bencoding::bencode::Bencode;

/// One entry of a multi-file `info` dictionary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TorrentFile {
    /// Path components below the torrent directory, in order.
    pub path: Vec<String>,
    pub length: i64,
}

/// The `info` dictionary of a metainfo document.
///
/// `length` is the total payload size. For multi-file torrents it is the sum
/// of the file lengths and `files` holds the layout in descriptor order; for
/// single-file torrents `files` is empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Info {
    pub name: String,
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub length: i64,
    pub files: Vec<TorrentFile>,
}

/// Posible `Info` parsing errors.
#[derive(Debug, PartialEq, Eq)]
pub enum FromInfoError {
    NotADict,
    MissingName,
    MissingLength,
    MissingPieceLength,
    MissingPieces,
    InvalidFileEntry,
    InvalidPieces,
}

impl Info {
    pub fn from(bencode: &Bencode) -> Result<Info, FromInfoError> {
        let dict = bencode.as_dict().ok_or(FromInfoError::NotADict)?;

        let name = dict
            .get(&b"name"[..])
            .and_then(|v| v.as_bytes())
            .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
            .ok_or(FromInfoError::MissingName)?;

        let piece_length = dict
            .get(&b"piece length"[..])
            .and_then(|v| v.as_int())
            .ok_or(FromInfoError::MissingPieceLength)?;

        let pieces = dict
            .get(&b"pieces"[..])
            .and_then(|v| v.as_bytes())
            .ok_or(FromInfoError::MissingPieces)?
            .to_vec();
        if pieces.len() % 20 != 0 {
            return Err(FromInfoError::InvalidPieces);
        }

        let (length, files) = match dict.get(&b"files"[..]) {
            Some(files_value) => {
                let files = Self::create_files(files_value)?;
                let total = files.iter().map(|file| file.length).sum();
                (total, files)
            }
            None => {
                let length = dict
                    .get(&b"length"[..])
                    .and_then(|v| v.as_int())
                    .ok_or(FromInfoError::MissingLength)?;
                (length, vec![])
            }
        };

        Ok(Info {
            name,
            piece_length,
            pieces,
            length,
            files,
        })
    }

    fn create_files(bencode: &Bencode) -> Result<Vec<TorrentFile>, FromInfoError> {
        let list = bencode.as_list().ok_or(FromInfoError::InvalidFileEntry)?;
        let mut files = Vec::with_capacity(list.len());

        for entry in list {
            let length = entry
                .get(b"length")
                .and_then(|v| v.as_int())
                .ok_or(FromInfoError::InvalidFileEntry)?;

            let path_list = entry
                .get(b"path")
                .and_then(|v| v.as_list())
                .ok_or(FromInfoError::InvalidFileEntry)?;

            let mut path = Vec::with_capacity(path_list.len());
            for component in path_list {
                let component = component
                    .as_bytes()
                    .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
                    .ok_or(FromInfoError::InvalidFileEntry)?;
                path.push(component);
            }
            if path.is_empty() {
                return Err(FromInfoError::InvalidFileEntry);
            }

            files.push(TorrentFile { path, length });
        }

        Ok(files)
    }
}
