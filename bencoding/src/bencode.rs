use std::collections::BTreeMap;

/// A bencoded value.
///
/// Dictionaries keep every key they were decoded with, so re-encoding a
/// decoded value reproduces the original bytes for canonical input.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

/// Posible bencode decoding errors.
#[derive(PartialEq, Eq, Debug)]
pub enum BencodeError {
    UnexpectedEnd,
    InvalidPrefix(u8),
    InvalidInt,
    InvalidLength,
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEnd)
    }

    fn bump(&mut self) -> Result<u8, BencodeError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn value(&mut self) -> Result<Bencode, BencodeError> {
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(Bencode::Bytes(self.byte_string()?)),
            other => Err(BencodeError::InvalidPrefix(other)),
        }
    }

    fn int(&mut self) -> Result<Bencode, BencodeError> {
        self.bump()?; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.data[start..self.pos];
        self.bump()?; // 'e'
        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInt)?;
        let number = text.parse::<i64>().map_err(|_| BencodeError::InvalidInt)?;
        Ok(Bencode::Int(number))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let digits = &self.data[start..self.pos];
        self.bump()?; // ':'
        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidLength)?;
        let length = text
            .parse::<usize>()
            .map_err(|_| BencodeError::InvalidLength)?;
        if self.pos + length > self.data.len() {
            return Err(BencodeError::UnexpectedEnd);
        }
        let bytes = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    fn list(&mut self) -> Result<Bencode, BencodeError> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.bump()?; // 'e'
        Ok(Bencode::List(items))
    }

    fn dict(&mut self) -> Result<Bencode, BencodeError> {
        self.bump()?; // 'd'
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.byte_string()?;
            let value = self.value()?;
            entries.insert(key, value);
        }
        self.bump()?; // 'e'
        Ok(Bencode::Dict(entries))
    }
}

impl Bencode {
    /// Decodes a bencoded byte slice into a `Bencode` value.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bencoding::bencode::Bencode;
    ///
    /// let bencode = Bencode::decode(b"5:hello").unwrap();
    /// assert_eq!(bencode, Bencode::Bytes(b"hello".to_vec()));
    ///
    /// let bencode = Bencode::decode(b"i123e").unwrap();
    /// assert_eq!(bencode, Bencode::Int(123));
    /// ```
    pub fn decode(data: &[u8]) -> Result<Bencode, BencodeError> {
        Decoder::new(data).value()
    }

    /// Encodes this value back into its bencoded byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(n) => {
                out.push(b'i');
                out.extend(n.to_string().into_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(bytes) => {
                out.extend(bytes.len().to_string().into_bytes());
                out.push(b':');
                out.extend(bytes);
            }
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend(key.len().to_string().into_bytes());
                    out.push(b':');
                    out.extend(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Returns the dictionary entries if this value is a dict.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Returns the byte string if this value is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the integer if this value is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the list items if this value is a list.
    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(items) => Some(items),
            _ => None,
        }
    }

    /// Looks up `key` if this value is a dict.
    pub fn get(&self, key: &[u8]) -> Option<&Bencode> {
        self.as_dict().and_then(|entries| entries.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_int() {
        assert_eq!(Bencode::decode(b"i42e").unwrap(), Bencode::Int(42));
        assert_eq!(Bencode::decode(b"i-7e").unwrap(), Bencode::Int(-7));
    }

    #[test]
    fn test_decode_bytes() {
        assert_eq!(
            Bencode::decode(b"4:spam").unwrap(),
            Bencode::Bytes(b"spam".to_vec())
        );
        assert_eq!(Bencode::decode(b"0:").unwrap(), Bencode::Bytes(vec![]));
    }

    #[test]
    fn test_decode_list() {
        let decoded = Bencode::decode(b"l4:spami3ee").unwrap();
        assert_eq!(
            decoded,
            Bencode::List(vec![Bencode::Bytes(b"spam".to_vec()), Bencode::Int(3)])
        );
    }

    #[test]
    fn test_decode_dict() {
        let decoded = Bencode::decode(b"d3:cow3:moo4:spami7ee").unwrap();
        let mut expected = BTreeMap::new();
        expected.insert(b"cow".to_vec(), Bencode::Bytes(b"moo".to_vec()));
        expected.insert(b"spam".to_vec(), Bencode::Int(7));
        assert_eq!(decoded, Bencode::Dict(expected));
    }

    #[test]
    fn test_decode_nested() {
        let decoded = Bencode::decode(b"d4:infod6:lengthi10e4:name4:testee").unwrap();
        let info = decoded.get(b"info").unwrap();
        assert_eq!(info.get(b"length").unwrap().as_int(), Some(10));
        assert_eq!(info.get(b"name").unwrap().as_bytes(), Some(&b"test"[..]));
    }

    #[test]
    fn test_decode_truncated_string() {
        assert_eq!(
            Bencode::decode(b"10:short").unwrap_err(),
            BencodeError::UnexpectedEnd
        );
    }

    #[test]
    fn test_decode_invalid_prefix() {
        assert_eq!(
            Bencode::decode(b"x").unwrap_err(),
            BencodeError::InvalidPrefix(b'x')
        );
    }

    #[test]
    fn test_decode_invalid_int() {
        assert_eq!(
            Bencode::decode(b"iabce").unwrap_err(),
            BencodeError::InvalidInt
        );
    }

    #[test]
    fn test_encode_roundtrip() {
        let cases: Vec<&[u8]> = vec![
            b"i42e",
            b"4:spam",
            b"l4:spami3ee",
            b"d3:cow3:moo4:spami7ee",
            b"d4:infod6:lengthi10e4:name4:testee",
        ];
        for case in cases {
            let decoded = Bencode::decode(case).unwrap();
            assert_eq!(decoded.encode(), case.to_vec());
        }
    }

    #[test]
    fn test_encode_dict_sorts_keys() {
        let mut entries = BTreeMap::new();
        entries.insert(b"zz".to_vec(), Bencode::Int(1));
        entries.insert(b"aa".to_vec(), Bencode::Int(2));
        let encoded = Bencode::Dict(entries).encode();
        assert_eq!(encoded, b"d2:aai2e2:zzi1ee".to_vec());
    }
}
