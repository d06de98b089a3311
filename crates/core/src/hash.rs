//! Content fingerprints using BLAKE3

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Size of a fingerprint in bytes
pub const FINGERPRINT_LEN: usize = 32;

/// A path-independent content fingerprint (BLAKE3, 256-bit).
///
/// Serializes as a 64-character hex string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Fingerprint arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap a raw digest read back from disk or the wire
    #[must_use]
    pub const fn from_raw(raw: [u8; FINGERPRINT_LEN]) -> Self {
        Self(raw)
    }

    /// Fingerprint a file by streaming its contents
    ///
    /// # Errors
    /// Returns an error if the file cannot be read
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Fingerprint everything a reader yields
    ///
    /// # Errors
    /// Returns an error if reading fails
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self(*hasher.finalize().as_bytes()))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Full lowercase hex encoding
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a full 64-character hex string
    ///
    /// # Errors
    /// Returns an error if the string is not valid hex of the right length
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut raw = [0u8; FINGERPRINT_LEN];
        hex::decode_to_slice(s, &mut raw)?;
        Ok(Self(raw))
    }

    /// First 16 hex characters, for display
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_hex()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = hex::FromHexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fingerprint_deterministic() {
        let h1 = Fingerprint::from_bytes(b"hello world");
        let h2 = Fingerprint::from_bytes(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_fingerprint_different_data() {
        assert_ne!(
            Fingerprint::from_bytes(b"hello"),
            Fingerprint::from_bytes(b"world")
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        // Larger than the read buffer so several updates happen
        let data = vec![7u8; 200 * 1024];
        let streamed = Fingerprint::from_reader(Cursor::new(&data)).unwrap();
        assert_eq!(streamed, Fingerprint::from_bytes(&data));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"contents").unwrap();
        assert_eq!(
            Fingerprint::from_file(&path).unwrap(),
            Fingerprint::from_bytes(b"contents")
        );
    }

    #[test]
    fn test_hex_parse() {
        let fp = Fingerprint::from_bytes(b"abc");
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()).unwrap(), fp);
        assert!(Fingerprint::from_hex("zz").is_err());
        assert_eq!(fp.to_string().len(), 16);
    }
}
