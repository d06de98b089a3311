//! Binary protocol between the sync client and a remote agent
//!
//! Wire format (all integers are big-endian):
//!
//! ```text
//! +--------+---------+------------------+
//! | type   | length  | payload          |
//! | 1 byte | 4 bytes | variable         |
//! +--------+---------+------------------+
//! ```
//!
//! Message types:
//! - 0x01: Snapshot request (include_hidden:1, pattern_count:2, (len:2, pattern)*)
//! - 0x02: Snapshot response (encoded snapshot)
//! - 0x03: WriteFile request (path_len:2, path, mode:4, data)
//! - 0x04: DeleteFile request (path_len:2, path)
//! - 0x05: Ok response (no payload)
//! - 0x06: Error response (message)
//! - 0x07: Shutdown request (no payload)
//! - 0x08: MoveFile request (src_len:2, src, dst_len:2, dst)
//! - 0x09: CopyFile request (src_len:2, src, dst_len:2, dst)

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};

use crate::codec::{decode_snapshot, encode_snapshot};
use crate::scan::ScanOptions;
use crate::snapshot::Snapshot;

/// Message type identifiers
pub mod msg {
    pub const SNAPSHOT_REQ: u8 = 0x01;
    pub const SNAPSHOT_RESP: u8 = 0x02;
    pub const WRITE_FILE: u8 = 0x03;
    pub const DELETE_FILE: u8 = 0x04;
    pub const OK: u8 = 0x05;
    pub const ERROR: u8 = 0x06;
    pub const SHUTDOWN: u8 = 0x07;
    pub const MOVE_FILE: u8 = 0x08;
    pub const COPY_FILE: u8 = 0x09;
}

/// Size of a frame header
pub const HEADER_LEN: usize = 5;

/// Largest file a single WriteFile frame carries, whatever its path
pub const MAX_WRITE_LEN: u64 = u32::MAX as u64 - (2 + u16::MAX as u64) - 4;

/// Write a frame header (type + length)
fn write_header<W: Write>(w: &mut W, msg_type: u8, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| eyre!("Frame too large: {len} bytes"))?;
    w.write_all(&[msg_type])?;
    w.write_all(&len.to_be_bytes())?;
    Ok(())
}

/// Read a frame header, returns (type, length)
fn read_header<R: Read>(r: &mut R) -> std::io::Result<(u8, u32)> {
    let mut type_buf = [0u8; 1];
    r.read_exact(&mut type_buf)?;

    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;

    Ok((type_buf[0], u32::from_be_bytes(len_buf)))
}

/// Payload length of a frame whose header is `header`
#[must_use]
pub fn payload_len(header: &[u8; HEADER_LEN]) -> usize {
    u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize
}

/// Append a length-prefixed string
fn encode_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| eyre!("String too long for frame: {s}"))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn encode_path(buf: &mut Vec<u8>, path: &Path) -> Result<()> {
    let s = path
        .to_str()
        .ok_or_else(|| eyre!("Path is not UTF-8: {}", path.display()))?;
    encode_str(buf, s)
}

fn decode_str<R: Read>(r: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn decode_path<R: Read>(r: &mut R) -> Result<PathBuf> {
    decode_str(r).map(PathBuf::from)
}

/// Messages exchanged with an agent
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SnapshotReq(ScanOptions),
    SnapshotResp(Snapshot),
    WriteFile { path: PathBuf, data: Bytes, mode: u32 },
    DeleteFile { path: PathBuf },
    MoveFile { src: PathBuf, dst: PathBuf },
    CopyFile { src: PathBuf, dst: PathBuf },
    Ok,
    Error(String),
    Shutdown,
}

/// Protocol writer for sending messages
pub struct ProtocolWriter<W> {
    inner: W,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn send_frame(&mut self, msg_type: u8, payload: &[u8]) -> Result<()> {
        write_header(&mut self.inner, msg_type, payload.len())?;
        self.inner.write_all(payload)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Send snapshot request with the scan rules the remote should apply
    pub fn send_snapshot_req(&mut self, options: &ScanOptions) -> Result<()> {
        let mut payload = vec![u8::from(options.include_hidden)];
        let count = u16::try_from(options.ignore.len())
            .map_err(|_| eyre!("Too many ignore patterns"))?;
        payload.extend_from_slice(&count.to_be_bytes());
        for pattern in &options.ignore {
            encode_str(&mut payload, pattern)?;
        }
        self.send_frame(msg::SNAPSHOT_REQ, &payload)
    }

    /// Send snapshot response
    pub fn send_snapshot_resp(&mut self, snapshot: &Snapshot) -> Result<()> {
        let payload = encode_snapshot(snapshot);
        self.send_frame(msg::SNAPSHOT_RESP, &payload)
    }

    /// Send write file request
    pub fn send_write_file(&mut self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        let mut head = Vec::new();
        encode_path(&mut head, path)?;
        head.extend_from_slice(&mode.to_be_bytes());

        // Data goes out without being copied into the header buffer
        write_header(&mut self.inner, msg::WRITE_FILE, head.len() + data.len())?;
        self.inner.write_all(&head)?;
        self.inner.write_all(data)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Send delete file request
    pub fn send_delete_file(&mut self, path: &Path) -> Result<()> {
        let mut payload = Vec::new();
        encode_path(&mut payload, path)?;
        self.send_frame(msg::DELETE_FILE, &payload)
    }

    /// Send move file request
    pub fn send_move_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let mut payload = Vec::new();
        encode_path(&mut payload, src)?;
        encode_path(&mut payload, dst)?;
        self.send_frame(msg::MOVE_FILE, &payload)
    }

    /// Send copy file request
    pub fn send_copy_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let mut payload = Vec::new();
        encode_path(&mut payload, src)?;
        encode_path(&mut payload, dst)?;
        self.send_frame(msg::COPY_FILE, &payload)
    }

    /// Send OK response
    pub fn send_ok(&mut self) -> Result<()> {
        self.send_frame(msg::OK, &[])
    }

    /// Send error response
    pub fn send_error(&mut self, message: &str) -> Result<()> {
        self.send_frame(msg::ERROR, message.as_bytes())
    }

    /// Send shutdown request
    pub fn send_shutdown(&mut self) -> Result<()> {
        self.send_frame(msg::SHUTDOWN, &[])
    }
}

/// Protocol reader for receiving messages
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: Read> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read next message
    ///
    /// # Errors
    /// Fails on I/O errors, unknown message types, or malformed payloads
    pub fn read_message(&mut self) -> Result<Message> {
        let (msg_type, len) = read_header(&mut self.inner)?;
        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload)?;
        parse_message(msg_type, payload)
    }
}

/// Decode a message from its type byte and payload
///
/// # Errors
/// Fails on unknown message types or malformed payloads
pub fn parse_message(msg_type: u8, payload: Vec<u8>) -> Result<Message> {
    let mut cursor = Cursor::new(payload.as_slice());

    let message = match msg_type {
        msg::SNAPSHOT_REQ => {
            let mut flag = [0u8; 1];
            cursor.read_exact(&mut flag)?;
            let mut count_buf = [0u8; 2];
            cursor.read_exact(&mut count_buf)?;
            let count = u16::from_be_bytes(count_buf);
            let ignore = (0..count)
                .map(|_| decode_str(&mut cursor))
                .collect::<Result<Vec<_>>>()?;
            Message::SnapshotReq(ScanOptions {
                include_hidden: flag[0] != 0,
                ignore,
                hash_workers: None,
            })
        }
        msg::SNAPSHOT_RESP => {
            return Ok(Message::SnapshotResp(decode_snapshot(&payload)?));
        }
        msg::WRITE_FILE => {
            let path = decode_path(&mut cursor)?;
            let mut mode_buf = [0u8; 4];
            cursor.read_exact(&mut mode_buf)?;
            let offset = usize::try_from(cursor.position())?;
            let data = Bytes::from(payload).slice(offset..);
            return Ok(Message::WriteFile {
                path,
                data,
                mode: u32::from_be_bytes(mode_buf),
            });
        }
        msg::DELETE_FILE => Message::DeleteFile {
            path: decode_path(&mut cursor)?,
        },
        msg::MOVE_FILE => Message::MoveFile {
            src: decode_path(&mut cursor)?,
            dst: decode_path(&mut cursor)?,
        },
        msg::COPY_FILE => Message::CopyFile {
            src: decode_path(&mut cursor)?,
            dst: decode_path(&mut cursor)?,
        },
        msg::OK => Message::Ok,
        msg::ERROR => return Ok(Message::Error(String::from_utf8_lossy(&payload).to_string())),
        msg::SHUTDOWN => Message::Shutdown,
        other => bail!("Unknown message type: {other:#04x}"),
    };

    let trailing = payload.len() - usize::try_from(cursor.position())?;
    if trailing > 0 {
        bail!("Message {msg_type:#04x} has {trailing} trailing bytes");
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::snapshot;

    fn roundtrip(send: impl FnOnce(&mut ProtocolWriter<&mut Vec<u8>>) -> Result<()>) -> Message {
        let mut buf = Vec::new();
        send(&mut ProtocolWriter::new(&mut buf)).unwrap();
        let mut reader = ProtocolReader::new(Cursor::new(buf));
        let message = reader.read_message().unwrap();
        assert!(reader.read_message().is_err(), "frame fully consumed");
        message
    }

    #[test]
    fn test_snapshot_req_carries_options() {
        let options = ScanOptions {
            include_hidden: true,
            ignore: vec!["*.log".into(), "target/".into()],
            hash_workers: Some(3),
        };
        let message = roundtrip(|w| w.send_snapshot_req(&options));
        assert_eq!(
            message,
            Message::SnapshotReq(ScanOptions {
                hash_workers: None,
                ..options
            })
        );
    }

    #[test]
    fn test_snapshot_resp() {
        let snap = snapshot(&[("a.txt", b"a"), ("dir/b.txt", b"bb")]);
        let Message::SnapshotResp(decoded) = roundtrip(|w| w.send_snapshot_resp(&snap)) else {
            panic!("expected snapshot response");
        };
        assert_eq!(decoded.files, snap.files);
    }

    #[test]
    fn test_write_file() {
        let message = roundtrip(|w| w.send_write_file(Path::new("dir/f.bin"), b"\x00\x01data", 0o755));
        assert_eq!(
            message,
            Message::WriteFile {
                path: PathBuf::from("dir/f.bin"),
                data: Bytes::from_static(b"\x00\x01data"),
                mode: 0o755,
            }
        );
    }

    #[test]
    fn test_move_and_copy() {
        assert_eq!(
            roundtrip(|w| w.send_move_file(Path::new("a"), Path::new("b/c"))),
            Message::MoveFile {
                src: PathBuf::from("a"),
                dst: PathBuf::from("b/c"),
            }
        );
        assert_eq!(
            roundtrip(|w| w.send_copy_file(Path::new("x"), Path::new("y"))),
            Message::CopyFile {
                src: PathBuf::from("x"),
                dst: PathBuf::from("y"),
            }
        );
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            roundtrip(|w| w.send_error("disk full")),
            Message::Error("disk full".into())
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let frame = [0x7f, 0, 0, 0, 0];
        let mut reader = ProtocolReader::new(Cursor::new(frame.to_vec()));
        assert!(reader.read_message().is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert!(parse_message(msg::DELETE_FILE, vec![0, 1, b'a', b'z']).is_err());
    }

    #[test]
    fn test_max_write_len_fits_any_path() {
        let longest_head = 2 + usize::from(u16::MAX) + 4;
        assert_eq!(MAX_WRITE_LEN as usize + longest_head, u32::MAX as usize);
    }

    #[test]
    fn test_payload_len() {
        let mut buf = Vec::new();
        ProtocolWriter::new(&mut buf).send_error("abc").unwrap();
        let header: [u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().unwrap();
        assert_eq!(payload_len(&header), 3);
    }
}
