//! The framed transfer protocol shared by the coordinator, the storage nodes and the clients.
//!
//! All integers are fixed-width and native-endian. An upload message is
//!
//! ```text
//! i32 dest_path_len | dest_path | i32 file_name_len | file_name | i64 file_size | payload
//! ```
//!
//! and a download response is an `i64` size (or [NOT_FOUND]) followed by the payload. Text
//! commands are single lines; text replies are terminated by [REPLY_TERMINATOR].
//!
//! Every reader in this module tolerates arbitrary fragmentation of the underlying stream. The
//! [FrameReader] keeps bytes that were read ahead, e.g. while sniffing a command, and hands them
//! out before requesting more from the source.

use crate::error::{ShardError, ShardResult};
use std::io;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};

/// Size of the chunks payloads are streamed in.
pub const CHUNK_SIZE: usize = 8192;

/// Maximum length of a path or file name on the wire.
pub const MAX_PATH_LEN: usize = 1024;

/// Size sentinel signaling that the requested file does not exist.
pub const NOT_FOUND: i64 = -1;

/// Byte terminating a text reply.
pub const REPLY_TERMINATOR: u8 = 0;

/// Largest file size accepted on the wire (256 TiB).
///
/// Eight bytes of text read in place of a size always decode to a larger value, so a text reply
/// where a size header was expected is rejected before any payload is relayed.
pub const MAX_FILE_SIZE: u64 = 1 << 48;

/// Header of a download response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeHeader {
    /// The file exists and this many payload bytes follow.
    Found(u64),
    /// The file does not exist, no payload follows.
    NotFound,
}

impl SizeHeader {
    fn to_wire(self) -> i64 {
        match self {
            SizeHeader::Found(size) => size as i64,
            SizeHeader::NotFound => NOT_FOUND,
        }
    }

    fn from_wire(value: i64) -> ShardResult<Self> {
        match value {
            NOT_FOUND => Ok(SizeHeader::NotFound),
            size => Ok(SizeHeader::Found(checked_file_size(size)?)),
        }
    }
}

fn checked_file_size(size: i64) -> ShardResult<u64> {
    match u64::try_from(size) {
        Ok(size) if size <= MAX_FILE_SIZE => Ok(size),
        Ok(_) => Err(ShardError::ProtocolViolation("implausible file size")),
        Err(_) => Err(ShardError::ProtocolViolation("negative file size")),
    }
}

/// The preamble of an upload message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHeader {
    /// Logical destination directory, e.g. `~S2/docs`.
    pub dest_path: String,
    /// Name of the file within the destination directory.
    pub file_name: String,
    /// Number of payload bytes following the header.
    pub file_size: u64,
}

impl UploadHeader {
    /// Decodes an upload header, reading exactly the bytes that belong to it.
    pub fn decode<R: Read>(reader: &mut R) -> ShardResult<Self> {
        let dest_path = read_string(reader)?;
        let file_name = read_string(reader)?;
        let file_size = checked_file_size(read_i64(reader)?)?;
        Ok(Self {
            dest_path,
            file_name,
            file_size,
        })
    }

    /// Writes the header. The payload has to be written by the caller.
    pub fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_string(writer, &self.dest_path)?;
        write_string(writer, &self.file_name)?;
        write_i64(writer, self.file_size as i64)
    }
}

/// Buffered reader for all messages of the protocol.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(CHUNK_SIZE, inner),
        }
    }

    /// Returns the buffered bytes without consuming them, reading from the source only if the
    /// buffer is empty. An empty slice means the peer closed the connection.
    pub fn sniff(&mut self) -> ShardResult<&[u8]> {
        Ok(self.inner.fill_buf()?)
    }

    /// Reads a text command.
    ///
    /// The command extends to the first newline or NUL byte of the next read, or over the whole
    /// read if it contains neither. Bytes after the terminator stay buffered. Returns `None` if
    /// the peer closed the connection.
    pub fn read_command(&mut self) -> ShardResult<Option<String>> {
        let buf = self.inner.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        let (line_len, consumed) = match buf.iter().position(|&b| b == b'\n' || b == b'\0') {
            Some(pos) => (pos, pos + 1),
            None => (buf.len(), buf.len()),
        };
        let line = String::from_utf8_lossy(&buf[..line_len])
            .trim_end_matches(['\r', '\0'])
            .to_string();
        self.inner.consume(consumed);
        Ok(Some(line))
    }

    pub fn read_upload_header(&mut self) -> ShardResult<UploadHeader> {
        UploadHeader::decode(&mut self.inner)
    }

    pub fn read_size(&mut self) -> ShardResult<SizeHeader> {
        read_size(&mut self.inner)
    }

    /// Reads a text reply up to its terminator or the end of the stream.
    pub fn read_reply(&mut self) -> ShardResult<String> {
        let mut buf = Vec::new();
        self.inner.read_until(REPLY_TERMINATOR, &mut buf)?;
        if buf.last() == Some(&REPLY_TERMINATOR) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Streams exactly `size` bytes into `writer`.
    pub fn copy_exact<W: Write + ?Sized>(&mut self, size: u64, writer: &mut W) -> ShardResult<()> {
        copy_exact(&mut self.inner, size, writer)
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut R {
        self.inner.get_mut()
    }
}

impl<R: Read> Read for FrameReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Reads exactly `buf.len()` bytes, failing with [ShardError::ShortRead] if the stream ends
/// early.
pub fn read_exact<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> ShardResult<()> {
    let mut received = 0;
    while received < buf.len() {
        match reader.read(&mut buf[received..]) {
            Ok(0) => return Err(ShardError::short_read(buf.len() as u64, received as u64)),
            Ok(n) => received += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Streams exactly `size` bytes from `reader` to `writer` in chunks of [CHUNK_SIZE].
///
/// Read failures are reported as [ShardError::ShortRead] with the number of bytes copied so far,
/// write failures as [ShardError::Io].
pub fn copy_exact<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    size: u64,
    writer: &mut W,
) -> ShardResult<()> {
    let mut buf = [0; CHUNK_SIZE];
    let mut copied = 0u64;
    while copied < size {
        let want = usize::try_from(size - copied).map_or(CHUNK_SIZE, |n| n.min(CHUNK_SIZE));
        let n = match reader.read(&mut buf[..want]) {
            Ok(0) => return Err(ShardError::short_read(size, copied)),
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return Err(ShardError::short_read(size, copied)),
        };
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok(())
}

pub fn read_size<R: Read + ?Sized>(reader: &mut R) -> ShardResult<SizeHeader> {
    SizeHeader::from_wire(read_i64(reader)?)
}

pub fn write_size<W: Write + ?Sized>(writer: &mut W, size: SizeHeader) -> io::Result<()> {
    write_i64(writer, size.to_wire())
}

/// Writes a text reply followed by its terminator.
pub fn write_reply<W: Write + ?Sized>(writer: &mut W, reply: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(reply.len() + 1);
    buf.extend_from_slice(reply.as_bytes());
    buf.push(REPLY_TERMINATOR);
    writer.write_all(&buf)?;
    writer.flush()
}

fn read_i64<R: Read + ?Sized>(reader: &mut R) -> ShardResult<i64> {
    let mut buf = [0; 8];
    read_exact(reader, &mut buf)?;
    Ok(i64::from_ne_bytes(buf))
}

fn write_i64<W: Write + ?Sized>(writer: &mut W, value: i64) -> io::Result<()> {
    writer.write_all(&value.to_ne_bytes())
}

fn read_string<R: Read + ?Sized>(reader: &mut R) -> ShardResult<String> {
    let mut len_buf = [0; 4];
    read_exact(reader, &mut len_buf)?;
    let len = i32::from_ne_bytes(len_buf);
    if len <= 0 || len as usize > MAX_PATH_LEN {
        return Err(ShardError::ProtocolViolation("length field out of range"));
    }
    let mut buf = vec![0; len as usize];
    read_exact(reader, &mut buf)?;
    String::from_utf8(buf).map_err(|_| ShardError::ProtocolViolation("string is not valid UTF-8"))
}

fn write_string<W: Write + ?Sized>(writer: &mut W, value: &str) -> io::Result<()> {
    if value.is_empty() || value.len() > MAX_PATH_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "path or file name length out of range",
        ));
    }
    writer.write_all(&(value.len() as i32).to_ne_bytes())?;
    writer.write_all(value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::io::Cursor;

    /// Hands out the wrapped data in reads of at most `chunk` bytes.
    struct ChunkedReader<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for ChunkedReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn encode_message(header: &UploadHeader, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        buf.extend_from_slice(payload);
        buf
    }

    fn random_payload(len: usize) -> Vec<u8> {
        let mut payload = vec![0; len];
        StdRng::seed_from_u64(0).fill_bytes(&mut payload);
        payload
    }

    #[test]
    fn test_decodes_message_split_at_any_boundary() {
        let payload = random_payload(CHUNK_SIZE + 17);
        let header = UploadHeader {
            dest_path: "~S2/docs/reports".to_string(),
            file_name: "q3.pdf".to_string(),
            file_size: payload.len() as u64,
        };
        let message = encode_message(&header, &payload);

        for chunk in (1..64).chain([CHUNK_SIZE - 1, CHUNK_SIZE, message.len()]) {
            let mut reader = FrameReader::new(ChunkedReader {
                data: &message,
                chunk,
            });
            let decoded = reader.read_upload_header().unwrap();
            assert_eq!(decoded, header, "chunk size {chunk}");
            let mut received = Vec::new();
            reader.copy_exact(decoded.file_size, &mut received).unwrap();
            assert_eq!(received, payload, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_decoding_resumes_after_sniffed_prefix() {
        let header = UploadHeader {
            dest_path: "~S3".to_string(),
            file_name: "notes.txt".to_string(),
            file_size: 12,
        };
        let message = encode_message(&header, b"hello world!");
        let mut reader = FrameReader::new(ChunkedReader {
            data: &message,
            chunk: 6,
        });

        let sniffed = reader.sniff().unwrap().to_vec();
        assert_eq!(sniffed, &message[..6]);

        assert_eq!(reader.read_upload_header().unwrap(), header);
        let mut received = Vec::new();
        reader.copy_exact(12, &mut received).unwrap();
        assert_eq!(received, b"hello world!");
    }

    #[test]
    fn test_rejects_invalid_lengths() {
        for len in [0i32, -5, MAX_PATH_LEN as i32 + 1] {
            let mut message = len.to_ne_bytes().to_vec();
            message.extend_from_slice(&[b'a'; 16]);
            let err = UploadHeader::decode(&mut Cursor::new(message)).unwrap_err();
            assert!(
                matches!(err, ShardError::ProtocolViolation(_)),
                "length {len}: {err}"
            );
        }
    }

    #[test]
    fn test_rejects_negative_file_size() {
        let mut message = Vec::new();
        write_string(&mut message, "~S1").unwrap();
        write_string(&mut message, "a.c").unwrap();
        write_i64(&mut message, -7).unwrap();
        assert!(matches!(
            UploadHeader::decode(&mut Cursor::new(message)),
            Err(ShardError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_text_in_place_of_size_is_rejected() {
        let mut reader = FrameReader::new(Cursor::new(b"ERROR: File not found\0".to_vec()));
        assert!(matches!(
            reader.read_size(),
            Err(ShardError::ProtocolViolation("implausible file size"))
        ));

        let mut reader = FrameReader::new(Cursor::new(b"Files fo".to_vec()));
        assert!(reader.read_size().is_err());

        let mut buf = Vec::new();
        write_size(&mut buf, SizeHeader::Found(MAX_FILE_SIZE)).unwrap();
        write_i64(&mut buf, MAX_FILE_SIZE as i64 + 1).unwrap();
        let mut reader = FrameReader::new(Cursor::new(buf));
        assert_eq!(
            reader.read_size().unwrap(),
            SizeHeader::Found(MAX_FILE_SIZE)
        );
        assert!(reader.read_size().is_err());
    }

    #[test]
    fn test_short_payload_reports_received_bytes() {
        let mut received = Vec::new();
        let err = copy_exact(&mut Cursor::new(b"hello"), 12, &mut received).unwrap_err();
        assert!(matches!(
            err,
            ShardError::ShortRead {
                expected: 12,
                received: 5
            }
        ));
        assert_eq!(received, b"hello");
    }

    #[test]
    fn test_truncated_header_is_short_read() {
        let mut message = Vec::new();
        write_string(&mut message, "~S2").unwrap();
        message.extend_from_slice(&4i32.to_ne_bytes());
        message.extend_from_slice(b"a.");
        assert!(matches!(
            UploadHeader::decode(&mut Cursor::new(message)),
            Err(ShardError::ShortRead { .. })
        ));
    }

    #[test]
    fn test_size_header() {
        let mut buf = Vec::new();
        write_size(&mut buf, SizeHeader::NotFound).unwrap();
        write_size(&mut buf, SizeHeader::Found(0)).unwrap();
        assert_eq!(&buf[..8], &(-1i64).to_ne_bytes());

        let mut reader = FrameReader::new(ChunkedReader {
            data: &buf,
            chunk: 3,
        });
        assert_eq!(reader.read_size().unwrap(), SizeHeader::NotFound);
        assert_eq!(reader.read_size().unwrap(), SizeHeader::Found(0));
        assert!(reader.read_size().is_err());
    }

    #[test]
    fn test_command_leaves_trailing_bytes_buffered() {
        let mut data = b"uploadf a.c ~S1/src\n".to_vec();
        data.extend_from_slice(&3i64.to_ne_bytes());
        data.extend_from_slice(b"x;\n");
        let mut reader = FrameReader::new(Cursor::new(data));

        assert_eq!(
            reader.read_command().unwrap().as_deref(),
            Some("uploadf a.c ~S1/src")
        );
        assert_eq!(reader.read_size().unwrap(), SizeHeader::Found(3));
        let mut payload = Vec::new();
        reader.copy_exact(3, &mut payload).unwrap();
        assert_eq!(payload, b"x;\n");
        assert_eq!(reader.read_command().unwrap(), None);
    }

    #[test]
    fn test_command_without_newline_spans_whole_read() {
        let mut reader = FrameReader::new(Cursor::new(b"LIST ~S2/docs\0".to_vec()));
        assert_eq!(
            reader.read_command().unwrap().as_deref(),
            Some("LIST ~S2/docs")
        );
        let mut reader = FrameReader::new(Cursor::new(b"dispfnames ~S1".to_vec()));
        assert_eq!(
            reader.read_command().unwrap().as_deref(),
            Some("dispfnames ~S1")
        );
    }

    #[test]
    fn test_replies_are_terminated() {
        let mut buf = Vec::new();
        write_reply(&mut buf, "first").unwrap();
        write_reply(&mut buf, "second").unwrap();
        let mut reader = FrameReader::new(ChunkedReader {
            data: &buf,
            chunk: 4,
        });
        assert_eq!(reader.read_reply().unwrap(), "first");
        assert_eq!(reader.read_reply().unwrap(), "second");
        assert_eq!(reader.read_reply().unwrap(), "");
    }
}
