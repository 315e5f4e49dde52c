//! Framing for a single file transfer.
//!
//! One connection carries exactly one frame:
//!
//! ```text
//! [u32 big-endian N][N bytes UTF-8 "fileName|fileSize"][fileSize bytes of content]
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Separator between file name and size inside the metadata string
pub const METADATA_DELIMITER: char = '|';

/// Largest metadata block we are willing to allocate for
pub const MAX_METADATA_LEN: usize = 64 * 1024;

/// Errors raised while encoding or decoding a transfer header
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("metadata length {0} exceeds limit of {} bytes", MAX_METADATA_LEN)]
    MetadataTooLong(usize),

    #[error("metadata is not valid UTF-8")]
    InvalidUtf8,

    #[error("metadata is missing the '|' delimiter")]
    MissingDelimiter,

    #[error("invalid file size: {0:?}")]
    InvalidSize(String),

    #[error("unsafe file name: {0:?}")]
    UnsafeFileName(String),

    #[error("file name contains the '|' delimiter: {0:?}")]
    DelimiterInFileName(String),

    #[error("unexpected end of stream while reading {0}")]
    UnexpectedEof(&'static str),

    #[error("unexpected end of stream after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Header that precedes the file content on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub file_name: String,
    pub file_size: u64,
}

impl TransferMetadata {
    /// Build outgoing metadata, refusing names the receiver could not parse back
    pub fn new(file_name: impl Into<String>, file_size: u64) -> Result<Self, ProtocolError> {
        let file_name = file_name.into();
        if file_name.contains(METADATA_DELIMITER) {
            return Err(ProtocolError::DelimiterInFileName(file_name));
        }
        if file_name.is_empty() {
            return Err(ProtocolError::UnsafeFileName(file_name));
        }
        Ok(Self { file_name, file_size })
    }

    /// The `"fileName|fileSize"` string carried on the wire
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.file_name, METADATA_DELIMITER, self.file_size)
    }

    /// Parse the metadata string, splitting on the first delimiter
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let (name, size) = raw
            .split_once(METADATA_DELIMITER)
            .ok_or(ProtocolError::MissingDelimiter)?;

        // u64 parsing already rejects signs other than a leading '+'
        if size.starts_with('+') {
            return Err(ProtocolError::InvalidSize(size.to_string()));
        }
        let file_size = size
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidSize(size.to_string()))?;

        Ok(Self {
            file_name: name.to_string(),
            file_size,
        })
    }

    /// Final path component of the received name, safe to join onto a directory
    pub fn safe_file_name(&self) -> Result<&str, ProtocolError> {
        let name = self
            .file_name
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or_default();

        if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
            return Err(ProtocolError::UnsafeFileName(self.file_name.clone()));
        }
        Ok(name)
    }
}

/// Write the length prefix and metadata in a single buffer
pub async fn write_header<W>(
    writer: &mut W,
    metadata: &TransferMetadata,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = metadata.encode();
    let bytes = encoded.as_bytes();
    if bytes.len() > MAX_METADATA_LEN {
        return Err(ProtocolError::MetadataTooLong(bytes.len()));
    }

    let mut frame = Vec::with_capacity(4 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(bytes);
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read the length prefix and metadata block from the start of a connection
pub async fn read_header<R>(reader: &mut R) -> Result<TransferMetadata, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact_or_eof(reader, &mut len_buf, "metadata length").await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_METADATA_LEN {
        return Err(ProtocolError::MetadataTooLong(len));
    }

    let mut meta_buf = vec![0u8; len];
    read_exact_or_eof(reader, &mut meta_buf, "metadata").await?;
    let raw = String::from_utf8(meta_buf).map_err(|_| ProtocolError::InvalidUtf8)?;

    TransferMetadata::decode(&raw)
}

async fn read_exact_or_eof<R>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::UnexpectedEof(what))
        }
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

/// Integer percentage of `done` over `total`, truncated toward zero
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (done as u128 * 100) / total as u128;
    percent.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_bytes_on_the_wire() {
        let metadata = TransferMetadata::new("notes.txt", 42).unwrap();
        let mut out = Vec::new();
        write_header(&mut out, &metadata).await.unwrap();

        let expected_body = b"notes.txt|42";
        assert_eq!(&out[..4], &(expected_body.len() as u32).to_be_bytes());
        assert_eq!(&out[4..], expected_body);

        let mut reader = &out[..];
        let decoded = read_header(&mut reader).await.unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn test_decode_splits_on_first_delimiter() {
        // a name with an embedded '|' leaves garbage in the size field
        let err = TransferMetadata::decode("a|b|10").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSize(s) if s == "b|10"));
    }

    #[test]
    fn test_decode_rejects_malformed_metadata() {
        assert!(matches!(
            TransferMetadata::decode("no-delimiter"),
            Err(ProtocolError::MissingDelimiter)
        ));
        assert!(matches!(
            TransferMetadata::decode("file.bin|-5"),
            Err(ProtocolError::InvalidSize(_))
        ));
        assert!(matches!(
            TransferMetadata::decode("file.bin|+5"),
            Err(ProtocolError::InvalidSize(_))
        ));
        assert!(matches!(
            TransferMetadata::decode("file.bin|"),
            Err(ProtocolError::InvalidSize(_))
        ));
    }

    #[test]
    fn test_outgoing_name_with_delimiter_rejected() {
        assert!(matches!(
            TransferMetadata::new("bad|name.txt", 1),
            Err(ProtocolError::DelimiterInFileName(_))
        ));
    }

    #[test]
    fn test_safe_file_name_strips_directories() {
        let meta = TransferMetadata::decode("../../etc/passwd|3").unwrap();
        assert_eq!(meta.safe_file_name().unwrap(), "passwd");

        let meta = TransferMetadata::decode("C:\\Users\\me\\photo.jpg|3").unwrap();
        assert_eq!(meta.safe_file_name().unwrap(), "photo.jpg");

        for bad in ["..|1", "dir/..|1", "|1", "dir/|1"] {
            let meta = TransferMetadata::decode(bad).unwrap();
            assert!(meta.safe_file_name().is_err(), "{} should be rejected", bad);
        }
    }

    #[tokio::test]
    async fn test_truncated_length_prefix_is_eof() {
        let mut reader: &[u8] = &[0, 0];
        let err = read_header(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof("metadata length")));
    }

    #[tokio::test]
    async fn test_truncated_metadata_is_eof() {
        let mut data = 20u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"short|1");
        let mut reader = &data[..];
        let err = read_header(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof("metadata")));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_allocation() {
        let data = u32::MAX.to_be_bytes();
        let mut reader = &data[..];
        let err = read_header(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MetadataTooLong(_)));
    }

    #[test]
    fn test_progress_percent_truncates() {
        assert_eq!(progress_percent(0, 100), 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 66);
        assert_eq!(progress_percent(4096, 10_000), 40);
        assert_eq!(progress_percent(10_000, 10_000), 100);
        assert_eq!(progress_percent(u64::MAX - 1, u64::MAX), 99);
        assert_eq!(progress_percent(0, 0), 100);
    }
}
