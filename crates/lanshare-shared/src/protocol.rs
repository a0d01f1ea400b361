//! Wire framing shared by every peer connection.
//!
//! A frame opens with the sender id and a type tag, both strings. Strings are
//! a big-endian `u32` length followed by UTF-8, integers are big-endian `u64`.
//! Payload bytes (file contents, update packages) follow their header raw.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FIELD_LEN;
use crate::error::ValidationError;

/// Receiver verdict after a FILE payload: stored and verified.
pub const ACK_OK: u8 = 0;
/// Receiver verdict: declared hash did not match.
pub const ACK_INTEGRITY: u8 = 1;
/// Receiver verdict: header refused (bad name, I/O failure on disk).
pub const ACK_REJECTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Chat,
    File,
    Status,
    Version,
    Update,
}

impl FrameKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            FrameKind::Chat => "CHAT",
            FrameKind::File => "FILE",
            FrameKind::Status => "STATUS",
            FrameKind::Version => "VERSION",
            FrameKind::Update => "UPDATE",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, ValidationError> {
        match tag {
            "CHAT" => Ok(FrameKind::Chat),
            "FILE" => Ok(FrameKind::File),
            "STATUS" => Ok(FrameKind::Status),
            // UPDATE_CHECK is accepted as an alias of VERSION
            "VERSION" | "UPDATE_CHECK" => Ok(FrameKind::Version),
            "UPDATE" => Ok(FrameKind::Update),
            other => Err(ValidationError::UnknownTag(other.to_string())),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

pub async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> io::Result<()> {
    if s.len() > MAX_FIELD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("field of {} bytes exceeds limit", s.len()),
        ));
    }
    w.write_u32(s.len() as u32).await?;
    w.write_all(s.as_bytes()).await
}

pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<String> {
    let len = r.read_u32().await? as usize;
    if len > MAX_FIELD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("field of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn write_u64<W: AsyncWrite + Unpin>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_u64(v).await
}

pub async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<u64> {
    r.read_u64().await
}

/// Sender id and type tag opening every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub sender_id: String,
    pub tag: String,
}

impl Preamble {
    pub async fn write_to<W: AsyncWrite + Unpin>(
        w: &mut W,
        sender_id: &str,
        kind: FrameKind,
    ) -> io::Result<()> {
        write_string(w, sender_id).await?;
        write_string(w, kind.as_tag()).await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Self> {
        let sender_id = read_string(r).await?;
        let tag = read_string(r).await?;
        Ok(Self { sender_id, tag })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFrame {
    pub encrypted_message: String,
}

impl ChatFrame {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, &self.encrypted_message).await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            encrypted_message: read_string(r).await?,
        })
    }
}

/// FILE header; `total_size` raw bytes follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub file_name: String,
    pub total_size: u64,
    pub metadata: String,
    pub hash: String,
    pub tags: String,
}

impl FileHeader {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, &self.file_name).await?;
        write_u64(w, self.total_size).await?;
        write_string(w, &self.metadata).await?;
        write_string(w, &self.hash).await?;
        write_string(w, &self.tags).await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            file_name: read_string(r).await?,
            total_size: read_u64(r).await?,
            metadata: read_string(r).await?,
            hash: read_string(r).await?,
            tags: read_string(r).await?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    pub display_name: String,
    pub user_status: String,
}

impl StatusFrame {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, &self.display_name).await?;
        write_string(w, &self.user_status).await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            display_name: read_string(r).await?,
            user_status: read_string(r).await?,
        })
    }
}

/// Version and developer identity, sent as the VERSION query and its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub developer_id: String,
}

impl VersionInfo {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, &self.version).await?;
        write_string(w, &self.developer_id).await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            version: read_string(r).await?,
            developer_id: read_string(r).await?,
        })
    }
}

/// Reply to UPDATE; `payload_size` raw bytes follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOffer {
    pub patch_notes: String,
    pub signature: String,
    pub payload_size: u64,
}

impl UpdateOffer {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, &self.patch_notes).await?;
        write_string(w, &self.signature).await?;
        write_u64(w, self.payload_size).await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            patch_notes: read_string(r).await?,
            signature: read_string(r).await?,
            payload_size: read_u64(r).await?,
        })
    }
}
