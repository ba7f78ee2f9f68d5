//! Packet framing for strand sessions.
//!
//! Wire format: `[length:4][payload:N]`
//!
//! - **length**: payload size in bytes (big-endian u32)
//! - **payload**: opaque application data
//!
//! There is no magic number, version byte or checksum. Structure inside the
//! payload is the business of the encoding layer ([`Packet::from_msg`] /
//! [`Packet::to_msg`]), which marshals application values as JSON.

use std::io::ErrorKind;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod codec;

pub use codec::PacketCodec;

/// Size of the length prefix in bytes.
pub const HEADER_SIZE: usize = 4;

/// Hard per-packet payload ceiling imposed by the u32 length field.
pub const MAX_PACKET_SIZE: usize = u32::MAX as usize;

/// The unit of exchange over a session: an opaque byte payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
}

impl Packet {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Marshal an application value into a packet payload.
    pub fn from_msg<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        let data = serde_json::to_vec(value).map_err(CodecError::Serde)?;
        Ok(Self { data })
    }

    /// Unmarshal the packet payload into an application value.
    pub fn to_msg<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_slice(&self.data).map_err(CodecError::Serde)
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o failure on packet stream")]
    Io(#[from] std::io::Error),

    /// The stream ended after a frame had started but before it completed.
    /// Never produced for a stream that ends cleanly between frames.
    #[error("stream ended inside a {expected} byte frame")]
    Truncated { expected: usize },

    #[error("payload of {len} bytes does not fit the length header")]
    TooLarge { len: usize },

    #[error("payload encoding")]
    Serde(#[source] serde_json::Error),
}

/// Write one packet to the stream and flush it.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = packet.data.len();
    if len > MAX_PACKET_SIZE {
        return Err(CodecError::TooLarge { len });
    }

    #[allow(clippy::cast_possible_truncation, reason = "bounded above")]
    let header = (len as u32).to_be_bytes();

    writer.write_all(&header).await?;
    writer.write_all(&packet.data).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one packet from the stream.
///
/// Loops until the full header and then the full payload have been read, so
/// short reads from the transport never surface as truncated packets. Returns
/// `Ok(None)` when the stream is exhausted at a frame boundary; a stream that
/// ends mid-frame is a [`CodecError::Truncated`] error instead.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0_u8; HEADER_SIZE];
    let mut filled = 0;

    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::Truncated {
                expected: HEADER_SIZE,
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    let mut data = vec![0_u8; len];

    if let Err(err) = reader.read_exact(&mut data).await {
        if err.kind() == ErrorKind::UnexpectedEof {
            return Err(CodecError::Truncated { expected: len });
        }
        return Err(err.into());
    }

    Ok(Some(Packet { data }))
}
