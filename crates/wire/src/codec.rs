use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{CodecError, Packet, HEADER_SIZE, MAX_PACKET_SIZE};

/// Framing codec for [`Packet`]s, for use with `tokio_util::codec::Framed`.
///
/// Delegates the length-prefix bookkeeping to [`LengthDelimitedCodec`], which
/// buffers until an entire frame is available; a partial frame never decodes.
#[derive(Debug)]
pub struct PacketCodec {
    length_codec: LengthDelimitedCodec,
}

impl PacketCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            length_codec: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(HEADER_SIZE)
                .max_frame_length(MAX_PACKET_SIZE)
                .new_codec(),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.length_codec.decode(src)? else {
            return Ok(None);
        };

        Ok(Some(Packet {
            data: frame.freeze().to_vec(),
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.length_codec
            .encode(Bytes::from(item.data), dst)
            .map_err(CodecError::Io)
    }
}
