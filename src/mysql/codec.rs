//! MySQL packet framing.
//!
//! ```text
//! ┌──────────────┬────────┬───────────────────────┐
//! │ length (3 LE)│ seq id │ payload (length bytes) │
//! └──────────────┴────────┴───────────────────────┘
//! ```
//!
//! A payload of exactly `0xFFFFFF` bytes means "more follows": the decoder
//! keeps concatenating until a shorter packet ends the logical payload.
//! The encoder splits the same way, and adds an empty trailer when the
//! payload is an exact multiple of the maximum.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload a single wire packet carries.
pub const MAX_PACKET_PAYLOAD: usize = 0xFF_FFFF;

const HEADER_LEN: usize = 4;

/// Upper bound on a reassembled logical payload.
const MAX_LOGICAL_PAYLOAD: usize = 1 << 30;

/// One logical MySQL packet, continuation parts already joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlPacket {
    /// Sequence id of the last wire packet.
    pub sequence_id: u8,
    pub payload: Bytes,
}

/// Sequence id shared by the read and write halves of a connection.
///
/// Every inbound packet sets the next outbound id to `seq + 1`; a new
/// command resets it to zero.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    next: Arc<AtomicU8>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start of a new command.
    pub fn reset(&self) {
        self.next.store(0, Ordering::Release);
    }

    /// Record an inbound packet's sequence id.
    pub fn observe(&self, sequence_id: u8) {
        self.next.store(sequence_id.wrapping_add(1), Ordering::Release);
    }

    /// Take the id for the next outbound packet.
    pub fn take_next(&self) -> u8 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    pub fn peek(&self) -> u8 {
        self.next.load(Ordering::Acquire)
    }
}

/// Codec for MySQL client/server packets.
#[derive(Debug, Clone, Default)]
pub struct MySqlPacketCodec {
    sequence: SequenceTracker,
    partial: Option<BytesMut>,
}

impl MySqlPacketCodec {
    pub fn new(sequence: SequenceTracker) -> Self {
        Self {
            sequence,
            partial: None,
        }
    }

    pub fn sequence(&self) -> &SequenceTracker {
        &self.sequence
    }
}

impl Decoder for MySqlPacketCodec {
    type Item = MySqlPacket;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MySqlPacket>, std::io::Error> {
        loop {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            let len = src[0] as usize | (src[1] as usize) << 8 | (src[2] as usize) << 16;
            let sequence_id = src[3];
            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let chunk = src.split_to(len);
            self.sequence.observe(sequence_id);

            if len == MAX_PACKET_PAYLOAD {
                let partial = self.partial.get_or_insert_with(BytesMut::new);
                if partial.len() + len > MAX_LOGICAL_PAYLOAD {
                    self.partial = None;
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "reassembled MySQL packet exceeds 1 GiB",
                    ));
                }
                partial.extend_from_slice(&chunk);
                continue;
            }

            let payload = match self.partial.take() {
                Some(mut partial) => {
                    partial.extend_from_slice(&chunk);
                    partial.freeze()
                }
                None => chunk.freeze(),
            };
            return Ok(Some(MySqlPacket {
                sequence_id,
                payload,
            }));
        }
    }
}

impl Encoder<Bytes> for MySqlPacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        let mut rest = payload.as_ref();
        loop {
            let take = rest.len().min(MAX_PACKET_PAYLOAD);
            dst.reserve(HEADER_LEN + take);
            let len = take as u32;
            dst.put_u8((len & 0xFF) as u8);
            dst.put_u8(((len >> 8) & 0xFF) as u8);
            dst.put_u8(((len >> 16) & 0xFF) as u8);
            dst.put_u8(self.sequence.take_next());
            dst.put_slice(&rest[..take]);
            rest = &rest[take..];
            if take < MAX_PACKET_PAYLOAD {
                return Ok(());
            }
        }
    }
}
