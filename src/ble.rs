//! BLE transport constants and chunk framing.
//!
//! The BLE radio and GATT stack are external; this module owns only the
//! chunk header codec and a `Transport` trait so the RPC dispatcher and
//! history streaming can be driven by a test double.

pub const SERVICE_UUID: &str = "5f524546-4c4f-575f-5250-435f5356435f";
pub const RPC_CHARACTERISTIC_UUID: &str = "5f524546-4c4f-575f-5250-435f494f5f5f";
pub const AUTH_CHARACTERISTIC_UUID: &str = "5f524546-4c4f-575f-5250-435f41555448";

/// Maximum chunk payload, bytes, excluding the 4-byte header.
pub const CHUNK_PAYLOAD_SIZE: usize = crate::config::BLE_CHUNK_PAYLOAD_SIZE;
const HEADER_SIZE: usize = 4;

pub const FLAG_FINAL: u8 = 0x01;
pub const FLAG_MISSED: u8 = 0x02;
pub const FLAG_OVERFLOW: u8 = 0x04;

/// One outbound chunk header: `{ messageId: u8, seq: u16 LE, flags: u8 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub message_id: u8,
    pub seq: u16,
    pub flags: u8,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let seq = self.seq.to_le_bytes();
        [self.message_id, seq[0], seq[1], self.flags]
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        ChunkHeader {
            message_id: bytes[0],
            seq: u16::from_le_bytes([bytes[1], bytes[2]]),
            flags: bytes[3],
        }
    }

    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }
}

/// Splits `payload` into MTU-sized chunks, each prefixed with its header.
/// The final chunk carries `FLAG_FINAL`; `missed`/`overflow` let callers
/// flag a gap or a history buffer overrun on every chunk of this message.
pub fn chunk_message(message_id: u8, payload: &[u8], missed: bool, overflow: bool) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        let mut flags = FLAG_FINAL;
        if missed {
            flags |= FLAG_MISSED;
        }
        if overflow {
            flags |= FLAG_OVERFLOW;
        }
        let header = ChunkHeader { message_id, seq: 0, flags };
        return vec![header.encode().to_vec()];
    }

    let chunks: Vec<&[u8]> = payload.chunks(CHUNK_PAYLOAD_SIZE).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut flags = 0u8;
            if i == last {
                flags |= FLAG_FINAL;
            }
            if missed {
                flags |= FLAG_MISSED;
            }
            if overflow {
                flags |= FLAG_OVERFLOW;
            }
            let header = ChunkHeader { message_id, seq: i as u16, flags };
            let mut out = header.encode().to_vec();
            out.extend_from_slice(chunk);
            out
        })
        .collect()
}

/// Sends one MTU-sized chunk over the (out-of-scope) BLE radio.
pub trait Transport: Send + Sync {
    fn send_chunk(&self, characteristic: &str, chunk: &[u8]);
}
