//! 分片传输层
//!
//! 每个 BLE 写入 / 通知为一个分片: 1 字节头 + 最多 19 字节负载。
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────┬──────────────────┐
//! │ bit0 is_start│ bit1-2 kind  │ bit3-7 0 │ payload (≤19B)   │
//! └──────────────┴──────────────┴──────────┴──────────────────┘
//! ```
//!
//! kind: 0 = 未结束, 1 = 明文结束, 2 = 密文结束。
//! 丢弃整条消息时密文分片仍需推进解密 IV，否则与对端失步。

use crate::crypto::{CryptSession, CryptoError};

pub const FRAGMENT_SIZE: usize = 19;
pub const MAX_RECV: usize = 128;

const HEADER_START: u8 = 0x01;
const KIND_SHIFT: u8 = 1;
const KIND_MASK: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    NotFinished,
    Plain,
    Encrypted,
    /// 保留值 3
    Reserved,
}

impl PacketKind {
    fn bits(self) -> u8 {
        match self {
            PacketKind::NotFinished => 0,
            PacketKind::Plain => 1,
            PacketKind::Encrypted => 2,
            PacketKind::Reserved => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & KIND_MASK {
            0 => PacketKind::NotFinished,
            1 => PacketKind::Plain,
            2 => PacketKind::Encrypted,
            _ => PacketKind::Reserved,
        }
    }
}

pub fn fragment_header(is_start: bool, kind: PacketKind) -> u8 {
    u8::from(is_start) | (kind.bits() << KIND_SHIFT)
}

fn parse_header(h: u8) -> (bool, PacketKind) {
    (h & HEADER_START != 0, PacketKind::from_bits(h >> KIND_SHIFT))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    /// 当前消息被丢弃，等待下一个起始分片
    Skipping,
    /// 完整消息可通过 [`Transport::data`] 读取
    Received,
    RequireMore,
    /// 分片本身无效 (长度 ≤ 1)
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to write fragment {index}")]
    WriteFailed { index: usize },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// 接收方向的重组缓冲
#[derive(Debug)]
pub struct Transport {
    buffer: Vec<u8>,
    skipping: bool,
    decrypt_failed: bool,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_RECV),
            skipping: false,
            decrypt_failed: false,
        }
    }
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.skipping = false;
        self.decrypt_failed = false;
    }

    /// 最近一次 `Received` 的消息，下一次 decode 前有效
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// 最近一次 decode 是否因认证失败而丢弃
    pub fn last_decrypt_failed(&self) -> bool {
        self.decrypt_failed
    }

    pub fn decode(&mut self, fragment: &[u8], crypt: &mut CryptSession) -> DecodeResult {
        self.decrypt_failed = false;
        let Some((&header, payload)) = fragment.split_first() else {
            return DecodeResult::Dropped;
        };
        if payload.is_empty() {
            return DecodeResult::Dropped;
        }
        let (is_start, kind) = parse_header(header);
        if is_start {
            self.buffer.clear();
            self.skipping = false;
        }
        if self.skipping {
            if kind == PacketKind::Encrypted {
                crypt.advance_dec_iv();
            }
            return DecodeResult::Skipping;
        }
        if self.buffer.len() + payload.len() > MAX_RECV {
            log::warn!("Received data too long, skipping");
            self.skipping = true;
            if kind == PacketKind::Encrypted {
                crypt.advance_dec_iv();
            }
            return DecodeResult::Skipping;
        }
        self.buffer.extend_from_slice(payload);
        if kind == PacketKind::NotFinished {
            return DecodeResult::RequireMore;
        }

        // 消息已结束，后续非起始分片一律跳过
        self.skipping = true;
        match kind {
            PacketKind::Plain => DecodeResult::Received,
            PacketKind::Encrypted => {
                if !crypt.is_key_shared() {
                    log::warn!("Encrypted message received before key sharing");
                    return DecodeResult::Skipping;
                }
                match crypt.decrypt(&self.buffer) {
                    Ok(plain) => {
                        self.buffer = plain;
                        DecodeResult::Received
                    }
                    Err(e) => {
                        log::warn!("Failed to decrypt message: {e}");
                        self.decrypt_failed = matches!(e, CryptoError::Decrypt);
                        DecodeResult::Skipping
                    }
                }
            }
            other => {
                log::warn!("{other:?}: Unexpected packet kind");
                DecodeResult::Skipping
            }
        }
    }

    /// 将完整报文切片发送，最后一个分片标记明文或密文
    pub fn send_data(
        packet: &[u8],
        encrypted: bool,
        write: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<(), TransportError> {
        let mut fragment = [0u8; 1 + FRAGMENT_SIZE];
        let count = packet.len().div_ceil(FRAGMENT_SIZE);
        for (index, chunk) in packet.chunks(FRAGMENT_SIZE).enumerate() {
            let kind = if index + 1 < count {
                PacketKind::NotFinished
            } else if encrypted {
                PacketKind::Encrypted
            } else {
                PacketKind::Plain
            };
            fragment[0] = fragment_header(index == 0, kind);
            fragment[1..=chunk.len()].copy_from_slice(chunk);
            if !write(&fragment[..=chunk.len()]) {
                log::warn!("Failed to send data to the peer");
                return Err(TransportError::WriteFailed { index });
            }
        }
        Ok(())
    }

    /// 拼接消息头与消息体，按需加密后发送
    pub fn send_message(
        header: &[u8],
        body: &[u8],
        encrypted: bool,
        crypt: &mut CryptSession,
        write: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<(), TransportError> {
        let mut plain = Vec::with_capacity(header.len() + body.len());
        plain.extend_from_slice(header);
        plain.extend_from_slice(body);
        let packet = if encrypted {
            crypt.encrypt(&plain)?
        } else {
            plain
        };
        Self::send_data(&packet, encrypted, write)
    }
}
