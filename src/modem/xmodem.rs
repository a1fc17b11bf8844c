//! XMODEM block transmission over the RUDICS data call.
//!
//! The sender keeps its position between calls to [`XmodemSender::run`]: a
//! block that draws a NAK or times out is reported as a [`XferError::Link`]
//! so the session can reseat the data call, then the same block is resent
//! when `run` is called again. The overall error budget spans reseats;
//! exhausting it aborts the file.

use std::io::Read;
use std::time::Duration;

use tracing::{debug, warn};

use crate::modem::transport::SerialTransport;
use crate::modem::ModemError;

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// 'C' — receiver requests CRC-16 framing.
pub const CRC_REQ: u8 = 0x43;

const PAD_BYTE: u8 = 0x1a;
const DEFAULT_MAX_ERRORS: u32 = 16;

/// Byte-level duplex link the sender runs over. Implemented by the serial
/// transport; tests substitute a scripted in-memory port.
pub trait XferPort {
    fn send(&mut self, data: &[u8]) -> Result<(), ModemError>;
    fn recv_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ModemError>;
    fn byte_timeout(&self) -> Duration;
}

impl XferPort for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), ModemError> {
        self.write_raw(data)
    }

    fn recv_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ModemError> {
        self.read_byte(timeout)
    }

    fn byte_timeout(&self) -> Duration {
        self.read_timeout()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum XferError {
    /// A block failed (NAK or timeout). The transfer can continue on a
    /// reseated link; the failed block will be resent.
    #[error("link error while sending block {block}")]
    Link { block: u32 },
    /// The receiver cancelled the transfer with two CAN bytes.
    #[error("transfer cancelled by receiver")]
    Cancelled,
    /// The error budget is spent; the file is abandoned.
    #[error("exhausted {0} transfer errors")]
    ExhaustedRetries(u32),
    #[error("transport failure: {0}")]
    Transport(#[from] ModemError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    Standard,
    Crc16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLength {
    Standard = 128,
    OneK = 1024,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Data,
    Eot,
    Done,
}

/// Resumable XMODEM sender state for a single file.
pub struct XmodemSender {
    max_errors: u32,
    block_length: BlockLength,
    checksum_mode: Checksum,
    phase: Phase,
    block_num: u32,
    pending: Option<Vec<u8>>,
    errors: u32,
    cancels: u32,
}

impl XmodemSender {
    #[must_use]
    pub fn new(block_length: BlockLength) -> Self {
        Self {
            max_errors: DEFAULT_MAX_ERRORS,
            block_length,
            checksum_mode: Checksum::Standard,
            phase: Phase::Handshake,
            block_num: 0,
            pending: None,
            errors: 0,
            cancels: 0,
        }
    }

    /// Cumulative error count across the whole transfer.
    #[must_use]
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Drive the transfer forward until it completes or an error needs the
    /// caller's attention. After [`XferError::Link`] the caller may reseat
    /// the link and call `run` again to continue from the failed block.
    pub fn run<D: XferPort, R: Read>(
        &mut self,
        dev: &mut D,
        stream: &mut R,
    ) -> Result<(), XferError> {
        loop {
            match self.phase {
                Phase::Handshake => self.handshake(dev)?,
                Phase::Data => self.send_blocks(dev, stream)?,
                Phase::Eot => self.finish(dev)?,
                Phase::Done => return Ok(()),
            }
        }
    }

    fn bump_errors(&mut self) -> Result<(), XferError> {
        self.errors += 1;
        if self.errors >= self.max_errors {
            return Err(XferError::ExhaustedRetries(self.errors));
        }
        Ok(())
    }

    fn note_cancel(&mut self) -> Result<(), XferError> {
        self.cancels += 1;
        if self.cancels >= 2 {
            warn!("Transmission cancelled: received two CAN bytes");
            return Err(XferError::Cancelled);
        }
        Ok(())
    }

    /// Wait for the receiver's mode byte: NAK selects the additive
    /// checksum, 'C' selects CRC-16.
    fn handshake<D: XferPort>(&mut self, dev: &mut D) -> Result<(), XferError> {
        debug!("Starting XMODEM transfer, waiting for receiver");
        match dev.recv_byte(dev.byte_timeout())? {
            Some(NAK) => {
                debug!("Standard checksum requested");
                self.checksum_mode = Checksum::Standard;
                self.phase = Phase::Data;
                Ok(())
            }
            Some(CRC_REQ) => {
                debug!("16-bit CRC requested");
                self.checksum_mode = Checksum::Crc16;
                self.phase = Phase::Data;
                Ok(())
            }
            Some(CAN) => {
                self.note_cancel()?;
                self.bump_errors()?;
                Err(XferError::Link { block: 0 })
            }
            Some(other) => {
                warn!("Unexpected byte {other} at start of transfer");
                self.bump_errors()?;
                Err(XferError::Link { block: 0 })
            }
            None => {
                warn!("Timed out waiting for start of transfer");
                self.bump_errors()?;
                Err(XferError::Link { block: 0 })
            }
        }
    }

    fn send_blocks<D: XferPort, R: Read>(
        &mut self,
        dev: &mut D,
        stream: &mut R,
    ) -> Result<(), XferError> {
        loop {
            let chunk = match self.pending.take() {
                Some(chunk) => chunk,
                None => {
                    let mut buf = vec![0u8; self.block_length as usize];
                    let n = stream
                        .read(&mut buf)
                        .map_err(|e| XferError::Transport(ModemError::Transfer(e.to_string())))?;
                    if n == 0 {
                        debug!("Reached EOF after {} blocks", self.block_num);
                        self.phase = Phase::Eot;
                        return Ok(());
                    }
                    buf.truncate(n);
                    self.block_num += 1;
                    buf
                }
            };

            let frame = build_block(self.block_num, &chunk, self.block_length, self.checksum_mode);
            debug!("Sending block {}", self.block_num);
            dev.send(&frame)?;

            match dev.recv_byte(dev.byte_timeout())? {
                Some(ACK) => {
                    self.cancels = 0;
                    continue;
                }
                Some(CAN) => {
                    self.pending = Some(chunk);
                    self.note_cancel()?;
                    self.bump_errors()?;
                    return Err(XferError::Link {
                        block: self.block_num,
                    });
                }
                Some(other) => {
                    warn!("Expected ACK for block {}, got {other}", self.block_num);
                    self.pending = Some(chunk);
                    self.bump_errors()?;
                    return Err(XferError::Link {
                        block: self.block_num,
                    });
                }
                None => {
                    warn!("Timeout waiting for ACK for block {}", self.block_num);
                    self.pending = Some(chunk);
                    self.bump_errors()?;
                    return Err(XferError::Link {
                        block: self.block_num,
                    });
                }
            }
        }
    }

    fn finish<D: XferPort>(&mut self, dev: &mut D) -> Result<(), XferError> {
        dev.send(&[EOT])?;
        match dev.recv_byte(dev.byte_timeout())? {
            Some(ACK) => {
                debug!("XMODEM transmission successful");
                self.phase = Phase::Done;
                Ok(())
            }
            other => {
                warn!("Expected ACK for EOT, got {other:?}");
                self.bump_errors()?;
                Err(XferError::Link {
                    block: self.block_num,
                })
            }
        }
    }
}

/// Assemble one framed block: header byte, block number and complement,
/// padded data, checksum.
fn build_block(block_num: u32, data: &[u8], length: BlockLength, mode: Checksum) -> Vec<u8> {
    let body_len = length as usize;
    let mut frame = Vec::with_capacity(body_len + 5);
    frame.push(match length {
        BlockLength::Standard => SOH,
        BlockLength::OneK => STX,
    });
    #[allow(clippy::cast_possible_truncation)]
    let num = (block_num & 0xFF) as u8;
    frame.push(num);
    frame.push(0xFF - num);
    frame.extend_from_slice(data);
    frame.resize(3 + body_len, PAD_BYTE);

    match mode {
        Checksum::Standard => frame.push(calc_checksum(&frame[3..])),
        Checksum::Crc16 => {
            let crc = calc_crc(&frame[3..]);
            frame.push((crc >> 8) as u8);
            frame.push((crc & 0xFF) as u8);
        }
    }
    frame
}

fn calc_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |x, &y| x.wrapping_add(y))
}

fn calc_crc(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Scripted port: records sent frames, replies from a queue.
    struct ScriptedPort {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<Option<u8>>,
    }

    impl ScriptedPort {
        fn new(replies: &[Option<u8>]) -> Self {
            Self {
                sent: Vec::new(),
                replies: replies.iter().copied().collect(),
            }
        }
    }

    impl XferPort for ScriptedPort {
        fn send(&mut self, data: &[u8]) -> Result<(), ModemError> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn recv_byte(&mut self, _timeout: Duration) -> Result<Option<u8>, ModemError> {
            Ok(self.replies.pop_front().unwrap_or(None))
        }

        fn byte_timeout(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    #[test]
    fn test_build_block_framing() {
        let frame = build_block(1, b"hello", BlockLength::Standard, Checksum::Standard);
        assert_eq!(frame.len(), 3 + 128 + 1);
        assert_eq!(frame[0], SOH);
        assert_eq!(frame[1], 1);
        assert_eq!(frame[2], 0xFE);
        assert_eq!(&frame[3..8], b"hello");
        assert_eq!(frame[8], PAD_BYTE);
        assert_eq!(frame[131], calc_checksum(&frame[3..131]));
    }

    #[test]
    fn test_build_block_one_k_crc() {
        let frame = build_block(2, &[0xAB; 1024], BlockLength::OneK, Checksum::Crc16);
        assert_eq!(frame.len(), 3 + 1024 + 2);
        assert_eq!(frame[0], STX);
        assert_eq!(frame[1], 2);
        assert_eq!(frame[2], 0xFD);
        let crc = calc_crc(&frame[3..1027]);
        assert_eq!(frame[1027], (crc >> 8) as u8);
        assert_eq!(frame[1028], (crc & 0xFF) as u8);
    }

    #[test]
    fn test_block_number_wraps() {
        let frame = build_block(256, b"x", BlockLength::Standard, Checksum::Standard);
        assert_eq!(frame[1], 0);
        assert_eq!(frame[2], 0xFF);
    }

    #[test]
    fn test_crc_check_value() {
        // Standard CRC-16/XMODEM check value.
        assert_eq!(calc_crc(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_happy_transfer() {
        let mut port = ScriptedPort::new(&[
            Some(NAK),  // handshake: standard checksum
            Some(ACK),  // block 1
            Some(ACK),  // block 2
            Some(ACK),  // EOT
        ]);
        let mut sender = XmodemSender::new(BlockLength::Standard);
        let mut data = Cursor::new(vec![0x55u8; 200]);

        sender.run(&mut port, &mut data).unwrap();

        assert_eq!(port.sent.len(), 3);
        assert_eq!(port.sent[0][1], 1);
        assert_eq!(port.sent[1][1], 2);
        assert_eq!(port.sent[2], vec![EOT]);
        assert_eq!(sender.errors(), 0);
    }

    #[test]
    fn test_nak_resends_same_block_after_resume() {
        let mut port = ScriptedPort::new(&[Some(NAK), Some(NAK)]);
        let mut sender = XmodemSender::new(BlockLength::Standard);
        let mut data = Cursor::new(vec![0x11u8; 64]);

        match sender.run(&mut port, &mut data) {
            Err(XferError::Link { block: 1 }) => {}
            other => panic!("expected link error, got {other:?}"),
        }
        assert_eq!(sender.errors(), 1);

        // Resume on a fresh link: the same block goes out again.
        let mut port = ScriptedPort::new(&[Some(ACK), Some(ACK)]);
        sender.run(&mut port, &mut data).unwrap();
        assert_eq!(port.sent[0][1], 1);
        assert_eq!(port.sent[1], vec![EOT]);
    }

    #[test]
    fn test_double_can_cancels() {
        let mut port = ScriptedPort::new(&[Some(NAK), Some(CAN)]);
        let mut sender = XmodemSender::new(BlockLength::Standard);
        let mut data = Cursor::new(vec![0u8; 10]);
        assert!(matches!(
            sender.run(&mut port, &mut data),
            Err(XferError::Link { .. })
        ));

        let mut port = ScriptedPort::new(&[Some(CAN)]);
        assert!(matches!(
            sender.run(&mut port, &mut data),
            Err(XferError::Cancelled)
        ));
    }

    #[test]
    fn test_error_budget_exhausts() {
        let mut sender = XmodemSender::new(BlockLength::Standard);
        let mut data = Cursor::new(vec![0u8; 10]);

        let mut last = None;
        for _ in 0..DEFAULT_MAX_ERRORS {
            let mut port = ScriptedPort::new(&[None]);
            last = Some(sender.run(&mut port, &mut data));
        }
        assert!(matches!(
            last.unwrap(),
            Err(XferError::ExhaustedRetries(n)) if n == DEFAULT_MAX_ERRORS
        ));
    }

    #[test]
    fn test_crc_handshake_selects_crc_frames() {
        let mut port = ScriptedPort::new(&[Some(CRC_REQ), Some(ACK), Some(ACK)]);
        let mut sender = XmodemSender::new(BlockLength::Standard);
        let mut data = Cursor::new(vec![0x42u8; 10]);
        sender.run(&mut port, &mut data).unwrap();
        // CRC mode: 2 checksum bytes.
        assert_eq!(port.sent[0].len(), 3 + 128 + 2);
    }
}
