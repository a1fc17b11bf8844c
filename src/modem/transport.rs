//! Blocking serial transport for the modem AT link.
//!
//! Owns the serial fd directly via termios — raw mode, configured baud, 8N1,
//! no flow control, `VMIN=0, VTIME=1` so reads return after 100 ms of
//! silence. The transport moves bytes and recognises terminal response
//! tokens; all interpretation of content happens in the session layer.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tracing::{debug, info};

use crate::config::ModemConfig;
use crate::modem::ModemError;

/// Read buffer size (AT responses are small).
const READ_BUF_SIZE: usize = 1024;

/// Settle time after a terminal token before declaring the response done.
const RESPONSE_SETTLE: Duration = Duration::from_millis(100);

/// Final tokens that end an AT response. `CONNECT` is handled separately
/// since it may carry a rate suffix.
const RESPONSE_TOKENS: &[&str] = &[
    "OK",
    "ERROR",
    "BUSY",
    "NO DIALTONE",
    "NO CARRIER",
    "RING",
    "NO ANSWER",
    "READY",
    "GOFORIT",
    "NAMERECV",
];

/// Helper to get a `BorrowedFd` from a `RawFd` for nix termios calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Serial line to the modem. Opened lazily when the worker takes the lock,
/// closed at the end of each worker iteration.
pub struct SerialTransport {
    port: String,
    baud: u32,
    read_timeout: Duration,
    wait_period: Duration,
    line_end: &'static str,
    fd: Option<RawFd>,
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl SerialTransport {
    #[must_use]
    pub fn new(cfg: &ModemConfig) -> Self {
        Self {
            port: cfg.serial_port.clone(),
            baud: cfg.serial_baud,
            read_timeout: Duration::from_secs_f64(cfg.serial_timeout),
            wait_period: Duration::from_secs_f64(cfg.msg_wait_period),
            line_end: cfg.line_end(),
            fd: None,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Per-operation serial timeout (used for byte-level transfer reads).
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Open and configure the serial device. No-op when already open.
    pub fn open(&mut self) -> Result<(), ModemError> {
        if self.fd.is_some() {
            return Ok(());
        }

        info!("Opening serial connection to modem on {}", self.port);
        let fd = fcntl::open(
            self.port.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| ModemError::Transport(format!("open {}: {e}", self.port)))?;

        // Clear O_NONBLOCK now that we have the fd — reads should block with
        // the VTIME timeout instead.
        let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL)
            .map_err(|e| ModemError::Transport(format!("F_GETFL: {e}")))?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags))
            .map_err(|e| ModemError::Transport(format!("F_SETFL: {e}")))?;

        configure_termios(fd, self.baud)?;

        // SAFETY: fd is valid — we just opened it
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH)
                .map_err(|e| ModemError::Transport(format!("tcflush: {e}")))?;
        }

        self.fd = Some(fd);
        Ok(())
    }

    /// Close the serial line. Safe to call when already closed.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            debug!("Closing modem serial connection");
            // SAFETY: fd was valid while stored; it is removed before closing
            unsafe {
                let _ = termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH);
            }
            let _ = unistd::close(fd);
        }
    }

    /// Write an AT command with the configured line terminator appended.
    pub fn write_line(&mut self, command: &str) -> Result<(), ModemError> {
        debug!("Message sent: {:?}", command.trim());
        let mut bytes = command.trim().as_bytes().to_vec();
        bytes.extend_from_slice(self.line_end.as_bytes());
        self.write_all(&bytes)
    }

    /// Write raw bytes with no terminator.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), ModemError> {
        debug!("Binary message of {} bytes sent", data.len());
        self.write_all(data)
    }

    fn write_all(&mut self, mut data: &[u8]) -> Result<(), ModemError> {
        let fd = self.open_fd()?;
        while !data.is_empty() {
            // SAFETY: fd is valid — open_fd returned it from self.fd
            let n = unsafe { unistd::write(borrow_fd(fd), data) }
                .map_err(|e| ModemError::Transport(format!("write: {e}")))?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Accumulate bytes until a terminal token ends the buffer, then wait
    /// ~100 ms for stragglers and return. On timeout the partial buffer is
    /// returned when non-empty; with nothing at all the read fails with
    /// [`ModemError::ResponseTimeout`]. The deadline restarts whenever data
    /// arrives.
    pub fn read_until_response(&mut self, timeout: Duration) -> Result<Vec<u8>, ModemError> {
        let mut reply: Vec<u8> = Vec::with_capacity(256);
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut deadline = Instant::now() + timeout;

        loop {
            let n = self.read_chunk(&mut buf)?;
            if n > 0 {
                reply.extend_from_slice(&buf[..n]);
                deadline = Instant::now() + timeout;

                if ends_with_terminal(&reply) {
                    std::thread::sleep(RESPONSE_SETTLE);
                    let trailing = self.read_chunk(&mut buf)?;
                    if trailing == 0 {
                        return Ok(reply);
                    }
                    reply.extend_from_slice(&buf[..trailing]);
                }
                continue;
            }

            if Instant::now() >= deadline {
                if reply.is_empty() {
                    return Err(ModemError::ResponseTimeout(timeout.as_secs_f64()));
                }
                debug!(
                    "Response stalled after {} bytes without terminal token",
                    reply.len()
                );
                return Ok(reply);
            }
            if reply.is_empty() {
                std::thread::sleep(self.wait_period.min(timeout));
            }
        }
    }

    /// Read exactly `len` bytes (binary SBD reads), failing on timeout.
    pub fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, ModemError> {
        let mut out = Vec::with_capacity(len);
        let mut buf = [0u8; READ_BUF_SIZE];
        let deadline = Instant::now() + timeout;

        while out.len() < len {
            let want = (len - out.len()).min(buf.len());
            let n = self.read_chunk(&mut buf[..want])?;
            if n > 0 {
                out.extend_from_slice(&buf[..n]);
            } else if Instant::now() >= deadline {
                return Err(ModemError::ResponseTimeout(timeout.as_secs_f64()));
            }
        }
        Ok(out)
    }

    /// Read a single byte, returning `None` on timeout (transfer-level
    /// retries count those against their own error budget).
    pub fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, ModemError> {
        let mut buf = [0u8; 1];
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_chunk(&mut buf)? == 1 {
                return Ok(Some(buf[0]));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ModemError> {
        let fd = self.open_fd()?;
        match unistd::read(fd, buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(e) => Err(ModemError::Transport(format!("read: {e}"))),
        }
    }

    fn open_fd(&self) -> Result<RawFd, ModemError> {
        self.fd
            .ok_or_else(|| ModemError::Transport("serial port is not open".to_string()))
    }
}

/// Configure termios: raw mode, configured baud, 8N1, no flow control.
/// `VMIN=0, VTIME=1` → reads return after 100 ms of silence.
fn configure_termios(fd: RawFd, baud: u32) -> Result<(), ModemError> {
    // SAFETY: fd is valid — caller just opened it
    let borrowed = unsafe { borrow_fd(fd) };

    let mut tio = termios::tcgetattr(borrowed)
        .map_err(|e| ModemError::Transport(format!("tcgetattr: {e}")))?;

    termios::cfmakeraw(&mut tio);

    let rate = baud_rate(baud)?;
    termios::cfsetispeed(&mut tio, rate)
        .map_err(|e| ModemError::Transport(format!("cfsetispeed: {e}")))?;
    termios::cfsetospeed(&mut tio, rate)
        .map_err(|e| ModemError::Transport(format!("cfsetospeed: {e}")))?;

    // 8N1, CLOCAL (ignore modem control lines), CREAD (enable receiver)
    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
        .map_err(|e| ModemError::Transport(format!("tcsetattr: {e}")))
}

fn baud_rate(baud: u32) -> Result<BaudRate, ModemError> {
    let rate = match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        other => {
            return Err(ModemError::Transport(format!(
                "unsupported baud rate {other}"
            )))
        }
    };
    Ok(rate)
}

/// Whether the buffer ends with one of the terminal response tokens
/// (ignoring trailing line endings).
fn ends_with_terminal(buf: &[u8]) -> bool {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\r' | b'\n' | b' ') {
        end -= 1;
    }
    let start = buf[..end]
        .iter()
        .rposition(|&b| b == b'\r' || b == b'\n')
        .map_or(0, |pos| pos + 1);
    let line: String = buf[start..end].iter().map(|&b| char::from(b)).collect();
    let line = line.trim();

    if RESPONSE_TOKENS.contains(&line) {
        return true;
    }
    if let Some(rest) = line.strip_prefix("CONNECT") {
        let rest = rest.trim();
        return rest.is_empty() || rest.chars().all(|c| c.is_ascii_digit());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_ok() {
        assert!(ends_with_terminal(b"+CSQ:4\r\nOK\r\n"));
    }

    #[test]
    fn test_terminal_bare_token() {
        assert!(ends_with_terminal(b"READY\r\n"));
        assert!(ends_with_terminal(b"NAMERECV"));
        assert!(ends_with_terminal(b"NO CARRIER\r\n"));
    }

    #[test]
    fn test_terminal_connect_with_rate() {
        assert!(ends_with_terminal(b"CONNECT 9600\r\n"));
        assert!(ends_with_terminal(b"CONNECT\r\n"));
        assert!(!ends_with_terminal(b"CONNECT LATER\r\n"));
    }

    #[test]
    fn test_terminal_partial_response() {
        assert!(!ends_with_terminal(b"+SBDIX: 0, 12, 0, 0, 0, 0\r\n"));
        assert!(!ends_with_terminal(b""));
        assert!(!ends_with_terminal(b"A\r\n"));
    }

    #[test]
    fn test_terminal_token_must_end_buffer() {
        assert!(!ends_with_terminal(b"OK\r\n+CREG: 0,1\r\n"));
    }

    #[test]
    fn test_baud_rate_mapping() {
        assert!(baud_rate(115_200).is_ok());
        assert!(baud_rate(19_200).is_ok());
        assert!(baud_rate(12_345).is_err());
    }
}
