//! AT command state machine for a single modem work cycle.
//!
//! A session is driven while the modem lock is held: initialisation and
//! network registration, signal check, SBD exchanges (MO write, SBDIX,
//! binary MT collection), and RUDICS data calls carrying the filename
//! preamble plus an XMODEM transfer. The transport is opened lazily and
//! closed by the worker at the end of each cycle.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info, warn};

use crate::modem::transport::SerialTransport;
use crate::modem::xmodem::{BlockLength, XferError, XmodemSender};
use crate::modem::{ModemError, Outbound, SbdMessage};
use crate::config::ModemConfig;

/// Attempts at the `@` attention preamble before giving up on the remote.
const PREAMBLE_ATTEMPTS: u32 = 8;

/// Minimum usable signal level (0-5 scale).
pub const MIN_SIGNAL: u8 = 3;

/// Where the session is in its work cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    Registered,
    InSbd,
    InDataCall,
    Hangup,
}

/// Decoded `+SBDIX:` status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbdixStatus {
    pub mo_status: u8,
    pub mo_msn: u32,
    pub mt_status: u8,
    pub mt_msn: u32,
    pub mt_len: usize,
    pub mt_queued: u32,
}

pub struct ModemSession {
    cfg: Arc<ModemConfig>,
    transport: SerialTransport,
    mt_destination: PathBuf,
    state: SessionState,
    mt_pending: bool,
    last_signal: u8,
    dataxfer_errors: u32,
}

impl ModemSession {
    #[must_use]
    pub fn new(cfg: Arc<ModemConfig>, mt_destination: PathBuf) -> Self {
        let transport = SerialTransport::new(&cfg);
        Self {
            cfg,
            transport,
            mt_destination,
            state: SessionState::Closed,
            mt_pending: false,
            last_signal: 0,
            dataxfer_errors: 0,
        }
    }

    /// Gateway still holds MT messages to collect.
    #[must_use]
    pub fn mt_pending(&self) -> bool {
        self.mt_pending
    }

    #[must_use]
    pub fn last_signal(&self) -> u8 {
        self.last_signal
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Close the serial line. Called by the worker in every iteration's
    /// cleanup path.
    pub fn close(&mut self) {
        self.transport.close();
        self.state = SessionState::Closed;
    }

    /// Open the line, reset the modem conversation, and register on the
    /// network (skipped on the cut-down RockBLOCK variant).
    pub fn initialise(&mut self) -> Result<(), ModemError> {
        self.transport.open()?;
        self.state = SessionState::Open;

        // Discard the echoes of the first exchanges — ATE0 takes effect mid-way.
        self.command("AT")?;
        self.command("ATE0")?;
        self.command("AT+SBDC")?;

        if !self.cfg.rockblock {
            let mut registered = false;
            for attempt in 0..self.cfg.max_reg_checks {
                info!(
                    "Checking registration on Iridium: attempt {} of {}",
                    attempt + 1,
                    self.cfg.max_reg_checks
                );
                let response = self.command("AT+CREG?")?;
                if last_line(&response) != "OK" {
                    warn!("Problem with the registration response, won't parse: {response:?}");
                } else if let Some((_, stat)) = parse_creg(&response) {
                    if stat == 1 || stat == 5 {
                        info!("Registered with status {stat}");
                        registered = true;
                        break;
                    }
                    info!("Not currently registered on network: status {stat}");
                }
                std::thread::sleep(Duration::from_secs_f64(self.cfg.reg_check_interval));
            }
            if !registered {
                return Err(ModemError::Protocol(
                    "failed to register on network".to_string(),
                ));
            }
        }

        self.state = SessionState::Registered;
        Ok(())
    }

    /// Check signal strength against `min_signal`. Updates `last_signal`.
    pub fn signal_check(&mut self, min_signal: u8) -> Result<bool, ModemError> {
        let response = self.command("AT+CSQ")?;
        let level = parse_csq(&response).ok_or_else(|| {
            ModemError::Protocol(format!("could not interpret signal from {response:?}"))
        })?;
        debug!("Got signal level {level}");
        self.last_signal = level;
        Ok(level >= min_signal)
    }

    /// Process one outbound item.
    pub fn process(&mut self, item: &Outbound) -> Result<(), ModemError> {
        match item {
            Outbound::Sbd(msg) => self.process_sbd(Some(msg)),
            Outbound::File(path) => self.process_file(path).map(|_| ()),
        }
    }

    /// One SBD exchange: optionally write an MO message, then run SBDIX
    /// until the MO status is conclusive, collecting an MT message when one
    /// arrives. Call with `None` to drain queued MT messages without
    /// transmitting.
    pub fn process_sbd(&mut self, mo: Option<&SbdMessage>) -> Result<(), ModemError> {
        self.state = SessionState::InSbd;
        let result = self.sbd_exchange(mo);
        self.state = SessionState::Registered;
        result
    }

    fn sbd_exchange(&mut self, mo: Option<&SbdMessage>) -> Result<(), ModemError> {
        if let Some(msg) = mo {
            let response = self.command(&format!("AT+SBDWB={}", msg.payload.len()))?;
            if last_line(&response) != "READY" {
                return Err(ModemError::Protocol(format!(
                    "error preparing for binary message: {response:?}"
                )));
            }

            let mut frame = msg.payload.clone();
            frame.extend_from_slice(&sbd_checksum(&msg.payload));
            self.transport.write_raw(&frame)?;
            let response = self.read_response(None)?;
            if !sbd_write_accepted(&response) {
                return Err(ModemError::Protocol(format!(
                    "error writing output binary for SBD: {response:?}"
                )));
            }
        }

        self.mt_pending = false;
        let xfer_timeout = Duration::from_secs_f64(self.cfg.sbd_xfer_timeout);
        let mut status = None;

        for attempt in 0..self.cfg.sbd_attempts {
            if attempt > 0 {
                std::thread::sleep(Duration::from_secs(self.cfg.sbd_gap));
            }
            let response = self.command_with_timeout("AT+SBDIX", xfer_timeout)?;
            if last_line(&response) != "OK" {
                return Err(ModemError::Protocol(format!(
                    "error submitting message: {response:?}"
                )));
            }
            let parsed = parse_sbdix(&response).ok_or_else(|| {
                ModemError::Protocol(format!("unparseable SBDIX response: {response:?}"))
            })?;
            status = Some(parsed);
            if parsed.mo_status <= 4 {
                break;
            }
            warn!(
                "Transient MO failure (status {}), attempt {} of {}",
                parsed.mo_status,
                attempt + 1,
                self.cfg.sbd_attempts
            );
        }

        let status = status.ok_or_else(|| ModemError::Protocol("no SBDIX attempts made".into()))?;

        if status.mt_queued > 0 {
            debug!("Messages still waiting at the GSS, will pick them up at end of message run");
            self.mt_pending = true;
        }

        if status.mt_status == 1 {
            self.collect_mt(status.mt_msn, status.mt_len)?;
        }

        self.clear_buffers();

        if status.mo_status > 4 {
            return Err(ModemError::MoPersistentFail(status.mo_status));
        }
        Ok(())
    }

    /// Read the queued MT message with SBDRB and persist it to the drop
    /// directory. A corrupt message is logged and discarded, not retried.
    fn collect_mt(&mut self, mt_msn: u32, mt_len: usize) -> Result<(), ModemError> {
        self.transport.write_line("AT+SBDRB")?;
        let timeout = Duration::from_secs_f64(self.cfg.msg_timeout);
        let raw = self.transport.read_exact(mt_len + 4, timeout)?;
        // Consume the trailing result code, if any.
        let _ = self.transport.read_until_response(Duration::from_secs(1));

        match decode_mt(&raw) {
            Ok(payload) => {
                let filename = mt_filename(mt_msn, Utc::now());
                let path = self.mt_destination.join(filename);
                info!("Received MT message, outputting to {}", path.display());
                if let Err(e) = std::fs::write(&path, payload) {
                    warn!("Could not write {}, abandoning: {e}", path.display());
                }
            }
            Err(reason) => warn!("Discarding corrupt MT message {mt_msn}: {reason}"),
        }
        Ok(())
    }

    fn clear_buffers(&mut self) {
        match self.command("AT+SBDD2") {
            Ok(response) if last_line(&response) == "OK" => debug!("Message buffers cleared"),
            Ok(response) => warn!("Unexpected response clearing buffers: {response:?}"),
            Err(e) => warn!("Failed to clear message buffers: {e}"),
        }
    }

    /// Ship a file over a RUDICS data call with the filename preamble and an
    /// XMODEM transfer. Returns `Ok(false)` when no dialup number is
    /// configured (the item is dropped).
    pub fn process_file(&mut self, path: &Path) -> Result<bool, ModemError> {
        if self.cfg.dialup_number.is_none() {
            warn!("No dialup number configured, will drop this file");
            return Ok(false);
        }

        self.start_data_call()?;
        self.send_filename(path)?;

        let mut file = File::open(path)
            .map_err(|e| ModemError::Transfer(format!("open {}: {e}", path.display())))?;
        let mut sender = XmodemSender::new(BlockLength::Standard);

        loop {
            match sender.run(&mut self.transport, &mut file) {
                Ok(()) => break,
                Err(XferError::Link { block }) => {
                    self.dataxfer_errors += 1;
                    warn!(
                        "Increase in error count at block {block} ({} total), reseating the data call",
                        self.dataxfer_errors
                    );
                    if let Err(e) = self.end_data_call() {
                        warn!("Unable to cleanly kill the call, will attempt a startup anyway: {e}");
                    }
                    self.start_data_call()?;
                }
                Err(e) => {
                    let _ = self.end_data_call();
                    return Err(ModemError::Transfer(e.to_string()));
                }
            }
        }

        debug!("Finished transfer of {}", path.display());
        self.end_data_call()?;
        Ok(true)
    }

    /// Repeat `@` until the remote is attentive, announce the filename, and
    /// send the framed header.
    fn send_filename(&mut self, path: &Path) -> Result<(), ModemError> {
        let mut attentive = false;
        for _ in 0..PREAMBLE_ATTEMPTS {
            let response = self.command("@")?;
            if last_line(&response) == "A" {
                attentive = true;
                break;
            }
        }
        if !attentive {
            return Err(ModemError::Protocol(
                "remote never acknowledged the attention preamble".to_string(),
            ));
        }

        let response = self.command("FILENAME")?;
        if last_line(&response) != "GOFORIT" {
            return Err(ModemError::Protocol(format!(
                "required response for FILENAME command not received: {response:?}"
            )));
        }

        let name = file_basename_latin1(path);
        let file_length = std::fs::metadata(path)
            .map_err(|e| ModemError::Transfer(format!("stat {}: {e}", path.display())))?
            .len();
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let frame = filename_frame(&name, file_length as i32);

        self.transport.write_raw(&frame)?;
        let response = self.read_response(None)?;
        if last_line(&response) != "NAMERECV" {
            return Err(ModemError::Protocol(format!(
                "could not transfer filename first: {response:?}"
            )));
        }
        Ok(())
    }

    fn start_data_call(&mut self) -> Result<(), ModemError> {
        let number = self
            .cfg
            .dialup_number
            .clone()
            .ok_or_else(|| ModemError::Protocol("no dialup number configured".to_string()))?;

        let response = self.command_with_timeout(
            &format!("ATDT{number}"),
            Duration::from_secs(self.cfg.call_timeout),
        )?;
        if !last_line(&response).starts_with("CONNECT") {
            return Err(ModemError::Protocol(format!(
                "error opening call: {response:?}"
            )));
        }
        self.state = SessionState::InDataCall;
        Ok(())
    }

    /// Escape back to command mode and hang up. The pauses around `+++` are
    /// required by the Hayes escape guard time.
    fn end_data_call(&mut self) -> Result<(), ModemError> {
        self.state = SessionState::Hangup;
        std::thread::sleep(Duration::from_secs(2));
        self.transport.write_raw(b"+++")?;
        let response = self.read_response(None)?;
        std::thread::sleep(Duration::from_secs(1));
        if last_line(&response) != "OK" {
            return Err(ModemError::Protocol(
                "did not switch to command mode to end call".to_string(),
            ));
        }

        let response = self.command("ATH0")?;
        if last_line(&response) != "OK" {
            return Err(ModemError::Protocol("did not hang up the call".to_string()));
        }
        std::thread::sleep(Duration::from_secs(1));
        self.state = SessionState::Registered;
        Ok(())
    }

    /// Iridium network time via AT-MSSTM: the configured era epoch plus the
    /// returned count of 90 ms intervals.
    pub fn get_system_time(&mut self) -> Result<DateTime<Utc>, ModemError> {
        debug!("Getting Iridium system time");
        let response = self.command("AT-MSSTM")?;
        if last_line(&response) != "OK" {
            return Err(ModemError::Protocol(format!(
                "error code response from modem: {response:?}"
            )));
        }
        let ticks = parse_msstm(&response).ok_or_else(|| {
            ModemError::Protocol(format!("cannot use value for Iridium time: {response:?}"))
        })?;

        let epoch = NaiveDateTime::parse_from_str(&self.cfg.iridium_epoch, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| ModemError::Protocol(format!("bad iridium_epoch: {e}")))?
            .and_utc();
        Ok(epoch + chrono::Duration::milliseconds(i64::from(ticks) * 90))
    }

    fn command(&mut self, cmd: &str) -> Result<String, ModemError> {
        self.command_with_timeout(cmd, Duration::from_secs_f64(self.cfg.msg_timeout))
    }

    fn command_with_timeout(
        &mut self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<String, ModemError> {
        self.transport.write_line(cmd)?;
        self.read_response(Some(timeout))
    }

    fn read_response(&mut self, timeout: Option<Duration>) -> Result<String, ModemError> {
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs_f64(self.cfg.msg_timeout));
        let raw = self.transport.read_until_response(timeout)?;
        let response = decode_latin1(&raw);
        debug!("Response received: {:?}", response.trim());
        Ok(response.trim().to_string())
    }
}

/// Decode raw modem bytes as latin-1 (every byte value is a valid char).
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Bytes of the path's final component, truncated to the 255-byte field.
fn file_basename_latin1(path: &Path) -> Vec<u8> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut bytes: Vec<u8> = name
        .chars()
        .map(|c| if (c as u32) < 256 { c as u8 } else { b'_' })
        .collect();
    bytes.truncate(255);
    bytes
}

fn last_line(response: &str) -> &str {
    response.lines().last().map(str::trim).unwrap_or("")
}

/// The binary SBD write is acknowledged with a `0` status line before the
/// final `OK`.
fn sbd_write_accepted(response: &str) -> bool {
    let lines: Vec<&str> = response.lines().map(str::trim).collect();
    lines.last() == Some(&"OK") && lines.iter().rev().skip(1).any(|l| *l == "0")
}

/// Big-endian 16-bit sum of the payload bytes — the SBDWB trailer.
#[must_use]
pub fn sbd_checksum(payload: &[u8]) -> [u8; 2] {
    let sum: u32 = payload.iter().map(|&b| u32::from(b)).sum();
    #[allow(clippy::cast_possible_truncation)]
    let sum = (sum & 0xFFFF) as u16;
    sum.to_be_bytes()
}

/// Verify a `length || payload || checksum` MT message, returning the
/// payload on success.
fn decode_mt(raw: &[u8]) -> Result<&[u8], String> {
    if raw.len() < 4 {
        return Err(format!("message of {} bytes is too short", raw.len()));
    }
    let length = usize::from(u16::from_be_bytes([raw[0], raw[1]]));
    let payload = &raw[2..raw.len() - 2];
    let chksum = u16::from_be_bytes([raw[raw.len() - 2], raw[raw.len() - 1]]);

    if length != payload.len() {
        return Err(format!(
            "length indicated {length} is not the actual message length {}",
            payload.len()
        ));
    }
    let calcd: u32 = payload.iter().map(|&b| u32::from(b)).sum();
    #[allow(clippy::cast_possible_truncation)]
    let calcd = (calcd & 0xFFFF) as u16;
    if chksum != calcd {
        return Err(format!(
            "checksum {chksum:#06x} is not the calculated checksum {calcd:#06x}"
        ));
    }
    Ok(payload)
}

/// MT drop filename: `{MTMSN}_{UTC yyyymmddHHMMSS}.msg`.
fn mt_filename(mt_msn: u32, now: DateTime<Utc>) -> String {
    format!("{}_{}.msg", mt_msn, now.format("%Y%m%d%H%M%S"))
}

/// Framed header announcing the next file: sentinel, length-prefixed name,
/// then little-endian file length, part counters, and the name's CRC32
/// folded to 16 bits, closed by the end sentinel.
fn filename_frame(name: &[u8], file_length: i32) -> Vec<u8> {
    let name = &name[..name.len().min(255)];
    #[allow(clippy::cast_possible_truncation)]
    let len = name.len() as u8;
    #[allow(clippy::cast_possible_wrap)]
    let crc = (crc32fast::hash(name) & 0xFFFF) as i32;

    let mut frame = Vec::with_capacity(name.len() + 19);
    frame.push(0x1A);
    frame.push(len);
    frame.extend_from_slice(name);
    frame.extend_from_slice(&file_length.to_le_bytes());
    frame.extend_from_slice(&1i32.to_le_bytes());
    frame.extend_from_slice(&1i32.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.push(0x1B);
    frame
}

/// Parse `+SBDIX:<mo_st>,<momsn>,<mt_st>,<mtmsn>,<mt_len>,<mt_q>`.
fn parse_sbdix(response: &str) -> Option<SbdixStatus> {
    let line = response
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("+SBDIX:"))?;
    let data = line.split_once(':')?.1;
    let parts: Vec<&str> = data.split(',').map(str::trim).collect();
    if parts.len() < 6 {
        return None;
    }
    Some(SbdixStatus {
        mo_status: parts[0].parse().ok()?,
        mo_msn: parts[1].parse().ok()?,
        mt_status: parts[2].parse().ok()?,
        mt_msn: parts[3].parse().ok()?,
        mt_len: parts[4].parse().ok()?,
        mt_queued: parts[5].parse().ok()?,
    })
}

/// Parse `+CREG: <n>,<stat>` (ignoring any trailing fields).
fn parse_creg(response: &str) -> Option<(u8, u8)> {
    let line = response
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("+CREG:"))?;
    let data = line.split_once(':')?.1;
    let mut parts = data.split(',').map(str::trim);
    let reg_type = parts.next()?.parse().ok()?;
    let stat = parts.next()?.parse().ok()?;
    Some((reg_type, stat))
}

/// Parse `+CSQ:<n>` — single-digit signal level 0-5.
fn parse_csq(response: &str) -> Option<u8> {
    let line = response
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("+CSQ:"))?;
    let data = line.split_once(':')?.1.trim();
    let digits: String = data.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Parse `-MSSTM: <8 hex digits>` into the 90 ms tick count.
fn parse_msstm(response: &str) -> Option<u32> {
    let line = response
        .lines()
        .map(str::trim)
        .find(|l| l.to_ascii_uppercase().starts_with("-MSSTM:"))?;
    let data = line.split_once(':')?.1.trim();
    let hex: String = data.chars().take(8).collect();
    if hex.len() != 8 {
        return None;
    }
    u32::from_str_radix(&hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_sbdix_delivered() {
        let response = "+SBDIX: 0, 12, 0, 0, 0, 0\r\nOK";
        let status = parse_sbdix(response).unwrap();
        assert_eq!(status.mo_status, 0);
        assert_eq!(status.mo_msn, 12);
        assert_eq!(status.mt_status, 0);
        assert_eq!(status.mt_queued, 0);
    }

    #[test]
    fn test_parse_sbdix_with_mt() {
        let response = "+SBDIX: 0, 13, 1, 99, 14, 2\r\n\r\nOK";
        let status = parse_sbdix(response).unwrap();
        assert_eq!(status.mt_status, 1);
        assert_eq!(status.mt_msn, 99);
        assert_eq!(status.mt_len, 14);
        assert_eq!(status.mt_queued, 2);
    }

    #[test]
    fn test_parse_sbdix_garbage() {
        assert!(parse_sbdix("OK").is_none());
        assert!(parse_sbdix("+SBDIX: 0, 1\r\nOK").is_none());
    }

    #[test]
    fn test_parse_creg() {
        assert_eq!(parse_creg("+CREG: 0,1\r\nOK"), Some((0, 1)));
        assert_eq!(parse_creg("+CREG: 000, 005, \"12\"\r\nOK"), Some((0, 5)));
        assert!(parse_creg("OK").is_none());
    }

    #[test]
    fn test_parse_csq() {
        assert_eq!(parse_csq("+CSQ:4\r\nOK"), Some(4));
        assert_eq!(parse_csq("+CSQ: 5\r\nOK"), Some(5));
        assert!(parse_csq("ERROR").is_none());
    }

    #[test]
    fn test_parse_msstm() {
        assert_eq!(parse_msstm("-MSSTM: 62b95972\r\nOK"), Some(0x62b9_5972));
        assert!(parse_msstm("-MSSTM: no network service\r\nOK").is_none());
        assert!(parse_msstm("OK").is_none());
    }

    #[test]
    fn test_sbd_checksum_round_trip() {
        let payload = b"HELLO";
        let chk = sbd_checksum(payload);
        let sum: u32 = payload.iter().map(|&b| u32::from(b)).sum();
        assert_eq!(u16::from_be_bytes(chk), (sum & 0xFFFF) as u16);

        // Wraps modulo 2^16.
        let big = vec![0xFFu8; 300];
        let chk = sbd_checksum(&big);
        assert_eq!(u16::from_be_bytes(chk), ((255 * 300) & 0xFFFF) as u16);
    }

    #[test]
    fn test_decode_mt_round_trip() {
        let payload = b"HELLOWORLD";
        let mut raw = Vec::new();
        raw.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        raw.extend_from_slice(payload);
        raw.extend_from_slice(&sbd_checksum(payload));
        assert_eq!(decode_mt(&raw).unwrap(), payload);
    }

    #[test]
    fn test_decode_mt_bad_length() {
        let payload = b"HELLOWORLD";
        let mut raw = Vec::new();
        raw.extend_from_slice(&11u16.to_be_bytes());
        raw.extend_from_slice(payload);
        raw.extend_from_slice(&sbd_checksum(payload));
        assert!(decode_mt(&raw).is_err());
    }

    #[test]
    fn test_decode_mt_bad_checksum() {
        let payload = b"HELLOWORLD";
        let mut raw = Vec::new();
        raw.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        raw.extend_from_slice(payload);
        raw.extend_from_slice(&[0xDE, 0xAD]);
        assert!(decode_mt(&raw).is_err());
    }

    #[test]
    fn test_decode_mt_too_short() {
        assert!(decode_mt(&[0x00]).is_err());
    }

    #[test]
    fn test_mt_filename() {
        let when = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(mt_filename(99, when), "99_20210304050607.msg");
    }

    #[test]
    fn test_filename_frame_layout() {
        let frame = filename_frame(b"track.dat", 2048);
        assert_eq!(frame[0], 0x1A);
        assert_eq!(frame[1], 9);
        assert_eq!(&frame[2..11], b"track.dat");
        assert_eq!(&frame[11..15], &2048i32.to_le_bytes());
        assert_eq!(&frame[15..19], &1i32.to_le_bytes());
        assert_eq!(&frame[19..23], &1i32.to_le_bytes());
        assert_eq!(*frame.last().unwrap(), 0x1B);
        assert_eq!(frame.len(), 2 + 9 + 16 + 1);
    }

    #[test]
    fn test_filename_frame_crc_field() {
        // crc32("123456789") is the standard check value 0xCBF43926.
        let frame = filename_frame(b"123456789", 1);
        let crc = i32::from_le_bytes([frame[19], frame[20], frame[21], frame[22]]);
        assert_eq!(crc, 0x3926);
    }

    #[test]
    fn test_sbd_write_accepted() {
        assert!(sbd_write_accepted("0\r\nOK"));
        assert!(sbd_write_accepted("\r\n0\r\n\r\nOK"));
        assert!(!sbd_write_accepted("2\r\nOK"));
        assert!(!sbd_write_accepted("0\r\nERROR"));
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("+CSQ:4\r\nOK"), "OK");
        assert_eq!(last_line(""), "");
        assert_eq!(last_line("READY"), "READY");
    }

    #[test]
    fn test_decode_latin1_preserves_high_bytes() {
        let decoded = decode_latin1(&[0x41, 0xE9, 0xFF]);
        assert_eq!(decoded, "Aéÿ");
    }

    #[test]
    fn test_file_basename_latin1() {
        assert_eq!(
            file_basename_latin1(Path::new("/data/out/track.dat")),
            b"track.dat"
        );
        let long = "x".repeat(300);
        assert_eq!(file_basename_latin1(Path::new(&long)).len(), 255);
    }
}
