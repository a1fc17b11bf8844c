//! Modem communications subsystem.
//!
//! One physical modem, serialised behind [`lock::ModemLock`]: tasks enqueue
//! outbound traffic onto the [`queue::MessageQueue`], the background
//! [`worker`] drains it through the [`session::ModemSession`] AT state
//! machine, and RUDICS/SSH supervisors borrow the same lock for the
//! duration of a dial-up call. The [`Connection`] trait is the seam between
//! modem variants: RUDICS is the real implementation, Certus a stub.

pub mod lock;
pub mod queue;
pub mod session;
pub mod transport;
pub mod worker;
pub mod xmodem;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::modem::lock::ModemLock;
use crate::modem::queue::{MessageQueue, PRIORITY_FILE_MO, PRIORITY_SBD_MO};
use crate::modem::session::ModemSession;
use crate::modem::worker::WorkerHandle;

/// Modem subsystem error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ModemError {
    /// Offline window, DIO failure, or the lock is already held.
    /// Recoverable: retry next worker iteration.
    #[error("modem lock unavailable: {0}")]
    LockUnavailable(String),
    /// Serial open/read/write failure. The line is closed and reopened
    /// next iteration.
    #[error("serial transport: {0}")]
    Transport(String),
    /// No terminal token arrived within the timeout. Transient.
    #[error("response timeout after {0:.1}s")]
    ResponseTimeout(f64),
    /// Unexpected AT response, checksum mismatch, or registration failure.
    /// Aborts the operation; transient.
    #[error("protocol: {0}")]
    Protocol(String),
    /// SBDIX reported MO status > 4 beyond the retry budget.
    #[error("persistent MO failure (status {0})")]
    MoPersistentFail(u8),
    /// Enqueue-time payload limit violation.
    #[error("payload of {got} bytes exceeds the {limit}-byte SBD limit")]
    PayloadTooLarge { got: usize, limit: usize },
    /// File transfer failure (XMODEM or file I/O).
    #[error("file transfer: {0}")]
    Transfer(String),
    /// Operation not implemented by this modem variant.
    #[error("not supported by this modem variant")]
    NotSupported,
}

/// A mobile-originated SBD message.
#[derive(Debug, Clone)]
pub struct SbdMessage {
    pub payload: Vec<u8>,
    pub binary: bool,
    pub include_timestamp: bool,
    pub warning: bool,
    pub critical: bool,
}

impl SbdMessage {
    /// Plain text message.
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self {
            payload: text.as_bytes().to_vec(),
            binary: false,
            include_timestamp: false,
            warning: false,
            critical: false,
        }
    }

    /// Raw binary message; never timestamped.
    #[must_use]
    pub fn binary(payload: Vec<u8>) -> Self {
        Self {
            payload,
            binary: true,
            include_timestamp: false,
            warning: false,
            critical: false,
        }
    }

    /// A critical notice: body prefixed `critical - ` for the ground
    /// station's triage.
    #[must_use]
    pub fn critical(text: &str) -> Self {
        Self {
            payload: format!("critical - {text}").into_bytes(),
            binary: false,
            include_timestamp: false,
            warning: false,
            critical: true,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self) -> Self {
        self.include_timestamp = true;
        self
    }

    /// Resolve the timestamp prefix into the payload. Applied once at
    /// enqueue time so the size limit covers the final wire bytes.
    #[must_use]
    fn stamped(mut self, now: DateTime<Utc>) -> Self {
        if self.include_timestamp && !self.binary {
            let mut payload = format!("{} ", now.format("%d%m%Y-%H%M%S")).into_bytes();
            payload.extend_from_slice(&self.payload);
            self.payload = payload;
            self.include_timestamp = false;
        }
        self
    }
}

/// One outbound queue item.
#[derive(Debug, Clone)]
pub enum Outbound {
    Sbd(SbdMessage),
    File(PathBuf),
}

/// Capability seam between modem variants.
pub trait Connection: Send + Sync {
    /// Ensure the background machinery is running. Idempotent.
    fn start(&self);
    /// Enqueue an SBD message for the next modem cycle.
    fn send_message(&self, msg: SbdMessage) -> Result<(), ModemError>;
    /// Enqueue a file for transfer over a RUDICS data call.
    fn send_file(&self, path: &Path) -> Result<(), ModemError>;
    /// Query the satellite network clock.
    fn get_system_time(&self) -> Result<DateTime<Utc>, ModemError>;
    /// The hardware lock, for supervisors that own the radio for a whole
    /// call. `None` for variants without a shared radio lock.
    fn modem_lock(&self) -> Option<Arc<ModemLock>>;
    /// Stop the worker and release resources.
    fn shutdown(&self);
}

/// Build the configured modem connection.
pub fn connect(cfg: &Config) -> Result<Arc<dyn Connection>, ModemError> {
    match cfg.modem.modem_type.as_str() {
        "rudics" => Ok(Arc::new(RudicsConnection::new(cfg)?)),
        "certus" => Ok(Arc::new(CertusConnection)),
        other => Err(ModemError::Protocol(format!(
            "unknown modem type \"{other}\""
        ))),
    }
}

/// The Iridium 9522B / RUDICS implementation: priority queue, power-gated
/// lock, and a lazily started worker thread.
pub struct RudicsConnection {
    cfg: Arc<crate::config::ModemConfig>,
    mt_destination: PathBuf,
    lock: Arc<ModemLock>,
    queue: Arc<MessageQueue>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl RudicsConnection {
    pub fn new(cfg: &Config) -> Result<Self, ModemError> {
        let mt_destination = PathBuf::from(&cfg.general.mt_destination);
        if !mt_destination.exists() {
            info!(
                "Creating non-existent message destination: {}",
                mt_destination.display()
            );
            std::fs::create_dir_all(&mt_destination)
                .map_err(|e| ModemError::Transport(format!("create MT destination: {e}")))?;
        }

        info!("Ready to connect to modem on {}", cfg.modem.serial_port);
        Ok(Self {
            cfg: Arc::new(cfg.modem.clone()),
            mt_destination,
            lock: Arc::new(ModemLock::new(&cfg.modem)),
            queue: Arc::new(MessageQueue::new()),
            worker: Mutex::new(None),
        })
    }

    /// Start the worker thread on first use.
    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = worker::spawn(
                Arc::clone(&self.cfg),
                self.mt_destination.clone(),
                Arc::clone(&self.queue),
                Arc::clone(&self.lock),
            );
        }
    }
}

impl Connection for RudicsConnection {
    fn start(&self) {
        self.ensure_worker();
    }

    fn send_message(&self, msg: SbdMessage) -> Result<(), ModemError> {
        let msg = msg.stamped(Utc::now());
        let limit = self.cfg.payload_limit();
        if msg.payload.len() > limit {
            return Err(ModemError::PayloadTooLarge {
                got: msg.payload.len(),
                limit,
            });
        }
        self.queue.push(PRIORITY_SBD_MO, Outbound::Sbd(msg));
        self.ensure_worker();
        Ok(())
    }

    fn send_file(&self, path: &Path) -> Result<(), ModemError> {
        if !path.is_file() {
            return Err(ModemError::Transfer(format!(
                "{} is not a readable file",
                path.display()
            )));
        }
        self.queue
            .push(PRIORITY_FILE_MO, Outbound::File(path.to_path_buf()));
        self.ensure_worker();
        Ok(())
    }

    fn get_system_time(&self) -> Result<DateTime<Utc>, ModemError> {
        let guard = self.lock.acquire(true)?;
        let mut session = ModemSession::new(Arc::clone(&self.cfg), self.mt_destination.clone());
        let result = session
            .initialise()
            .and_then(|()| session.get_system_time());
        session.close();
        drop(guard);
        result
    }

    fn modem_lock(&self) -> Option<Arc<ModemLock>> {
        Some(Arc::clone(&self.lock))
    }

    fn shutdown(&self) {
        if let Some(mut handle) = self.worker.lock().take() {
            info!("Stopping modem worker");
            handle.stop();
        }
    }
}

/// Certus variant stub: the polymorphism seam exists, the behaviour does
/// not.
pub struct CertusConnection;

impl Connection for CertusConnection {
    fn start(&self) {}

    fn send_message(&self, _msg: SbdMessage) -> Result<(), ModemError> {
        warn!("Certus modem support is not implemented");
        Err(ModemError::NotSupported)
    }

    fn send_file(&self, _path: &Path) -> Result<(), ModemError> {
        warn!("Certus modem support is not implemented");
        Err(ModemError::NotSupported)
    }

    fn get_system_time(&self) -> Result<DateTime<Utc>, ModemError> {
        Err(ModemError::NotSupported)
    }

    fn modem_lock(&self) -> Option<Arc<ModemLock>> {
        None
    }

    fn shutdown(&self) {}
}
