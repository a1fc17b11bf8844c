//! Background modem worker.
//!
//! A single long-lived thread that owns the serial session. Each iteration
//! it checks for pending traffic, takes the modem lock without blocking,
//! drains the queue in priority order (collecting queued MT messages before
//! any fresh MO transmission), and releases the lock again. The worker
//! never dies on a modem error and never holds the lock across the
//! inter-iteration wait.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::ModemConfig;
use crate::modem::lock::ModemLock;
use crate::modem::queue::{MessageQueue, PRIORITY_SBD_MO};
use crate::modem::session::{ModemSession, MIN_SIGNAL};
use crate::modem::{ModemError, Outbound, SbdMessage};

/// Granularity of the interruptible inter-iteration wait.
const WAIT_STEP: Duration = Duration::from_millis(500);

/// Handle to the running worker thread.
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal the worker to stop and join it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Modem worker thread panicked during shutdown");
            }
        }
    }
}

/// Spawn the worker thread. Returns `None` when the OS refuses the thread.
pub fn spawn(
    cfg: Arc<ModemConfig>,
    mt_destination: PathBuf,
    queue: Arc<MessageQueue>,
    lock: Arc<ModemLock>,
) -> Option<WorkerHandle> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);

    let thread = thread::Builder::new()
        .name("modem-worker".to_string())
        .spawn(move || worker_loop(&cfg, mt_destination, &queue, &lock, &flag));

    match thread {
        Ok(handle) => {
            info!("Modem worker thread started");
            Some(WorkerHandle {
                running,
                thread: Some(handle),
            })
        }
        Err(e) => {
            error!("Failed to spawn modem worker thread: {e}");
            None
        }
    }
}

fn worker_loop(
    cfg: &ModemConfig,
    mt_destination: PathBuf,
    queue: &MessageQueue,
    lock: &ModemLock,
    running: &AtomicBool,
) {
    let mut session = ModemSession::new(Arc::new(cfg.clone()), mt_destination);
    let modem_wait = Duration::from_secs_f64(cfg.modem_wait);

    while running.load(Ordering::Relaxed) {
        if !queue.is_empty() || session.mt_pending() {
            match lock.acquire(false) {
                Ok(guard) => {
                    let result = drive_session(cfg, queue, &mut session);
                    session.close();
                    drop(guard);
                    match result {
                        Ok(()) => debug!("Reached end of modem usage for this iteration"),
                        Err(e) => error!("Modem cycle failed, will retry next iteration: {e}"),
                    }
                }
                Err(e) => debug!("Modem unavailable this iteration: {e}"),
            }
            queue.set_mt_pending(session.mt_pending());
        }

        // Interruptible wait between iterations; the lock is never held here.
        let mut waited = Duration::ZERO;
        while waited < modem_wait && running.load(Ordering::Relaxed) {
            let step = WAIT_STEP.min(modem_wait - waited);
            thread::sleep(step);
            waited += step;
        }
    }
    debug!("Modem worker thread exiting");
}

/// One locked cycle: initialise, check signal, then drain. Queued MT
/// messages are always collected before issuing a fresh MO so a pending
/// delivery is never overwritten in the modem's buffers.
fn drive_session(
    cfg: &ModemConfig,
    queue: &MessageQueue,
    session: &mut ModemSession,
) -> Result<(), ModemError> {
    session.initialise()?;

    if !session.signal_check(MIN_SIGNAL)? {
        warn!(
            "Not enough signal to perform activities (level {})",
            session.last_signal()
        );
        return Ok(());
    }

    debug!("Current queue size approx.: {}", queue.len());
    let mut processed = 0u32;

    loop {
        if session.mt_pending() {
            info!("Outstanding MT messages, collecting...");
            session.process_sbd(None)?;
            continue;
        }

        let Some(entry) = queue.pop(Duration::from_secs(1)) else {
            break;
        };

        match session.process(&entry.item) {
            Ok(()) => processed += 1,
            Err(ModemError::MoPersistentFail(status)) => {
                if entry.retried {
                    warn!("Requeued message failed again with MO status {status}, surfacing");
                    surface_critical(queue, &entry.item, status);
                } else {
                    warn!("Adding message back into queue due to persistent MO status {status}");
                    queue.requeue(entry);
                }
            }
            Err(e) => {
                // Transient: put the item back at its original position and
                // give the modem a fresh start next iteration.
                warn!("Failed message handling, putting back to the queue...");
                queue.push_back(entry);
                return Err(e);
            }
        }
    }

    info!("Processed {processed} outgoing messages");
    Ok(())
}

/// Announce a dead message over the link itself — unless the dead message
/// was already a critical notice, which would loop forever.
fn surface_critical(queue: &MessageQueue, item: &Outbound, status: u8) {
    let already_critical = matches!(item, Outbound::Sbd(msg) if msg.critical);
    if already_critical {
        error!("Dropping undeliverable critical message (MO status {status})");
        return;
    }
    let notice = match item {
        Outbound::Sbd(_) => format!("failed to deliver SBD after retries (MO status {status})"),
        Outbound::File(path) => format!("failed to deliver file {}", path.display()),
    };
    queue.push(
        PRIORITY_SBD_MO,
        Outbound::Sbd(SbdMessage::critical(&notice)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_critical_enqueues_notice() {
        let queue = MessageQueue::new();
        let failed = Outbound::Sbd(SbdMessage::text("data"));
        surface_critical(&queue, &failed, 5);

        let entry = queue.pop(Duration::ZERO).unwrap();
        match entry.item {
            Outbound::Sbd(msg) => {
                assert!(msg.critical);
                assert!(msg.payload.starts_with(b"critical -"));
            }
            Outbound::File(_) => panic!("expected SBD"),
        }
    }

    #[test]
    fn test_surface_critical_never_loops_on_critical_messages() {
        let queue = MessageQueue::new();
        let failed = Outbound::Sbd(SbdMessage::critical("already critical"));
        surface_critical(&queue, &failed, 5);
        assert!(queue.is_empty());
    }
}
