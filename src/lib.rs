#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! fieldnode library — the building blocks of the field-node controller:
//!
//! - `config` — TOML configuration loading and validation
//! - `sched` — the time-driven action planner and outcome routing
//! - `tasks` — task kinds (SBD/file senders, supervisors, sleep, ...)
//! - `modem` — the modem lock, serial transport, AT session, queue and
//!   worker, plus the RUDICS/Certus connection seam
//! - `logging` — stdout + dated-file tracing setup
//! - `pidfile` — exclusive advisory-locked PID file

pub mod config;
pub mod logging;
pub mod modem;
pub mod pidfile;
pub mod sched;
pub mod tasks;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use modem::{Connection, ModemError};
pub use pidfile::PidFile;
pub use sched::Scheduler;
pub use tasks::Outcome;
