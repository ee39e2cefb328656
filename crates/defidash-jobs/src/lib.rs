//! `defidash-jobs`: durable job queue and periodic scheduler on SQLite.
//!
//! # Overview
//!
//! Every process that shares the database file runs one [`Worker`] and one
//! [`Scheduler`]. The database is the only coordination point between them:
//!
//! | Operation           | Statement                                   | Guarantee                       |
//! |---------------------|---------------------------------------------|---------------------------------|
//! | claim jobs          | `DELETE … RETURNING` over the due set       | each job is claimed once        |
//! | claim an occurrence | `UPDATE … WHERE next_run <= now RETURNING`  | each occurrence fires once      |
//!
//! Claiming a job deletes it, so a job that fails or panics is gone. Handlers
//! that need retries re-enqueue themselves through [`JobContext::queue`].
//!
//! Handlers and schedules are registered on a [`RegistryBuilder`] at startup;
//! duplicates are rejected there and the frozen [`Registry`] is shared by the
//! loops.

pub mod db;
pub mod error;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use error::{JobError, JobsError, Result};
pub use queue::Queue;
pub use registry::{JobHandler, Registry, RegistryBuilder};
pub use runner::{install_panic_capture, JobContext, JobOutcome, JobRunner};
pub use scheduler::Scheduler;
pub use types::{Job, JobArgs, Priority, ScheduleRow};
pub use worker::Worker;
