//! Schedule triggers.
//!
//! [`Schedule`] compiles a manifest [`ScheduleSpec`](crate::manifest::ScheduleSpec)
//! into fire times; [`TriggerEngine`] runs one timer per job and invokes its
//! callback on each fire. Runs that start more than the misfire grace period
//! late are skipped rather than replayed.

pub mod engine;
pub mod schedule;

pub use engine::{JobCallback, TriggerEngine};
pub use schedule::Schedule;
