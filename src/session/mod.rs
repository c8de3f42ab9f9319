//! Session-runner job handling — see [`runner`] for the `JobHandler`
//! implementation that drives one agent turn per claimed `session-runner`
//! job.

pub mod runner;
