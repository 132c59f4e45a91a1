//! Request handlers, grouped by surface

pub mod crons;
pub mod hunts;
pub mod misc;
pub mod sessions;
