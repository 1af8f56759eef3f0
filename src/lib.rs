//! Scheduling core for a construction resource board: attachment rules,
//! attachment-graph maintenance, atomic group moves and optimistic
//! multi-session synchronization against an external store.

pub mod board;
pub mod errors;
pub mod group_move;
pub mod model;
pub mod projection;
pub mod rules;
pub mod store;
pub mod sync;
