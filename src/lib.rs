//! Timetable allocation engine served over the Postgres wire protocol.
//!
//! Each tenant database holds slots, timetables and allocations. Writes are
//! checked for teacher, room and section double-booking and persisted through
//! a per-tenant write-ahead log.

pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
