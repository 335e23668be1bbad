//! rollcall-service — Attendance orchestration.
//!
//! Owns the extraction engine thread and ties the matcher, the
//! reconciliation pass and the attendance store together.

pub mod config;
pub mod engine;
pub mod service;

pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use service::{AttendanceService, AutoMark, EnrollmentError, GroupResult, ServiceError};
