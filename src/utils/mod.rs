//! The `utils` module provides definitions shared across `rigbroker`:
//! the error types of every subsystem and the logging setup.

pub mod error;
pub mod logging;
