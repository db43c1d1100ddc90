//! State machine test utilities and tests.

mod run;
pub mod utils;
