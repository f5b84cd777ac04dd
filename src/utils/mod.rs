//! Utility functions and helpers.
//!
//! Environment variable handling and time helpers.

pub mod clock;
pub mod env;

pub use clock::{Clock, FixedClock, SystemClock, local_date, parse_timezone};
pub use env::{get_env_with_prefix, parse_day_list, parse_env_day_list, parse_env_with_prefix};
