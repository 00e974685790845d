pub mod clock;
pub mod error;
pub mod ratelimit;
pub mod sample;

pub use clock::{real_clock, Clock, RealClock, SharedClock, TestClock};
pub use error::{CaptureError, ConfigError, DriverError};
pub use ratelimit::LogRateLimiter;
pub use sample::{SampleFormat, SampleSpec, USEC_PER_MSEC, USEC_PER_SEC};
