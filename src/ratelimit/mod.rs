//! Request classification and window rate limiting.

mod classifier;
mod clock;
mod counter;
mod key;
mod limiter;
mod retention;
mod rules;

pub use classifier::{EndpointType, RequestClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::WindowCounter;
pub use key::AdmissionKey;
pub use limiter::WindowRateLimiter;
pub use retention::{RetentionPolicy, RetentionSweeper};
pub use rules::{CategoryLimits, LimitRule, TimeUnit};
