//! Model-aware rate limiting over rolling time windows.
//!
//! Each upstream model carries one or more windows (e.g. 150 calls per 3h and
//! 50 per week); a call is granted only when every window has room, and the
//! grant is recorded in all of them under one lock. Exhausted models can fall
//! back to another model's budget.

pub mod limiter;
pub mod window;

pub use limiter::{Acquisition, ModelLimit, ModelUsage, RateLimitError, RateLimiter, WindowUsage};
pub use window::{RateWindow, WindowMode, WindowSpec};
