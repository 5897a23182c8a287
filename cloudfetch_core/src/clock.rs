//! Time source for URL expiry checks
//!
//! Abstracted for one reason only: expiry logic must be testable
//! without waiting for presigned URLs to actually expire.
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// A source of the current UTC time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl Clock for Arc<dyn Clock> {
    fn now(&self) -> DateTime<Utc> {
        self.as_ref().now()
    }
}
