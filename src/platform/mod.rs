//! Platform Abstraction Layer
//!
//! The only thing the core needs from its host is a monotonic clock in
//! milliseconds:
//!
//! - Browser: `performance.now()` (via web-sys)
//! - Native: `std::time::Instant`
//! - Tests and replays: a manually advanced clock
//!
//! The scheduler and lifecycle are platform-agnostic. Only the TimeSource
//! implementation knows about the host environment.

#[cfg(target_arch = "wasm32")]
pub mod web;

use std::cell::Cell;
use std::rc::Rc;

/// Monotonic time in milliseconds
pub trait TimeSource {
    fn now_ms(&self) -> f64;
}

/// Time source shared by the sessions of an app
pub type SharedTime = Rc<dyn TimeSource>;

/// Native monotonic clock, counting from its creation
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    origin: std::time::Instant,
}

#[cfg(not(target_arch = "wasm32"))]
impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// A clock that only moves when told to
///
/// Clones share the same time, so a test can keep one and hand the other
/// to a session.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Rc<Cell<f64>>,
}

impl ManualTimeSource {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
        }
    }

    pub fn set(&self, ms: f64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: f64) {
        self.now.set(self.now.get() + ms);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> f64 {
        self.now.get()
    }
}

/// The host's real clock
pub fn default_time_source() -> SharedTime {
    #[cfg(target_arch = "wasm32")]
    {
        Rc::new(web::PerformanceTimeSource::new())
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        Rc::new(SystemTimeSource::new())
    }
}
