//! Browser time source
//!
//! Uses `performance.now()`; falls back to `Date.now()` where the
//! Performance API is missing (some workers, old engines).

use super::TimeSource;

#[derive(Debug, Clone, Default)]
pub struct PerformanceTimeSource {
    _private: (),
}

impl PerformanceTimeSource {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl TimeSource for PerformanceTimeSource {
    fn now_ms(&self) -> f64 {
        web_sys::window()
            .and_then(|w| w.performance())
            .map(|p| p.now())
            .unwrap_or_else(js_sys::Date::now)
    }
}
