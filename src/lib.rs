//! knightly - cooperative engine tasks for a chess GUI, native or WASM
//!
//! Design principles:
//! - One thread, no preemption: a task only yields where it says so
//! - Every engine search is a scheduler task with a bounded turn
//! - The session lifecycle owns locks, tables and clocks; nothing leaks
//!   past a transition
//!
//! Platform support:
//! - Browser (wasm32-unknown-unknown): `performance.now()` clock, console logging
//! - Native: `Instant` clock, stderr logging, the `knightly-cli` binary

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

/// Console logging helper
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    pub fn log(s: &str);
}

/// Log to browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}

pub mod app;
pub mod config;
pub mod engine;
pub mod game;
pub mod kernel;
pub mod platform;
pub mod session;

pub use app::{App, AppError, AppResult, Command};
pub use config::Config;
pub use session::Session;

/// Initialize panic hook for better error messages in browser console
#[cfg(target_arch = "wasm32")]
fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// WASM entry point
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn main() {
    init_panic_hook();
    console_log!("[knightly] loaded");
}

/// Run a match between the two demo engines and return its score as JSON
///
/// `config_json` uses the same format as the CLI's config file.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn run_demo_match(config_json: &str) -> Result<String, JsValue> {
    let config = Config::from_json(config_json).map_err(|e| JsValue::from_str(&e.to_string()))?;
    let (engine, opponent) = app::demo_engines();
    let stats = app::run_engine_match(config, engine, opponent).map_err(|e| JsValue::from_str(&e.to_string()))?;
    Ok(stats.to_json())
}
