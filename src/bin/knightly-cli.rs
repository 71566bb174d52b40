//! knightly CLI - native entry point
//!
//! Plays a match between the two demo engines under the cooperative
//! scheduler and prints the final score as JSON.
//!
//! Usage:
//!   knightly-cli [config.json]     run a match (defaults when no file)
//!   knightly-cli --print-config    print the default config

use knightly::app::{demo_engines, run_engine_match};
use knightly::kernel::trace;
use knightly::Config;
use std::process::ExitCode;

fn load_config(path: Option<&str>) -> Result<Config, String> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e))?;
    Config::from_json(&text).map_err(|e| format!("{}: {}", path, e))
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--print-config") {
        println!("{}", Config::default().to_json());
        return ExitCode::SUCCESS;
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("usage: knightly-cli [config.json] | --print-config");
        return ExitCode::SUCCESS;
    }

    let config = match load_config(args.first().map(String::as_str)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("knightly: {}", e);
            return ExitCode::FAILURE;
        }
    };

    eprintln!(
        "knightly v{} - {} game match",
        env!("CARGO_PKG_VERSION"),
        config.engine_match.games
    );

    let tracing = config.trace.enabled;
    let (engine, opponent) = demo_engines();
    match run_engine_match(config, engine, opponent) {
        Ok(stats) => {
            println!("{}", stats.to_json());
            if tracing {
                let summary = trace::with_tracer(|t| t.summary());
                eprintln!("{}", summary);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("knightly: {}", e);
            ExitCode::FAILURE
        }
    }
}
