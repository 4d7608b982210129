//! Logging setup using `log` + `log4rs`, console output to stderr.
//!
//! The filter expression whitelists relay crates at the requested level and
//! keeps third-party crates off unless opted in:
//! `"info"`, `"debug,sqlx=info"`, `"root=warn,info"`.

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

const CONSOLE_APPENDER: &str = "stderr";
const LOG_LINE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{h({l})}] {m}{n}";
const WHITELISTED_CRATES: &[&str] = &["relay_core", "relay_service"];

/// Initializes the global logger. Repeated calls are ignored.
pub fn init_logger(filters: &str) {
    let app_level = parse_app_level(filters);
    let root_level = parse_root_override(filters).unwrap_or(LevelFilter::Off);
    let module_levels = parse_module_levels(filters);

    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_LINE_PATTERN)))
        .build();

    let mut builder = Config::builder().appender(Appender::builder().build(CONSOLE_APPENDER, Box::new(console)));

    for crate_name in WHITELISTED_CRATES {
        if !module_levels.iter().any(|(module, _)| module == crate_name) {
            builder = builder.logger(
                Logger::builder()
                    .appenders([CONSOLE_APPENDER.to_string()])
                    .additive(false)
                    .build(*crate_name, app_level),
            );
        }
    }
    for (module, level) in &module_levels {
        builder = builder.logger(
            Logger::builder()
                .appenders([CONSOLE_APPENDER.to_string()])
                .additive(false)
                .build(module, *level),
        );
    }

    if let Ok(config) = builder.build(Root::builder().appender(CONSOLE_APPENDER).build(root_level)) {
        let _ = log4rs::init_config(config);
    }
}

fn parse_app_level(filters: &str) -> LevelFilter {
    filters
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty() && !part.contains('='))
        .find_map(|part| part.parse().ok())
        .unwrap_or(LevelFilter::Info)
}

fn parse_root_override(filters: &str) -> Option<LevelFilter> {
    filters.split(',').find_map(|part| {
        let (module, level) = part.trim().split_once('=')?;
        if module.trim() != "root" {
            return None;
        }
        level.trim().parse().ok()
    })
}

fn parse_module_levels(filters: &str) -> Vec<(String, LevelFilter)> {
    filters
        .split(',')
        .filter_map(|part| {
            let (module, level) = part.trim().split_once('=')?;
            let module = module.trim();
            if module.is_empty() || module == "root" {
                return None;
            }
            Some((module.to_string(), level.trim().parse().ok()?))
        })
        .collect()
}
