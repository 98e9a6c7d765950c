//! Process-wide logger setup on top of `env_logger`.
//!
//! The `log` facade is the single global logger; every component logs under
//! its own target (`shardkv::shard`, `shardkv::net`, ...). `RUST_LOG`, when
//! set, overrides the configured level.

use log::LevelFilter;
use std::io::Write;

/// Map a level name to a filter. Unknown names yield `None`.
pub fn level_filter(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        "off" => Some(LevelFilter::Off),
        _ => None,
    }
}

/// Install the global logger.
///
/// # Arguments
/// * `level` - level name; unknown names fall back to info
/// * `pretty` - colored human output instead of plain timestamped lines
///
/// Calling this more than once is harmless; only the first call wins.
pub fn init(level: &str, pretty: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level_filter(level).unwrap_or(LevelFilter::Info));
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    if pretty {
        builder.write_style(env_logger::WriteStyle::Auto);
    } else {
        builder.write_style(env_logger::WriteStyle::Never);
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {} {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        });
    }

    let _ = builder.try_init();
}
