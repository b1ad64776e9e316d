//! Structured logging setup.
//!
//! The proxy logs through the [`log`] facade, same as `http-cache` itself.
//! The distilled system this crate implements emits single-line JSON log
//! records; rather than hand-rolling a `log::Log` backend to match that
//! shape, we configure [`env_logger`] — the facade's standard companion
//! crate — with a custom line formatter that produces the same JSON fields
//! (`timestamp`, `level`, `target`, `message`).

use std::io::Write;

use env_logger::Builder;
use log::LevelFilter;

/// Installs the process-wide JSON logger.
///
/// Honors `RUST_LOG` for level filtering (defaulting to `info`), matching
/// `env_logger`'s usual convention rather than inventing a proxy-specific
/// knob.
pub fn init() {
    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.format(|buf, record| {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        writeln!(
            buf,
            "{}",
            serde_json::json!({
                "timestamp": now.as_secs_f64(),
                "level": record.level().to_string(),
                "target": record.target(),
                "message": record.args().to_string(),
            })
        )
    });
    // In test and repeated-init contexts this can already be set; that's not
    // a condition worth failing startup over.
    let _ = builder.try_init();
}
