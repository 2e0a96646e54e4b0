// Custom logger

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

/// Log at `info` unless `RUST_LOG` says otherwise.
pub fn init_log() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .parse_env("RUST_LOG")
        .init();
}
