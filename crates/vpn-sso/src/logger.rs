use colored::Colorize;
use log::{Level, LevelFilter};
use std::io::Write;

/// Environment variable that overrides the level passed on the command line,
/// using the usual `env_logger` filter syntax (e.g. `vpn_sso::tunnel=trace`).
pub const LOG_ENV: &str = "VPN_SSO_LOG";

/// Installs the process-wide logger on stderr, where the journal picks it up.
///
/// At `Debug` and above the emitting module is printed too, which makes the
/// interleaved SSO / tunnel / cache output readable.
pub fn init_logger(level: LevelFilter) {
    let with_target = level >= LevelFilter::Debug;

    env_logger::Builder::new()
        .filter(None, level)
        .parse_env(LOG_ENV)
        .format(move |buf, record| {
            let tag = match record.level() {
                Level::Error => "ERROR".red(),
                Level::Warn => "WARN".yellow(),
                Level::Info => "INFO".green(),
                Level::Debug => "DEBUG".blue(),
                Level::Trace => "TRACE".purple(),
            };
            if with_target {
                let target = record.target().trim_start_matches("vpn_sso::");
                writeln!(buf, "[{}] {} - {}", tag, target.dimmed(), record.args())
            } else {
                writeln!(buf, "[{}] - {}", tag, record.args())
            }
        })
        .init();
}
