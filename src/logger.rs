use std::fs::File;

use anyhow::Context;
use time::{
    format_description::{self, parse},
    OffsetDateTime,
};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

use crate::configuration::Configuration;

/// Install the global tracing subscriber.
///
/// With `config.log` the output goes to a timestamped file in the working directory, otherwise
/// to stdout. [`LeagueManager::new`](crate::orchestrator::LeagueManager::new) only calls this for
/// file logging; call it directly for stdout. Fails if a global subscriber is already set.
pub fn init_logger(config: &Configuration) -> anyhow::Result<()> {
    let writer = if config.log() {
        let file_name = get_log_file_name()?;
        let file = File::create(&file_name)
            .with_context(|| format!("could not create log file {file_name}"))?;
        BoxMakeWriter::new(file)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
            .context("timer format")?,
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if config.log() { Level::TRACE } else { Level::INFO })
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber).context(
        "Could not set global default tracing subscriber. Consider disabling logs if you are already setting a subscriber.",
    )
}

fn get_log_file_name() -> anyhow::Result<String> {
    let format = parse("[year]-[month]-[day]_[hour]:[minute]:[second]_log.txt")?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(now.format(&format)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_logger_installs_once() {
        let config = Configuration::new();
        assert!(!config.log());
        init_logger(&config).unwrap();
        tracing::info!("stdout logger ready");
        assert!(init_logger(&config).is_err());
    }

    #[test]
    fn log_file_name_is_timestamped() {
        let name = get_log_file_name().unwrap();
        assert!(name.ends_with("_log.txt"));
        assert_eq!(name.len(), "2025-01-01_00:00:00_log.txt".len());
    }
}
