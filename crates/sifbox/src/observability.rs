use std::borrow::Cow;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use libbuild::config::ENV_MESSAGELEVEL;
use tracing::Level;
use tracing_subscriber::fmt::{self, writer::BoxMakeWriter};
use tracing_subscriber::prelude::*;

const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";
enum LogFormat {
    Text,
    Json,
}

/// If in debug mode, default level is debug to get maximum logging
#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

/// Warnings are part of the user facing output of builds
#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "warn";

fn detect_log_format(log_format: Option<&str>) -> Result<LogFormat> {
    match log_format {
        None | Some(LOG_FORMAT_TEXT) => Ok(LogFormat::Text),
        Some(LOG_FORMAT_JSON) => Ok(LogFormat::Json),
        Some(unknown) => bail!("unknown log format: {}", unknown),
    }
}

/// `SIFBOX_MESSAGELEVEL` takes a level name or the numeric verbosity of
/// older releases, where negative values only keep errors and warnings.
fn message_level(value: &str) -> Result<Level> {
    if let Ok(level) = Level::from_str(value) {
        return Ok(level);
    }
    let level = match value.trim().parse::<i32>() {
        Ok(n) if n <= -3 => Level::ERROR,
        Ok(n) if n <= 0 => Level::WARN,
        Ok(1 | 2) => Level::INFO,
        Ok(3 | 4) => Level::DEBUG,
        Ok(_) => Level::TRACE,
        Err(_) => bail!("invalid {ENV_MESSAGELEVEL} value {value:?}"),
    };
    Ok(level)
}

fn detect_log_level(input: Option<String>, is_debug: bool, env_level: Option<String>) -> Result<Level> {
    // `log-level` wins over `debug`, which wins over the environment.
    let log_level: Cow<str> = match (input, env_level) {
        (Some(level), _) => level.into(),
        (None, _) if is_debug => "debug".into(),
        (None, Some(env)) => return message_level(&env),
        (None, None) => DEFAULT_LOG_LEVEL.into(),
    };

    Ok(Level::from_str(log_level.as_ref())?)
}

#[derive(Debug, Default)]
pub struct ObservabilityConfig {
    pub log_debug_flag: bool,
    pub log_level: Option<String>,
    pub message_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_format: Option<String>,
    pub systemd_log: bool,
}

impl From<&crate::Opts> for ObservabilityConfig {
    fn from(opts: &crate::Opts) -> Self {
        Self {
            log_debug_flag: opts.global.debug,
            log_level: opts.global.log_level.to_owned(),
            message_level: std::env::var(ENV_MESSAGELEVEL).ok().filter(|v| !v.is_empty()),
            log_file: opts.global.log.to_owned(),
            log_format: opts.global.log_format.to_owned(),
            systemd_log: opts.global.systemd_log,
        }
    }
}

pub fn init<T>(config: T) -> Result<()>
where
    T: Into<ObservabilityConfig>,
{
    let config = config.into();
    let level = detect_log_level(config.log_level, config.log_debug_flag, config.message_level)
        .with_context(|| "failed to parse log level")?;
    let log_level_filter = tracing_subscriber::filter::LevelFilter::from(level);
    let log_format = detect_log_format(config.log_format.as_deref())
        .with_context(|| "failed to detect log format")?;

    let systemd_journald = if config.systemd_log {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer.with_syslog_identifier("sifbox".to_string())),
            Err(err) => {
                // no journal inside most containers, keep going without it
                eprintln!("failed to initialize journald logging: {:?}", err);
                None
            }
        }
    } else {
        None
    };
    let (writer, to_stderr) = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(file), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    // Only one of the format layers is present. Text on the terminal drops
    // timestamps and targets, log files keep them.
    let (terminal, text_file, json) = match log_format {
        LogFormat::Text if to_stderr => (
            Some(fmt::layer().without_time().with_target(false).with_writer(writer)),
            None,
            None,
        ),
        LogFormat::Text => (None, Some(fmt::layer().with_writer(writer)), None),
        LogFormat::Json => (
            None,
            None,
            Some(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_writer(writer),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(log_level_filter)
        .with(systemd_journald)
        .with(terminal)
        .with(text_file)
        .with(json)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};
    use serial_test::serial;

    use super::*;

    /// The global subscriber can be set once per process, so every init
    /// test runs in a forked child.
    fn in_child_process<F: FnOnce() -> Result<(), String>>(cb: F) -> Result<()> {
        match unsafe { fork()? } {
            ForkResult::Child => {
                let code = match cb() {
                    Ok(()) => 0,
                    Err(msg) => {
                        eprintln!("{msg}");
                        1
                    }
                };
                unsafe { nix::libc::_exit(code) }
            }
            ForkResult::Parent { child } => match waitpid(child, None)? {
                WaitStatus::Exited(_, 0) => Ok(()),
                status => bail!("test child failed: {status:?}"),
            },
        }
    }

    #[test]
    fn test_detect_log_level() {
        let test = vec![
            ("error", tracing::Level::ERROR),
            ("warn", tracing::Level::WARN),
            ("info", tracing::Level::INFO),
            ("debug", tracing::Level::DEBUG),
            ("trace", tracing::Level::TRACE),
        ];
        for (input, expected) in test {
            assert_eq!(
                detect_log_level(Some(input.to_string()), false, None)
                    .expect("failed to parse log level"),
                expected
            )
        }
        assert_eq!(
            detect_log_level(None, true, Some("error".to_owned())).expect("failed to parse log level"),
            tracing::Level::DEBUG
        );
        assert!(detect_log_level(Some("invalid".to_string()), false, None).is_err());
    }

    #[test]
    fn test_message_level() {
        assert_eq!(
            detect_log_level(None, false, Some("info".to_owned())).unwrap(),
            tracing::Level::INFO
        );
        assert_eq!(message_level("-3").unwrap(), tracing::Level::ERROR);
        assert_eq!(message_level("0").unwrap(), tracing::Level::WARN);
        assert_eq!(message_level("5").unwrap(), tracing::Level::TRACE);
        assert!(message_level("loud").is_err());
    }

    #[test]
    fn test_detect_log_level_default() {
        let expected = if cfg!(debug_assertions) {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        };
        assert_eq!(detect_log_level(None, false, None).unwrap(), expected);
    }

    #[test]
    #[serial]
    fn test_higher_loglevel_no_log() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let log_file = Path::join(temp_dir.path(), "test.log");
        in_child_process(|| {
            let config = ObservabilityConfig {
                log_file: Some(log_file.clone()),
                log_level: Some("error".to_string()),
                ..Default::default()
            };
            init(config).map_err(|err| err.to_string())?;
            tracing::info!("testing this");
            let data = std::fs::read_to_string(&log_file)
                .map_err(|err| format!("failed to read the logfile: {err:?}"))?;
            if !data.is_empty() {
                return Err(format!("info level should not be logged, but got: {data}"));
            }
            Ok(())
        })
    }

    #[test]
    #[serial]
    fn test_json_logfile() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let log_file = Path::join(temp_dir.path(), "test.log");
        in_child_process(|| {
            let config = ObservabilityConfig {
                log_file: Some(log_file.clone()),
                log_format: Some(LOG_FORMAT_JSON.to_owned()),
                ..Default::default()
            };
            init(config).map_err(|err| err.to_string())?;
            tracing::error!("testing json log");
            let data = std::fs::read_to_string(&log_file)
                .map_err(|err| format!("failed to read the logfile: {err:?}"))?;
            if data.is_empty() {
                return Err("logfile should not be empty".to_owned());
            }
            serde_json::from_str::<serde_json::Value>(&data)
                .map_err(|err| format!("failed to parse {data}: {err:?}"))?;
            Ok(())
        })
    }
}
