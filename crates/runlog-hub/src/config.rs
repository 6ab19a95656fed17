use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8765";
pub const DEFAULT_DB_PATH: &str = ".runlog/runlog.db";
pub const DEFAULT_LOG_DIR: &str = ".runlog/logs";
pub const DEFAULT_EVENT_RETENTION: usize = 4096;
pub const DEFAULT_IDLE_EVICT_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "runlog-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub db: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value_t = DEFAULT_EVENT_RETENTION)]
    pub event_retention: usize,
    #[arg(long, default_value = "")]
    pub executor: String,
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub executor_cmd: Vec<String>,
    #[arg(long, default_value_t = 50)]
    pub echo_delay_ms: u64,
    /// Seconds before an idle thread's in-memory state is dropped; 0 keeps it.
    #[arg(long)]
    pub idle_evict_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorKind {
    Echo { delay: Duration },
    Command { program: String, args: Vec<String> },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub log_dir: String,
    pub debug: bool,
    pub event_retention: usize,
    pub executor: ExecutorKind,
    pub idle_evict: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid bind address {addr}: {reason}")]
    InvalidAddr { addr: String, reason: String },
    #[error("refusing to bind non-loopback address {0}")]
    NonLoopback(String),
    #[error("unknown executor: {0}")]
    UnknownExecutor(String),
    #[error("command executor needs --executor-cmd or RUNLOG_EXECUTOR_CMD")]
    MissingExecutorCommand,
    #[error("event retention must be at least 1")]
    ZeroRetention,
    #[error("invalid idle eviction seconds: {0}")]
    InvalidIdleEvict(String),
}

pub fn load_config() -> Result<Config, ConfigError> {
    config_from_args(Args::parse())
}

/// Flags win over `RUNLOG_*` variables, which win over defaults.
pub fn config_from_args(args: Args) -> Result<Config, ConfigError> {
    let addr = parse_bind_addr(&resolve("RUNLOG_ADDR", &args.addr, DEFAULT_ADDR))?;
    let db_path = PathBuf::from(resolve("RUNLOG_DB", &args.db, DEFAULT_DB_PATH));
    let log_dir = resolve("RUNLOG_LOG_DIR", &args.log_dir, DEFAULT_LOG_DIR);
    let debug = args.debug || env_true("RUNLOG_DEBUG");
    if args.event_retention == 0 {
        return Err(ConfigError::ZeroRetention);
    }

    let executor = match resolve("RUNLOG_EXECUTOR", &args.executor, "echo").as_str() {
        "echo" => ExecutorKind::Echo {
            delay: Duration::from_millis(args.echo_delay_ms),
        },
        "command" => {
            let mut command = if args.executor_cmd.is_empty() {
                env_value("RUNLOG_EXECUTOR_CMD")
                    .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default()
            } else {
                args.executor_cmd.clone()
            };
            if command.is_empty() {
                return Err(ConfigError::MissingExecutorCommand);
            }
            let program = command.remove(0);
            ExecutorKind::Command {
                program,
                args: command,
            }
        }
        other => return Err(ConfigError::UnknownExecutor(other.to_string())),
    };

    let idle_evict_secs = match args.idle_evict_secs {
        Some(secs) => secs,
        None => match env_value("RUNLOG_IDLE_EVICT_SECS") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidIdleEvict(raw.clone()))?,
            None => DEFAULT_IDLE_EVICT_SECS,
        },
    };

    Ok(Config {
        addr,
        db_path,
        log_dir,
        debug,
        event_retention: args.event_retention,
        executor,
        idle_evict: Duration::from_secs(idle_evict_secs),
    })
}

pub fn parse_bind_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    let addr: SocketAddr = raw.trim().parse().map_err(|err: std::net::AddrParseError| {
        ConfigError::InvalidAddr {
            addr: raw.to_string(),
            reason: err.to_string(),
        }
    })?;
    if !addr.ip().is_loopback() {
        return Err(ConfigError::NonLoopback(raw.to_string()));
    }
    Ok(addr)
}

fn resolve(env_key: &str, flag: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    env_value(env_key).unwrap_or_else(|| default.to_string())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["runlog-hub", "--addr", "127.0.0.1:9100", "--db", "/tmp/x.db"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("parse args")
    }

    #[test]
    fn flags_take_precedence_and_echo_is_default() {
        let config = config_from_args(args(&["--echo-delay-ms", "5"])).expect("config");
        assert_eq!(config.addr.port(), 9100);
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.event_retention, DEFAULT_EVENT_RETENTION);
        assert_eq!(
            config.executor,
            ExecutorKind::Echo {
                delay: Duration::from_millis(5)
            }
        );
    }

    #[test]
    fn command_executor_takes_program_and_arguments() {
        let config = config_from_args(args(&[
            "--executor",
            "command",
            "--executor-cmd",
            "python3",
            "-u",
            "agent.py",
        ]))
        .expect("config");
        assert_eq!(
            config.executor,
            ExecutorKind::Command {
                program: "python3".to_string(),
                args: vec!["-u".to_string(), "agent.py".to_string()],
            }
        );
        assert!(matches!(
            config_from_args(args(&["--executor", "quantum"])),
            Err(ConfigError::UnknownExecutor(_))
        ));
    }

    #[test]
    fn bind_address_must_be_loopback() {
        assert!(parse_bind_addr("127.0.0.1:0").is_ok());
        assert!(parse_bind_addr("[::1]:8765").is_ok());
        assert_eq!(
            parse_bind_addr("0.0.0.0:8765"),
            Err(ConfigError::NonLoopback("0.0.0.0:8765".to_string()))
        );
        assert!(matches!(
            parse_bind_addr("localhost"),
            Err(ConfigError::InvalidAddr { .. })
        ));
    }

    #[test]
    fn idle_eviction_flag_accepts_zero_to_disable() {
        let config = config_from_args(args(&["--idle-evict-secs", "0"])).expect("config");
        assert!(config.idle_evict.is_zero());
        let config = config_from_args(args(&["--idle-evict-secs", "90"])).expect("config");
        assert_eq!(config.idle_evict, Duration::from_secs(90));
    }

    #[test]
    fn zero_retention_is_rejected() {
        assert_eq!(
            config_from_args(args(&["--event-retention", "0"])).err(),
            Some(ConfigError::ZeroRetention)
        );
    }
}
