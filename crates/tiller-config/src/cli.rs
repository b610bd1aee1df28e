//! Command-line interface for the tiller runtime daemon.
//!
//! The flag surface mirrors what operators and the supervising IDE pass on
//! the command line; parsing produces a resolved [`ServiceConfig`] and never
//! leaks `clap` types into the daemon.

use std::env;
use std::ffi::OsString;
use std::str::FromStr;

use camino::Utf8PathBuf;
use clap::{ArgAction, Parser};
use thiserror::Error;

use crate::defaults::{DEFAULT_BIND_ADDRESS, DEFAULT_RPC_PORT, DEFAULT_WEB_PORT};
use crate::endpoint::BindEndpoint;
use crate::extension::{ExtensionSpec, ExtensionSpecError};
use crate::logging::{LogFormat, LogSettings};
use crate::observer::{ObserverTrigger, StatusObserverSpec};
use crate::ServiceConfig;

/// Command-line arguments accepted by `tillerd`.
#[derive(Parser, Debug)]
#[command(name = "tillerd", version, about = "Control-runtime service daemon")]
pub struct Cli {
    /// Service identity; disables secret provisioning and announcement when absent.
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,

    /// IP address or host name of the interface to bind to.
    #[arg(short = 'i', long = "ip", default_value = DEFAULT_BIND_ADDRESS)]
    pub ip: String,

    /// Port the RPC listener serves on.
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_RPC_PORT)]
    pub port: u16,

    /// Load and start the controlled program once the runtime is ready.
    #[arg(short = 'a', long = "autostart")]
    pub autostart: bool,

    /// Disable the auxiliary interface (reactor thread, web endpoint, client).
    #[arg(long = "no-web")]
    pub no_web: bool,

    /// Port for the auxiliary web endpoint.
    #[arg(short = 'w', long = "web-port", default_value_t = DEFAULT_WEB_PORT)]
    pub web_port: u16,

    /// Pre-shared-key file path; provisioning is skipped when absent.
    #[arg(short = 's', long = "psk-path")]
    pub psk_path: Option<Utf8PathBuf>,

    /// Auxiliary client configuration file.
    #[arg(short = 'c', long = "client-conf")]
    pub client_conf: Option<Utf8PathBuf>,

    /// Extension hook executable (absolute path); may be given multiple times.
    #[arg(short = 'e', long = "ext", value_name = "PATH")]
    pub extensions: Vec<Utf8PathBuf>,

    /// Working directory; defaults to the current directory.
    #[arg(short = 'd', long = "workdir")]
    pub workdir: Option<Utf8PathBuf>,

    /// Command launched when the controlled program starts.
    #[arg(long = "on-start", value_name = "CMD")]
    pub on_start: Option<String>,

    /// Command launched when the controlled program stops.
    #[arg(long = "on-stop", value_name = "CMD")]
    pub on_stop: Option<String>,

    /// Command launched on every state transition.
    #[arg(long = "on-status-change", value_name = "CMD")]
    pub on_status_change: Option<String>,

    /// Raise log verbosity; repeat for trace-level output.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format.
    #[arg(long = "log-format", default_value = "compact", value_parser = parse_log_format)]
    pub log_format: LogFormat,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    LogFormat::from_str(value).map_err(|error| error.to_string())
}

/// Errors raised while resolving the CLI into a [`ServiceConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An extension path could not be split into a (file, directory) pair.
    #[error("invalid extension path: {source}")]
    Extension {
        /// Underlying split error.
        #[from]
        source: ExtensionSpecError,
    },
    /// The current directory could not be determined.
    #[error("failed to resolve current directory: {source}")]
    CurrentDir {
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The working directory path is not valid UTF-8.
    #[error("working directory '{path}' is not valid UTF-8")]
    WorkdirEncoding {
        /// Lossy rendering of the offending path.
        path: String,
    },
}

/// Parses the given arguments into a resolved configuration.
///
/// # Errors
///
/// Returns [`ConfigError`] on invalid extension paths or when the default
/// working directory cannot be resolved. Invalid flags terminate the process
/// through `clap` with a usage message, matching conventional CLI behaviour.
pub fn parse<I, T>(args: I) -> Result<ServiceConfig, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    resolve(cli)
}

fn resolve(cli: Cli) -> Result<ServiceConfig, ConfigError> {
    let workdir = match cli.workdir {
        Some(dir) => dir,
        None => default_workdir()?,
    };

    let mut observers = Vec::new();
    if let Some(command) = cli.on_start {
        observers.push(StatusObserverSpec::new(ObserverTrigger::Started, command));
    }
    if let Some(command) = cli.on_stop {
        observers.push(StatusObserverSpec::new(ObserverTrigger::Stopped, command));
    }
    if let Some(command) = cli.on_status_change {
        observers.push(StatusObserverSpec::new(ObserverTrigger::Any, command));
    }

    let extensions = cli
        .extensions
        .iter()
        .map(|path| ExtensionSpec::from_path(path))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ServiceConfig {
        identity: cli.name,
        workdir,
        psk_path: cli.psk_path,
        autostart: cli.autostart,
        endpoint: BindEndpoint::new(cli.ip, cli.port),
        web_interface: !cli.no_web,
        web_port: Some(cli.web_port),
        client_conf: cli.client_conf,
        extensions,
        observers,
        logging: LogSettings {
            filter: filter_for_verbosity(cli.verbose),
            format: cli.log_format,
        },
    })
}

fn default_workdir() -> Result<Utf8PathBuf, ConfigError> {
    let current = env::current_dir().map_err(|source| ConfigError::CurrentDir { source })?;
    Utf8PathBuf::from_path_buf(current).map_err(|path| ConfigError::WorkdirEncoding {
        path: path.display().to_string(),
    })
}

fn filter_for_verbosity(verbose: u8) -> String {
    match verbose {
        0 => crate::defaults::DEFAULT_LOG_FILTER.to_owned(),
        1 => "debug".to_owned(),
        _ => "trace".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse_line(line: &[&str]) -> ServiceConfig {
        let mut args = vec!["tillerd"];
        args.extend_from_slice(line);
        parse(args).expect("configuration should resolve")
    }

    #[test]
    fn defaults_match_contract() {
        let config = parse_line(&[]);
        assert_eq!(config.endpoint, BindEndpoint::new("localhost", 3000));
        assert!(config.web_interface);
        assert_eq!(config.web_port, Some(8009));
        assert!(config.identity.is_none());
        assert!(!config.autostart);
        assert!(config.observers.is_empty());
    }

    #[test]
    fn observer_flags_map_to_triggers() {
        let config = parse_line(&[
            "--on-start",
            "notify start {}",
            "--on-stop",
            "notify stop {}",
            "--on-status-change",
            "notify any {}",
        ]);
        let triggers: Vec<_> = config.observers.iter().map(|o| o.trigger).collect();
        assert_eq!(
            triggers,
            vec![
                ObserverTrigger::Started,
                ObserverTrigger::Stopped,
                ObserverTrigger::Any,
            ]
        );
    }

    #[test]
    fn extension_paths_become_specs() {
        let config = parse_line(&["--ext", "/opt/hooks/serial", "--ext", "/opt/hooks/ident"]);
        assert_eq!(config.extensions.len(), 2);
        assert_eq!(config.extensions[0].file, "serial");
        assert_eq!(config.extensions[0].directory.as_str(), "/opt/hooks");
    }

    #[test]
    fn no_web_disables_auxiliary_interface() {
        let config = parse_line(&["--no-web"]);
        assert!(!config.web_interface);
    }

    #[rstest]
    #[case(0, "info")]
    #[case(1, "debug")]
    #[case(2, "trace")]
    #[case(5, "trace")]
    fn verbosity_maps_to_filter(#[case] verbose: u8, #[case] expected: &str) {
        assert_eq!(filter_for_verbosity(verbose), expected);
    }
}
