//! Configuration.
//!
//! This module primarily contains the type [`Config`] that holds all the
//! configuration used by relyd. It can be loaded both from a TOML
//! formatted config file and command line options.

use std::{env, fmt, fs};
use std::convert::TryFrom;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use clap::{Command, Args, ArgAction, ArgMatches, FromArgMatches, Parser};
use dirs::home_dir;
use log::{LevelFilter, error};
#[cfg(unix)] use syslog::Facility;
use crate::error::Failed;


//------------ Defaults for Some Values --------------------------------------

/// The default RTR listen address.
const DEFAULT_RTR_LISTEN: &str = "127.0.0.1:8282";

/// The default address of the administrative interface.
const DEFAULT_HTTP_LISTEN: &str = "127.0.0.1:8080";

/// The default refresh interval in seconds.
const DEFAULT_REFRESH: u64 = 3600;

/// The default RTR retry interval in seconds.
const DEFAULT_RETRY: u64 = 600;

/// The default RTR expire interval in seconds.
const DEFAULT_EXPIRE: u64 = 7200;

/// The default number of earlier data sets to keep for diffs.
const DEFAULT_HISTORY_SIZE: usize = 10;

/// The default period of the validation scheduler in seconds.
const DEFAULT_SCHEDULER_TICK: u64 = 10;

/// The default time until an anchor is validated again in seconds.
const DEFAULT_VALIDATION_INTERVAL: u64 = 600;

/// The default collector command.
const DEFAULT_COLLECTOR_COMMAND: &str = "relyd-collector";

/// The default timeout for collector commands in seconds.
const DEFAULT_COLLECTOR_TIMEOUT: u64 = 300;

/// The default route visibility dumps.
const DEFAULT_DUMP_URLS: &[&str] = &[
    "https://www.ris.ripe.net/dumps/riswhoisdump.IPv4.gz",
    "https://www.ris.ripe.net/dumps/riswhoisdump.IPv6.gz",
];

/// The default period for refreshing the dumps in seconds.
const DEFAULT_DUMP_REFRESH: u64 = 12 * 3600;

/// The default timeout for downloading a dump.
const DEFAULT_DUMP_TIMEOUT: Option<Duration> = Some(Duration::from_secs(300));

/// The default number of peers that need to see a route.
const DEFAULT_VISIBILITY_THRESHOLD: u64 = 5;

/// The default syslog facility.
#[cfg(unix)]
const DEFAULT_SYSLOG_FACILITY: Facility = Facility::LOG_DAEMON;


//------------ Config --------------------------------------------------------

/// relyd configuration.
///
/// All values are public and can be accessed directly.
///
/// The two functions [`config_args`][Self::config_args] and
/// [`server_args`][Self::server_args] add the command line options to a
/// clap command. The base config is then created from the matches via
/// [`from_arg_matches`][Self::from_arg_matches] and the server options
/// applied via
/// [`apply_server_arg_matches`][Self::apply_server_arg_matches].
/// Finally, [`to_toml`][Self::to_toml] produces the content of a config
/// file representing the configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Path to the directory that contains the trust anchor locators.
    pub tal_dir: PathBuf,

    /// Path to the file with filters, whitelist, and preferences.
    pub data_file: PathBuf,

    /// Addresses to listen on for RTR connections.
    pub rtr_listen: Vec<SocketAddr>,

    /// Addresses for the administrative interface.
    pub http_listen: Vec<SocketAddr>,

    /// Don’t send Serial Notify PDUs.
    pub rtr_no_notify: bool,

    /// Keep RTR connections open after protocol errors.
    pub rtr_keep_open_on_error: bool,

    /// The refresh interval for RTR clients.
    pub refresh: Duration,

    /// The retry interval for RTR clients.
    pub retry: Duration,

    /// The expire interval for RTR clients.
    pub expire: Duration,

    /// How many earlier data sets to keep for serial queries.
    pub history_size: usize,

    /// How often the validation scheduler looks for due anchors.
    pub scheduler_tick: Duration,

    /// Time until an anchor is validated again after success.
    pub validation_interval: Duration,

    /// Time until an anchor is validated again after failure.
    ///
    /// If this is `None`, the success interval is used.
    pub validation_retry_interval: Option<Duration>,

    /// The command to run for fetching certificates and ROAs.
    pub collector_command: String,

    /// Arguments passed to the collector before the sub-command.
    pub collector_args: Vec<String>,

    /// Timeout for a single collector run.
    pub collector_timeout: Duration,

    /// The URLs of the route visibility dumps.
    pub dump_urls: Vec<String>,

    /// How often to refresh the route visibility dumps.
    pub dump_refresh: Duration,

    /// Timeout for downloading a dump.
    pub dump_timeout: Option<Duration>,

    /// How many peers need to see a route for it to count.
    pub visibility_threshold: u64,

    /// The log levels to be logged.
    pub log_level: LevelFilter,

    /// The target to send log messages to.
    pub log_target: LogTarget,
}


impl Config {
    /// Adds the basic arguments to a clap command.
    pub fn config_args(app: Command) -> Command {
        GlobalArgs::augment_args(app)
    }

    /// Adds the relevant config args to the server subcommand.
    pub fn server_args(app: Command) -> Command {
        ServerArgs::augment_args(app)
    }

    /// Creates a configuration from command line matches.
    ///
    /// The function will try to read a config file if provided via the
    /// config file option (`-c` or `--config`) or a file in
    /// `$HOME/.relyd.conf` otherwise. If the latter doesn’t exist either,
    /// starts with a default configuration.
    ///
    /// All relative paths given in command line arguments will be
    /// interpreted relative to `cur_dir`. Paths in the config file are
    /// relative to the config file’s directory.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let mut res = Self::create_base_config(
            Self::path_value_of(matches, "config", cur_dir)
                .as_ref().map(AsRef::as_ref)
        )?;
        res.apply_arg_matches(matches, cur_dir)?;
        Ok(res)
    }

    /// Applies the basic command line arguments to a configuration.
    fn apply_arg_matches(
        &mut self,
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<(), Failed> {
        let args = GlobalArgs::from_arg_matches(
            matches
        ).expect("bug in command line arguments parser");

        // log_target - Goes first so we can move things out of args later.
        self.apply_log_matches(&args, cur_dir)?;

        // tal_dir
        if let Some(dir) = args.tal_dir {
            self.tal_dir = cur_dir.join(dir)
        }
        else if let Some(dir) = args.base_dir.as_ref() {
            self.tal_dir = cur_dir.join(dir).join("tals")
        }
        if self.tal_dir == Path::new("") {
            error!(
                "Couldn’t determine default TAL directory: \
                 no home directory.\n\
                 Please specify the TAL directory with the -t option."
            );
            return Err(Failed)
        }

        // data_file
        if let Some(file) = args.data_file {
            self.data_file = cur_dir.join(file)
        }
        else if let Some(dir) = args.base_dir.as_ref() {
            self.data_file = cur_dir.join(dir).join("data.json")
        }
        if self.data_file == Path::new("") {
            error!(
                "Couldn’t determine default data file: \
                 no home directory.\n\
                 Please specify the data file with the -d option."
            );
            return Err(Failed)
        }

        // collector_command
        if let Some(value) = args.collector_command {
            self.collector_command = value
        }

        // collector_args
        if let Some(value) = args.collector_args {
            self.collector_args = value
        }

        // collector_timeout
        if let Some(value) = args.collector_timeout {
            self.collector_timeout = Duration::from_secs(value)
        }

        // log_level
        if args.verbose > 1 {
            self.log_level = LevelFilter::Debug
        }
        else if args.verbose == 1 {
            self.log_level = LevelFilter::Info
        }
        else if args.quiet > 1 {
            self.log_level = LevelFilter::Off
        }
        else if args.quiet == 1 {
            self.log_level = LevelFilter::Error
        }

        Ok(())
    }

    /// Applies the logging-specific command line arguments to the config.
    ///
    /// This is the Unix version that also considers syslog as a valid
    /// target.
    #[cfg(unix)]
    fn apply_log_matches(
        &mut self,
        args: &GlobalArgs,
        cur_dir: &Path,
    ) -> Result<(), Failed> {
        if args.syslog {
            if let Some(facility) = args.syslog_facility.as_ref() {
                self.log_target = LogTarget::Syslog(
                    match Facility::from_str(facility) {
                        Ok(value) => value,
                        Err(_) => {
                            error!("Invalid value for syslog-facility.");
                            return Err(Failed);
                        }
                    }
                )
            }
            else if !matches!(self.log_target, LogTarget::Syslog(_)) {
                self.log_target = LogTarget::Syslog(DEFAULT_SYSLOG_FACILITY)
            }
        }
        else if let Some(file) = args.logfile.as_ref() {
            if file == "-" {
                self.log_target = LogTarget::Stderr
            }
            else {
                self.log_target = LogTarget::File(cur_dir.join(file))
            }
        }
        Ok(())
    }

    /// Applies the logging-specific command line arguments to the config.
    ///
    /// This is the non-Unix version that does not use syslog.
    #[cfg(not(unix))]
    #[allow(clippy::unnecessary_wraps)]
    fn apply_log_matches(
        &mut self,
        args: &GlobalArgs,
        cur_dir: &Path,
    ) -> Result<(), Failed> {
        if let Some(file) = args.logfile.as_ref() {
            if file == "-" {
                self.log_target = LogTarget::Stderr
            }
            else {
                self.log_target = LogTarget::File(cur_dir.join(file))
            }
        }
        Ok(())
    }

    /// Applies the server command line arguments to an existing config.
    pub fn apply_server_arg_matches(
        &mut self,
        matches: &ArgMatches,
    ) -> Result<(), Failed> {
        let args = ServerArgs::from_arg_matches(
            matches
        ).expect("bug in command line arguments parser");

        if let Some(value) = args.refresh {
            self.refresh = Duration::from_secs(value)
        }
        if let Some(value) = args.retry {
            self.retry = Duration::from_secs(value)
        }
        if let Some(value) = args.expire {
            self.expire = Duration::from_secs(value)
        }
        if let Some(value) = args.history {
            self.history_size = value
        }
        if let Some(list) = args.rtr_listen {
            self.rtr_listen = list
        }
        if let Some(list) = args.http_listen {
            self.http_listen = list
        }
        if args.no_notify {
            self.rtr_no_notify = true
        }
        if args.keep_open_on_error {
            self.rtr_keep_open_on_error = true
        }
        if let Some(value) = args.scheduler_tick {
            self.scheduler_tick = Duration::from_secs(value)
        }
        if let Some(value) = args.validation_interval {
            self.validation_interval = Duration::from_secs(value)
        }
        if let Some(value) = args.validation_retry_interval {
            self.validation_retry_interval = Some(Duration::from_secs(value))
        }
        if let Some(list) = args.dump_urls {
            self.dump_urls = list
        }
        if let Some(value) = args.dump_refresh {
            self.dump_refresh = Duration::from_secs(value)
        }
        if let Some(value) = args.dump_timeout {
            self.dump_timeout = if value == 0 {
                None
            }
            else {
                Some(Duration::from_secs(value))
            }
        }
        if let Some(value) = args.visibility_threshold {
            self.visibility_threshold = value
        }

        self.check_listen_addrs()
    }

    /// Returns a path value in arg matches.
    ///
    /// This expands a relative path based on the given directory.
    fn path_value_of(
        matches: &ArgMatches,
        key: &str,
        dir: &Path
    ) -> Option<PathBuf> {
        matches.get_one::<PathBuf>(key).map(|path| dir.join(path))
    }

    /// Creates the correct base configuration for the given config file path.
    ///
    /// If no config path is given, tries to read the default config in
    /// `$HOME/.relyd.conf`. If that doesn’t exist, creates a default
    /// config.
    fn create_base_config(path: Option<&Path>) -> Result<Self, Failed> {
        let file = match path {
            Some(path) => {
                match ConfigFile::read(path)? {
                    Some(file) => file,
                    None => {
                        error!("Cannot read config file {}", path.display());
                        return Err(Failed);
                    }
                }
            }
            None => {
                match home_dir() {
                    Some(dir) => match ConfigFile::read(
                                            &dir.join(".relyd.conf"))? {
                        Some(file) => file,
                        None => return Ok(Self::default()),
                    }
                    None => return Ok(Self::default())
                }
            }
        };
        Self::from_config_file(file)
    }

    /// Creates a base config from a config file.
    ///
    /// Values missing from the file are taken from the default config.
    fn from_config_file(mut file: ConfigFile) -> Result<Self, Failed> {
        let default = Self::default();
        let log_target = Self::log_target_from_config_file(&mut file)?;
        let res = Config {
            tal_dir: file.take_path("tal-dir")?.unwrap_or(default.tal_dir),
            data_file: {
                file.take_path("data-file")?.unwrap_or(default.data_file)
            },
            rtr_listen: {
                file.take_from_str_array("rtr-listen")?
                    .unwrap_or(default.rtr_listen)
            },
            http_listen: {
                file.take_from_str_array("http-listen")?
                    .unwrap_or(default.http_listen)
            },
            rtr_no_notify: file.take_bool("rtr-no-notify")?.unwrap_or(false),
            rtr_keep_open_on_error: {
                file.take_bool("rtr-keep-open-on-error")?.unwrap_or(false)
            },
            refresh: {
                Duration::from_secs(
                    file.take_u64("refresh")?.unwrap_or(DEFAULT_REFRESH)
                )
            },
            retry: {
                Duration::from_secs(
                    file.take_u64("retry")?.unwrap_or(DEFAULT_RETRY)
                )
            },
            expire: {
                Duration::from_secs(
                    file.take_u64("expire")?.unwrap_or(DEFAULT_EXPIRE)
                )
            },
            history_size: {
                file.take_usize("history-size")?
                    .unwrap_or(DEFAULT_HISTORY_SIZE)
            },
            scheduler_tick: {
                Duration::from_secs(
                    file.take_u64("scheduler-tick")?
                        .unwrap_or(DEFAULT_SCHEDULER_TICK)
                )
            },
            validation_interval: {
                Duration::from_secs(
                    file.take_u64("validation-interval")?
                        .unwrap_or(DEFAULT_VALIDATION_INTERVAL)
                )
            },
            validation_retry_interval: {
                file.take_u64("validation-retry-interval")?
                    .map(Duration::from_secs)
            },
            collector_command: {
                file.take_string("collector-command")?
                    .unwrap_or(default.collector_command)
            },
            collector_args: {
                file.take_string_array("collector-args")?.unwrap_or_default()
            },
            collector_timeout: {
                Duration::from_secs(
                    file.take_u64("collector-timeout")?
                        .unwrap_or(DEFAULT_COLLECTOR_TIMEOUT)
                )
            },
            dump_urls: {
                file.take_string_array("dump-urls")?
                    .unwrap_or(default.dump_urls)
            },
            dump_refresh: {
                Duration::from_secs(
                    file.take_u64("dump-refresh")?
                        .unwrap_or(DEFAULT_DUMP_REFRESH)
                )
            },
            dump_timeout: {
                match file.take_u64("dump-timeout")? {
                    Some(0) => None,
                    Some(value) => Some(Duration::from_secs(value)),
                    None => DEFAULT_DUMP_TIMEOUT
                }
            },
            visibility_threshold: {
                file.take_u64("visibility-threshold")?
                    .unwrap_or(DEFAULT_VISIBILITY_THRESHOLD)
            },
            log_level: {
                file.take_from_str("log-level")?.unwrap_or(LevelFilter::Warn)
            },
            log_target,
        };
        file.check_exhausted()?;
        res.check_listen_addrs()?;
        Ok(res)
    }

    /// Determines the logging target from the config file.
    ///
    /// This is the Unix version that also deals with syslog.
    #[cfg(unix)]
    fn log_target_from_config_file(
        file: &mut ConfigFile
    ) -> Result<LogTarget, Failed> {
        let facility = file.take_string("syslog-facility")?;
        let facility = facility.as_ref().map(AsRef::as_ref)
                               .unwrap_or("daemon");
        let facility = match Facility::from_str(facility) {
            Ok(value) => value,
            Err(_) => {
                error!(
                    "Failed in config file {}: invalid syslog-facility.",
                    file.path.display()
                );
                return Err(Failed);
            }
        };
        let log_target = file.take_string("log")?;
        let log_file = file.take_path("log-file")?;
        match log_target.as_ref().map(AsRef::as_ref) {
            Some("default") | Some("stderr") | None => Ok(LogTarget::Stderr),
            Some("syslog") => Ok(LogTarget::Syslog(facility)),
            Some("file") => {
                match log_file {
                    Some(file) => Ok(LogTarget::File(file)),
                    None => {
                        error!(
                            "Failed in config file {}: \
                             log target \"file\" requires 'log-file' value.",
                            file.path.display()
                        );
                        Err(Failed)
                    }
                }
            }
            Some(value) => {
                error!(
                    "Failed in config file {}: \
                     invalid log target '{}'",
                     file.path.display(),
                     value
                );
                Err(Failed)
            }
        }
    }

    /// Determines the logging target from the config file.
    ///
    /// This is the non-Unix version that only logs to stderr or a file.
    #[cfg(not(unix))]
    fn log_target_from_config_file(
        file: &mut ConfigFile
    ) -> Result<LogTarget, Failed> {
        let log_target = file.take_string("log")?;
        let log_file = file.take_path("log-file")?;
        match log_target.as_ref().map(AsRef::as_ref) {
            Some("default") | Some("stderr") | None => Ok(LogTarget::Stderr),
            Some("file") => {
                match log_file {
                    Some(file) => Ok(LogTarget::File(file)),
                    None => {
                        error!(
                            "Failed in config file {}: \
                             log target \"file\" requires 'log-file' value.",
                            file.path.display()
                        );
                        Err(Failed)
                    }
                }
            }
            Some(value) => {
                error!(
                    "Failed in config file {}: \
                     invalid log target '{}'",
                    file.path.display(), value
                );
                Err(Failed)
            }
        }
    }

    /// Checks that all listen addresses have a port.
    fn check_listen_addrs(&self) -> Result<(), Failed> {
        for addr in self.rtr_listen.iter().chain(self.http_listen.iter()) {
            if addr.port() == 0 {
                error!("Invalid listen address {}: port must not be 0.", addr);
                return Err(Failed)
            }
        }
        Ok(())
    }

    /// Returns the time until an anchor is validated again after failure.
    pub fn validation_retry_interval(&self) -> Duration {
        self.validation_retry_interval.unwrap_or(self.validation_interval)
    }

    /// Creates a default config with the given paths.
    fn default_with_paths(tal_dir: PathBuf, data_file: PathBuf) -> Self {
        Config {
            tal_dir,
            data_file,
            rtr_listen: vec![
                SocketAddr::from_str(DEFAULT_RTR_LISTEN)
                    .expect("bad default RTR address")
            ],
            http_listen: vec![
                SocketAddr::from_str(DEFAULT_HTTP_LISTEN)
                    .expect("bad default HTTP address")
            ],
            rtr_no_notify: false,
            rtr_keep_open_on_error: false,
            refresh: Duration::from_secs(DEFAULT_REFRESH),
            retry: Duration::from_secs(DEFAULT_RETRY),
            expire: Duration::from_secs(DEFAULT_EXPIRE),
            history_size: DEFAULT_HISTORY_SIZE,
            scheduler_tick: Duration::from_secs(DEFAULT_SCHEDULER_TICK),
            validation_interval: {
                Duration::from_secs(DEFAULT_VALIDATION_INTERVAL)
            },
            validation_retry_interval: None,
            collector_command: DEFAULT_COLLECTOR_COMMAND.into(),
            collector_args: Vec::new(),
            collector_timeout: Duration::from_secs(DEFAULT_COLLECTOR_TIMEOUT),
            dump_urls: DEFAULT_DUMP_URLS.iter().map(|s| s.to_string()).collect(),
            dump_refresh: Duration::from_secs(DEFAULT_DUMP_REFRESH),
            dump_timeout: DEFAULT_DUMP_TIMEOUT,
            visibility_threshold: DEFAULT_VISIBILITY_THRESHOLD,
            log_level: LevelFilter::Warn,
            log_target: LogTarget::default(),
        }
    }

    /// Returns a TOML representation of the config.
    pub fn to_toml(&self) -> toml::Value {
        let mut res = toml::value::Table::new();
        res.insert(
            "tal-dir".into(),
            self.tal_dir.display().to_string().into()
        );
        res.insert(
            "data-file".into(),
            self.data_file.display().to_string().into()
        );
        res.insert(
            "rtr-listen".into(),
            toml::Value::Array(
                self.rtr_listen.iter().map(|a| a.to_string().into()).collect()
            )
        );
        res.insert(
            "http-listen".into(),
            toml::Value::Array(
                self.http_listen.iter().map(|a| a.to_string().into()).collect()
            )
        );
        res.insert("rtr-no-notify".into(), self.rtr_no_notify.into());
        res.insert(
            "rtr-keep-open-on-error".into(),
            self.rtr_keep_open_on_error.into()
        );
        res.insert("refresh".into(), (self.refresh.as_secs() as i64).into());
        res.insert("retry".into(), (self.retry.as_secs() as i64).into());
        res.insert("expire".into(), (self.expire.as_secs() as i64).into());
        res.insert("history-size".into(), (self.history_size as i64).into());
        res.insert(
            "scheduler-tick".into(),
            (self.scheduler_tick.as_secs() as i64).into()
        );
        res.insert(
            "validation-interval".into(),
            (self.validation_interval.as_secs() as i64).into()
        );
        if let Some(retry) = self.validation_retry_interval {
            res.insert(
                "validation-retry-interval".into(),
                (retry.as_secs() as i64).into()
            );
        }
        res.insert(
            "collector-command".into(),
            self.collector_command.clone().into()
        );
        res.insert(
            "collector-args".into(),
            toml::Value::Array(
                self.collector_args.iter().map(|a| a.clone().into()).collect()
            )
        );
        res.insert(
            "collector-timeout".into(),
            (self.collector_timeout.as_secs() as i64).into()
        );
        res.insert(
            "dump-urls".into(),
            toml::Value::Array(
                self.dump_urls.iter().map(|a| a.clone().into()).collect()
            )
        );
        res.insert(
            "dump-refresh".into(),
            (self.dump_refresh.as_secs() as i64).into()
        );
        res.insert("dump-timeout".into(),
            match self.dump_timeout {
                Some(timeout) => (timeout.as_secs() as i64).into(),
                None => 0.into(),
            }
        );
        res.insert(
            "visibility-threshold".into(),
            (self.visibility_threshold as i64).into()
        );
        res.insert("log-level".into(), self.log_level.to_string().into());
        match self.log_target {
            #[cfg(unix)]
            LogTarget::Syslog(facility) => {
                res.insert("log".into(), "syslog".into());
                res.insert(
                    "syslog-facility".into(),
                    facility_to_string(facility).into()
                );
            }
            LogTarget::Stderr => {
                res.insert("log".into(), "stderr".into());
            }
            LogTarget::File(ref file) => {
                res.insert("log".into(), "file".into());
                res.insert(
                    "log-file".into(),
                    file.display().to_string().into()
                );
            }
        }
        res.into()
    }
}


//--- Default

impl Default for Config {
    fn default() -> Self {
        match home_dir() {
            Some(dir) => {
                let base = dir.join(".relyd");
                Config::default_with_paths(
                    base.join("tals"),
                    base.join("data.json")
                )
            }
            None => {
                Config::default_with_paths(
                    PathBuf::from(""), PathBuf::from("")
                )
            }
        }
    }
}


//--- Display

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_toml())
    }
}


//------------ LogTarget -----------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug)]
pub enum LogTarget {
    /// Syslog.
    ///
    /// The argument is the syslog facility to use.
    #[cfg(unix)]
    Syslog(Facility),

    /// Stderr.
    ///
    /// This is the default.
    Stderr,

    /// A file.
    ///
    /// The argument is the file name.
    File(PathBuf)
}


//--- Default

impl Default for LogTarget {
    fn default() -> Self {
        LogTarget::Stderr
    }
}


//--- PartialEq and Eq

impl PartialEq for LogTarget {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            #[cfg(unix)]
            (&LogTarget::Syslog(s), &LogTarget::Syslog(o)) => {
                (s as usize) == (o as usize)
            }
            (&LogTarget::Stderr, &LogTarget::Stderr) => true,
            (&LogTarget::File(ref s), &LogTarget::File(ref o)) => {
                s == o
            }
            _ => false
        }
    }
}

impl Eq for LogTarget { }


//------------ GlobalArgs ----------------------------------------------------

/// The global command line arguments.
#[derive(Clone, Debug, Parser)]
struct GlobalArgs {
    /// Read base configuration from this file
    #[arg(short, long, value_name="PATH")]
    config: Option<PathBuf>,

    /// Sets the base directory for TALs and the data file
    #[arg(short, long, value_name="PATH")]
    base_dir: Option<PathBuf>,

    /// Sets the TAL directory
    #[arg(short, long, value_name="PATH")]
    tal_dir: Option<PathBuf>,

    /// Sets the file keeping filters, whitelist, and preferences
    #[arg(short, long, value_name="PATH")]
    data_file: Option<PathBuf>,

    /// The command to run for fetching certificates and ROAs
    #[arg(long, value_name="COMMAND")]
    collector_command: Option<String>,

    /// Argument for the collector command, may be given multiple times
    #[arg(long = "collector-arg", value_name="ARG", allow_hyphen_values = true)]
    collector_args: Option<Vec<String>>,

    /// Timeout for collector commands
    #[arg(long, value_name = "SECONDS")]
    collector_timeout: Option<u64>,

    /// Log more information, twice for even more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log less information, twice for no information
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,

    /// Log to syslog
    #[cfg(unix)]
    #[arg(long)]
    syslog: bool,

    /// Facility to use for syslog logging
    #[cfg(unix)]
    #[arg(long, value_name = "FACILITY")]
    syslog_facility: Option<String>,

    /// Log to this file
    #[arg(long, value_name = "PATH")]
    logfile: Option<String>,
}


//------------ ServerArgs ----------------------------------------------------

/// The server-related command line arguments.
#[derive(Clone, Debug, Parser)]
struct ServerArgs {
    /// Refresh interval in seconds [default 3600]
    #[arg(long, value_name = "SECONDS")]
    refresh: Option<u64>,

    /// RTR retry interval in seconds [default 600]
    #[arg(long, value_name = "SECONDS")]
    retry: Option<u64>,

    /// RTR expire interval in seconds [default 7200]
    #[arg(long, value_name = "SECONDS")]
    expire: Option<u64>,

    /// Number of history items to keep [default 10]
    #[arg(long, value_name = "COUNT")]
    history: Option<usize>,

    /// Listen on address/port for RTR
    #[arg(long = "rtr", value_name = "ADDR:PORT")]
    rtr_listen: Option<Vec<SocketAddr>>,

    /// Address/port for the administrative interface
    #[arg(long = "http", value_name = "ADDR:PORT")]
    http_listen: Option<Vec<SocketAddr>>,

    /// Don’t send Serial Notify to RTR clients
    #[arg(long)]
    no_notify: bool,

    /// Keep RTR connections open after protocol errors
    #[arg(long)]
    keep_open_on_error: bool,

    /// Period for checking for due trust anchors [default 10]
    #[arg(long, value_name = "SECONDS")]
    scheduler_tick: Option<u64>,

    /// Time between validations of a trust anchor [default 600]
    #[arg(long, value_name = "SECONDS")]
    validation_interval: Option<u64>,

    /// Time before retrying a failed trust anchor
    #[arg(long, value_name = "SECONDS")]
    validation_retry_interval: Option<u64>,

    /// URL of a route visibility dump, may be given multiple times
    #[arg(long = "dump-url", value_name = "URL")]
    dump_urls: Option<Vec<String>>,

    /// Refresh interval for route visibility dumps [default 43200]
    #[arg(long, value_name = "SECONDS")]
    dump_refresh: Option<u64>,

    /// Timeout for downloading a dump (0 for none) [default 300]
    #[arg(long, value_name = "SECONDS")]
    dump_timeout: Option<u64>,

    /// Number of peers that need to see a route [default 5]
    #[arg(long, value_name = "COUNT")]
    visibility_threshold: Option<u64>,
}


//------------ ConfigFile ----------------------------------------------------

/// The content of a config file.
///
/// This is a thin wrapper around `toml::Table` to make dealing with it more
/// convenient.
#[derive(Clone, Debug)]
struct ConfigFile {
    /// The content of the file.
    content: toml::value::Table,

    /// The path to the config file.
    path: PathBuf,

    /// The directory we found the file in.
    ///
    /// This is used in relative paths.
    dir: PathBuf,
}

impl ConfigFile {
    /// Reads the config file at the given path.
    ///
    /// If there is no such file, returns `None`. If there is a file but it
    /// is broken, aborts.
    #[allow(clippy::verbose_file_reads)]
    fn read(path: &Path) -> Result<Option<Self>, Failed> {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(_) => return Ok(None)
        };
        let mut config = String::new();
        if let Err(err) = file.read_to_string(&mut config) {
            error!(
                "Failed to read config file {}: {}",
                path.display(), err
            );
            return Err(Failed);
        }
        Self::parse(&config, path).map(Some)
    }

    /// Parses the content of the file from a string.
    fn parse(content: &str, path: &Path) -> Result<Self, Failed> {
        let content = match toml::from_str(content) {
            Ok(toml::Value::Table(content)) => content,
            Ok(_) => {
                error!(
                    "Failed to parse config file {}: Not a mapping.",
                    path.display()
                );
                return Err(Failed);
            }
            Err(err) => {
                error!(
                    "Failed to parse config file {}: {}",
                    path.display(), err
                );
                return Err(Failed);
            }
        };
        let path = if path.is_relative() {
            match env::current_dir() {
                Ok(dir) => dir.join(path),
                Err(err) => {
                    error!(
                        "Fatal: Can't determine current directory: {}.",
                        err
                    );
                    return Err(Failed);
                }
            }
        }
        else {
            path.into()
        };
        let dir = match path.parent() {
            Some(dir) => dir.into(),
            None => {
                error!(
                    "Fatal: config file {} has no directory.",
                    path.display()
                );
                return Err(Failed)
            }
        };
        Ok(ConfigFile { content, path, dir })
    }

    /// Takes a boolean value from the config file.
    ///
    /// Returns `Ok(None)` if there is no such key. Returns an error if the
    /// key exists but the value isn’t a booelan.
    fn take_bool(&mut self, key: &str) -> Result<Option<bool>, Failed> {
        match self.content.remove(key) {
            Some(value) => {
                if let toml::Value::Boolean(res) = value {
                    Ok(Some(res))
                }
                else {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be a boolean.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes an unsigned integer value from the config file.
    ///
    /// Returns `Ok(None)` if there is no such key. Returns an error if the
    /// key exists but the value isn’t an integer or if it is negative.
    fn take_u64(&mut self, key: &str) -> Result<Option<u64>, Failed> {
        match self.content.remove(key) {
            Some(value) => {
                if let toml::Value::Integer(res) = value {
                    u64::try_from(res).map(Some).map_err(|_| {
                        error!(
                            "Failed in config file {}: \
                            '{}' expected to be a positive integer.",
                            self.path.display(), key
                        );
                        Failed
                    })
                }
                else {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be an integer.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes an unsigned integer value from the config file.
    fn take_usize(&mut self, key: &str) -> Result<Option<usize>, Failed> {
        match self.take_u64(key)? {
            Some(value) => {
                usize::try_from(value).map(Some).map_err(|_| {
                    error!(
                        "Failed in config file {}: \
                        value for '{}' is too large.",
                        self.path.display(), key
                    );
                    Failed
                })
            }
            None => Ok(None)
        }
    }

    /// Takes a string value from the config file.
    ///
    /// Returns `Ok(None)` if there is no such key. Returns an error if the
    /// key exists but the value isn’t a string.
    fn take_string(&mut self, key: &str) -> Result<Option<String>, Failed> {
        match self.content.remove(key) {
            Some(value) => {
                if let toml::Value::String(res) = value {
                    Ok(Some(res))
                }
                else {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be a string.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a string encoded value from the config file.
    ///
    /// The value is converted via `FromStr::from_str`.
    fn take_from_str<T>(&mut self, key: &str) -> Result<Option<T>, Failed>
    where T: FromStr, T::Err: fmt::Display {
        match self.take_string(key)? {
            Some(value) => {
                match T::from_str(&value) {
                    Ok(some) => Ok(Some(some)),
                    Err(err) => {
                        error!(
                            "Failed in config file {}: \
                             illegal value in '{}': {}.",
                            self.path.display(), key, err
                        );
                        Err(Failed)
                    }
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a path value from the config file.
    ///
    /// A relative path is taken as relative to the directory of the config
    /// file and expanded accordingly.
    fn take_path(&mut self, key: &str) -> Result<Option<PathBuf>, Failed> {
        self.take_string(key).map(|opt| opt.map(|path| self.dir.join(path)))
    }

    /// Takes an array of strings from the config file.
    fn take_string_array(
        &mut self,
        key: &str
    ) -> Result<Option<Vec<String>>, Failed> {
        self.take_from_str_array(key)
    }

    /// Takes an array of string encoded values from the config file.
    ///
    /// Each string is converted via `FromStr::from_str`. Returns `Ok(None)`
    /// if the key is not present. If the entry is present but not an array
    /// of strings or if converting any of the strings fails, returns an
    /// error.
    fn take_from_str_array<T>(
        &mut self,
        key: &str
    ) -> Result<Option<Vec<T>>, Failed>
    where T: FromStr, T::Err: fmt::Display {
        match self.content.remove(key) {
            Some(toml::Value::Array(vec)) => {
                let mut res = Vec::new();
                for value in vec.into_iter() {
                    if let toml::Value::String(value) = value {
                        match T::from_str(&value) {
                            Ok(value) => res.push(value),
                            Err(err) => {
                                error!(
                                    "Failed in config file {}: \
                                     Invalid value in '{}': {}",
                                    self.path.display(), key, err
                                );
                                return Err(Failed)
                            }
                        }
                    }
                    else {
                        error!(
                            "Failed in config file {}: \
                            '{}' expected to be a array of strings.",
                            self.path.display(),
                            key
                        );
                        return Err(Failed)
                    }
                }
                Ok(Some(res))
            }
            Some(_) => {
                error!(
                    "Failed in config file {}: \
                     '{}' expected to be a array of strings.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Checks whether the config file is now empty.
    ///
    /// If it isn’t, logs a complaint and returns an error.
    fn check_exhausted(&self) -> Result<(), Failed> {
        if !self.content.is_empty() {
            let keys: Vec<_> = self.content.keys().map(String::as_str)
                .collect();
            error!(
                "Failed in config file {}: Unknown settings {}.",
                self.path.display(), keys.join(",")
            );
            Err(Failed)
        }
        else {
            Ok(())
        }
    }
}


//------------ Helpers -------------------------------------------------------

/// Converts the syslog facility to its name.
#[cfg(unix)]
fn facility_to_string(facility: Facility) -> String {
    use syslog::Facility::*;

    match facility {
        LOG_KERN => "kern",
        LOG_USER => "user",
        LOG_MAIL => "mail",
        LOG_DAEMON => "daemon",
        LOG_AUTH => "auth",
        LOG_SYSLOG => "syslog",
        LOG_LPR => "lpr",
        LOG_NEWS => "news",
        LOG_UUCP => "uucp",
        LOG_CRON => "cron",
        LOG_AUTHPRIV => "authpriv",
        LOG_FTP => "ftp",
        LOG_LOCAL0 => "local0",
        LOG_LOCAL1 => "local1",
        LOG_LOCAL2 => "local2",
        LOG_LOCAL3 => "local3",
        LOG_LOCAL4 => "local4",
        LOG_LOCAL5 => "local5",
        LOG_LOCAL6 => "local6",
        LOG_LOCAL7 => "local7",
    }.into()
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn get_default_config() -> Config {
        // Set $HOME so that home_dir always succeeds.
        ::std::env::set_var("HOME", "/home/test");
        Config::default()
    }

    fn process_basic_args(args: &[&str]) -> Config {
        let mut config = get_default_config();
        config.apply_arg_matches(
            &Config::config_args(Command::new("relyd"))
                .get_matches_from(args),
            Path::new("/test")
        ).unwrap();
        config
    }

    fn process_server_args(args: &[&str]) -> Result<Config, Failed> {
        let mut config = get_default_config();
        let matches = Config::server_args(Config::config_args(
                Command::new("relyd"))
        ).get_matches_from(args);
        config.apply_arg_matches(&matches, Path::new("/test")).unwrap();
        config.apply_server_arg_matches(&matches)?;
        Ok(config)
    }

    #[test]
    #[cfg(unix)]
    fn default_config() {
        let config = get_default_config();
        assert_eq!(
            config.tal_dir,
            home_dir().unwrap().join(".relyd").join("tals")
        );
        assert_eq!(
            config.data_file,
            home_dir().unwrap().join(".relyd").join("data.json")
        );
        assert_eq!(config.refresh, Duration::from_secs(DEFAULT_REFRESH));
        assert_eq!(config.retry, Duration::from_secs(DEFAULT_RETRY));
        assert_eq!(config.expire, Duration::from_secs(DEFAULT_EXPIRE));
        assert_eq!(config.history_size, DEFAULT_HISTORY_SIZE);
        assert_eq!(
            config.rtr_listen,
            vec![SocketAddr::from_str("127.0.0.1:8282").unwrap()]
        );
        assert!(!config.rtr_no_notify);
        assert!(!config.rtr_keep_open_on_error);
        assert_eq!(config.scheduler_tick, Duration::from_secs(10));
        assert_eq!(config.validation_retry_interval(), Duration::from_secs(600));
        assert_eq!(config.dump_urls.len(), 2);
        assert_eq!(config.dump_refresh, Duration::from_secs(43200));
        assert_eq!(config.visibility_threshold, 5);
        assert_eq!(config.log_level, LevelFilter::Warn);
        assert_eq!(config.log_target, LogTarget::Stderr);
    }

    #[test]
    #[cfg(unix)] // ... because of drive letters in absolute paths on Windows.
    fn good_config_file() {
        let config = ConfigFile::parse(
            "tal-dir = \"taldir\"\n\
             data-file = \"/var/lib/relyd/data.json\"\n\
             rtr-listen = [\"[2001:db8::4]:323\", \"192.0.2.4:323\"]\n\
             http-listen = [\"192.0.2.4:8080\"]\n\
             rtr-no-notify = true\n\
             rtr-keep-open-on-error = true\n\
             refresh = 6\n\
             retry = 7\n\
             expire = 8\n\
             history-size = 5000\n\
             scheduler-tick = 2\n\
             validation-interval = 60\n\
             validation-retry-interval = 30\n\
             collector-command = \"/usr/bin/collect\"\n\
             collector-args = [\"--quiet\"]\n\
             collector-timeout = 20\n\
             dump-urls = [\"https://example.net/dump.gz\"]\n\
             dump-refresh = 3600\n\
             dump-timeout = 0\n\
             visibility-threshold = 3\n\
             log-level = \"info\"\n\
             log = \"file\"\n\
             log-file = \"foo.log\"",
            Path::new("/test/relyd.conf")
        ).unwrap();
        let config = Config::from_config_file(config).unwrap();
        assert_eq!(config.tal_dir.to_str().unwrap(), "/test/taldir");
        assert_eq!(
            config.data_file.to_str().unwrap(), "/var/lib/relyd/data.json"
        );
        assert_eq!(
            config.rtr_listen,
            vec![
                SocketAddr::from_str("[2001:db8::4]:323").unwrap(),
                SocketAddr::from_str("192.0.2.4:323").unwrap(),
            ]
        );
        assert_eq!(
            config.http_listen,
            vec![SocketAddr::from_str("192.0.2.4:8080").unwrap()]
        );
        assert!(config.rtr_no_notify);
        assert!(config.rtr_keep_open_on_error);
        assert_eq!(config.refresh, Duration::from_secs(6));
        assert_eq!(config.retry, Duration::from_secs(7));
        assert_eq!(config.expire, Duration::from_secs(8));
        assert_eq!(config.history_size, 5000);
        assert_eq!(config.scheduler_tick, Duration::from_secs(2));
        assert_eq!(config.validation_interval, Duration::from_secs(60));
        assert_eq!(config.validation_retry_interval(), Duration::from_secs(30));
        assert_eq!(config.collector_command, "/usr/bin/collect");
        assert_eq!(config.collector_args, vec![String::from("--quiet")]);
        assert_eq!(config.collector_timeout, Duration::from_secs(20));
        assert_eq!(config.dump_urls, vec!["https://example.net/dump.gz"]);
        assert_eq!(config.dump_refresh, Duration::from_secs(3600));
        assert_eq!(config.dump_timeout, None);
        assert_eq!(config.visibility_threshold, 3);
        assert_eq!(config.log_level, LevelFilter::Info);
        assert_eq!(
            config.log_target,
            LogTarget::File(PathBuf::from("/test/foo.log"))
        );
    }

    #[test]
    #[cfg(unix)]
    fn minimal_config_file() {
        let default = get_default_config();
        let config = ConfigFile::parse(
            "tal-dir = \"taldir\"",
            Path::new("/test/relyd.conf")
        ).unwrap();
        let config = Config::from_config_file(config).unwrap();
        assert_eq!(config.tal_dir.to_str().unwrap(), "/test/taldir");
        assert_eq!(config.data_file, default.data_file);
        assert_eq!(config.rtr_listen, default.rtr_listen);
        assert_eq!(config.validation_retry_interval, None);
        assert_eq!(config.dump_timeout, DEFAULT_DUMP_TIMEOUT);
        assert_eq!(config.log_target, LogTarget::default());
    }

    #[test]
    fn bad_config_file() {
        let config = ConfigFile::parse(
            "tal-dir = 12", Path::new("/test/relyd.conf")
        ).unwrap();
        assert!(Config::from_config_file(config).is_err());
        let config = ConfigFile::parse(
            "repository-dir = \"bla\"", Path::new("/test/relyd.conf")
        ).unwrap();
        assert!(Config::from_config_file(config).is_err());
        let config = ConfigFile::parse(
            "refresh = -1", Path::new("/test/relyd.conf")
        ).unwrap();
        assert!(Config::from_config_file(config).is_err());
        let config = ConfigFile::parse(
            "rtr-listen = [\"127.0.0.1:0\"]", Path::new("/test/relyd.conf")
        ).unwrap();
        assert!(Config::from_config_file(config).is_err());
        assert!(
            ConfigFile::parse("[[", Path::new("/test/relyd.conf")).is_err()
        );
    }

    #[test]
    fn read_your_own_config() {
        let mut out_config = get_default_config();
        out_config.validation_retry_interval = Some(Duration::from_secs(17));
        out_config.collector_args = vec!["-x".into()];
        let out_file = format!("{}", out_config.to_toml());
        let in_file = ConfigFile::parse(
            &out_file, Path::new("/test/relyd.conf")
        ).unwrap();
        let in_config = Config::from_config_file(in_file).unwrap();
        assert_eq!(out_config, in_config);
    }

    #[test]
    #[cfg(unix)]
    fn basic_args() {
        let config = process_basic_args(&[
            "relyd", "-b", "/base", "-t", "tals",
            "--collector-command", "collect",
            "--collector-arg=--fast", "--collector-arg", "verbose",
            "--syslog", "--syslog-facility", "auth"
        ]);
        assert_eq!(config.tal_dir, Path::new("/test/tals"));
        assert_eq!(config.data_file, Path::new("/base/data.json"));
        assert_eq!(config.collector_command, "collect");
        assert_eq!(config.collector_args, vec!["--fast", "verbose"]);
        assert_eq!(config.log_target, LogTarget::Syslog(Facility::LOG_AUTH));
    }

    #[test]
    fn verbosity() {
        let config = process_basic_args(&["relyd"]);
        assert_eq!(config.log_level, LevelFilter::Warn);
        let config = process_basic_args(&["relyd", "-v"]);
        assert_eq!(config.log_level, LevelFilter::Info);
        let config = process_basic_args(&["relyd", "-vv"]);
        assert_eq!(config.log_level, LevelFilter::Debug);
        let config = process_basic_args(&["relyd", "-q"]);
        assert_eq!(config.log_level, LevelFilter::Error);
        let config = process_basic_args(&["relyd", "-qq"]);
        assert_eq!(config.log_level, LevelFilter::Off);
    }

    #[test]
    fn server_args() {
        let config = process_server_args(&[
            "relyd", "--refresh", "7", "--retry", "8", "--expire", "9",
            "--history", "1000",
            "--rtr", "[2001:db8::4]:323",
            "--rtr", "192.0.2.4:323",
            "--http", "192.0.2.4:8080",
            "--no-notify", "--keep-open-on-error",
            "--validation-interval", "100",
            "--dump-url", "https://example.net/a",
            "--dump-timeout", "0",
        ]).unwrap();
        assert_eq!(config.refresh, Duration::from_secs(7));
        assert_eq!(config.retry, Duration::from_secs(8));
        assert_eq!(config.expire, Duration::from_secs(9));
        assert_eq!(config.history_size, 1000);
        assert_eq!(
            config.rtr_listen,
            vec![
                SocketAddr::from_str("[2001:db8::4]:323").unwrap(),
                SocketAddr::from_str("192.0.2.4:323").unwrap(),
            ]
        );
        assert_eq!(
            config.http_listen,
            vec![SocketAddr::from_str("192.0.2.4:8080").unwrap()]
        );
        assert!(config.rtr_no_notify);
        assert!(config.rtr_keep_open_on_error);
        assert_eq!(config.validation_interval, Duration::from_secs(100));
        assert_eq!(
            config.validation_retry_interval(), Duration::from_secs(100)
        );
        assert_eq!(config.dump_urls, vec!["https://example.net/a"]);
        assert_eq!(config.dump_timeout, None);
    }

    #[test]
    fn zero_port_rejected() {
        assert!(process_server_args(&["relyd", "--rtr", "127.0.0.1:0"]).is_err());
    }

    #[test]
    fn check_args() {
        crate::operation::Operation::config_args(
            GlobalArgs::augment_args(Command::new("test"))
        ).debug_assert();
    }
}
