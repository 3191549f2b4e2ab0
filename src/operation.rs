//! What relyd can do for you.
//!
//! This module implements all the commands users can ask relyd to
//! perform. They are encapsulated in the type [`Operation`] which can
//! determine the command from the command line argumments and then execute
//! it.

use std::sync::Arc;
use chrono::Utc;
use clap::ArgMatches;
use log::{error, info};
use crate::collector::CommandCollector;
use crate::config::Config;
use crate::dump::{DumpRefreshScheduler, HttpDumpFetcher};
use crate::engine::{Engine, StateSource};
use crate::error::{ExitError, Failed};
use crate::process::{Process, ShutdownSender};
use crate::rtr::NotificationServer;
use crate::state::{Snapshot, TrustAnchors};
use crate::store::Store;
use crate::tals::TrustAnchorLocator;
use crate::validation::{RetryPolicy, ValidationScheduler, ValidationWorker};

#[cfg(unix)] use tokio::signal::unix::{Signal, SignalKind, signal};


//------------ Operation -----------------------------------------------------

/// The command to execute.
///
/// You can create a value from the command line arguments. First, you add
/// all necessary sub-commands and arguments to a clap `Command` via
/// [`config_args`][Self::config_args] and then process the argument matches
/// into a value in [`from_arg_matches`][Self::from_arg_matches]. Finally,
/// you can execute the created command through the [`run`][Self::run]
/// method.
pub enum Operation {
    Server(Server),
    PrintConfig(PrintConfig),
}

impl Operation {
    /// Prepares everything.
    ///
    /// Call this before doing anything else.
    pub fn prepare() -> Result<(), Failed> {
        Process::init()
    }

    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        let app = Server::config_args(app);
        PrintConfig::config_args(app)
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        config: &mut Config
    ) -> Result<Self, Failed> {
        Ok(match matches.subcommand() {
            Some(("server", matches)) => {
                Operation::Server(Server::from_arg_matches(matches, config)?)
            }
            Some(("config", matches)) => {
                Operation::PrintConfig(
                    PrintConfig::from_arg_matches(matches, config)?
                )
            }
            _ => {
                error!(
                    "Failed: a command is required.\n\
                     \nCommands are:\
                     \n   server    Start the RTR server and validation\
                     \n   config    Print the configuration\
                     \n\
                     \nSee relyd -h for a usage summary."
                );
                return Err(Failed)
            }
        })
    }

    /// Runs the command.
    pub fn run(self, config: Config) -> Result<(), ExitError> {
        let process = Process::new(config);
        match self {
            Operation::Server(cmd) => cmd.run(process),
            Operation::PrintConfig(cmd) => cmd.run(process),
        }
    }
}


//------------ Server --------------------------------------------------------

/// Run as server.
pub struct Server;

impl Server {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Config::server_args(
                clap::Command::new("server")
                .about("Starts as a server")
                .after_help(AFTER_HELP)
            )
        )
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        config: &mut Config
    ) -> Result<Self, Failed> {
        config.apply_server_arg_matches(matches)?;
        Ok(Server)
    }

    /// Runs the server until it is told to stop.
    pub fn run(self, process: Process) -> Result<(), ExitError> {
        process.switch_logging()?;
        process.create_data_dir()?;
        let config = process.config();

        let locators = TrustAnchorLocator::read_dir(&config.tal_dir)?;
        let store = Store::new(&config.data_file);
        let persisted = store.load()?;
        let engine = Engine::new(
            config,
            Snapshot::new(
                persisted.exceptions,
                TrustAnchors::new(locators, Utc::now()),
                persisted.user_preferences,
            ),
            store,
        );
        if !config.http_listen.is_empty() {
            info!(
                "Administrative interface to be served on {}.",
                config.http_listen.iter().map(ToString::to_string)
                    .collect::<Vec<_>>().join(", ")
            );
        }

        let runtime = process.runtime()?;
        let res: Result<(), Failed> = runtime.block_on(async {
            let listeners = NotificationServer::<StateSource>::bind(
                &config.rtr_listen
            ).await?;
            let fetcher = HttpDumpFetcher::new(config)?;
            let collector = Arc::new(CommandCollector::from_config(config));
            let scheduler = ValidationScheduler::new(
                ValidationWorker::new(
                    engine.state().clone(),
                    collector.clone(),
                    collector,
                    RetryPolicy::from_config(config),
                    engine.publisher().clone(),
                ),
                config.scheduler_tick,
            );
            let dumps = DumpRefreshScheduler::new(
                fetcher,
                config.dump_urls.clone(),
                engine.publisher().dumps().clone(),
                config.dump_refresh,
                engine.publisher().clone(),
            );

            let (tx, shutdown) = ShutdownSender::new();
            let mut rtr = tokio::spawn(
                engine.server().clone().run(listeners, shutdown)
            );
            let validation = tokio::spawn(scheduler.run(tx.subscribe()));
            let dumps = tokio::spawn(dumps.run(tx.subscribe()));

            let mut signal = SignalListener::new()?;
            let res = loop {
                tokio::select! {
                    sig = signal.next() => match sig {
                        UserSignal::Terminate => {
                            info!("Shutting down.");
                            break Ok(())
                        }
                        UserSignal::RotateLog => {
                            if process.rotate_log().is_err() {
                                break Err(Failed)
                            }
                        }
                    },
                    _ = &mut rtr => {
                        error!("RTR server terminated unexpectedly.");
                        break Err(Failed)
                    }
                }
            };

            tx.shutdown();
            // Errors here mean the task panicked which has been reported
            // already.
            let _ = validation.await;
            let _ = dumps.await;
            if !rtr.is_finished() {
                let _ = rtr.await;
            }
            res
        });
        res.map_err(Into::into)
    }
}


//------------ PrintConfig ---------------------------------------------------

/// Print the current configuration.
pub struct PrintConfig;

impl PrintConfig {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(Config::server_args(clap::Command::new("config")
            .about("Prints the current config and exits")
            .after_help(AFTER_HELP)
        ))
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        config: &mut Config,
    ) -> Result<Self, Failed> {
        config.apply_server_arg_matches(matches)?;
        Ok(PrintConfig)
    }

    /// Prints the current configuration to stdout and exits.
    fn run(self, process: Process) -> Result<(), ExitError> {
        println!("{}", process.config());
        Ok(())
    }
}


//------------ SignalListener ------------------------------------------------

#[allow(dead_code)]
enum UserSignal {
    Terminate,
    RotateLog,
}

/// Waits for the user telling us to quit or rotate the log.
#[cfg(unix)]
struct SignalListener {
    int: Signal,
    term: Signal,
    usr1: Signal,
}

#[cfg(unix)]
impl SignalListener {
    pub fn new() -> Result<Self, Failed> {
        Ok(SignalListener {
            int: Self::attach(SignalKind::interrupt(), "INT")?,
            term: Self::attach(SignalKind::terminate(), "TERM")?,
            usr1: Self::attach(SignalKind::user_defined1(), "USR1")?,
        })
    }

    fn attach(kind: SignalKind, name: &str) -> Result<Signal, Failed> {
        signal(kind).map_err(|err| {
            error!("Attaching to signal {} failed: {}", name, err);
            Failed
        })
    }

    /// Waits for the next thing to do.
    pub async fn next(&mut self) -> UserSignal {
        tokio::select! {
            _ = self.int.recv() => UserSignal::Terminate,
            _ = self.term.recv() => UserSignal::Terminate,
            _ = self.usr1.recv() => UserSignal::RotateLog,
        }
    }
}

#[cfg(not(unix))]
struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub fn new() -> Result<Self, Failed> {
        Ok(SignalListener)
    }

    /// Waits for the next thing to do.
    pub async fn next(&mut self) -> UserSignal {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Listening for Ctrl-C failed: {}", err);
            futures::future::pending::<()>().await;
        }
        UserSignal::Terminate
    }
}


//------------ Constants -----------------------------------------------------

/// The after help message pointing to the main help.
const AFTER_HELP: &str =
    "Additional global options are available. \
    Please consult 'relyd --help' for those.";
