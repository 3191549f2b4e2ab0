//! Managing the process relyd runs in.

use std::fs;
use log::error;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use crate::config::Config;
use crate::error::Failed;
use crate::log::Logger;


//------------ Process -------------------------------------------------------

/// A representation of the process relyd runs in.
///
/// This type provides access to the configuration and the environment in a
/// platform independent way.
pub struct Process {
    config: Config,
}

impl Process {
    /// Prepares the process.
    ///
    /// This starts logging to stderr and must be called before anything
    /// else.
    pub fn init() -> Result<(), Failed> {
        Logger::init()
    }

    pub fn new(config: Config) -> Self {
        Process { config }
    }

    /// Returns a reference to the config.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Switches logging to the configured target.
    pub fn switch_logging(&self) -> Result<(), Failed> {
        Logger::switch_logging(&self.config)
    }

    /// Re-opens the log file if we are logging to a file.
    pub fn rotate_log(&self) -> Result<(), Failed> {
        Logger::rotate_log()
    }
}

/// # Directory Management
///
impl Process {
    /// Creates the directory the data file lives in.
    pub fn create_data_dir(&self) -> Result<(), Failed> {
        let dir = match self.config.data_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => return Ok(())
        };
        if let Err(err) = fs::create_dir_all(dir) {
            error!(
                "Fatal: failed to create data directory {}: {}",
                dir.display(), err
            );
            return Err(Failed)
        }
        Ok(())
    }
}

/// # Tokio Runtime
///
impl Process {
    /// Returns a multi-threaded Tokio runtime.
    pub fn runtime(&self) -> Result<Runtime, Failed> {
        Runtime::new().map_err(|err| {
            error!("Failed to create runtime: {}", err);
            Failed
        })
    }
}


//------------ Shutdown ------------------------------------------------------

/// The receiving side of the shutdown signal.
///
/// Every long-running task holds a clone of this and stops once
/// [`wait`][Self::wait] returns. This happens when shutdown has been
/// requested or when the [`ShutdownSender`] has been dropped.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Waits until shutdown is requested.
    ///
    /// The future is cancel safe and can be used in `select!` loops.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return
            }
            if self.rx.changed().await.is_err() {
                return
            }
        }
    }

    /// Returns whether shutdown has been requested already.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}


//------------ ShutdownSender ------------------------------------------------

/// The sending side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Creates a new signal pair.
    pub fn new() -> (Self, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownSender { tx }, Shutdown { rx })
    }

    /// Returns another receiver for the signal.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown { rx: self.tx.subscribe() }
    }

    /// Tells everyone to shut down.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}


//============ Tests =========================================================
