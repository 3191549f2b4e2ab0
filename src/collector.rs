//! Retrieving certificates and route origins for trust anchors.
//!
//! The actual RPKI work, i.e., following a trust anchor locator to its
//! certificate and validating everything published below it, is not done by
//! this crate. Instead, validation talks to two collaborators: a
//! [`CertificateExtractor`] that turns a trust anchor locator into a
//! certificate, and a [`StatementFetcher`] that produces the route origins
//! validated under that certificate.
//!
//! [`CommandCollector`] implements both by running an external command.

use std::{fmt, process};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::time::timeout;
use crate::config::Config;
use crate::origins::{AddressOrigin, RouteOrigins};
use crate::tals::TrustAnchorLocator;


//------------ Certificate ---------------------------------------------------

/// A reference to the certificate of a trust anchor.
///
/// We only keep the URI the certificate was retrieved from.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Certificate {
    uri: Arc<str>,
}

impl Certificate {
    pub fn new(uri: &str) -> Self {
        Certificate { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.uri)
    }
}


//------------ CertificateExtractor ------------------------------------------

/// A type that can retrieve the certificate for a trust anchor locator.
#[async_trait]
pub trait CertificateExtractor: Send + Sync {
    async fn extract_certificate(
        &self, tal: &TrustAnchorLocator
    ) -> Result<Certificate, AnchorFetchError>;
}


//------------ StatementFetcher ----------------------------------------------

/// A type that can retrieve the validated route origins of a trust anchor.
#[async_trait]
pub trait StatementFetcher: Send + Sync {
    async fn fetch_statements(
        &self, tal: &TrustAnchorLocator, cert: &Certificate
    ) -> Result<RouteOrigins, AnchorFetchError>;
}


//------------ CommandCollector ----------------------------------------------

/// A collector running an external command.
///
/// The command is run with the additional arguments from the config
/// followed by either `certificate <tal-path>` or
/// `roas <tal-path> <certificate-uri>`. In the first case, the first line of
/// the output is the certificate URI. In the second case, the output is a
/// JSON object with a `roas` member containing a list of route origins.
#[derive(Clone, Debug)]
pub struct CommandCollector {
    /// The actual command.
    command: String,

    /// The list of additional arguments.
    args: Vec<String>,

    /// How long to wait for the command before giving up.
    timeout: Duration,
}

impl CommandCollector {
    pub fn new(
        command: impl Into<String>, args: Vec<String>, timeout: Duration
    ) -> Self {
        CommandCollector { command: command.into(), args, timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.collector_command.clone(),
            config.collector_args.clone(),
            config.collector_timeout,
        )
    }

    /// Runs the command with the given arguments and returns stdout.
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, String> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
           .args(args)
           .stdin(process::Stdio::null())
           .kill_on_drop(true);
        debug!("Running command {:?}", cmd);
        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(format!(
                    "failed to run '{}': {}", self.command, err
                ))
            }
            Err(_) => {
                return Err(format!(
                    "'{}' timed out after {} seconds",
                    self.command, self.timeout.as_secs()
                ))
            }
        };
        if !output.status.success() {
            return Err(format!(
                "'{}' failed with {}: {}",
                self.command, output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
        Ok(output.stdout)
    }

    fn tal_path(tal: &TrustAnchorLocator) -> Result<&str, String> {
        tal.path().to_str().ok_or_else(|| {
            format!("TAL path {} is not valid UTF-8", tal.path().display())
        })
    }
}

#[async_trait]
impl CertificateExtractor for CommandCollector {
    async fn extract_certificate(
        &self, tal: &TrustAnchorLocator
    ) -> Result<Certificate, AnchorFetchError> {
        let path = Self::tal_path(tal).map_err(AnchorFetchError::Certificate)?;
        let stdout = self.run(
            &["certificate", path]
        ).await.map_err(AnchorFetchError::Certificate)?;
        let stdout = String::from_utf8_lossy(&stdout);
        match stdout.lines().next().map(str::trim) {
            Some(uri) if !uri.is_empty() => Ok(Certificate::new(uri)),
            _ => Err(AnchorFetchError::Certificate(
                "command returned no certificate".into()
            ))
        }
    }
}

#[async_trait]
impl StatementFetcher for CommandCollector {
    async fn fetch_statements(
        &self, tal: &TrustAnchorLocator, cert: &Certificate
    ) -> Result<RouteOrigins, AnchorFetchError> {
        #[derive(Deserialize)]
        struct Output {
            roas: Vec<AddressOrigin>,
        }

        let path = Self::tal_path(tal).map_err(AnchorFetchError::Statements)?;
        let stdout = self.run(
            &["roas", path, cert.uri()]
        ).await.map_err(AnchorFetchError::Statements)?;
        let output: Output = serde_json::from_slice(&stdout).map_err(|err| {
            AnchorFetchError::Statements(
                format!("invalid output from '{}': {}", self.command, err)
            )
        })?;
        Ok(output.roas.into_iter().collect())
    }
}


//------------ AnchorFetchError ----------------------------------------------

/// Retrieving data for a trust anchor has failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AnchorFetchError {
    /// The certificate could not be extracted.
    Certificate(String),

    /// The route origins could not be fetched.
    Statements(String),
}

impl AnchorFetchError {
    pub fn reason(&self) -> &str {
        match *self {
            AnchorFetchError::Certificate(ref reason) => reason,
            AnchorFetchError::Statements(ref reason) => reason,
        }
    }
}

impl fmt::Display for AnchorFetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AnchorFetchError::Certificate(ref reason) => {
                write!(f, "failed to update certificate: {}", reason)
            }
            AnchorFetchError::Statements(ref reason) => {
                write!(f, "failed to update ROAs: {}", reason)
            }
        }
    }
}

impl std::error::Error for AnchorFetchError { }


//============ Tests =========================================================
