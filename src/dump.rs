//! Route visibility dumps.
//!
//! The route announcements checked by origin validation are taken from
//! dumps of what route collectors currently see. Each dump is a list of
//! origin AS, prefix, and the number of collector peers that see the route.
//! Only routes seen by at least a configured number of peers are
//! considered.
//!
//! The dumps are kept in a [`DumpSet`] and periodically refreshed by the
//! [`DumpRefreshScheduler`].

use std::{fmt, io};
use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use log::{debug, error, info, warn};
use reqwest::{Client, ClientBuilder};
use crate::config::Config;
use crate::engine::Publisher;
use crate::error::Failed;
use crate::origins::{AddressPrefix, Asn};
use crate::process::Shutdown;
use crate::validity::Announcement;


//------------ Configuration Constants ---------------------------------------

const USER_AGENT: &str = concat!("relyd/", env!("CARGO_PKG_VERSION"));


//------------ DumpEntry -----------------------------------------------------

/// A single route as seen by the route collectors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DumpEntry {
    asn: Asn,
    prefix: AddressPrefix,

    /// The number of peers that see this route.
    visibility: u64,
}

impl DumpEntry {
    pub fn new(asn: Asn, prefix: AddressPrefix, visibility: u64) -> Self {
        DumpEntry { asn, prefix, visibility }
    }

    pub fn asn(&self) -> Asn {
        self.asn
    }

    pub fn prefix(&self) -> AddressPrefix {
        self.prefix
    }

    pub fn visibility(&self) -> u64 {
        self.visibility
    }

    pub fn announcement(&self) -> Announcement {
        Announcement::new(self.asn, self.prefix)
    }

    /// Parses a data line of a RIS whois dump.
    ///
    /// Returns `None` for lines that don’t describe a single origin route.
    fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let asn = fields.next()?.trim();
        let prefix = fields.next()?.trim();
        let visibility = fields.next()?.trim();
        if asn.starts_with('{') {
            // AS set origins can’t be validated.
            return None
        }
        Some(DumpEntry {
            asn: asn.parse().ok()?,
            prefix: prefix.parse().ok()?,
            visibility: visibility.parse().ok()?,
        })
    }
}


//------------ Dump ----------------------------------------------------------

/// The content of a single dump.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dump {
    entries: Vec<DumpEntry>,
}

impl Dump {
    /// Parses a dump in RIS whois format.
    ///
    /// Lines starting with `%` are comments. All other lines contain the
    /// origin AS, the prefix, and the visibility separated by tabs. Lines
    /// that can’t be parsed are skipped.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, io::Error> {
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('%') {
                continue
            }
            match DumpEntry::parse_line(line) {
                Some(entry) => entries.push(entry),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!("Skipped {} unusable lines in dump.", skipped);
        }
        Ok(Dump { entries })
    }

    /// Parses a dump from its raw, possibly gzipped, octets.
    pub fn from_octets(data: &[u8], gzipped: bool) -> Result<Self, io::Error> {
        if gzipped {
            Self::parse(io::BufReader::new(MultiGzDecoder::new(data)))
        }
        else {
            Self::parse(data)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DumpEntry> {
        self.entries.iter()
    }
}

impl FromIterator<DumpEntry> for Dump {
    fn from_iter<I: IntoIterator<Item = DumpEntry>>(iter: I) -> Self {
        Dump { entries: iter.into_iter().collect() }
    }
}


//------------ DumpFetcher ---------------------------------------------------

/// A type that can retrieve a dump.
#[async_trait]
pub trait DumpFetcher: Send + Sync {
    async fn fetch_dump(&self, url: &str) -> Result<Dump, DumpRefreshError>;
}


//------------ HttpDumpFetcher -----------------------------------------------

/// Fetches dumps via HTTP.
///
/// Dumps whose URL ends in `.gz` are gunzipped.
#[derive(Clone, Debug)]
pub struct HttpDumpFetcher {
    client: Client,
}

impl HttpDumpFetcher {
    pub fn new(config: &Config) -> Result<Self, Failed> {
        let mut builder = ClientBuilder::new().use_rustls_tls();
        builder = builder.user_agent(USER_AGENT);
        if let Some(timeout) = config.dump_timeout {
            builder = builder.timeout(timeout);
        }
        match builder.build() {
            Ok(client) => Ok(HttpDumpFetcher { client }),
            Err(err) => {
                error!("Failed to initialize HTTP client: {}.", err);
                Err(Failed)
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Bytes, reqwest::Error> {
        self.client.get(url).send().await?.error_for_status()?.bytes().await
    }
}

#[async_trait]
impl DumpFetcher for HttpDumpFetcher {
    async fn fetch_dump(&self, url: &str) -> Result<Dump, DumpRefreshError> {
        let data = self.download(url).await.map_err(|err| {
            DumpRefreshError::new(url, err.to_string())
        })?;
        let gzipped = url.ends_with(".gz");

        // Dumps have a few million lines. Don’t hold up the runtime.
        let res = tokio::task::spawn_blocking(move || {
            Dump::from_octets(&data, gzipped)
        }).await;
        match res {
            Ok(Ok(dump)) => Ok(dump),
            Ok(Err(err)) => Err(DumpRefreshError::new(url, err.to_string())),
            Err(err) => Err(DumpRefreshError::new(url, err.to_string())),
        }
    }
}


//------------ DumpSet -------------------------------------------------------

/// The current dumps of all sources.
///
/// Values can be cloned cheaply. All clones share the same dumps. Only the
/// [`DumpRefreshScheduler`] replaces dumps.
///
/// Every replacement increases the generation of the set. It tells
/// results computed from different dumps apart.
#[derive(Clone, Debug)]
pub struct DumpSet {
    current: Arc<ArcSwap<Dumps>>,

    /// The minimum visibility for a route to be considered announced.
    threshold: u64,
}

#[derive(Clone, Debug, Default)]
struct Dumps {
    generation: u64,
    dumps: BTreeMap<String, Arc<Dump>>,
}

impl DumpSet {
    pub fn new(threshold: u64) -> Self {
        DumpSet {
            current: Default::default(),
            threshold,
        }
    }

    /// Returns the current dump for the source with the given URL.
    pub fn get(&self, url: &str) -> Option<Arc<Dump>> {
        self.current.load().dumps.get(url).cloned()
    }

    /// Returns the current generation.
    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Replaces the dump for the given source.
    pub fn replace(&self, url: &str, dump: Dump) {
        let dump = Arc::new(dump);
        self.current.rcu(|current| {
            let mut dumps = current.dumps.clone();
            dumps.insert(url.into(), dump.clone());
            Dumps { generation: current.generation + 1, dumps }
        });
    }

    /// Returns all sufficiently visible announcements from all dumps.
    ///
    /// The returned list is ordered and contains each announcement only
    /// once.
    pub fn announcements(&self) -> Vec<Announcement> {
        self.visible_announcements().1
    }

    /// Returns the generation and the visible announcements of that
    /// generation.
    pub fn visible_announcements(&self) -> (u64, Vec<Announcement>) {
        let current = self.current.load();
        let res: BTreeSet<_> = current.dumps.values().flat_map(|dump| {
            dump.iter().filter_map(|entry| {
                if entry.visibility >= self.threshold {
                    Some(entry.announcement())
                }
                else {
                    None
                }
            })
        }).collect();
        (current.generation, res.into_iter().collect())
    }
}


//------------ DumpRefreshScheduler ------------------------------------------

/// Periodically refreshes all dumps and revalidates the announcements.
pub struct DumpRefreshScheduler<F> {
    fetcher: F,
    urls: Vec<String>,
    dumps: DumpSet,
    refresh: Duration,
    publisher: Publisher,
}

impl<F: DumpFetcher> DumpRefreshScheduler<F> {
    pub fn new(
        fetcher: F,
        urls: Vec<String>,
        dumps: DumpSet,
        refresh: Duration,
        publisher: Publisher,
    ) -> Self {
        DumpRefreshScheduler { fetcher, urls, dumps, refresh, publisher }
    }

    /// Refreshes all sources once.
    ///
    /// A source that fails keeps its previous dump. Returns the errors of
    /// all failed sources.
    pub async fn refresh_all(&self) -> Vec<DumpRefreshError> {
        let results = futures::future::join_all(
            self.urls.iter().map(|url| self.fetcher.fetch_dump(url))
        ).await;
        let mut errors = Vec::new();
        for (url, res) in self.urls.iter().zip(results) {
            match res {
                Ok(dump) => {
                    info!("Dump {}: {} entries.", url, dump.len());
                    self.dumps.replace(url, dump);
                }
                Err(err) => {
                    warn!("{}. Keeping previous data.", err);
                    errors.push(err);
                }
            }
        }
        errors
    }

    /// Runs the refresh loop until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) {
        loop {
            self.refresh_all().await;
            self.publisher.publish().await;
            tokio::select! {
                _ = tokio::time::sleep(self.refresh) => { }
                _ = shutdown.wait() => {
                    debug!("Dump refresh: shutting down.");
                    return
                }
            }
        }
    }
}


//------------ DumpRefreshError ----------------------------------------------

/// Refreshing a dump has failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DumpRefreshError {
    url: String,
    reason: String,
}

impl DumpRefreshError {
    pub fn new(url: &str, reason: impl Into<String>) -> Self {
        DumpRefreshError { url: url.into(), reason: reason.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for DumpRefreshError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "failed to refresh dump {}: {}", self.url, self.reason)
    }
}

impl std::error::Error for DumpRefreshError { }


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use crate::engine::test::publisher;

    const DUMP: &str = "\
% This file contains route announcements seen by the RIS collectors.
%
% Some more explanation.

65000\t10.0.0.0/24\t300
65001\t10.1.0.0/16\t3
{65002,65003}\t10.2.0.0/16\t200
65004\tbogus\t200
65005\t10.5.0.0/16
65006\t2001:db8::/32\t150
";

    fn entry(asn: u32, prefix: &str, visibility: u64) -> DumpEntry {
        DumpEntry::new(asn.into(), prefix.parse().unwrap(), visibility)
    }

    #[test]
    fn parse_ris_dump() {
        let dump = Dump::parse(DUMP.as_bytes()).unwrap();
        assert_eq!(
            dump.iter().copied().collect::<Vec<_>>(),
            vec![
                entry(65000, "10.0.0.0/24", 300),
                entry(65001, "10.1.0.0/16", 3),
                entry(65006, "2001:db8::/32", 150),
            ]
        );
    }

    #[test]
    fn parse_gzipped_dump() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(DUMP.as_bytes()).unwrap();
        let data = encoder.finish().unwrap();
        assert_eq!(
            Dump::from_octets(&data, true).unwrap(),
            Dump::parse(DUMP.as_bytes()).unwrap()
        );
        assert!(Dump::from_octets(DUMP.as_bytes(), true).is_err());
    }

    #[test]
    fn announcements_are_filtered_and_deduplicated() {
        let dumps = DumpSet::new(5);
        dumps.replace("v4", vec![
            entry(65000, "10.0.0.0/24", 300),
            entry(65001, "10.1.0.0/16", 3),
        ].into_iter().collect());
        dumps.replace("v6", vec![
            entry(65000, "10.0.0.0/24", 10),
            entry(65006, "2001:db8::/32", 5),
        ].into_iter().collect());
        assert_eq!(
            dumps.announcements(),
            vec![
                entry(65000, "10.0.0.0/24", 0).announcement(),
                entry(65006, "2001:db8::/32", 0).announcement(),
            ]
        );
    }

    /// A fetcher returning pre-configured results.
    #[derive(Default)]
    struct TestFetcher(Mutex<BTreeMap<String, Result<Dump, String>>>);

    impl TestFetcher {
        fn set(&self, url: &str, res: Result<Dump, String>) {
            self.0.lock().unwrap().insert(url.into(), res);
        }
    }

    #[async_trait]
    impl DumpFetcher for TestFetcher {
        async fn fetch_dump(
            &self, url: &str
        ) -> Result<Dump, DumpRefreshError> {
            match self.0.lock().unwrap().get(url) {
                Some(Ok(dump)) => Ok(dump.clone()),
                Some(Err(reason)) => {
                    Err(DumpRefreshError::new(url, reason.as_str()))
                }
                None => Err(DumpRefreshError::new(url, "not found")),
            }
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_dump() {
        let dumps = DumpSet::new(1);
        let fetcher = TestFetcher::default();
        let first = Dump::parse(DUMP.as_bytes()).unwrap();
        fetcher.set("a", Ok(first.clone()));
        fetcher.set("b", Ok(vec![entry(65010, "10.10.0.0/16", 10)]
            .into_iter().collect()));
        let scheduler = DumpRefreshScheduler::new(
            fetcher, vec!["a".into(), "b".into()], dumps.clone(),
            Duration::from_secs(3600), publisher(),
        );
        assert!(scheduler.refresh_all().await.is_empty());
        assert_eq!(dumps.generation(), 2);
        let old_a = dumps.get("a").unwrap();

        let second: Dump = vec![entry(65011, "10.11.0.0/16", 10)]
            .into_iter().collect();
        scheduler.fetcher.set("a", Err("connection refused".into()));
        scheduler.fetcher.set("b", Ok(second.clone()));
        let errors = scheduler.refresh_all().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].url(), "a");
        assert_eq!(dumps.generation(), 3);

        let new_a = dumps.get("a").unwrap();
        assert!(Arc::ptr_eq(&old_a, &new_a));
        assert_eq!(*new_a, first);
        assert_eq!(*dumps.get("b").unwrap(), second);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fetcher = TestFetcher::default();
        fetcher.set("a", Ok(vec![entry(65000, "10.0.0.0/24", 10)]
            .into_iter().collect()));
        let publisher = publisher();
        let dumps = publisher.dumps().clone();
        let validator = publisher.validator().clone();
        let scheduler = DumpRefreshScheduler::new(
            fetcher, vec!["a".into()], dumps.clone(),
            Duration::from_secs(3600), publisher,
        );
        let (tx, shutdown) = crate::process::ShutdownSender::new();
        let task = tokio::spawn(scheduler.run(shutdown));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await.unwrap().unwrap();
        assert_eq!(dumps.get("a").unwrap().len(), 1);
        assert_eq!(validator.current().len(), 1);
        assert_eq!(validator.current().dump_generation(), 1);
    }
}
