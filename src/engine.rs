//! Wiring the parts of the engine together.
//!
//! The engine state lives in a [`VersionedState`]. Everything that changes
//! it, be it validation or the administrative interface, hands the
//! consequences of a commit to a [`Publisher`] which tells the RTR server
//! about the new version and revalidates the observed route announcements.
//!
//! The RTR server itself only sees the state through a [`StateSource`].

use std::sync::Arc;
use arc_swap::ArcSwap;
use log::error;
use rand::random;
use crate::admin::Admin;
use crate::config::Config;
use crate::dump::DumpSet;
use crate::origins::AddressOrigins;
use crate::rtr::{NotificationServer, NotifySender, PayloadSource, Timing};
use crate::state::{Snapshot, VersionedState};
use crate::store::Store;
use crate::validity::OriginValidator;


//------------ StateSource ---------------------------------------------------

/// Provides the distinct prefix set of the current snapshot.
///
/// Since the distinct prefix set is derived from the snapshot, we keep the
/// set for the most recent version around so it is only computed once per
/// version.
#[derive(Clone, Debug)]
pub struct StateSource {
    state: VersionedState,

    /// The session ID used for this process.
    nonce: u16,

    /// The last computed prefix set.
    cache: Arc<ArcSwap<(u64, Arc<AddressOrigins>)>>,
}

impl StateSource {
    /// Creates a new source with a random session ID.
    pub fn new(state: VersionedState) -> Self {
        Self::with_nonce(state, random())
    }

    pub fn with_nonce(state: VersionedState, nonce: u16) -> Self {
        let snapshot = state.get();
        let cache = (
            snapshot.version(), Arc::new(snapshot.distinct_prefixes())
        );
        StateSource {
            state,
            nonce,
            cache: Arc::new(ArcSwap::from_pointee(cache)),
        }
    }

    pub fn state(&self) -> &VersionedState {
        &self.state
    }

    /// Returns the distinct prefix set for a snapshot.
    pub fn prefixes_for(&self, snapshot: &Snapshot) -> Arc<AddressOrigins> {
        let cached = self.cache.load();
        if cached.0 == snapshot.version() {
            return cached.1.clone()
        }
        let prefixes = Arc::new(snapshot.distinct_prefixes());
        let new = Arc::new((snapshot.version(), prefixes.clone()));
        self.cache.rcu(|cached| {
            if cached.0 > snapshot.version() {
                cached.clone()
            }
            else {
                new.clone()
            }
        });
        prefixes
    }
}

impl PayloadSource for StateSource {
    fn current_version(&self) -> u64 {
        self.state.get().version()
    }

    fn current_prefixes(&self) -> Arc<AddressOrigins> {
        self.prefixes_for(&self.state.get())
    }

    fn current_nonce(&self) -> u16 {
        self.nonce
    }

    fn current(&self) -> (u64, Arc<AddressOrigins>) {
        let snapshot = self.state.get();
        (snapshot.version(), self.prefixes_for(&snapshot))
    }
}


//------------ Publisher -----------------------------------------------------

/// Makes a committed state change known.
///
/// Values can be cloned cheaply.
#[derive(Clone, Debug)]
pub struct Publisher {
    source: StateSource,
    notify: NotifySender,
    validator: OriginValidator,
    dumps: DumpSet,
}

impl Publisher {
    pub fn new(
        source: StateSource,
        notify: NotifySender,
        validator: OriginValidator,
        dumps: DumpSet,
    ) -> Self {
        Publisher { source, notify, validator, dumps }
    }

    pub fn validator(&self) -> &OriginValidator {
        &self.validator
    }

    pub fn dumps(&self) -> &DumpSet {
        &self.dumps
    }

    pub fn notifier(&self) -> &NotifySender {
        &self.notify
    }

    /// Publishes the current snapshot.
    ///
    /// This always uses the snapshot current at the time of the call rather
    /// than the one committed by the caller. Should another commit have
    /// happened in between, publishing the older one would be pointless.
    ///
    /// Routers are notified right away. Revalidating the announcements can
    /// take a while with large dumps and runs on a blocking thread.
    ///
    /// Returns the version that was published.
    pub async fn publish(&self) -> u64 {
        let (version, prefixes) = self.source.current();
        self.notify.notify(version);
        let validator = self.validator.clone();
        let dumps = self.dumps.clone();
        let res = tokio::task::spawn_blocking(move || {
            // The dumps are read after the snapshot so that a refresh
            // publishing after us sees our version or a newer one.
            let (generation, announcements) = dumps.visible_announcements();
            validator.update(version, generation, &announcements, &prefixes);
        }).await;
        if let Err(err) = res {
            error!("Origin validation for version {} failed: {}", version, err);
        }
        version
    }
}


//------------ Engine --------------------------------------------------------

/// All the long-lived parts of the engine.
pub struct Engine {
    state: VersionedState,
    server: NotificationServer<StateSource>,
    publisher: Publisher,
    admin: Admin,
}

impl Engine {
    /// Creates the engine from the initial snapshot.
    pub fn new(config: &Config, initial: Snapshot, store: Store) -> Self {
        let state = VersionedState::new(initial);
        let source = StateSource::new(state.clone());
        let server = NotificationServer::new(
            source.clone(),
            config.history_size,
            Timing::from_config(config),
            !config.rtr_no_notify,
            config.rtr_keep_open_on_error,
        );
        let publisher = Publisher::new(
            source,
            server.notifier(),
            OriginValidator::new(),
            DumpSet::new(config.visibility_threshold),
        );
        let admin = Admin::new(state.clone(), store, publisher.clone());
        Engine { state, server, publisher, admin }
    }

    pub fn state(&self) -> &VersionedState {
        &self.state
    }

    pub fn server(&self) -> &NotificationServer<StateSource> {
        &self.server
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn admin(&self) -> &Admin {
        &self.admin
    }
}


//============ Tests =========================================================
