//! Administrative changes to the state.
//!
//! The web interface through which users maintain filters, whitelist
//! entries, and preferences lives elsewhere. It calls into [`Admin`] which
//! commits each change, writes it to the data file, and publishes it.

use std::{fmt, io};
use std::sync::Arc;
use log::{error, info};
use crate::engine::Publisher;
use crate::exceptions::{LocalExceptions, PrefixFilter};
use crate::origins::AddressOrigin;
use crate::state::{Snapshot, UserPreferences, VersionedState};
use crate::store::Store;


//------------ Admin ---------------------------------------------------------

/// The administrative operations.
///
/// Values can be cloned cheaply.
#[derive(Clone, Debug)]
pub struct Admin {
    state: VersionedState,
    store: Arc<Store>,
    publisher: Publisher,
}

impl Admin {
    pub fn new(
        state: VersionedState, store: Store, publisher: Publisher
    ) -> Self {
        Admin { state, store: Arc::new(store), publisher }
    }

    /// Adds a filter.
    ///
    /// Adding a filter that is already present still results in a new
    /// version.
    pub async fn add_filter(
        &self, filter: PrefixFilter
    ) -> Result<Arc<Snapshot>, AdminError> {
        info!("Adding filter {}.", filter);
        self.change_exceptions(|exceptions| {
            exceptions.add_filter(filter);
        }).await
    }

    pub async fn remove_filter(
        &self, filter: PrefixFilter
    ) -> Result<Arc<Snapshot>, AdminError> {
        info!("Removing filter {}.", filter);
        self.change_exceptions(|exceptions| {
            exceptions.remove_filter(&filter);
        }).await
    }

    pub async fn add_whitelist_entry(
        &self, entry: AddressOrigin
    ) -> Result<Arc<Snapshot>, AdminError> {
        info!("Adding whitelist entry {}.", entry);
        self.change_exceptions(|exceptions| {
            exceptions.add_whitelist_entry(entry);
        }).await
    }

    pub async fn remove_whitelist_entry(
        &self, entry: AddressOrigin
    ) -> Result<Arc<Snapshot>, AdminError> {
        info!("Removing whitelist entry {}.", entry);
        self.change_exceptions(|exceptions| {
            exceptions.remove_whitelist_entry(&entry);
        }).await
    }

    pub async fn update_preferences(
        &self, preferences: UserPreferences
    ) -> Result<Arc<Snapshot>, AdminError> {
        self.commit(|snapshot| snapshot.with_preferences(preferences)).await
    }

    async fn change_exceptions(
        &self, op: impl Fn(&mut LocalExceptions)
    ) -> Result<Arc<Snapshot>, AdminError> {
        self.commit(|snapshot| snapshot.with_exceptions(&op)).await
    }

    /// Commits a change, saves, and publishes the result.
    ///
    /// The result is published even if saving fails since the state has
    /// changed regardless.
    async fn commit(
        &self, op: impl FnMut(&Snapshot) -> Snapshot
    ) -> Result<Arc<Snapshot>, AdminError> {
        let snapshot = self.state.update(op);
        let saved = self.store.save(&snapshot);
        self.publisher.publish().await;
        match saved {
            Ok(()) => Ok(snapshot),
            Err(error) => {
                error!(
                    "Failed to write data file {}: {}",
                    self.store.path().display(), error
                );
                Err(AdminError::Persist { snapshot, error })
            }
        }
    }
}


//------------ AdminError ----------------------------------------------------

/// An administrative operation did not fully succeed.
#[derive(Debug)]
pub enum AdminError {
    /// The change was committed but could not be written to disk.
    Persist {
        snapshot: Arc<Snapshot>,
        error: io::Error,
    },
}

impl AdminError {
    /// Returns the snapshot that was committed regardless.
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        match *self {
            AdminError::Persist { ref snapshot, .. } => snapshot,
        }
    }
}

impl fmt::Display for AdminError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AdminError::Persist { ref snapshot, ref error } => {
                write!(
                    f, "version {} committed but not saved: {}",
                    snapshot.version(), error
                )
            }
        }
    }
}

impl std::error::Error for AdminError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            AdminError::Persist { ref error, .. } => Some(error),
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use crate::origins::RouteOrigins;
    use crate::origins::test::origin;
    use crate::state::{AnchorKey, AnchorStatus};
    use crate::state::test::snapshot;
    use crate::store::PersistedState;
    use crate::engine::test::publisher_for;

    fn setup(store: Store) -> (VersionedState, Admin) {
        let state = VersionedState::new(snapshot(&["a"], Utc::now()));
        let origins: RouteOrigins = vec![
            origin(65000, "10.0.0.0/24", 24),
            origin(65001, "10.1.0.0/24", 24),
        ].into_iter().collect();
        state.update(|snapshot| {
            snapshot.with_route_origins(
                &AnchorKey::new("a"), origins.clone(),
                AnchorStatus::Idle {
                    next_update: Utc::now(), last_outcome: None
                }
            )
        });
        let admin = Admin::new(
            state.clone(), store, publisher_for(state.clone())
        );
        (state, admin)
    }

    #[tokio::test]
    async fn filter_and_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("data.json");
        let (state, admin) = setup(Store::new(&store_path));
        let mut rx = admin.publisher.notifier().subscribe();
        let filtered = origin(65000, "10.0.0.0/24", 24);

        let filter = PrefixFilter::exact(&filtered);
        let snapshot = admin.add_filter(filter).await.unwrap();
        assert_eq!(snapshot.version(), 2);
        assert_eq!(rx.recv().await, 2);
        let prefixes = snapshot.distinct_prefixes();
        assert_eq!(prefixes.len(), 1);
        assert!(!prefixes.contains(&filtered));

        // Adding it again still bumps the version.
        let snapshot = admin.add_filter(filter).await.unwrap();
        assert_eq!(snapshot.version(), 3);
        assert_eq!(snapshot.exceptions().filters().len(), 1);

        // The whitelist re-admits the filtered entry.
        let snapshot = admin.add_whitelist_entry(filtered).await.unwrap();
        assert!(snapshot.distinct_prefixes().contains(&filtered));
        assert_eq!(snapshot.distinct_prefixes().len(), 2);

        let snapshot = admin.remove_whitelist_entry(filtered).await.unwrap();
        assert!(!snapshot.distinct_prefixes().contains(&filtered));
        let snapshot = admin.remove_filter(filter).await.unwrap();
        assert!(snapshot.distinct_prefixes().contains(&filtered));
        assert_eq!(state.get().version(), 6);

        let stored = Store::new(&store_path).load().unwrap();
        assert_eq!(stored, PersistedState::from_snapshot(&state.get()));
        assert_eq!(admin.publisher.validator().current().version(), 6);
    }

    #[tokio::test]
    async fn preferences() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("data.json");
        let (state, admin) = setup(Store::new(&store_path));
        let prefs = UserPreferences {
            update_alert_active: false, max_stale_days: 7
        };
        admin.update_preferences(prefs).await.unwrap();
        assert_eq!(state.get().preferences(), prefs);
        assert_eq!(
            Store::new(&store_path).load().unwrap().user_preferences, prefs
        );
    }

    #[tokio::test]
    async fn persist_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (state, admin) = setup(
            Store::new(dir.path().join("missing").join("data.json"))
        );
        let entry = origin(65010, "192.0.2.0/24", 24);
        let err = admin.add_whitelist_entry(entry).await.unwrap_err();
        assert!(matches!(err, AdminError::Persist { .. }));
        assert_eq!(err.snapshot().version(), 2);

        // The change has happened anyway.
        assert_eq!(state.get().version(), 2);
        assert!(state.get().distinct_prefixes().contains(&entry));
        assert_eq!(admin.publisher.validator().current().version(), 2);
    }
}
