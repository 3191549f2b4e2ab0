//! The shared state of the engine.
//!
//! All state that is shared between validation, the administrative layer,
//! and the consumers of the validated data lives in a single immutable
//! [`Snapshot`]. The current snapshot is kept by [`VersionedState`] which
//! allows readers to grab it without ever blocking and writers to replace it
//! atomically with a new snapshot derived from the current one.
//!
//! Every committed replacement increases the snapshot’s version by exactly
//! one.

use std::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;
use arc_swap::{ArcSwap, Guard};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::collector::Certificate;
use crate::exceptions::LocalExceptions;
use crate::origins::{AddressOrigins, RouteOrigins};
use crate::tals::TrustAnchorLocator;


//------------ AnchorKey -----------------------------------------------------

/// The key identifying a trust anchor.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AnchorKey(Arc<str>);

impl AnchorKey {
    pub fn new(name: &str) -> Self {
        AnchorKey(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnchorKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ TrustAnchor ---------------------------------------------------

/// A configured trust anchor and its current status.
#[derive(Clone, Debug)]
pub struct TrustAnchor {
    locator: Arc<TrustAnchorLocator>,
    status: AnchorStatus,
}

impl TrustAnchor {
    /// Creates a new trust anchor that is due for validation at `now`.
    pub fn new(locator: TrustAnchorLocator, now: DateTime<Utc>) -> Self {
        TrustAnchor {
            locator: Arc::new(locator),
            status: AnchorStatus::Idle {
                next_update: now,
                last_outcome: None,
            }
        }
    }

    pub fn key(&self) -> AnchorKey {
        AnchorKey::new(self.locator.name())
    }

    pub fn locator(&self) -> &Arc<TrustAnchorLocator> {
        &self.locator
    }

    pub fn status(&self) -> &AnchorStatus {
        &self.status
    }

    fn with_status(&self, status: AnchorStatus) -> Self {
        TrustAnchor { locator: self.locator.clone(), status }
    }
}


//------------ AnchorStatus --------------------------------------------------

/// The status of a trust anchor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AnchorStatus {
    /// Nothing is happening right now.
    Idle {
        /// When the anchor should be validated again.
        next_update: DateTime<Utc>,

        /// The outcome of the last validation if there was one.
        last_outcome: Option<AnchorOutcome>,
    },

    /// A validation is currently running.
    Validating {
        step: ValidationStep,
    },
}

impl AnchorStatus {
    /// Returns whether the anchor is idle and should be validated at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match *self {
            AnchorStatus::Idle { next_update, .. } => next_update <= now,
            AnchorStatus::Validating { .. } => false,
        }
    }

    pub fn is_validating(&self) -> bool {
        matches!(*self, AnchorStatus::Validating { .. })
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AnchorStatus::Idle { ref next_update, ref last_outcome } => {
                match *last_outcome {
                    Some(AnchorOutcome::Success { .. }) => {
                        write!(f, "valid, next update at {}", next_update)
                    }
                    Some(AnchorOutcome::Failure { ref reason }) => {
                        write!(
                            f, "failed ({}), next update at {}",
                            reason, next_update
                        )
                    }
                    None => write!(f, "next update at {}", next_update)
                }
            }
            AnchorStatus::Validating { step } => step.fmt(f)
        }
    }
}


//------------ AnchorOutcome -------------------------------------------------

/// The outcome of a validation run for a trust anchor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AnchorOutcome {
    Success {
        certificate: Certificate,
    },
    Failure {
        reason: String,
    },
}


//------------ ValidationStep ------------------------------------------------

/// The step a running validation of a trust anchor is currently in.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ValidationStep {
    UpdatingCertificate,
    UpdatingRoas,
}

impl fmt::Display for ValidationStep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            ValidationStep::UpdatingCertificate => "Updating certificate",
            ValidationStep::UpdatingRoas => "Updating ROAs",
        })
    }
}


//------------ TrustAnchors --------------------------------------------------

/// The set of all configured trust anchors.
///
/// The set of anchors is fixed when the engine starts. Only the status of
/// the individual anchors changes.
#[derive(Clone, Debug, Default)]
pub struct TrustAnchors {
    anchors: BTreeMap<AnchorKey, TrustAnchor>,
}

impl TrustAnchors {
    pub fn new(
        locators: impl IntoIterator<Item = TrustAnchorLocator>,
        now: DateTime<Utc>,
    ) -> Self {
        TrustAnchors {
            anchors: locators.into_iter().map(|locator| {
                let anchor = TrustAnchor::new(locator, now);
                (anchor.key(), anchor)
            }).collect()
        }
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn get(&self, key: &AnchorKey) -> Option<&TrustAnchor> {
        self.anchors.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrustAnchor> {
        self.anchors.values()
    }

    /// Returns the keys of all anchors due for validation at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<AnchorKey> {
        self.anchors.iter().filter_map(|(key, anchor)| {
            if anchor.status.is_due(now) {
                Some(key.clone())
            }
            else {
                None
            }
        }).collect()
    }

    /// Returns a copy with the status of one anchor replaced.
    ///
    /// Unknown keys are ignored.
    fn with_status(&self, key: &AnchorKey, status: AnchorStatus) -> Self {
        let mut res = self.clone();
        if let Some(anchor) = res.anchors.get_mut(key) {
            *anchor = anchor.with_status(status);
        }
        res
    }
}


//------------ UserPreferences -----------------------------------------------

/// Preferences set by the user through the administrative interface.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    /// Whether the user wants to be alerted about available updates.
    pub update_alert_active: bool,

    /// After how many days data should be considered stale.
    pub max_stale_days: u32,
}

impl Default for UserPreferences {
    fn default() -> Self {
        UserPreferences {
            update_alert_active: true,
            max_stale_days: 0,
        }
    }
}


//------------ Snapshot ------------------------------------------------------

/// An immutable snapshot of the complete engine state.
///
/// New snapshots are created from existing ones through the `with_*`
/// methods and committed via [`VersionedState::update`], which also sets
/// the version.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    exceptions: Arc<LocalExceptions>,
    trust_anchors: TrustAnchors,
    route_origins: BTreeMap<AnchorKey, RouteOrigins>,
    preferences: UserPreferences,
    version: u64,
}

impl Snapshot {
    /// Creates the initial snapshot with version 0.
    pub fn new(
        exceptions: LocalExceptions,
        trust_anchors: TrustAnchors,
        preferences: UserPreferences,
    ) -> Self {
        Snapshot {
            exceptions: Arc::new(exceptions),
            trust_anchors,
            route_origins: BTreeMap::new(),
            preferences,
            version: 0,
        }
    }

    pub fn exceptions(&self) -> &LocalExceptions {
        &self.exceptions
    }

    pub fn trust_anchors(&self) -> &TrustAnchors {
        &self.trust_anchors
    }

    pub fn route_origins(&self, key: &AnchorKey) -> Option<&RouteOrigins> {
        self.route_origins.get(key)
    }

    pub fn preferences(&self) -> UserPreferences {
        self.preferences
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns the distinct set of route origins for this snapshot.
    ///
    /// This is recomputed each time it is called.
    pub fn distinct_prefixes(&self) -> AddressOrigins {
        AddressOrigins::from_route_origins(
            self.route_origins.values(), &self.exceptions
        )
    }

    /// Claims an anchor for validation.
    ///
    /// Returns a snapshot with the anchor’s status changed to validating the
    /// certificate if the anchor is idle and due at `now`. Returns `None`
    /// otherwise.
    pub fn start_validation(
        &self, key: &AnchorKey, now: DateTime<Utc>
    ) -> Option<Self> {
        if !self.trust_anchors.get(key)?.status().is_due(now) {
            return None
        }
        Some(self.with_anchor_status(
            key,
            AnchorStatus::Validating {
                step: ValidationStep::UpdatingCertificate
            }
        ))
    }

    pub fn with_anchor_status(
        &self, key: &AnchorKey, status: AnchorStatus
    ) -> Self {
        Snapshot {
            trust_anchors: self.trust_anchors.with_status(key, status),
            .. self.clone()
        }
    }

    /// Replaces the route origins of an anchor and sets its status.
    pub fn with_route_origins(
        &self, key: &AnchorKey, origins: RouteOrigins, status: AnchorStatus
    ) -> Self {
        let mut route_origins = self.route_origins.clone();
        route_origins.insert(key.clone(), origins);
        Snapshot {
            trust_anchors: self.trust_anchors.with_status(key, status),
            route_origins,
            .. self.clone()
        }
    }

    /// Returns a copy with the exceptions modified by `op`.
    pub fn with_exceptions(
        &self, op: impl FnOnce(&mut LocalExceptions)
    ) -> Self {
        let mut exceptions = LocalExceptions::clone(&self.exceptions);
        op(&mut exceptions);
        Snapshot {
            exceptions: Arc::new(exceptions),
            .. self.clone()
        }
    }

    pub fn with_preferences(&self, preferences: UserPreferences) -> Self {
        Snapshot { preferences, .. self.clone() }
    }
}


//------------ VersionedState ------------------------------------------------

/// The current snapshot of the engine state.
///
/// Values of this type can be cloned cheaply. All clones refer to the same
/// state.
#[derive(Clone, Debug)]
pub struct VersionedState {
    current: Arc<ArcSwap<Snapshot>>,
}

impl VersionedState {
    pub fn new(initial: Snapshot) -> Self {
        VersionedState {
            current: Arc::new(ArcSwap::from_pointee(initial))
        }
    }

    /// Returns the current snapshot.
    pub fn get(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Atomically replaces the current snapshot.
    ///
    /// The new snapshot is created by `op` from the current one. If another
    /// commit happens while `op` is running, `op` is called again with the
    /// newer snapshot, so it must not have side effects. The version of the
    /// new snapshot is always the version of the snapshot `op` was given
    /// plus one.
    ///
    /// Returns the committed snapshot.
    pub fn update<F>(&self, mut op: F) -> Arc<Snapshot>
    where F: FnMut(&Snapshot) -> Snapshot {
        let mut current = self.current.load_full();
        loop {
            let next = op(&current);
            match self.compare_and_swap(&current, next) {
                Ok(next) => return next,
                Err(newer) => current = newer,
            }
        }
    }

    /// Atomically replaces the current snapshot if `op` wants to.
    ///
    /// Works like [`update`][Self::update] except that if `op` returns
    /// `None`, nothing is committed, the version stays the same, and the
    /// method returns `None`.
    pub fn try_update<F>(&self, mut op: F) -> Option<Arc<Snapshot>>
    where F: FnMut(&Snapshot) -> Option<Snapshot> {
        let mut current = self.current.load_full();
        loop {
            let next = op(&current)?;
            match self.compare_and_swap(&current, next) {
                Ok(next) => return Some(next),
                Err(newer) => current = newer,
            }
        }
    }

    /// Commits `next` if `current` is still the current snapshot.
    ///
    /// Returns the committed snapshot on success or the snapshot that is
    /// current instead on failure.
    fn compare_and_swap(
        &self, current: &Arc<Snapshot>, mut next: Snapshot
    ) -> Result<Arc<Snapshot>, Arc<Snapshot>> {
        next.version = current.version + 1;
        let next = Arc::new(next);
        let prev = self.current.compare_and_swap(current, next.clone());
        if Arc::ptr_eq(&*prev, current) {
            Ok(next)
        }
        else {
            Err(Guard::into_inner(prev))
        }
    }
}


//============ Tests =========================================================
