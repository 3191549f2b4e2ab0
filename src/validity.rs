//! Checking for validity of route announcements.
//!
//! The [`OriginValidator`] keeps the result of classifying all currently
//! observed route announcements against the distinct set of route origins.
//! The result is always recomputed from scratch and swapped in as a whole.
//!
//! A result is computed from two inputs that change independently: the
//! route origins of a snapshot and the announcements of a generation of the
//! route dumps. A stored result is only replaced by one that isn’t older in
//! both.

use std::fmt;
use std::collections::HashMap;
use std::sync::Arc;
use arc_swap::ArcSwap;
use log::{debug, info};
use serde::Serialize;
use crate::origins::{AddressOrigin, AddressOrigins, AddressPrefix, Asn};


//------------ Announcement --------------------------------------------------

/// A route announcement observed in the wild.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize
)]
pub struct Announcement {
    asn: Asn,
    prefix: AddressPrefix,
}

impl Announcement {
    pub fn new(asn: Asn, prefix: AddressPrefix) -> Self {
        Announcement { asn, prefix }
    }

    pub fn asn(&self) -> Asn {
        self.asn
    }

    pub fn prefix(&self) -> AddressPrefix {
        self.prefix
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} => {}", self.prefix, self.asn)
    }
}


//------------ RouteValidity -------------------------------------------------

/// Information about the validity of a route announcement.
#[derive(Clone, Debug)]
pub struct RouteValidity<'a> {
    /// The route announcement.
    announcement: Announcement,

    /// Covering entries with the same origin and a suitable length.
    matched: Vec<&'a AddressOrigin>,

    /// Covering entries with a different origin.
    bad_asn: Vec<&'a AddressOrigin>,

    /// Covering entries with the same origin but a too short max length.
    bad_len: Vec<&'a AddressOrigin>,
}

impl<'a> RouteValidity<'a> {
    /// Determines validity from all entries covering the announcement.
    ///
    /// Entries in `covering` that don’t actually cover the announced
    /// prefix are skipped.
    pub fn new(
        announcement: Announcement,
        covering: impl IntoIterator<Item = &'a AddressOrigin>,
    ) -> Self {
        let mut matched = Vec::new();
        let mut bad_asn = Vec::new();
        let mut bad_len = Vec::new();
        for origin in covering {
            if !origin.prefix().covers(announcement.prefix) {
                continue
            }
            if origin.asn() != announcement.asn {
                bad_asn.push(origin)
            }
            else if announcement.prefix.address_length() > origin.max_length() {
                bad_len.push(origin)
            }
            else {
                matched.push(origin)
            }
        }
        RouteValidity { announcement, matched, bad_asn, bad_len }
    }

    pub fn announcement(&self) -> Announcement {
        self.announcement
    }

    /// Returns the validity state.
    ///
    /// A matching entry beats one with a bad length which beats one with a
    /// different origin.
    pub fn state(&self) -> RouteState {
        if !self.matched.is_empty() {
            RouteState::Valid
        }
        else if !self.bad_len.is_empty() {
            RouteState::InvalidLength
        }
        else if !self.bad_asn.is_empty() {
            RouteState::InvalidAsn
        }
        else {
            RouteState::Unknown
        }
    }

    pub fn matched(&self) -> &[&'a AddressOrigin] {
        &self.matched
    }

    pub fn bad_asn(&self) -> &[&'a AddressOrigin] {
        &self.bad_asn
    }

    pub fn bad_len(&self) -> &[&'a AddressOrigin] {
        &self.bad_len
    }
}


//------------ RouteState ----------------------------------------------------

/// The origin validation state of a route announcement.
///
/// An entry _covers_ an announcement if its prefix is equal to or less
/// specific than the announced prefix.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteState {
    /// A covering entry has the announcement’s origin and allows its length.
    Valid,

    /// A covering entry has the announcement’s origin but a shorter max
    /// length, and no entry makes the announcement valid.
    InvalidLength,

    /// Only covering entries with a different origin exist.
    InvalidAsn,

    /// No entry covers the announcement.
    Unknown,
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            RouteState::Valid => "valid",
            RouteState::InvalidLength => "invalid length",
            RouteState::InvalidAsn => "invalid ASN",
            RouteState::Unknown => "unknown",
        })
    }
}


//------------ OriginIndex ---------------------------------------------------

/// The distinct route origins indexed by prefix.
///
/// Finding the covering entries for a prefix needs one lookup per prefix
/// length in use.
struct OriginIndex<'a> {
    by_prefix: HashMap<AddressPrefix, Vec<&'a AddressOrigin>>,
    v4_lens: Vec<u8>,
    v6_lens: Vec<u8>,
}

impl<'a> OriginIndex<'a> {
    fn new(origins: &'a AddressOrigins) -> Self {
        let mut by_prefix: HashMap<_, Vec<_>> = HashMap::new();
        let mut v4_lens = Vec::new();
        let mut v6_lens = Vec::new();
        for origin in origins.iter() {
            let prefix = origin.prefix();
            by_prefix.entry(prefix).or_default().push(origin);
            if prefix.is_v4() {
                v4_lens.push(prefix.address_length())
            }
            else {
                v6_lens.push(prefix.address_length())
            }
        }
        v4_lens.sort_unstable();
        v4_lens.dedup();
        v6_lens.sort_unstable();
        v6_lens.dedup();
        OriginIndex { by_prefix, v4_lens, v6_lens }
    }

    fn covering(
        &self, prefix: AddressPrefix
    ) -> impl Iterator<Item = &'a AddressOrigin> + '_ {
        let lens = if prefix.is_v4() { &self.v4_lens } else { &self.v6_lens };
        lens.iter().take_while(move |len| **len <= prefix.address_length())
            .filter_map(move |len| self.by_prefix.get(&prefix.truncate(*len)))
            .flat_map(|origins| origins.iter().copied())
    }

    fn validate(&self, announcement: Announcement) -> RouteValidity<'a> {
        RouteValidity::new(announcement, self.covering(announcement.prefix))
    }
}


//------------ ValidatedAnnouncement -----------------------------------------

/// A route announcement together with its validity state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ValidatedAnnouncement {
    #[serde(flatten)]
    announcement: Announcement,
    validity: RouteState,
}

impl ValidatedAnnouncement {
    pub fn announcement(&self) -> Announcement {
        self.announcement
    }

    pub fn validity(&self) -> RouteState {
        self.validity
    }
}


//------------ ValidatedAnnouncements ----------------------------------------

/// The result of validating all known announcements.
#[derive(Clone, Debug, Default)]
pub struct ValidatedAnnouncements {
    /// The version of the snapshot the route origins were taken from.
    version: u64,

    /// The generation of the dumps the announcements were taken from.
    dump_generation: u64,

    announcements: Vec<ValidatedAnnouncement>,
}

impl ValidatedAnnouncements {
    /// Validates all announcements against the given route origins.
    pub fn new(
        version: u64,
        announcements: &[Announcement],
        origins: &AddressOrigins,
    ) -> Self {
        let index = OriginIndex::new(origins);
        ValidatedAnnouncements {
            version,
            dump_generation: 0,
            announcements: announcements.iter().map(|announcement| {
                ValidatedAnnouncement {
                    announcement: *announcement,
                    validity: index.validate(*announcement).state(),
                }
            }).collect()
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dump_generation(&self) -> u64 {
        self.dump_generation
    }

    /// Returns whether this result should be kept over one for the inputs.
    ///
    /// This is the case if both inputs of this result are at least as new
    /// and at least one of them is newer.
    fn supersedes(&self, version: u64, dump_generation: u64) -> bool {
        self.version >= version
            && self.dump_generation >= dump_generation
            && (self.version, self.dump_generation)
                != (version, dump_generation)
    }

    pub fn len(&self) -> usize {
        self.announcements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.announcements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatedAnnouncement> {
        self.announcements.iter()
    }

    /// Returns the number of announcements in the given state.
    pub fn count(&self, state: RouteState) -> usize {
        self.announcements.iter().filter(|item| item.validity == state).count()
    }
}


//------------ OriginValidator -----------------------------------------------

/// Keeps the validity of all observed route announcements.
///
/// Values of this type can be cloned cheaply. All clones share the same
/// result.
#[derive(Clone, Debug, Default)]
pub struct OriginValidator {
    current: Arc<ArcSwap<ValidatedAnnouncements>>,
}

impl OriginValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the validity of all announcements.
    ///
    /// The route origins are those of the snapshot with the given
    /// `version`, the announcements those of the dumps of the given
    /// `dump_generation`. If a result for newer inputs has been stored in
    /// the meantime, that one is kept.
    ///
    /// Returns the result now current.
    pub fn update(
        &self,
        version: u64,
        dump_generation: u64,
        announcements: &[Announcement],
        origins: &AddressOrigins,
    ) -> Arc<ValidatedAnnouncements> {
        let mut new = ValidatedAnnouncements::new(
            version, announcements, origins
        );
        new.dump_generation = dump_generation;
        let new = Arc::new(new);
        self.current.rcu(|current| {
            if current.supersedes(version, dump_generation) {
                debug!(
                    "Dropping validity for version {} and dumps {}, \
                     have {} and {} already.",
                    version, dump_generation,
                    current.version, current.dump_generation
                );
                current.clone()
            }
            else {
                new.clone()
            }
        });
        let res = self.current.load_full();
        if Arc::ptr_eq(&res, &new) {
            info!(
                "Origin validation for version {}: {} valid, {} invalid \
                 length, {} invalid ASN, {} unknown.",
                version,
                res.count(RouteState::Valid),
                res.count(RouteState::InvalidLength),
                res.count(RouteState::InvalidAsn),
                res.count(RouteState::Unknown),
            );
        }
        res
    }

    /// Returns the current result.
    pub fn current(&self) -> Arc<ValidatedAnnouncements> {
        self.current.load_full()
    }

    /// Validates a single announcement against the given route origins.
    pub fn validate(
        origins: &AddressOrigins, announcement: Announcement
    ) -> RouteValidity<'_> {
        RouteValidity::new(announcement, origins.iter())
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::origins::test::origin;

    fn announcement(asn: u32, prefix: &str) -> Announcement {
        Announcement::new(asn.into(), prefix.parse().unwrap())
    }

    fn states(
        origins: &AddressOrigins, announcements: &[Announcement]
    ) -> Vec<RouteState> {
        ValidatedAnnouncements::new(1, announcements, origins)
            .iter().map(|item| item.validity()).collect()
    }

    #[test]
    fn basic_states() {
        let origins: AddressOrigins = vec![
            origin(65000, "10.0.0.0/24", 24)
        ].into_iter().collect();
        assert_eq!(
            states(&origins, &[
                announcement(65000, "10.0.0.0/24"),
                announcement(65001, "10.0.0.0/24"),
                announcement(65000, "10.0.0.0/25"),
                announcement(65000, "192.0.2.0/24"),
            ]),
            vec![
                RouteState::Valid,
                RouteState::InvalidAsn,
                RouteState::InvalidLength,
                RouteState::Unknown,
            ]
        );
    }

    #[test]
    fn tie_break() {
        let origins: AddressOrigins = vec![
            origin(65001, "10.0.0.0/16", 24),
            origin(65000, "10.0.0.0/16", 16),
            origin(65000, "10.0.0.0/20", 24),
        ].into_iter().collect();
        assert_eq!(
            states(&origins, &[
                // matched by the /20 entry
                announcement(65000, "10.0.1.0/24"),
                // /16 with same ASN has too short max length
                announcement(65000, "10.0.128.0/24"),
                // only a different ASN covers this one
                announcement(65002, "10.0.128.0/24"),
                // less specific than everything
                announcement(65000, "10.0.0.0/8"),
            ]),
            vec![
                RouteState::Valid,
                RouteState::InvalidLength,
                RouteState::InvalidAsn,
                RouteState::Unknown,
            ]
        );
    }

    #[test]
    fn index_matches_linear_scan() {
        let origins: AddressOrigins = vec![
            origin(65000, "10.0.0.0/8", 24),
            origin(65001, "10.1.0.0/16", 16),
            origin(65002, "2001:db8::/32", 48),
            origin(65000, "0.0.0.0/0", 32),
        ].into_iter().collect();
        let index = OriginIndex::new(&origins);
        for item in [
            announcement(65000, "10.1.2.0/24"),
            announcement(65001, "10.1.0.0/16"),
            announcement(65001, "10.1.0.0/17"),
            announcement(65002, "2001:db8:1::/48"),
            announcement(65002, "2001:db9::/32"),
            announcement(65003, "192.0.2.0/24"),
        ] {
            let indexed = index.validate(item);
            let scanned = OriginValidator::validate(&origins, item);
            assert_eq!(indexed.state(), scanned.state(), "{}", item);
            assert_eq!(indexed.matched().len(), scanned.matched().len());
            assert_eq!(indexed.bad_asn().len(), scanned.bad_asn().len());
            assert_eq!(indexed.bad_len().len(), scanned.bad_len().len());
        }
    }

    #[test]
    fn families_dont_mix() {
        let origins: AddressOrigins = vec![
            origin(65000, "::/0", 128),
        ].into_iter().collect();
        assert_eq!(
            states(&origins, &[announcement(65000, "10.0.0.0/8")]),
            vec![RouteState::Unknown]
        );
    }

    #[test]
    fn older_results_are_dropped() {
        let validator = OriginValidator::new();
        let origins: AddressOrigins = vec![
            origin(65000, "10.0.0.0/24", 24)
        ].into_iter().collect();
        let announcements = [announcement(65000, "10.0.0.0/24")];

        let res = validator.update(4, 0, &announcements, &origins);
        assert_eq!(res.version(), 4);
        assert_eq!(res.count(RouteState::Valid), 1);

        let res = validator.update(
            3, 0, &announcements, &AddressOrigins::new()
        );
        assert_eq!(res.version(), 4);
        assert_eq!(validator.current().count(RouteState::Valid), 1);

        let res = validator.update(
            4, 0, &announcements, &AddressOrigins::new()
        );
        assert_eq!(res.version(), 4);
        assert_eq!(res.count(RouteState::Unknown), 1);
    }

    #[test]
    fn results_from_older_dumps_are_dropped() {
        let validator = OriginValidator::new();
        let origins: AddressOrigins = vec![
            origin(65000, "10.0.0.0/24", 24)
        ].into_iter().collect();
        let fresh = [announcement(65000, "10.0.0.0/24")];

        // Both computed for the same snapshot, the second one with the
        // dumps from before the last refresh.
        validator.update(7, 2, &fresh, &origins);
        let res = validator.update(7, 1, &[], &origins);
        assert_eq!(res.dump_generation(), 2);
        assert_eq!(res.len(), 1);
        assert_eq!(res.count(RouteState::Valid), 1);

        // A newer snapshot with newer dumps replaces it.
        let res = validator.update(8, 3, &[], &origins);
        assert_eq!((res.version(), res.dump_generation()), (8, 3));
        assert!(res.is_empty());

        // Newer in one input only still replaces it.
        let res = validator.update(9, 2, &fresh, &origins);
        assert_eq!((res.version(), res.dump_generation()), (9, 2));
        let res = validator.update(8, 4, &fresh, &origins);
        assert_eq!((res.version(), res.dump_generation()), (8, 4));
    }

    #[test]
    fn serialize_validated() {
        let origins = AddressOrigins::new();
        let res = ValidatedAnnouncements::new(
            1, &[announcement(65000, "10.0.0.0/24")], &origins
        );
        let item = res.iter().next().unwrap();
        assert_eq!(
            serde_json::to_value(item).unwrap(),
            serde_json::json!({
                "asn": "AS65000",
                "prefix": "10.0.0.0/24",
                "validity": "UNKNOWN"
            })
        );
    }
}
