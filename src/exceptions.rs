//! Local exceptions: user-maintained filters and whitelist entries.
//!
//! Filters remove route origins produced by validation from the published
//! set. Whitelist entries add route origins to the set regardless of what
//! validation produced and of any filters.

use std::fmt;
use serde::{Deserialize, Serialize};
use crate::origins::{AddressOrigin, AddressPrefix, Asn};


//------------ LocalExceptions -----------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LocalExceptions {
    #[serde(default)]
    filters: Vec<PrefixFilter>,

    #[serde(default)]
    whitelist: Vec<AddressOrigin>,
}

impl LocalExceptions {
    pub fn new(
        filters: Vec<PrefixFilter>, whitelist: Vec<AddressOrigin>
    ) -> Self {
        LocalExceptions { filters, whitelist }
    }

    /// Returns whether a validated route origin survives the filters.
    pub fn keep_origin(&self, addr: &AddressOrigin) -> bool {
        !self.filters.iter().any(|filter| filter.matches(addr))
    }

    pub fn filters(&self) -> &[PrefixFilter] {
        &self.filters
    }

    pub fn whitelist(&self) -> &[AddressOrigin] {
        &self.whitelist
    }

    /// Adds a filter unless an equal one is already present.
    ///
    /// Returns whether the filter was added.
    pub fn add_filter(&mut self, filter: PrefixFilter) -> bool {
        if self.filters.contains(&filter) {
            return false
        }
        self.filters.push(filter);
        true
    }

    /// Removes all filters equal to `filter`.
    ///
    /// Returns whether anything was removed.
    pub fn remove_filter(&mut self, filter: &PrefixFilter) -> bool {
        let len = self.filters.len();
        self.filters.retain(|item| item != filter);
        self.filters.len() != len
    }

    pub fn add_whitelist_entry(&mut self, entry: AddressOrigin) -> bool {
        if self.whitelist.contains(&entry) {
            return false
        }
        self.whitelist.push(entry);
        true
    }

    pub fn remove_whitelist_entry(&mut self, entry: &AddressOrigin) -> bool {
        let len = self.whitelist.len();
        self.whitelist.retain(|item| item != entry);
        self.whitelist.len() != len
    }
}


//------------ PrefixFilter --------------------------------------------------

/// A filter for route origins.
///
/// A filter matches a route origin if all the fields it has set match. The
/// AS number has to be equal, the prefix has to cover the route origin’s
/// prefix, and the max length has to be equal. A filter with neither
/// AS number nor prefix is rejected when parsing.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize
)]
#[serde(try_from = "FilterJson", into = "FilterJson")]
pub struct PrefixFilter {
    asn: Option<Asn>,
    prefix: Option<AddressPrefix>,
    max_length: Option<u8>,
}

impl PrefixFilter {
    pub fn new(
        asn: Option<Asn>,
        prefix: Option<AddressPrefix>,
        max_length: Option<u8>,
    ) -> Result<Self, FilterError> {
        if asn.is_none() && prefix.is_none() {
            return Err(FilterError)
        }
        Ok(PrefixFilter { asn, prefix, max_length })
    }

    /// Creates a filter that matches exactly the given route origin.
    pub fn exact(origin: &AddressOrigin) -> Self {
        PrefixFilter {
            asn: Some(origin.asn()),
            prefix: Some(origin.prefix()),
            max_length: Some(origin.max_length()),
        }
    }

    pub fn asn(&self) -> Option<Asn> {
        self.asn
    }

    pub fn prefix(&self) -> Option<AddressPrefix> {
        self.prefix
    }

    pub fn max_length(&self) -> Option<u8> {
        self.max_length
    }

    pub fn matches(&self, addr: &AddressOrigin) -> bool {
        if let Some(asn) = self.asn {
            if asn != addr.asn() {
                return false
            }
        }
        if let Some(prefix) = self.prefix {
            if !prefix.covers(addr.prefix()) {
                return false
            }
        }
        if let Some(max_len) = self.max_length {
            if max_len != addr.max_length() {
                return false
            }
        }
        true
    }
}

impl fmt::Display for PrefixFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.prefix {
            Some(prefix) => write!(f, "{}", prefix)?,
            None => f.write_str("any prefix")?,
        }
        if let Some(max_len) = self.max_length {
            write!(f, "-{}", max_len)?;
        }
        match self.asn {
            Some(asn) => write!(f, " => {}", asn),
            None => f.write_str(" => any AS"),
        }
    }
}

#[derive(Clone, Copy, Deserialize, Serialize)]
struct FilterJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    asn: Option<Asn>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    prefix: Option<AddressPrefix>,

    #[serde(
        default, rename = "maxLength", skip_serializing_if = "Option::is_none"
    )]
    max_length: Option<u8>,
}

impl TryFrom<FilterJson> for PrefixFilter {
    type Error = FilterError;

    fn try_from(json: FilterJson) -> Result<Self, Self::Error> {
        PrefixFilter::new(json.asn, json.prefix, json.max_length)
    }
}

impl From<PrefixFilter> for FilterJson {
    fn from(filter: PrefixFilter) -> Self {
        FilterJson {
            asn: filter.asn,
            prefix: filter.prefix,
            max_length: filter.max_length,
        }
    }
}


//------------ FilterError ---------------------------------------------------

/// A filter had neither an AS number nor a prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FilterError;

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("filter needs at least one of 'asn' and 'prefix'")
    }
}

impl std::error::Error for FilterError { }


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::origins::test::origin;

    #[test]
    fn filter_matching() {
        let roa = origin(65000, "10.0.0.0/24", 24);

        let by_asn = PrefixFilter::new(
            Some(Asn::from_u32(65000)), None, None
        ).unwrap();
        assert!(by_asn.matches(&roa));
        assert!(!by_asn.matches(&origin(65001, "10.0.0.0/24", 24)));

        let by_prefix = PrefixFilter::new(
            None, Some("10.0.0.0/8".parse().unwrap()), None
        ).unwrap();
        assert!(by_prefix.matches(&roa));
        assert!(!by_prefix.matches(&origin(65000, "11.0.0.0/24", 24)));

        let by_len = PrefixFilter::new(
            None, Some("10.0.0.0/8".parse().unwrap()), Some(25)
        ).unwrap();
        assert!(!by_len.matches(&roa));

        assert!(PrefixFilter::new(None, None, Some(24)).is_err());
    }

    #[test]
    fn add_and_remove() {
        let roa = origin(65000, "10.0.0.0/24", 24);
        let mut exceptions = LocalExceptions::default();
        assert!(exceptions.keep_origin(&roa));
        assert!(exceptions.add_filter(PrefixFilter::exact(&roa)));
        assert!(!exceptions.add_filter(PrefixFilter::exact(&roa)));
        assert!(!exceptions.keep_origin(&roa));
        assert!(exceptions.remove_filter(&PrefixFilter::exact(&roa)));
        assert!(!exceptions.remove_filter(&PrefixFilter::exact(&roa)));
        assert!(exceptions.keep_origin(&roa));

        assert!(exceptions.add_whitelist_entry(roa));
        assert!(!exceptions.add_whitelist_entry(roa));
        assert_eq!(exceptions.whitelist(), &[roa]);
        assert!(exceptions.remove_whitelist_entry(&roa));
        assert!(exceptions.whitelist().is_empty());
    }

    #[test]
    fn filter_json() {
        let filter: PrefixFilter = serde_json::from_str(
            r#"{"asn": "AS65000"}"#
        ).unwrap();
        assert_eq!(filter.asn(), Some(Asn::from_u32(65000)));
        assert_eq!(filter.prefix(), None);
        assert_eq!(
            serde_json::to_string(&filter).unwrap(),
            r#"{"asn":"AS65000"}"#
        );
        assert!(serde_json::from_str::<PrefixFilter>(
            r#"{"maxLength": 24}"#
        ).is_err());
    }
}
