//! Route origins and the address prefixes they talk about.
//!
//! This module contains the basic vocabulary of the engine: AS numbers,
//! address prefixes, and the route origin statements made of the two plus a
//! maximum length. It also contains [`AddressOrigins`], the distinct set of
//! statements that is handed to routers and used for origin validation, and
//! [`OriginsDiff`], the difference between two such sets.

use std::{cmp, fmt, str};
use std::convert::TryFrom;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de;
use crate::exceptions::LocalExceptions;


//------------ Asn -----------------------------------------------------------

/// An autonomous system number.
///
/// In text, the number is written with an `AS` prefix. When parsing, the
/// prefix is optional and case insensitive.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Asn(u32);

impl Asn {
    pub const fn from_u32(value: u32) -> Self {
        Asn(value)
    }

    pub fn into_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for Asn {
    fn from(value: u32) -> Self {
        Asn(value)
    }
}

impl From<Asn> for u32 {
    fn from(asn: Asn) -> u32 {
        asn.0
    }
}

impl str::FromStr for Asn {
    type Err = FromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = match s.get(..2) {
            Some(start) if start.eq_ignore_ascii_case("as") => &s[2..],
            _ => s
        };
        u32::from_str(digits).map(Asn).map_err(|_| {
            FromStrError::new("AS number", s)
        })
    }
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AS{}", self.0)
    }
}

impl Serialize for Asn {
    fn serialize<S: Serializer>(
        &self, serializer: S
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Asn {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D
    ) -> Result<Self, D::Error> {
        struct AsnVisitor;

        impl<'de> de::Visitor<'de> for AsnVisitor {
            type Value = Asn;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an AS number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Asn, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Asn, E> {
                u32::try_from(v).map(Asn).map_err(|_| {
                    E::custom(format!("AS number {} out of range", v))
                })
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Asn, E> {
                u32::try_from(v).map(Asn).map_err(|_| {
                    E::custom(format!("AS number {} out of range", v))
                })
            }
        }

        deserializer.deserialize_any(AsnVisitor)
    }
}


//------------ AddressPrefix -------------------------------------------------

/// An IPv4 or IPv6 address prefix.
///
/// The address bits beyond the prefix length are always zero. Creating a
/// prefix from an address with host bits set quietly clears them.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AddressPrefix {
    addr: IpAddr,
    len: u8,
}

impl AddressPrefix {
    /// Creates a new prefix.
    ///
    /// Returns an error if `len` is too long for the address family.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, FromStrError> {
        if len > max_address_length(addr) {
            return Err(FromStrError::new(
                "prefix", &format!("{}/{}", addr, len)
            ))
        }
        Ok(AddressPrefix { addr: mask_address(addr, len), len })
    }

    pub fn address(self) -> IpAddr {
        self.addr
    }

    pub fn address_length(self) -> u8 {
        self.len
    }

    pub fn is_v4(self) -> bool {
        self.addr.is_ipv4()
    }

    /// Returns the longest prefix length possible in this address family.
    pub fn max_address_length(self) -> u8 {
        max_address_length(self.addr)
    }

    /// Returns whether `self` covers `other`.
    ///
    /// A prefix covers another prefix of the same address family if it is
    /// not longer and its network bits are equal to the respective bits of
    /// the other prefix. A prefix covers itself.
    pub fn covers(self, other: Self) -> bool {
        if self.len > other.len {
            return false
        }
        match (self.addr, other.addr) {
            (IpAddr::V4(left), IpAddr::V4(right)) => {
                let mask = v4_mask(self.len);
                u32::from(left) & mask == u32::from(right) & mask
            }
            (IpAddr::V6(left), IpAddr::V6(right)) => {
                let mask = v6_mask(self.len);
                u128::from(left) & mask == u128::from(right) & mask
            }
            _ => false
        }
    }

    /// Returns the less specific prefix of the given length.
    ///
    /// If `len` is not shorter than the prefix, returns the prefix itself.
    pub fn truncate(self, len: u8) -> Self {
        let len = cmp::min(len, self.len);
        AddressPrefix { addr: mask_address(self.addr, len), len }
    }
}

fn max_address_length(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn v4_mask(len: u8) -> u32 {
    !u32::MAX.checked_shr(u32::from(len)).unwrap_or(0)
}

fn v6_mask(len: u8) -> u128 {
    !u128::MAX.checked_shr(u32::from(len)).unwrap_or(0)
}

fn mask_address(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(addr) => {
            IpAddr::V4(Ipv4Addr::from(u32::from(addr) & v4_mask(len)))
        }
        IpAddr::V6(addr) => {
            IpAddr::V6(Ipv6Addr::from(u128::from(addr) & v6_mask(len)))
        }
    }
}

impl str::FromStr for AddressPrefix {
    type Err = FromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut iter = s.trim().splitn(2, '/');
        let addr = iter.next().ok_or_else(|| FromStrError::new("prefix", s))?;
        let len = iter.next().ok_or_else(|| FromStrError::new("prefix", s))?;
        let addr = IpAddr::from_str(addr)
            .map_err(|_| FromStrError::new("prefix", s))?;
        let len = u8::from_str(len)
            .map_err(|_| FromStrError::new("prefix", s))?;
        AddressPrefix::new(addr, len)
    }
}

impl fmt::Display for AddressPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl Serialize for AddressPrefix {
    fn serialize<S: Serializer>(
        &self, serializer: S
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressPrefix {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}


//------------ AddressOrigin -------------------------------------------------

/// A route origin statement.
///
/// The statement authorizes the AS `asn` to originate routes for `prefix`
/// and any more specific prefix up to a length of `max_length`.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize
)]
#[serde(try_from = "OriginJson", into = "OriginJson")]
pub struct AddressOrigin {
    asn: Asn,
    prefix: AddressPrefix,
    max_length: u8,
}

impl AddressOrigin {
    /// Creates a new statement.
    ///
    /// The maximum length must be between the prefix length and the
    /// maximum length of the address family.
    pub fn new(
        asn: Asn, prefix: AddressPrefix, max_length: u8
    ) -> Result<Self, FromStrError> {
        if max_length < prefix.address_length()
            || max_length > prefix.max_address_length()
        {
            return Err(FromStrError::new(
                "max length",
                &format!("{} for {}", max_length, prefix)
            ))
        }
        Ok(AddressOrigin { asn, prefix, max_length })
    }

    pub fn asn(&self) -> Asn {
        self.asn
    }

    pub fn prefix(&self) -> AddressPrefix {
        self.prefix
    }

    pub fn address(&self) -> IpAddr {
        self.prefix.address()
    }

    pub fn address_length(&self) -> u8 {
        self.prefix.address_length()
    }

    pub fn max_length(&self) -> u8 {
        self.max_length
    }
}

impl fmt::Display for AddressOrigin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{} => {}", self.prefix, self.max_length, self.asn)
    }
}

/// The JSON representation of an address origin.
#[derive(Clone, Copy, Deserialize, Serialize)]
struct OriginJson {
    asn: Asn,
    prefix: AddressPrefix,
    #[serde(rename = "maxLength")]
    max_length: Option<u8>,
}

impl TryFrom<OriginJson> for AddressOrigin {
    type Error = FromStrError;

    fn try_from(json: OriginJson) -> Result<Self, Self::Error> {
        AddressOrigin::new(
            json.asn, json.prefix,
            json.max_length.unwrap_or_else(|| json.prefix.address_length())
        )
    }
}

impl From<AddressOrigin> for OriginJson {
    fn from(origin: AddressOrigin) -> Self {
        OriginJson {
            asn: origin.asn,
            prefix: origin.prefix,
            max_length: Some(origin.max_length),
        }
    }
}


//------------ RouteOrigins --------------------------------------------------

/// The set of route origin statements produced by one trust anchor.
///
/// The set is sorted and free of duplicates. It is cheap to clone since
/// the statements themselves are shared.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RouteOrigins {
    origins: Arc<Vec<AddressOrigin>>,
}

impl RouteOrigins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressOrigin> {
        self.origins.iter()
    }
}

impl FromIterator<AddressOrigin> for RouteOrigins {
    fn from_iter<I: IntoIterator<Item = AddressOrigin>>(iter: I) -> Self {
        let mut origins: Vec<_> = iter.into_iter().collect();
        origins.sort_unstable();
        origins.dedup();
        RouteOrigins { origins: Arc::new(origins) }
    }
}


//------------ AddressOrigins ------------------------------------------------

/// The distinct set of route origin statements.
///
/// This is the set of statements of all trust anchors that are not removed
/// by a filter plus all whitelist entries. The set is kept sorted, so two
/// sets built from the same input always compare and iterate the same.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AddressOrigins {
    origins: Vec<AddressOrigin>,
}

impl AddressOrigins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the distinct set from route origins and local exceptions.
    ///
    /// Filters only apply to the route origins. Whitelist entries are added
    /// afterwards and are always part of the set.
    pub fn from_route_origins<'a>(
        origins: impl IntoIterator<Item = &'a RouteOrigins>,
        exceptions: &LocalExceptions,
    ) -> Self {
        let mut res = Vec::new();
        for set in origins {
            for addr in set.iter() {
                if exceptions.keep_origin(addr) {
                    res.push(*addr)
                }
            }
        }
        res.extend(exceptions.whitelist().iter().copied());
        res.sort_unstable();
        res.dedup();
        AddressOrigins { origins: res }
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn contains(&self, origin: &AddressOrigin) -> bool {
        self.origins.binary_search(origin).is_ok()
    }

    pub fn get(&self, idx: usize) -> Option<&AddressOrigin> {
        self.origins.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressOrigin> {
        self.origins.iter()
    }
}

impl FromIterator<AddressOrigin> for AddressOrigins {
    fn from_iter<I: IntoIterator<Item = AddressOrigin>>(iter: I) -> Self {
        let mut origins: Vec<_> = iter.into_iter().collect();
        origins.sort_unstable();
        origins.dedup();
        AddressOrigins { origins }
    }
}


//------------ OriginsDiff ---------------------------------------------------

/// The difference between two sets of address origins.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OriginsDiff {
    announce: Vec<AddressOrigin>,
    withdraw: Vec<AddressOrigin>,
}

impl OriginsDiff {
    /// Constructs the changes necessary to get from `old` to `new`.
    pub fn construct(old: &AddressOrigins, new: &AddressOrigins) -> Self {
        let mut announce = Vec::new();
        let mut withdraw = Vec::new();
        let mut old_iter = old.iter().peekable();
        let mut new_iter = new.iter().peekable();

        // Both sets are sorted, so we can walk them side by side.
        loop {
            match (old_iter.peek(), new_iter.peek()) {
                (Some(left), Some(right)) => {
                    match left.cmp(right) {
                        cmp::Ordering::Less => {
                            withdraw.push(**left);
                            old_iter.next();
                        }
                        cmp::Ordering::Greater => {
                            announce.push(**right);
                            new_iter.next();
                        }
                        cmp::Ordering::Equal => {
                            old_iter.next();
                            new_iter.next();
                        }
                    }
                }
                (Some(left), None) => {
                    withdraw.push(**left);
                    old_iter.next();
                }
                (None, Some(right)) => {
                    announce.push(**right);
                    new_iter.next();
                }
                (None, None) => break
            }
        }
        OriginsDiff { announce, withdraw }
    }

    pub fn is_empty(&self) -> bool {
        self.announce.is_empty() && self.withdraw.is_empty()
    }

    pub fn announce(&self) -> &[AddressOrigin] {
        &self.announce
    }

    pub fn withdraw(&self) -> &[AddressOrigin] {
        &self.withdraw
    }
}


//------------ FromStrError --------------------------------------------------

/// A value could not be converted from its string representation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FromStrError {
    what: &'static str,
    value: String,
}

impl FromStrError {
    fn new(what: &'static str, value: &str) -> Self {
        FromStrError { what, value: value.into() }
    }
}

impl fmt::Display for FromStrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bad {} '{}'", self.what, self.value)
    }
}

impl std::error::Error for FromStrError { }


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
pub mod test {

    use super::*;
    use crate::exceptions::PrefixFilter;

    fn make_pfx(s: &str, l: u8) -> AddressPrefix {
        AddressPrefix::new(s.parse().unwrap(), l).unwrap()
    }

    pub fn origin(asn: u32, prefix: &str, max_len: u8) -> AddressOrigin {
        AddressOrigin::new(
            Asn::from_u32(asn), prefix.parse().unwrap(), max_len
        ).unwrap()
    }

    #[test]
    fn should_find_covered_prefixes() {
        let outer = make_pfx("10.0.0.0", 16);
        let sibling = make_pfx("10.1.0.0", 16);
        let inner_low = make_pfx("10.0.0.0", 24);
        let inner_mid = make_pfx("10.0.61.0", 24);
        let inner_hi = make_pfx("10.0.255.0", 24);

        assert!(! outer.covers(sibling));
        assert!(outer.covers(inner_low));
        assert!(outer.covers(inner_mid));
        assert!(outer.covers(inner_hi));
        assert!(! inner_low.covers(outer));
        assert!(outer.covers(outer));
    }

    #[test]
    fn covers_at_the_edges() {
        assert!(make_pfx("0.0.0.0", 0).covers(make_pfx("192.0.2.1", 32)));
        assert!(make_pfx("192.0.2.1", 32).covers(make_pfx("192.0.2.1", 32)));
        assert!(!make_pfx("192.0.2.1", 32).covers(make_pfx("192.0.2.2", 32)));
        assert!(make_pfx("::", 0).covers(make_pfx("2001:db8::1", 128)));
        assert!(
            make_pfx("2001:db8::", 32).covers(make_pfx("2001:db8:1::", 48))
        );
        assert!(!make_pfx("0.0.0.0", 0).covers(make_pfx("2001:db8::", 32)));
    }

    #[test]
    fn parse_prefixes() {
        assert_eq!(
            "10.0.0.0/24".parse::<AddressPrefix>().unwrap(),
            make_pfx("10.0.0.0", 24)
        );
        assert_eq!(
            "10.0.0.17/24".parse::<AddressPrefix>().unwrap(),
            make_pfx("10.0.0.0", 24)
        );
        assert!("10.0.0.0/33".parse::<AddressPrefix>().is_err());
        assert!("10.0.0.0".parse::<AddressPrefix>().is_err());
        assert!("2001:db8::/129".parse::<AddressPrefix>().is_err());
        assert_eq!(
            make_pfx("2001:db8::", 32).to_string(), "2001:db8::/32"
        );
    }

    #[test]
    fn parse_asns() {
        assert_eq!("AS65000".parse::<Asn>().unwrap(), Asn::from_u32(65000));
        assert_eq!("as65000".parse::<Asn>().unwrap(), Asn::from_u32(65000));
        assert_eq!("65000".parse::<Asn>().unwrap(), Asn::from_u32(65000));
        assert!("AS".parse::<Asn>().is_err());
        assert!("ASx".parse::<Asn>().is_err());
        assert_eq!(Asn::from_u32(3333).to_string(), "AS3333");
    }

    #[test]
    fn origin_json() {
        let json = r#"{"asn": "AS65000", "prefix": "10.0.0.0/24",
                       "maxLength": 24}"#;
        let parsed: AddressOrigin = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, origin(65000, "10.0.0.0/24", 24));

        let json = r#"{"asn": 65000, "prefix": "10.0.0.0/24"}"#;
        let parsed: AddressOrigin = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, origin(65000, "10.0.0.0/24", 24));

        let json = r#"{"asn": "AS65000", "prefix": "10.0.0.0/24",
                       "maxLength": 16}"#;
        assert!(serde_json::from_str::<AddressOrigin>(json).is_err());

        let back = serde_json::to_value(origin(1, "10.0.0.0/8", 12)).unwrap();
        assert_eq!(back["asn"], "AS1");
        assert_eq!(back["prefix"], "10.0.0.0/8");
        assert_eq!(back["maxLength"], 12);
    }

    #[test]
    fn distinct_prefixes_are_deduplicated() {
        let first: RouteOrigins = vec![
            origin(65000, "10.0.0.0/24", 24),
            origin(65001, "10.1.0.0/24", 24),
        ].into_iter().collect();
        let second: RouteOrigins = vec![
            origin(65000, "10.0.0.0/24", 24),
            origin(65000, "10.0.0.0/24", 25),
        ].into_iter().collect();
        let set = AddressOrigins::from_route_origins(
            [&first, &second], &LocalExceptions::default()
        );
        assert_eq!(set.len(), 3);
        let again = AddressOrigins::from_route_origins(
            [&second, &first], &LocalExceptions::default()
        );
        assert_eq!(set, again);
    }

    #[test]
    fn filters_apply_before_whitelist() {
        let roas: RouteOrigins = vec![
            origin(65000, "10.0.0.0/24", 24),
            origin(65001, "10.1.0.0/24", 24),
        ].into_iter().collect();
        let mut exceptions = LocalExceptions::default();
        exceptions.add_filter(
            PrefixFilter::exact(&origin(65000, "10.0.0.0/24", 24))
        );
        let set = AddressOrigins::from_route_origins([&roas], &exceptions);
        assert_eq!(set.len(), 1);
        assert!(!set.contains(&origin(65000, "10.0.0.0/24", 24)));

        exceptions.add_whitelist_entry(origin(65000, "10.0.0.0/24", 24));
        let set = AddressOrigins::from_route_origins([&roas], &exceptions);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&origin(65000, "10.0.0.0/24", 24)));
    }

    #[test]
    fn construct_diff() {
        let old: AddressOrigins = vec![
            origin(1, "10.0.0.0/24", 24),
            origin(2, "10.0.1.0/24", 24),
            origin(3, "10.0.2.0/24", 24),
        ].into_iter().collect();
        let new: AddressOrigins = vec![
            origin(2, "10.0.1.0/24", 24),
            origin(3, "10.0.2.0/24", 24),
            origin(4, "10.0.3.0/24", 24),
        ].into_iter().collect();
        let diff = OriginsDiff::construct(&old, &new);
        assert_eq!(diff.announce(), &[origin(4, "10.0.3.0/24", 24)]);
        assert_eq!(diff.withdraw(), &[origin(1, "10.0.0.0/24", 24)]);
        assert!(OriginsDiff::construct(&new, &new).is_empty());
    }
}
