//! RTR serial numbers.

use std::{cmp, fmt};


//------------ Serial --------------------------------------------------------

/// The serial number of a data set sent to routers.
///
/// Serial numbers wrap around, so comparison follows the rules of
/// [RFC 1982]: two serials that are exactly `2^31` apart are neither equal
/// nor is one of them larger. Hence, only `PartialOrd` is implemented.
///
/// The serial of a snapshot is the lower 32 bits of its version.
///
/// [RFC 1982]: https://tools.ietf.org/html/rfc1982
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Serial(pub u32);

impl Serial {
    /// Returns the serial for a snapshot version.
    pub fn from_version(version: u64) -> Self {
        Serial(version as u32)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialOrd for Serial {
    fn partial_cmp(&self, other: &Serial) -> Option<cmp::Ordering> {
        // The distance going upwards from other to self. Below 2^31 means
        // self is ahead, above means self is behind.
        match self.0.wrapping_sub(other.0) {
            0 => Some(cmp::Ordering::Equal),
            0x8000_0000 => None,
            dist if dist < 0x8000_0000 => Some(cmp::Ordering::Greater),
            _ => Some(cmp::Ordering::Less),
        }
    }
}


//============ Testing =======================================================
