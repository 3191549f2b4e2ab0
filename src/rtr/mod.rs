//! The RPKI to Router Protocol.
//!
//! See RFC 6810 and RFC 8210 for all the details.

use std::sync::Arc;
use crate::origins::AddressOrigins;

pub use self::history::PublishedHistory;
pub use self::net::NotificationServer;
pub use self::notify::{NotifyReceiver, NotifySender};
pub use self::send::Timing;
pub use self::serial::Serial;

pub mod pdu;
mod history;
mod net;
mod notify;
mod query;
mod send;
mod serial;


//------------ PayloadSource -------------------------------------------------

/// The data served to routers.
///
/// The server never looks at the engine state directly but only asks this
/// trait for what it needs.
pub trait PayloadSource: Clone + Send + Sync + 'static {
    /// Returns the version of the current data set.
    fn current_version(&self) -> u64;

    /// Returns the current data set.
    fn current_prefixes(&self) -> Arc<AddressOrigins>;

    /// Returns the session ID of this server instance.
    fn current_nonce(&self) -> u16;

    /// Returns the version and data set that belong together.
    ///
    /// The default implementation asks for both separately. Implementations
    /// that can change between the two calls should override it.
    fn current(&self) -> (u64, Arc<AddressOrigins>) {
        (self.current_version(), self.current_prefixes())
    }
}
