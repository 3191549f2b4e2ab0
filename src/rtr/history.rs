//! The data sets recently sent to routers.
//!
//! In order to answer serial queries with incremental updates, the server
//! needs to know what data set a router has. Whenever a data set is sent to
//! a router, it is recorded here together with its serial. Only a limited
//! number of data sets is kept. Routers with older serials receive a cache
//! reset.

use std::collections::VecDeque;
use std::sync::Arc;
use arc_swap::ArcSwap;
use crate::origins::AddressOrigins;
use super::serial::Serial;


//------------ PublishedHistory ----------------------------------------------

/// The recently published data sets.
///
/// Values of this type can be cloned cheaply. All clones share the same
/// history.
#[derive(Clone, Debug)]
pub struct PublishedHistory {
    sets: Arc<ArcSwap<VecDeque<(Serial, Arc<AddressOrigins>)>>>,
    keep: usize,
}

impl PublishedHistory {
    /// Creates a new, empty history keeping `keep` data sets.
    pub fn new(keep: usize) -> Self {
        PublishedHistory {
            sets: Arc::new(ArcSwap::from_pointee(VecDeque::new())),
            keep,
        }
    }

    /// Records that the data set for `serial` has been published.
    ///
    /// If the serial has been recorded before, nothing happens. Otherwise,
    /// the oldest data set is dropped if there are too many.
    pub fn record(&self, serial: Serial, origins: &Arc<AddressOrigins>) {
        if self.keep == 0 || self.get(serial).is_some() {
            return
        }
        self.sets.rcu(|sets| {
            let mut sets = VecDeque::clone(sets);
            if !sets.iter().any(|(item, _)| *item == serial) {
                sets.push_back((serial, origins.clone()));
            }
            while sets.len() > self.keep {
                sets.pop_front();
            }
            sets
        });
    }

    /// Returns the data set published for `serial` if it is still known.
    pub fn get(&self, serial: Serial) -> Option<Arc<AddressOrigins>> {
        self.sets.load().iter().find_map(|(item, origins)| {
            if *item == serial {
                Some(origins.clone())
            }
            else {
                None
            }
        })
    }

    /// Returns the number of data sets currently kept.
    pub fn len(&self) -> usize {
        self.sets.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::origins::test::origin;

    fn set(asn: u32) -> Arc<AddressOrigins> {
        Arc::new(
            vec![origin(asn, "10.0.0.0/24", 24)].into_iter().collect()
        )
    }

    #[test]
    fn bounded_history() {
        let history = PublishedHistory::new(2);
        history.record(Serial(1), &set(1));
        history.record(Serial(2), &set(2));
        history.record(Serial(2), &set(3));
        assert_eq!(history.len(), 2);
        assert_eq!(history.get(Serial(2)), Some(set(2)));

        history.record(Serial(3), &set(3));
        assert_eq!(history.len(), 2);
        assert!(history.get(Serial(1)).is_none());
        assert_eq!(history.get(Serial(3)), Some(set(3)));
    }

    #[test]
    fn no_history() {
        let history = PublishedHistory::new(0);
        history.record(Serial(1), &set(1));
        assert!(history.is_empty());
        assert!(history.get(Serial(1)).is_none());
    }
}
