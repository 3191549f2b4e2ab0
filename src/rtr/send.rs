//! Sending messages to the RTR client.

use std::io;
use std::cmp::min;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use crate::config::Config;
use crate::origins::{AddressOrigins, OriginsDiff};
use super::pdu;
use super::serial::Serial;


//------------ Sender --------------------------------------------------------

/// The sending half of an RTR connection.
///
/// All PDUs making up one response are collected in a buffer and flushed
/// to the socket at the end of the response.
pub struct Sender<Sock> {
    sock: BufWriter<Sock>,
    session: u16,
    timing: Timing,
}

impl<Sock: AsyncWrite + Unpin> Sender<Sock> {
    pub fn new(sock: Sock, session: u16, timing: Timing) -> Self {
        Sender {
            sock: BufWriter::new(sock),
            session, timing
        }
    }

    pub async fn notify(
        &mut self, version: u8, serial: Serial
    ) -> Result<(), io::Error> {
        pdu::SerialNotify::new(
            version, self.session, serial
        ).write(&mut self.sock).await?;
        self.sock.flush().await
    }

    pub async fn reset(&mut self, version: u8) -> Result<(), io::Error> {
        pdu::CacheReset::new(version).write(&mut self.sock).await?;
        self.sock.flush().await
    }

    pub async fn diff(
        &mut self,
        version: u8,
        serial: Serial,
        diff: &OriginsDiff,
    ) -> Result<(), io::Error> {
        self.wrapped(version, serial, SendDiff::new(version, diff)).await
    }

    pub async fn full(
        &mut self,
        version: u8,
        serial: Serial,
        current: &AddressOrigins,
    ) -> Result<(), io::Error> {
        self.wrapped(version, serial, SendFull::new(version, current)).await
    }

    pub async fn error(
        &mut self, error: &pdu::ErrorReport
    ) -> Result<(), io::Error> {
        error.write(&mut self.sock).await?;
        self.sock.flush().await
    }

    /// Sends a complete data response.
    ///
    /// This is a Cache Response PDU, followed by the prefix PDUs from
    /// `iter`, followed by an End of Data PDU.
    async fn wrapped(
        &mut self,
        version: u8,
        serial: Serial,
        iter: impl Iterator<Item = pdu::Prefix>,
    ) -> Result<(), io::Error> {
        pdu::CacheResponse::new(
            version, self.session
        ).write(&mut self.sock).await?;
        for prefix in iter {
            prefix.write(&mut self.sock).await?;
        }
        pdu::EndOfData::new(
            version, self.session, serial, self.timing
        ).write(&mut self.sock).await?;
        self.sock.flush().await
    }
}


//------------ SendDiff ------------------------------------------------------

/// The prefix PDUs for a diff.
///
/// Announcements are sent first, then withdrawals.
pub struct SendDiff<'a> {
    version: u8,
    diff: &'a OriginsDiff,
    announce: bool,
    next_idx: usize,
}

impl<'a> SendDiff<'a> {
    fn new(version: u8, diff: &'a OriginsDiff) -> Self {
        SendDiff {
            version,
            diff,
            announce: true,
            next_idx: 0
        }
    }
}

impl<'a> Iterator for SendDiff<'a> {
    type Item = pdu::Prefix;

    fn next(&mut self) -> Option<Self::Item> {
        if self.announce {
            if let Some(res) = self.diff.announce().get(self.next_idx) {
                self.next_idx += 1;
                return Some(
                    pdu::Prefix::new(self.version, pdu::Prefix::ANNOUNCE, res)
                )
            }
            self.announce = false;
            self.next_idx = 0;
        }
        let res = self.diff.withdraw().get(self.next_idx)?;
        self.next_idx += 1;
        Some(pdu::Prefix::new(self.version, pdu::Prefix::WITHDRAW, res))
    }
}


//------------ SendFull ------------------------------------------------------

/// The prefix PDUs for a complete data set.
pub struct SendFull<'a> {
    version: u8,
    origins: &'a AddressOrigins,
    next_idx: usize,
}

impl<'a> SendFull<'a> {
    pub fn new(version: u8, origins: &'a AddressOrigins) -> Self {
        SendFull {
            version, origins,
            next_idx: 0
        }
    }
}

impl<'a> Iterator for SendFull<'a> {
    type Item = pdu::Prefix;

    fn next(&mut self) -> Option<Self::Item> {
        let res = self.origins.get(self.next_idx)?;
        self.next_idx += 1;
        Some(pdu::Prefix::new(self.version, pdu::Prefix::ANNOUNCE, res))
    }
}


//------------ Timing --------------------------------------------------------

/// The timing parameters sent in version 1 End of Data PDUs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timing {
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32
}

impl Timing {
    pub fn new(refresh: u32, retry: u32, expire: u32) -> Self {
        Timing { refresh, retry, expire }
    }

    pub fn from_config(config: &Config) -> Self {
        Timing {
            refresh: Self::secs(config.refresh),
            retry: Self::secs(config.retry),
            expire: Self::secs(config.expire),
        }
    }

    fn secs(duration: Duration) -> u32 {
        min(duration.as_secs(), u64::from(u32::MAX)) as u32
    }
}

impl Default for Timing {
    fn default() -> Self {
        Timing::new(3600, 600, 7200)
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::origins::test::origin;

    #[test]
    fn diff_order() {
        let old: AddressOrigins = vec![
            origin(1, "10.0.0.0/24", 24),
            origin(2, "10.0.1.0/24", 24),
        ].into_iter().collect();
        let new: AddressOrigins = vec![
            origin(2, "10.0.1.0/24", 24),
            origin(3, "10.0.2.0/24", 24),
            origin(4, "2001:db8::/32", 32),
        ].into_iter().collect();
        let diff = OriginsDiff::construct(&old, &new);
        let flags: Vec<_> = SendDiff::new(1, &diff).map(|pdu| {
            match pdu {
                pdu::Prefix::V4(pdu) => (4, pdu.flags()),
                pdu::Prefix::V6(pdu) => (6, pdu.flags()),
            }
        }).collect();
        assert_eq!(flags, vec![(4, 1), (6, 1), (4, 0)]);
    }

    #[tokio::test]
    async fn full_response() {
        let set: AddressOrigins = vec![
            origin(1, "10.0.0.0/24", 24),
            origin(2, "2001:db8::/32", 48),
        ].into_iter().collect();
        let mut buf = Vec::new();
        {
            let mut sender = Sender::new(&mut buf, 7, Timing::default());
            sender.full(1, Serial(12), &set).await.unwrap();
        }
        assert_eq!(buf.len(), 8 + 20 + 32 + 24);
        assert_eq!(&buf[..8], &[1, 3, 0, 7, 0, 0, 0, 8]);
        assert_eq!(buf[8 + 1], 4);
        assert_eq!(buf[28 + 1], 6);
        assert_eq!(&buf[60..68], &[1, 7, 0, 7, 0, 0, 0, 24]);
        assert_eq!(&buf[68..72], &[0, 0, 0, 12]);
    }

    #[tokio::test]
    async fn empty_v0_response() {
        let mut buf = Vec::new();
        {
            let mut sender = Sender::new(&mut buf, 7, Timing::default());
            sender.diff(0, Serial(3), &OriginsDiff::default()).await.unwrap();
        }
        assert_eq!(
            buf,
            vec![
                0, 3, 0, 7, 0, 0, 0, 8,
                0, 7, 0, 7, 0, 0, 0, 12, 0, 0, 0, 3
            ]
        );
    }
}
