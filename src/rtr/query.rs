//! Reading an RTR query from a client.

use std::io;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use super::pdu;
use super::serial::Serial;


//------------ Configuration -------------------------------------------------

/// The highest protocol version we support.
pub const MAX_VERSION: u8 = 1;

/// The largest PDU we are willing to skip over.
///
/// Anything larger is considered a corrupt stream.
const MAX_SKIP_LEN: u32 = 0xFFFF;


//------------ Query ---------------------------------------------------------

/// Something a client has sent us.
pub enum Query {
    /// A serial query.
    Serial {
        version: u8,
        session: u16,
        serial: Serial,
    },

    /// A reset query.
    Reset {
        version: u8,
    },

    /// The client sent something wrong and we should report it.
    Error {
        report: pdu::ErrorReport,

        /// Whether the connection has to be closed after the report.
        close: bool,
    },

    /// The client sent us an error report.
    ///
    /// We never answer those. The connection is closed instead.
    Report {
        code: u16,
    },
}

impl Query {
    /// Returns whether the connection ends after this query.
    pub fn is_final(&self) -> bool {
        match *self {
            Query::Error { close, .. } => close,
            Query::Report { .. } => true,
            _ => false,
        }
    }
}


//------------ QueryReader ---------------------------------------------------

/// Reads queries from the receiving half of an RTR connection.
pub struct QueryReader<Sock> {
    sock: Sock,

    /// The protocol version negotiated via the first PDU.
    version: Option<u8>,

    /// Should we carry on after protocol errors?
    keep_open: bool,
}

impl<Sock: AsyncRead + Unpin> QueryReader<Sock> {
    pub fn new(sock: Sock, keep_open: bool) -> Self {
        QueryReader { sock, version: None, keep_open }
    }

    /// Returns the negotiated version or 0 if there is none yet.
    pub fn version(&self) -> u8 {
        self.version.unwrap_or(0)
    }

    /// Reads the next query.
    ///
    /// Returns `Ok(None)` if the client has closed the connection.
    pub async fn next(&mut self) -> Result<Option<Query>, io::Error> {
        let header = match pdu::Header::read(&mut self.sock).await {
            Ok(header) => header,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(None)
            }
            Err(err) => return Err(err)
        };
        debug!("RTR: read a header for PDU {}.", header.pdu());

        if let Some(err) = self.check_version(header) {
            return self.error(header, err).await
        }
        if header.length() < pdu::Header::LEN {
            // We can’t find the next PDU, so this is always fatal.
            return Ok(Some(Query::Error {
                report: self.report(
                    header, pdu::ErrorReport::CORRUPT_DATA, "invalid length"
                ),
                close: true
            }))
        }

        match header.pdu() {
            pdu::SerialQuery::PDU => {
                debug!("RTR: Got serial query.");
                if header.length() != pdu::SerialQuery::LEN {
                    return self.error(header, (
                        pdu::ErrorReport::CORRUPT_DATA,
                        "invalid length"
                    )).await
                }
                let payload = pdu::SerialQueryPayload::read(
                    &mut self.sock
                ).await?;
                Ok(Some(Query::Serial {
                    version: header.version(),
                    session: header.session(),
                    serial: payload.serial(),
                }))
            }
            pdu::ResetQuery::PDU => {
                debug!("RTR: Got reset query.");
                if header.length() != pdu::ResetQuery::LEN {
                    return self.error(header, (
                        pdu::ErrorReport::CORRUPT_DATA,
                        "invalid length"
                    )).await
                }
                Ok(Some(Query::Reset { version: header.version() }))
            }
            pdu::ErrorReport::PDU => {
                debug!(
                    "RTR: Got error report with code {}.", header.session()
                );
                Ok(Some(Query::Report { code: header.session() }))
            }
            pdu => {
                debug!("RTR: Got unexpected PDU {}.", pdu);
                self.error(header, (
                    pdu::ErrorReport::UNSUPPORTED_PDU_TYPE,
                    "expected Serial Query or Reset Query"
                )).await
            }
        }
    }

    /// Checks the version of a PDU and negotiates it if necessary.
    fn check_version(
        &mut self, header: pdu::Header
    ) -> Option<(u16, &'static str)> {
        match self.version {
            Some(current) if current != header.version() => {
                Some((
                    pdu::ErrorReport::UNEXPECTED_PROTOCOL_VERSION,
                    "version switched during connection"
                ))
            }
            Some(_) => None,
            None if header.version() > MAX_VERSION => {
                Some((
                    pdu::ErrorReport::UNSUPPORTED_VERSION,
                    "only versions 0 and 1 supported"
                ))
            }
            None => {
                self.version = Some(header.version());
                None
            }
        }
    }

    /// Produces an error query for a PDU with an intact header.
    ///
    /// If the connection is to be kept open, the rest of the PDU is skipped
    /// so the next read starts at the next PDU.
    async fn error(
        &mut self, header: pdu::Header, (code, text): (u16, &'static str)
    ) -> Result<Option<Query>, io::Error> {
        let report = self.report(header, code, text);
        let close = !self.keep_open
            || header.length() < pdu::Header::LEN
            || header.length() > MAX_SKIP_LEN;
        if !close {
            let skip = u64::from(header.length() - pdu::Header::LEN);
            let skipped = tokio::io::copy(
                &mut (&mut self.sock).take(skip), &mut tokio::io::sink()
            ).await?;
            if skipped != skip {
                return Ok(None)
            }
        }
        Ok(Some(Query::Error { report, close }))
    }

    fn report(
        &self, header: pdu::Header, code: u16, text: &str
    ) -> pdu::ErrorReport {
        // Error reports use our version unless the client’s is one we
        // can’t speak.
        let version = match self.version {
            Some(version) => version,
            None => header.version().min(MAX_VERSION),
        };
        pdu::ErrorReport::new(version, code, header.as_ref(), text)
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    async fn read_all(data: Vec<u8>, keep_open: bool) -> Vec<Query> {
        let mut reader = QueryReader::new(data.as_slice(), keep_open);
        let mut res = Vec::new();
        while let Some(query) = reader.next().await.unwrap() {
            let stop = query.is_final();
            res.push(query);
            if stop {
                break
            }
        }
        res
    }

    fn concat(pdus: &[&[u8]]) -> Vec<u8> {
        pdus.iter().flat_map(|pdu| pdu.iter().copied()).collect()
    }

    #[tokio::test]
    async fn read_queries() {
        let data = concat(&[
            pdu::ResetQuery::new(1).as_ref(),
            pdu::SerialQuery::new(1, 17, Serial(4)).as_ref(),
        ]);
        let queries = read_all(data, false).await;
        assert_eq!(queries.len(), 2);
        assert!(matches!(queries[0], Query::Reset { version: 1 }));
        assert!(matches!(
            queries[1],
            Query::Serial { version: 1, session: 17, serial: Serial(4) }
        ));
    }

    #[tokio::test]
    async fn unsupported_version() {
        let data = concat(&[pdu::ResetQuery::new(2).as_ref()]);
        let queries = read_all(data, false).await;
        match queries[0] {
            Query::Error { ref report, close } => {
                assert_eq!(
                    report.error_code(), pdu::ErrorReport::UNSUPPORTED_VERSION
                );
                assert_eq!(report.as_ref()[0], 1);
                assert!(close);
            }
            _ => panic!("expected error")
        }
    }

    #[tokio::test]
    async fn version_switch() {
        let data = concat(&[
            pdu::ResetQuery::new(0).as_ref(),
            pdu::ResetQuery::new(1).as_ref(),
        ]);
        let queries = read_all(data, false).await;
        assert_eq!(queries.len(), 2);
        match queries[1] {
            Query::Error { ref report, close } => {
                assert_eq!(
                    report.error_code(),
                    pdu::ErrorReport::UNEXPECTED_PROTOCOL_VERSION
                );
                assert!(close);
            }
            _ => panic!("expected error")
        }
    }

    #[tokio::test]
    async fn unsupported_pdu_keep_open() {
        let data = concat(&[
            pdu::CacheResponse::new(1, 0).as_ref(),
            pdu::ResetQuery::new(1).as_ref(),
        ]);

        let queries = read_all(data.clone(), false).await;
        assert_eq!(queries.len(), 1);
        assert!(queries[0].is_final());

        let queries = read_all(data, true).await;
        assert_eq!(queries.len(), 2);
        match queries[0] {
            Query::Error { ref report, close } => {
                assert_eq!(
                    report.error_code(),
                    pdu::ErrorReport::UNSUPPORTED_PDU_TYPE
                );
                assert!(!close);
            }
            _ => panic!("expected error")
        }
        assert!(matches!(queries[1], Query::Reset { version: 1 }));
    }

    #[tokio::test]
    async fn bad_length_keep_open() {
        // A reset query claiming to be twelve octets long.
        let mut data = vec![1, 2, 0, 0, 0, 0, 0, 12, 0xde, 0xad, 0xbe, 0xef];
        data.extend_from_slice(pdu::ResetQuery::new(1).as_ref());
        let queries = read_all(data, true).await;
        assert_eq!(queries.len(), 2);
        match queries[0] {
            Query::Error { ref report, close } => {
                assert_eq!(
                    report.error_code(), pdu::ErrorReport::CORRUPT_DATA
                );
                assert!(!close);
            }
            _ => panic!("expected error")
        }
        assert!(matches!(queries[1], Query::Reset { version: 1 }));
    }
}
