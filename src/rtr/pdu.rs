//! RTR PDUs.
//!
//! This module contains types that represent the protocol data units of
//! RPKI-RTR in their wire representation. That is, these types can be
//! used given to read and write operations as buffers.
//! See section 5 of RFC 6810 and RFC 8210. Annoyingly, the format of the
//! `EndOfData` PDU changes between the two versions.

use std::{io, mem, slice};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::origins::AddressOrigin;
use super::serial::Serial;


//------------ Macro for Common Impls ----------------------------------------

macro_rules! common {
    ( $type:ident ) => {
        #[allow(dead_code)]
        impl $type {
            pub async fn read<Sock: AsyncRead + Unpin>(
                sock: &mut Sock
            ) -> Result<Self, io::Error> {
                let mut res = Self::default();
                sock.read_exact(res.as_mut()).await?;
                Ok(res)
            }

            pub async fn write<Sock: AsyncWrite + Unpin>(
                &self, sock: &mut Sock
            ) -> Result<(), io::Error> {
                sock.write_all(self.as_ref()).await
            }
        }

        impl AsRef<[u8]> for $type {
            fn as_ref(&self) -> &[u8] {
                unsafe {
                    slice::from_raw_parts(
                        self as *const Self as *const u8,
                        mem::size_of::<Self>()
                    )
                }
            }
        }

        impl AsMut<[u8]> for $type {
            fn as_mut(&mut self) -> &mut [u8] {
                unsafe {
                    slice::from_raw_parts_mut(
                        self as *mut Self as *mut u8,
                        mem::size_of::<Self>()
                    )
                }
            }
        }
    }
}


//------------ SerialNotify --------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct SerialNotify {
    header: Header,
    serial: u32,
}

impl SerialNotify {
    pub const PDU: u8 = 0;
    pub const LEN: u32 = 12;

    pub fn new(version: u8, session: u16, serial: Serial) -> Self {
        SerialNotify {
            header: Header::new(version, Self::PDU, session, Self::LEN),
            serial: serial.0.to_be(),
        }
    }

    pub fn session(&self) -> u16 {
        self.header.session()
    }

    pub fn serial(&self) -> Serial {
        Serial(u32::from_be(self.serial))
    }
}

common!(SerialNotify);


//------------ SerialQuery ---------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct SerialQuery {
    header: Header,
    payload: SerialQueryPayload,
}

impl SerialQuery {
    pub const PDU: u8 = 1;
    pub const LEN: u32 = 12;

    pub fn new(version: u8, session: u16, serial: Serial) -> Self {
        SerialQuery {
            header: Header::new(version, Self::PDU, session, Self::LEN),
            payload: SerialQueryPayload::new(serial),
        }
    }
}

common!(SerialQuery);


//------------ SerialQueryPayload --------------------------------------------

/// The part of a serial query following the header.
#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct SerialQueryPayload {
    serial: u32
}

impl SerialQueryPayload {
    pub fn new(serial: Serial) -> Self {
        SerialQueryPayload {
            serial: serial.0.to_be()
        }
    }

    pub fn serial(self) -> Serial {
        Serial(u32::from_be(self.serial))
    }
}

common!(SerialQueryPayload);


//------------ ResetQuery ----------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct ResetQuery {
    header: Header
}

impl ResetQuery {
    pub const PDU: u8 = 2;
    pub const LEN: u32 = 8;

    pub fn new(version: u8) -> Self {
        ResetQuery {
            header: Header::new(version, Self::PDU, 0, Self::LEN)
        }
    }
}

common!(ResetQuery);


//------------ CacheResponse -------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct CacheResponse {
    header: Header
}

impl CacheResponse {
    pub const PDU: u8 = 3;
    pub const LEN: u32 = 8;

    pub fn new(version: u8, session: u16) -> Self {
        CacheResponse {
            header: Header::new(version, Self::PDU, session, Self::LEN)
        }
    }
}

common!(CacheResponse);


//------------ Ipv4Prefix ----------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct Ipv4Prefix {
    header: Header,
    flags: u8,
    prefix_len: u8,
    max_len: u8,
    zero: u8,
    prefix: u32,
    asn: u32
}

impl Ipv4Prefix {
    pub const PDU: u8 = 4;
    pub const LEN: u32 = 20;

    pub fn new(
        version: u8,
        flags: u8,
        prefix_len: u8,
        max_len: u8,
        prefix: Ipv4Addr,
        asn: u32
    ) -> Self {
        Ipv4Prefix {
            header: Header::new(version, Self::PDU, 0, Self::LEN),
            flags,
            prefix_len,
            max_len,
            zero: 0,
            prefix: u32::from(prefix).to_be(),
            asn: asn.to_be()
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn max_len(&self) -> u8 {
        self.max_len
    }

    pub fn prefix(&self) -> Ipv4Addr {
        u32::from_be(self.prefix).into()
    }

    pub fn asn(&self) -> u32 {
        u32::from_be(self.asn)
    }
}

common!(Ipv4Prefix);


//------------ Ipv6Prefix ----------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct Ipv6Prefix {
    header: Header,
    flags: u8,
    prefix_len: u8,
    max_len: u8,
    zero: u8,
    prefix: u128,
    asn: u32,
}

impl Ipv6Prefix {
    pub const PDU: u8 = 6;
    pub const LEN: u32 = 32;

    pub fn new(
        version: u8,
        flags: u8,
        prefix_len: u8,
        max_len: u8,
        prefix: Ipv6Addr,
        asn: u32
    ) -> Self {
        Ipv6Prefix {
            header: Header::new(version, Self::PDU, 0, Self::LEN),
            flags,
            prefix_len,
            max_len,
            zero: 0,
            prefix: u128::from(prefix).to_be(),
            asn: asn.to_be()
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn max_len(&self) -> u8 {
        self.max_len
    }

    pub fn prefix(&self) -> Ipv6Addr {
        u128::from_be(self.prefix).into()
    }

    pub fn asn(&self) -> u32 {
        u32::from_be(self.asn)
    }
}

common!(Ipv6Prefix);


//------------ Prefix --------------------------------------------------------

/// A prefix PDU for either address family.
pub enum Prefix {
    V4(Ipv4Prefix),
    V6(Ipv6Prefix),
}

impl Prefix {
    /// The flag for announcing a route origin.
    pub const ANNOUNCE: u8 = 1;

    /// The flag for withdrawing a route origin.
    pub const WITHDRAW: u8 = 0;

    pub fn new(version: u8, flags: u8, origin: &AddressOrigin) -> Self {
        let prefix = origin.prefix();
        match prefix.address() {
            IpAddr::V4(addr) => {
                Prefix::V4(
                    Ipv4Prefix::new(
                        version,
                        flags,
                        prefix.address_length(),
                        origin.max_length(),
                        addr,
                        origin.asn().into_u32()
                    )
                )
            }
            IpAddr::V6(addr) => {
                Prefix::V6(
                    Ipv6Prefix::new(
                        version,
                        flags,
                        prefix.address_length(),
                        origin.max_length(),
                        addr,
                        origin.asn().into_u32()
                    )
                )
            }
        }
    }

    pub async fn write<Sock: AsyncWrite + Unpin>(
        &self, sock: &mut Sock
    ) -> Result<(), io::Error> {
        sock.write_all(self.as_ref()).await
    }
}

impl AsRef<[u8]> for Prefix {
    fn as_ref(&self) -> &[u8] {
        match *self {
            Prefix::V4(ref prefix) => prefix.as_ref(),
            Prefix::V6(ref prefix) => prefix.as_ref(),
        }
    }
}


//------------ EndOfData -----------------------------------------------------

/// Generic End-of-Data PDU.
///
/// This PDU differs between version 0 and 1 of RTR. Consequently, this
/// generic version is an enum that can be both, depending on the version
/// requested.
pub enum EndOfData {
    V0(EndOfDataV0),
    V1(EndOfDataV1),
}

impl EndOfData {
    pub const PDU: u8 = 7;

    pub fn new(
        version: u8,
        session: u16,
        serial: Serial,
        timing: super::send::Timing,
    ) -> Self {
        if version == 0 {
            EndOfData::V0(EndOfDataV0::new(session, serial))
        }
        else {
            EndOfData::V1(EndOfDataV1::new(
                version, session, serial,
                timing.refresh, timing.retry, timing.expire
            ))
        }
    }

    pub async fn write<Sock: AsyncWrite + Unpin>(
        &self, sock: &mut Sock
    ) -> Result<(), io::Error> {
        sock.write_all(self.as_ref()).await
    }
}

impl AsRef<[u8]> for EndOfData {
    fn as_ref(&self) -> &[u8] {
        match *self {
            EndOfData::V0(ref inner) => inner.as_ref(),
            EndOfData::V1(ref inner) => inner.as_ref(),
        }
    }
}


//------------ EndOfDataV0 ---------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct EndOfDataV0 {
    header: Header,
    serial: u32
}

impl EndOfDataV0 {
    pub const LEN: u32 = 12;

    pub fn new(session: u16, serial: Serial) -> Self {
        EndOfDataV0 {
            header: Header::new(0, EndOfData::PDU, session, Self::LEN),
            serial: serial.0.to_be()
        }
    }

    pub fn serial(&self) -> Serial {
        Serial(u32::from_be(self.serial))
    }
}

common!(EndOfDataV0);


//------------ EndOfDataV1 ---------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct EndOfDataV1 {
    header: Header,
    serial: u32,
    refresh: u32,
    retry: u32,
    expire: u32,
}

impl EndOfDataV1 {
    pub const LEN: u32 = 24;

    pub fn new(
        version: u8,
        session: u16,
        serial: Serial,
        refresh: u32,
        retry: u32,
        expire: u32
    ) -> Self {
        EndOfDataV1 {
            header: Header::new(version, EndOfData::PDU, session, Self::LEN),
            serial: serial.0.to_be(),
            refresh: refresh.to_be(),
            retry: retry.to_be(),
            expire: expire.to_be(),
        }
    }

    pub fn serial(&self) -> Serial {
        Serial(u32::from_be(self.serial))
    }

    pub fn refresh(&self) -> u32 {
        u32::from_be(self.refresh)
    }

    pub fn retry(&self) -> u32 {
        u32::from_be(self.retry)
    }

    pub fn expire(&self) -> u32 {
        u32::from_be(self.expire)
    }
}

common!(EndOfDataV1);


//------------ CacheReset ----------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct CacheReset {
    header: Header
}

impl CacheReset {
    pub const PDU: u8 = 8;
    pub const LEN: u32 = 8;

    pub fn new(version: u8) -> Self {
        CacheReset {
            header: Header::new(version, Self::PDU, 0, Self::LEN)
        }
    }
}

common!(CacheReset);


//------------ ErrorReport ---------------------------------------------------

/// An Error Report PDU.
///
/// Since the erroneous PDU and the error text have variable length, the PDU
/// is assembled into a buffer rather than a fixed struct.
#[derive(Clone, Debug)]
pub struct ErrorReport {
    octets: Bytes,
}

impl ErrorReport {
    pub const PDU: u8 = 10;

    pub const CORRUPT_DATA: u16 = 0;
    pub const INTERNAL_ERROR: u16 = 1;
    pub const NO_DATA_AVAILABLE: u16 = 2;
    pub const INVALID_REQUEST: u16 = 3;
    pub const UNSUPPORTED_VERSION: u16 = 4;
    pub const UNSUPPORTED_PDU_TYPE: u16 = 5;
    pub const UNEXPECTED_PROTOCOL_VERSION: u16 = 8;

    /// Creates a new error report.
    ///
    /// The `pdu` is the erroneous PDU or as much of it as is available.
    pub fn new(version: u8, error_code: u16, pdu: &[u8], text: &str) -> Self {
        let len = 16 + pdu.len() + text.len();
        let mut octets = BytesMut::with_capacity(len);
        octets.put_slice(
            Header::new(version, Self::PDU, error_code, len as u32).as_ref()
        );
        octets.put_u32(pdu.len() as u32);
        octets.put_slice(pdu);
        octets.put_u32(text.len() as u32);
        octets.put_slice(text.as_bytes());
        ErrorReport { octets: octets.freeze() }
    }

    pub fn error_code(&self) -> u16 {
        u16::from_be_bytes([self.octets[2], self.octets[3]])
    }

    pub async fn write<Sock: AsyncWrite + Unpin>(
        &self, sock: &mut Sock
    ) -> Result<(), io::Error> {
        sock.write_all(self.as_ref()).await
    }
}

impl AsRef<[u8]> for ErrorReport {
    fn as_ref(&self) -> &[u8] {
        self.octets.as_ref()
    }
}


//------------ Header --------------------------------------------------------

/// The header common to all PDUs.
///
/// The `session` field doubles as the error code in Error Report PDUs and
/// is zero in some others.
#[derive(Clone, Copy, Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct Header {
    version: u8,
    pdu: u8,
    session: u16,
    length: u32,
}

impl Header {
    pub const LEN: u32 = 8;

    pub fn new(version: u8, pdu: u8, session: u16, length: u32) -> Self {
        Header {
            version,
            pdu,
            session: session.to_be(),
            length: length.to_be(),
        }
    }

    pub fn version(self) -> u8 {
        self.version
    }

    pub fn pdu(self) -> u8 {
        self.pdu
    }

    pub fn session(self) -> u16 {
        u16::from_be(self.session)
    }

    pub fn length(self) -> u32 {
        u32::from_be(self.length)
    }
}

common!(Header);


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::origins::test::origin;
    use crate::rtr::send::Timing;

    #[test]
    fn pdu_sizes() {
        assert_eq!(SerialNotify::default().as_ref().len(), 12);
        assert_eq!(SerialQuery::default().as_ref().len(), 12);
        assert_eq!(ResetQuery::default().as_ref().len(), 8);
        assert_eq!(CacheResponse::default().as_ref().len(), 8);
        assert_eq!(Ipv4Prefix::default().as_ref().len(), 20);
        assert_eq!(Ipv6Prefix::default().as_ref().len(), 32);
        assert_eq!(EndOfDataV0::default().as_ref().len(), 12);
        assert_eq!(EndOfDataV1::default().as_ref().len(), 24);
        assert_eq!(CacheReset::default().as_ref().len(), 8);
    }

    #[test]
    fn wire_format() {
        assert_eq!(
            SerialNotify::new(1, 0x1234, Serial(5)).as_ref(),
            &[1, 0, 0x12, 0x34, 0, 0, 0, 12, 0, 0, 0, 5]
        );
        assert_eq!(
            Prefix::new(1, 1, &origin(65000, "192.0.2.0/24", 25)).as_ref(),
            &[
                1, 4, 0, 0, 0, 0, 0, 20,
                1, 24, 25, 0,
                192, 0, 2, 0,
                0, 0, 0xfd, 0xe8,
            ]
        );
        let timing = Timing::new(3600, 600, 7200);
        assert_eq!(
            EndOfData::new(0, 7, Serial(9), timing).as_ref(),
            &[0, 7, 0, 7, 0, 0, 0, 12, 0, 0, 0, 9]
        );
        assert_eq!(
            EndOfData::new(1, 7, Serial(9), timing).as_ref().len(), 24
        );
    }

    #[test]
    fn error_report() {
        let offending = ResetQuery::new(2);
        let report = ErrorReport::new(
            1, ErrorReport::UNSUPPORTED_VERSION, offending.as_ref(), "no"
        );
        assert_eq!(report.error_code(), 4);
        assert_eq!(
            report.as_ref(),
            &[
                1, 10, 0, 4, 0, 0, 0, 26,
                0, 0, 0, 8,
                2, 2, 0, 0, 0, 0, 0, 8,
                0, 0, 0, 2,
                b'n', b'o',
            ]
        );
    }
}
