//! Listener and connections.
//!
//! This module implements the RTR listener sockets and the high-level
//! connection handling.

use std::{cmp, io};
use std::net::SocketAddr;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::error::Failed;
use crate::origins::OriginsDiff;
use crate::process::Shutdown;
use super::PayloadSource;
use super::history::PublishedHistory;
use super::notify::{NotifyReceiver, NotifySender};
use super::query::{Query, QueryReader};
use super::send::{Sender, Timing};
use super::serial::Serial;


//------------ NotificationServer --------------------------------------------

/// The RTR server.
///
/// The server takes all its data from a [`PayloadSource`]. It learns about
/// new data through the [`NotifySender`] available via
/// [`notifier`][Self::notifier].
#[derive(Clone, Debug)]
pub struct NotificationServer<Source> {
    source: Source,
    history: PublishedHistory,
    notify: NotifySender,
    timing: Timing,

    /// Keep connections open after protocol errors?
    keep_open: bool,
}

impl<Source: PayloadSource> NotificationServer<Source> {
    /// Creates a new server.
    ///
    /// If `notify` is `false`, no Serial Notify PDUs are sent and routers
    /// have to poll. If `keep_open` is `true`, connections are not closed
    /// after sending an Error Report for a malformed query.
    pub fn new(
        source: Source,
        history_size: usize,
        timing: Timing,
        notify: bool,
        keep_open: bool,
    ) -> Self {
        let version = source.current_version();
        NotificationServer {
            source,
            history: PublishedHistory::new(history_size),
            notify: NotifySender::new(version, notify),
            timing,
            keep_open,
        }
    }

    /// Returns a notifier for this server.
    pub fn notifier(&self) -> NotifySender {
        self.notify.clone()
    }

    /// Tells all connected routers about a new version.
    pub fn notify(&self, version: u64) -> bool {
        self.notify.notify(version)
    }

    /// Binds listeners to all the given addresses.
    ///
    /// Fails if any of them cannot be bound.
    pub async fn bind(
        addrs: &[SocketAddr]
    ) -> Result<Vec<TcpListener>, Failed> {
        let mut res = Vec::with_capacity(addrs.len());
        for addr in addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!("RTR: Listening on {}.", addr);
                    res.push(listener)
                }
                Err(err) => {
                    error!("Failed to bind RTR listener {}: {}", addr, err);
                    return Err(Failed)
                }
            }
        }
        Ok(res)
    }

    /// Runs the server on the given listeners until shutdown.
    pub async fn run(self, listeners: Vec<TcpListener>, shutdown: Shutdown) {
        let tasks: Vec<_> = listeners.into_iter().map(|listener| {
            tokio::spawn(self.clone().single_listener(
                listener, shutdown.clone()
            ))
        }).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Accepts connections on a single listener until shutdown.
    ///
    /// Every connection is spawned as a new task.
    async fn single_listener(
        self, listener: TcpListener, mut shutdown: Shutdown
    ) {
        loop {
            let (sock, addr) = tokio::select! {
                res = listener.accept() => {
                    match res {
                        Ok(some) => some,
                        Err(err) => {
                            error!("Failed to accept RTR connection: {}", err);
                            continue
                        }
                    }
                }
                _ = shutdown.wait() => break,
            };
            debug!("RTR: new connection from {}.", addr);
            tokio::spawn(
                Connection::new(sock, self.clone(), shutdown.clone()).run()
            );
        }
    }
}


//------------ Connection ----------------------------------------------------

/// A single RTR connection.
struct Connection<Source> {
    /// The queries read from the socket.
    ///
    /// Queries are read by a separate task since reading isn’t cancel safe.
    queries: mpsc::Receiver<Result<Option<Query>, io::Error>>,

    /// The task reading queries.
    reader: JoinHandle<()>,

    /// The output half of the socket.
    output: Sender<OwnedWriteHalf>,

    /// Where we learn about new data.
    notify: NotifyReceiver,

    /// The negotiated protocol version.
    ///
    /// This is `None` until we have received the first query.
    version: Option<u8>,

    server: NotificationServer<Source>,
    shutdown: Shutdown,
}

impl<Source: PayloadSource> Connection<Source> {
    fn new(
        sock: TcpStream,
        server: NotificationServer<Source>,
        shutdown: Shutdown,
    ) -> Self {
        let (read, write) = sock.into_split();
        let (tx, rx) = mpsc::channel(1);
        let reader = tokio::spawn(
            Self::read_queries(
                QueryReader::new(read, server.keep_open), tx
            )
        );
        Connection {
            queries: rx,
            reader,
            output: Sender::new(
                write, server.source.current_nonce(), server.timing
            ),
            notify: server.notify.subscribe(),
            version: None,
            server,
            shutdown,
        }
    }

    async fn read_queries(
        mut reader: QueryReader<OwnedReadHalf>,
        tx: mpsc::Sender<Result<Option<Query>, io::Error>>,
    ) {
        loop {
            let res = reader.next().await;
            let done = match res {
                Ok(Some(ref query)) => query.is_final(),
                _ => true,
            };
            if tx.send(res).await.is_err() || done {
                break
            }
        }
    }

    async fn run(mut self) {
        if let Err(err) = self.process().await {
            debug!("RTR connection error: {}", err);
        }
        self.reader.abort();
    }

    async fn process(&mut self) -> Result<(), io::Error> {
        loop {
            tokio::select! {
                query = self.queries.recv() => {
                    match query {
                        Some(Ok(Some(query))) => {
                            if !self.query(query).await? {
                                return Ok(())
                            }
                        }
                        Some(Err(err)) => return Err(err),
                        Some(Ok(None)) | None => return Ok(()),
                    }
                }
                version = self.notify.recv() => {
                    self.serial_notify(version).await?
                }
                _ = self.shutdown.wait() => return Ok(())
            }
        }
    }

    /// Processes a query.
    ///
    /// Returns whether the connection should continue.
    async fn query(&mut self, query: Query) -> Result<bool, io::Error> {
        match query {
            Query::Serial { version, session, serial } => {
                self.version = Some(version);
                self.serial_query(version, session, serial).await?;
                Ok(true)
            }
            Query::Reset { version } => {
                self.version = Some(version);
                self.reset_query(version).await?;
                Ok(true)
            }
            Query::Error { report, close } => {
                self.output.error(&report).await?;
                Ok(!close)
            }
            Query::Report { code } => {
                warn!(
                    "RTR: client sent error report with code {}, \
                     closing connection.",
                    code
                );
                Ok(false)
            }
        }
    }

    async fn reset_query(&mut self, version: u8) -> Result<(), io::Error> {
        let (current, origins) = self.server.source.current();
        let serial = Serial::from_version(current);
        self.server.history.record(serial, &origins);
        self.output.full(version, serial, &origins).await
    }

    async fn serial_query(
        &mut self, version: u8, session: u16, serial: Serial
    ) -> Result<(), io::Error> {
        if session != self.server.source.current_nonce() {
            debug!("RTR: session mismatch, sending cache reset.");
            return self.output.reset(version).await
        }
        let (current, origins) = self.server.source.current();
        let current = Serial::from_version(current);
        self.server.history.record(current, &origins);
        if serial == current {
            return self.output.diff(
                version, current, &OriginsDiff::default()
            ).await
        }
        if serial.partial_cmp(&current) != Some(cmp::Ordering::Less) {
            debug!(
                "RTR: serial {} is ahead of {}, sending cache reset.",
                serial, current
            );
            return self.output.reset(version).await
        }
        match self.server.history.get(serial) {
            Some(old) => {
                let diff = OriginsDiff::construct(&old, &origins);
                self.output.diff(version, current, &diff).await
            }
            None => {
                debug!("RTR: unknown serial {}, sending cache reset.", serial);
                self.output.reset(version).await
            }
        }
    }

    async fn serial_notify(&mut self, version: u64) -> Result<(), io::Error> {
        // Before the first query we don’t know which version to speak.
        match self.version {
            Some(protocol) => {
                self.output.notify(
                    protocol, Serial::from_version(version)
                ).await
            }
            None => Ok(())
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;
    use crate::origins::AddressOrigins;
    use crate::origins::test::origin;
    use crate::process::ShutdownSender;
    use crate::rtr::pdu;

    /// A payload source with settable data.
    #[derive(Clone, Default)]
    struct TestSource(Arc<Mutex<(u64, Arc<AddressOrigins>)>>);

    impl TestSource {
        fn set(&self, version: u64, origins: AddressOrigins) {
            *self.0.lock().unwrap() = (version, Arc::new(origins));
        }
    }

    impl PayloadSource for TestSource {
        fn current_version(&self) -> u64 {
            self.0.lock().unwrap().0
        }

        fn current_prefixes(&self) -> Arc<AddressOrigins> {
            self.0.lock().unwrap().1.clone()
        }

        fn current_nonce(&self) -> u16 {
            0x4242
        }

        fn current(&self) -> (u64, Arc<AddressOrigins>) {
            self.0.lock().unwrap().clone()
        }
    }

    async fn start(
        source: TestSource, notify: bool, keep_open: bool
    ) -> (SocketAddr, NotificationServer<TestSource>, ShutdownSender) {
        let server = NotificationServer::new(
            source, 10, Timing::default(), notify, keep_open
        );
        let listeners = NotificationServer::<TestSource>::bind(
            &["127.0.0.1:0".parse().unwrap()]
        ).await.unwrap();
        let addr = listeners[0].local_addr().unwrap();
        let (tx, shutdown) = ShutdownSender::new();
        tokio::spawn(server.clone().run(listeners, shutdown));
        (addr, server, tx)
    }

    /// Reads one PDU and returns its header and complete octets.
    async fn read_pdu(sock: &mut TcpStream) -> (pdu::Header, Vec<u8>) {
        let header = timeout(
            Duration::from_secs(5), pdu::Header::read(sock)
        ).await.unwrap().unwrap();
        let mut res = header.as_ref().to_vec();
        res.resize(header.length() as usize, 0);
        sock.read_exact(&mut res[8..]).await.unwrap();
        (header, res)
    }

    fn set(origins: &[(u32, &str)]) -> AddressOrigins {
        origins.iter().map(|(asn, prefix)| {
            let len = prefix.parse::<crate::origins::AddressPrefix>()
                .unwrap().address_length();
            origin(*asn, prefix, len)
        }).collect()
    }

    #[tokio::test]
    async fn reset_and_serial_query() {
        let source = TestSource::default();
        source.set(5, set(&[(65000, "10.0.0.0/24"), (65001, "10.1.0.0/24")]));
        let (addr, _server, _shutdown) = start(
            source.clone(), true, false
        ).await;
        let mut sock = TcpStream::connect(addr).await.unwrap();

        sock.write_all(pdu::ResetQuery::new(1).as_ref()).await.unwrap();
        let (header, _) = read_pdu(&mut sock).await;
        assert_eq!(header.pdu(), pdu::CacheResponse::PDU);
        assert_eq!(header.session(), 0x4242);
        for _ in 0..2 {
            let (header, _) = read_pdu(&mut sock).await;
            assert_eq!(header.pdu(), pdu::Ipv4Prefix::PDU);
        }
        let (header, octets) = read_pdu(&mut sock).await;
        assert_eq!(header.pdu(), pdu::EndOfData::PDU);
        assert_eq!(&octets[8..12], &[0, 0, 0, 5]);

        // Change the data and ask for a diff.
        source.set(7, set(&[(65000, "10.0.0.0/24"), (65002, "10.2.0.0/24")]));
        sock.write_all(
            pdu::SerialQuery::new(1, 0x4242, Serial(5)).as_ref()
        ).await.unwrap();
        let (header, _) = read_pdu(&mut sock).await;
        assert_eq!(header.pdu(), pdu::CacheResponse::PDU);
        let (_, announce) = read_pdu(&mut sock).await;
        assert_eq!(announce[8], pdu::Prefix::ANNOUNCE);
        assert_eq!(&announce[12..16], &[10, 2, 0, 0]);
        let (_, withdraw) = read_pdu(&mut sock).await;
        assert_eq!(withdraw[8], pdu::Prefix::WITHDRAW);
        assert_eq!(&withdraw[12..16], &[10, 1, 0, 0]);
        let (header, octets) = read_pdu(&mut sock).await;
        assert_eq!(header.pdu(), pdu::EndOfData::PDU);
        assert_eq!(&octets[8..12], &[0, 0, 0, 7]);

        // The current serial gets an empty response.
        sock.write_all(
            pdu::SerialQuery::new(1, 0x4242, Serial(7)).as_ref()
        ).await.unwrap();
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::CacheResponse::PDU);
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::EndOfData::PDU);

        // Unknown serials, serials from the future, and wrong sessions get
        // a cache reset.
        sock.write_all(
            pdu::SerialQuery::new(1, 0x4242, Serial(2)).as_ref()
        ).await.unwrap();
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::CacheReset::PDU);
        sock.write_all(
            pdu::SerialQuery::new(1, 0x4242, Serial(9)).as_ref()
        ).await.unwrap();
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::CacheReset::PDU);
        sock.write_all(
            pdu::SerialQuery::new(1, 0x1111, Serial(7)).as_ref()
        ).await.unwrap();
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::CacheReset::PDU);
    }

    #[tokio::test]
    async fn notify_all_sessions_once() {
        let source = TestSource::default();
        source.set(5, AddressOrigins::default());
        let (addr, server, _shutdown) = start(source.clone(), true, false).await;

        let mut socks = Vec::new();
        for _ in 0..3 {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            sock.write_all(pdu::ResetQuery::new(1).as_ref()).await.unwrap();
            assert_eq!(
                read_pdu(&mut sock).await.0.pdu(), pdu::CacheResponse::PDU
            );
            assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::EndOfData::PDU);
            socks.push(sock);
        }

        source.set(6, AddressOrigins::default());
        assert!(server.notify(6));
        assert!(!server.notify(6));
        for sock in &mut socks {
            let (header, octets) = read_pdu(sock).await;
            assert_eq!(header.pdu(), pdu::SerialNotify::PDU);
            assert_eq!(header.session(), 0x4242);
            assert_eq!(&octets[8..12], &[0, 0, 0, 6]);
            let mut buf = [0u8; 1];
            assert!(
                timeout(Duration::from_millis(100), sock.read(&mut buf))
                    .await.is_err()
            );
        }
    }

    #[tokio::test]
    async fn suppressed_notify() {
        let source = TestSource::default();
        let (addr, server, _shutdown) = start(source.clone(), false, false)
            .await;
        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(pdu::ResetQuery::new(0).as_ref()).await.unwrap();
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::CacheResponse::PDU);
        let (header, octets) = read_pdu(&mut sock).await;
        assert_eq!(header.pdu(), pdu::EndOfData::PDU);
        assert_eq!(octets.len(), 12);

        source.set(1, AddressOrigins::default());
        assert!(!server.notify(1));
        let mut buf = [0u8; 1];
        assert!(
            timeout(Duration::from_millis(100), sock.read(&mut buf))
                .await.is_err()
        );
    }

    #[tokio::test]
    async fn protocol_errors() {
        let source = TestSource::default();
        let (addr, _server, _shutdown) = start(source.clone(), true, false)
            .await;
        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(pdu::CacheResponse::new(1, 0).as_ref()).await.unwrap();
        let (header, _) = read_pdu(&mut sock).await;
        assert_eq!(header.pdu(), pdu::ErrorReport::PDU);
        assert_eq!(header.session(), pdu::ErrorReport::UNSUPPORTED_PDU_TYPE);
        let mut buf = [0u8; 1];
        assert_eq!(
            timeout(Duration::from_secs(5), sock.read(&mut buf))
                .await.unwrap().unwrap(),
            0
        );

        let (addr, _server, _shutdown) = start(source.clone(), true, true)
            .await;
        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(pdu::CacheResponse::new(1, 0).as_ref()).await.unwrap();
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::ErrorReport::PDU);
        sock.write_all(pdu::ResetQuery::new(1).as_ref()).await.unwrap();
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::CacheResponse::PDU);
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let source = TestSource::default();
        let (addr, _server, shutdown) = start(source, true, false).await;
        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(pdu::ResetQuery::new(1).as_ref()).await.unwrap();
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::CacheResponse::PDU);
        assert_eq!(read_pdu(&mut sock).await.0.pdu(), pdu::EndOfData::PDU);
        shutdown.shutdown();
        let mut buf = [0u8; 1];
        assert_eq!(
            timeout(Duration::from_secs(5), sock.read(&mut buf))
                .await.unwrap().unwrap(),
            0
        );
    }
}
