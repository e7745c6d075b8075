use std::{
    collections::HashMap,
    fmt, io, mem,
    net::{IpAddr, Ipv6Addr, Shutdown, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use socket2::{SockAddr, SockRef, Socket};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream, UdpSocket},
    runtime::Handle,
    sync::watch,
};
use uuid::Uuid;

use crate::{
    completion::OperationKind,
    error::SocketError,
    resolver::{AddressResolver, SystemResolver},
    runtime::{self, with_timeout},
};

use super::{
    address::{AddressFamily, Endpoint, MappedAddress, SocketKind},
    pktinfo::{self, ReceivedMessage},
};

enum Io {
    /// Created but neither listening nor connected. Datagram sockets stay
    /// here until their first transfer.
    Fresh(Socket),
    /// A stream connect owns the descriptor until it settles.
    Connecting,
    Listener(Arc<TcpListener>),
    Stream(Arc<TcpStream>),
    Datagram(Arc<UdpSocket>),
    Closed,
}

struct State {
    io: Io,
    dual: bool,
    /// Default peer of a connected datagram socket.
    peer: Option<SocketAddr>,
    receive_timeout: Option<Duration>,
    packet_information: bool,
    // Replayed onto the replacement descriptor after a failed connect.
    reuse_address: bool,
    ttl: Option<u32>,
    bound: Option<SocketAddr>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Bind,
    Connect,
}

enum Connection {
    Stream(Arc<TcpStream>),
    Datagram(Arc<UdpSocket>),
}

pub(crate) struct SocketCore {
    family: AddressFamily,
    kind: SocketKind,
    runtime: Handle,
    state: Mutex<State>,
    closed: watch::Sender<bool>,
    resolver: Mutex<Arc<dyn AddressResolver>>,
    pending: Mutex<HashMap<Uuid, OperationKind>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open(family: AddressFamily, kind: SocketKind, dual: bool) -> io::Result<Socket> {
    let socket = Socket::new(family.domain(), kind.socket_type(), Some(kind.protocol()))?;
    socket.set_nonblocking(true)?;
    if family == AddressFamily::V6 {
        socket.set_only_v6(!dual)?;
    }
    Ok(socket)
}

fn apply_ttl(sock: SockRef<'_>, family: AddressFamily, dual: bool, ttl: u32) -> io::Result<()> {
    match family {
        AddressFamily::V4 => sock.set_ttl(ttl),
        AddressFamily::V6 => {
            sock.set_unicast_hops_v6(ttl)?;
            if dual {
                sock.set_ttl(ttl)?;
            }
            Ok(())
        }
    }
}

fn bound_port(socket: SockRef<'_>) -> Option<u16> {
    let addr = socket.local_addr().ok()?.as_socket()?;
    if addr.port() == 0 {
        None
    } else {
        Some(addr.port())
    }
}

async fn read_stream(stream: &TcpStream, buf: &mut [u8]) -> Result<usize, SocketError> {
    loop {
        stream.readable().await?;
        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn write_stream(stream: &TcpStream, data: &[u8]) -> Result<usize, SocketError> {
    loop {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

impl SocketCore {
    fn new(
        family: AddressFamily,
        kind: SocketKind,
        runtime: Handle,
        io: Io,
        dual: bool,
        resolver: Arc<dyn AddressResolver>,
    ) -> SocketCore {
        let (closed, _) = watch::channel(false);
        SocketCore {
            family,
            kind,
            runtime,
            state: Mutex::new(State {
                io,
                dual,
                peer: None,
                receive_timeout: None,
                packet_information: false,
                reuse_address: false,
                ttl: None,
                bound: None,
            }),
            closed,
            resolver: Mutex::new(resolver),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    fn with_sock<R, E, F>(&self, f: F) -> Result<R, SocketError>
    where
        E: Into<SocketError>,
        F: FnOnce(SockRef<'_>) -> Result<R, E>,
    {
        let state = self.state();
        let sock = match &state.io {
            Io::Fresh(socket) => SockRef::from(socket),
            Io::Listener(listener) => SockRef::from(&**listener),
            Io::Stream(stream) => SockRef::from(&**stream),
            Io::Datagram(socket) => SockRef::from(&**socket),
            Io::Connecting => return Err(SocketError::InvalidArgument("a connect is in progress")),
            Io::Closed => return Err(SocketError::Disposed),
        };
        f(sock).map_err(Into::into)
    }

    /// Races `future` against the socket being closed.
    async fn guarded<T, F>(&self, future: F) -> Result<T, SocketError>
    where
        F: std::future::Future<Output = Result<T, SocketError>>,
    {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            result = future => result,
            _ = wait_closed(&mut closed) => Err(SocketError::Disposed),
        }
    }

    pub(crate) fn dual_mode(&self) -> Result<bool, SocketError> {
        if self.family == AddressFamily::V4 {
            return Err(SocketError::UnsupportedOperation(
                "dual mode is only defined for IPv6 sockets",
            ));
        }
        let state = self.state();
        match state.io {
            Io::Closed => Err(SocketError::Disposed),
            _ => Ok(state.dual),
        }
    }

    fn set_dual_mode(&self, enabled: bool) -> Result<(), SocketError> {
        if self.family == AddressFamily::V4 {
            return Err(SocketError::UnsupportedOperation(
                "dual mode is only defined for IPv6 sockets",
            ));
        }
        let mut state = self.state();
        match &state.io {
            Io::Fresh(socket) if bound_port(SockRef::from(socket)).is_none() => {
                socket.set_only_v6(!enabled)?;
            }
            Io::Closed => return Err(SocketError::Disposed),
            _ => {
                return Err(SocketError::fault(
                    io::ErrorKind::InvalidInput,
                    "dual mode cannot change once the socket is bound",
                ))
            }
        }
        state.dual = enabled;
        Ok(())
    }

    /// Applies the family/mode matrix to a concrete address.
    fn normalize(&self, addr: SocketAddr, purpose: Purpose) -> Result<SocketAddr, SocketError> {
        match (self.family, addr) {
            (AddressFamily::V4, SocketAddr::V4(_)) | (AddressFamily::V6, SocketAddr::V6(_)) => {
                Ok(addr)
            }
            (AddressFamily::V4, SocketAddr::V6(_)) => Err(SocketError::family_fault()),
            (AddressFamily::V6, SocketAddr::V4(v4)) => {
                if self.dual_mode()? {
                    if purpose == Purpose::Bind && v4.ip().is_unspecified() {
                        return Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), v4.port()));
                    }
                    return Ok(addr.map_to_v6());
                }
                match purpose {
                    Purpose::Bind => Err(SocketError::family_fault()),
                    Purpose::Connect => Err(SocketError::UnsupportedOperation(
                        "IPv4 destination on an IPv6 socket without dual mode",
                    )),
                }
            }
        }
    }

    fn accepts(&self, ip: &IpAddr, dual: bool) -> bool {
        match (self.family, ip) {
            (AddressFamily::V4, IpAddr::V4(_)) | (AddressFamily::V6, IpAddr::V6(_)) => true,
            (AddressFamily::V6, IpAddr::V4(_)) => dual,
            (AddressFamily::V4, IpAddr::V6(_)) => false,
        }
    }

    fn bind(&self, endpoint: &Endpoint) -> Result<(), SocketError> {
        let addr = match endpoint {
            Endpoint::Ip(addr) => *addr,
            Endpoint::Host(..) => {
                return Err(SocketError::InvalidArgument(
                    "bind requires a concrete address, not a host name",
                ))
            }
        };
        let addr = self.normalize(addr, Purpose::Bind)?;
        let mut state = self.state();
        let local = match &state.io {
            Io::Fresh(socket) => {
                socket.bind(&SockAddr::from(addr))?;
                socket.local_addr()?.as_socket()
            }
            Io::Closed => return Err(SocketError::Disposed),
            _ => {
                return Err(SocketError::fault(
                    io::ErrorKind::InvalidInput,
                    "socket is already bound",
                ))
            }
        };
        state.bound = local;
        log::debug!("bound {} {:?} socket to {}", self.family, self.kind, addr);
        Ok(())
    }

    fn listen(&self, backlog: i32) -> Result<(), SocketError> {
        if self.kind != SocketKind::Stream {
            return Err(SocketError::UnsupportedOperation(
                "only stream sockets can listen",
            ));
        }
        let mut state = self.state();
        let socket = match &state.io {
            Io::Fresh(socket) => socket,
            Io::Listener(_) => return Ok(()),
            Io::Closed => return Err(SocketError::Disposed),
            _ => return Err(SocketError::InvalidArgument("a connected socket cannot listen")),
        };
        socket.listen(backlog)?;
        // Registration works on a duplicate so a failure leaves the socket in place.
        let listener = {
            let _runtime = self.runtime.enter();
            TcpListener::from_std(socket.try_clone()?.into())?
        };
        if let Ok(addr) = listener.local_addr() {
            log::debug!("listening on {} (backlog {})", addr, backlog);
        }
        state.io = Io::Listener(Arc::new(listener));
        Ok(())
    }

    fn listener(&self) -> Result<Arc<TcpListener>, SocketError> {
        match &self.state().io {
            Io::Listener(listener) => Ok(listener.clone()),
            Io::Closed => Err(SocketError::Disposed),
            _ => Err(SocketError::InvalidArgument("socket is not listening")),
        }
    }

    pub(crate) async fn accept(&self) -> Result<DualStackSocket, SocketError> {
        let listener = self.listener()?;
        let (stream, peer) = self
            .guarded(async { listener.accept().await.map_err(SocketError::from) })
            .await?;
        log::debug!("accepted connection from {}", peer);
        let resolver = self.resolver();
        Ok(DualStackSocket::from_core(SocketCore::new(
            self.family,
            SocketKind::Stream,
            self.runtime.clone(),
            Io::Stream(Arc::new(stream)),
            self.dual_mode().unwrap_or(false),
            resolver,
        )))
    }

    fn resolver(&self) -> Arc<dyn AddressResolver> {
        lock(&self.resolver).clone()
    }

    pub(crate) async fn connect(&self, endpoint: Endpoint) -> Result<(), SocketError> {
        match endpoint {
            Endpoint::Ip(addr) => {
                let addr = self.normalize(addr, Purpose::Connect)?;
                self.connect_addr(addr).await
            }
            Endpoint::Host(host, port) => {
                let resolver = self.resolver();
                let addresses = self.guarded(resolver.resolve(&host)).await?;
                self.connect_any(&addresses, port).await
            }
        }
    }

    pub(crate) async fn connect_any(
        &self,
        addresses: &[IpAddr],
        port: u16,
    ) -> Result<(), SocketError> {
        let dual = match self.family {
            AddressFamily::V4 => false,
            AddressFamily::V6 => self.dual_mode()?,
        };
        let candidates: Vec<SocketAddr> = addresses
            .iter()
            .filter(|ip| self.accepts(ip, dual))
            .map(|ip| match self.family {
                AddressFamily::V4 => SocketAddr::new(*ip, port),
                AddressFamily::V6 => SocketAddr::new(*ip, port).map_to_v6(),
            })
            .collect();
        if candidates.is_empty() {
            return Err(SocketError::AddressFamilyMismatch {
                candidates: addresses.len(),
            });
        }
        let mut last_error = None;
        for addr in candidates {
            match self.connect_addr(addr).await {
                Ok(()) => return Ok(()),
                Err(SocketError::Disposed) => return Err(SocketError::Disposed),
                Err(e) => {
                    log::debug!("connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(SocketError::AddressFamilyMismatch {
            candidates: addresses.len(),
        }))
    }

    /// Takes the descriptor out for one connect attempt.
    fn stream_attempt(&self) -> Result<Socket, SocketError> {
        let mut state = self.state();
        let error = match &state.io {
            Io::Fresh(_) => None,
            Io::Closed => Some(SocketError::Disposed),
            Io::Connecting => {
                Some(SocketError::InvalidArgument("a connect is already in progress"))
            }
            Io::Listener(_) => {
                Some(SocketError::InvalidArgument("a listening socket cannot connect"))
            }
            _ => Some(SocketError::fault(
                io::ErrorKind::AlreadyExists,
                "socket is already connected",
            )),
        };
        if let Some(error) = error {
            return Err(error);
        }
        match mem::replace(&mut state.io, Io::Connecting) {
            Io::Fresh(socket) => Ok(socket),
            _ => Err(SocketError::Disposed),
        }
    }

    /// A new descriptor with the mode, options and local address of the one a
    /// failed connect used up. A refused connect leaves a TCP socket unable to
    /// connect again.
    fn replacement(&self, state: &State) -> io::Result<Socket> {
        let socket = open(self.family, self.kind, state.dual)?;
        if state.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if let Some(ttl) = state.ttl {
            apply_ttl(SockRef::from(&socket), self.family, state.dual, ttl)?;
        }
        if let Some(local) = state.bound {
            socket.bind(&SockAddr::from(local))?;
        }
        Ok(socket)
    }

    fn finish_stream(&self, result: Result<TcpStream, SocketError>) -> Result<(), SocketError> {
        let mut state = self.state();
        if let Io::Closed = state.io {
            return Err(SocketError::Disposed);
        }
        match result {
            Ok(stream) => {
                if let Ok(peer) = stream.peer_addr() {
                    log::debug!("connected to {}", peer);
                }
                state.io = Io::Stream(Arc::new(stream));
                Ok(())
            }
            Err(e) => {
                match self.replacement(&state) {
                    Ok(socket) => state.io = Io::Fresh(socket),
                    Err(rebuild) => {
                        log::warn!("cannot replace socket after failed connect: {}", rebuild);
                        state.io = Io::Closed;
                        self.closed.send_replace(true);
                    }
                }
                Err(e)
            }
        }
    }

    async fn connect_addr(&self, addr: SocketAddr) -> Result<(), SocketError> {
        match self.kind {
            SocketKind::Stream => {
                let socket = TcpSocket::from_std_stream(self.stream_attempt()?.into());
                let attempt = ConnectAttempt {
                    core: self,
                    settled: false,
                };
                let result = self
                    .guarded(async { socket.connect(addr).await.map_err(SocketError::from) })
                    .await;
                attempt.settle(result)
            }
            SocketKind::Datagram => {
                let socket = self.datagram()?;
                self.guarded(async { socket.connect(addr).await.map_err(SocketError::from) })
                    .await?;
                self.state().peer = Some(addr);
                log::debug!("datagram socket connected to {}", addr);
                Ok(())
            }
        }
    }

    /// The registered datagram socket, registering it on first use.
    fn datagram(&self) -> Result<Arc<UdpSocket>, SocketError> {
        if self.kind != SocketKind::Datagram {
            return Err(SocketError::UnsupportedOperation(
                "connectionless operation on a stream socket",
            ));
        }
        let mut state = self.state();
        let registered = match &state.io {
            Io::Datagram(socket) => return Ok(socket.clone()),
            Io::Fresh(socket) => {
                let _runtime = self.runtime.enter();
                Arc::new(UdpSocket::from_std(socket.try_clone()?.into())?)
            }
            _ => return Err(SocketError::Disposed),
        };
        state.io = Io::Datagram(registered.clone());
        Ok(registered)
    }

    fn connection(&self) -> Result<Connection, SocketError> {
        let state = self.state();
        match &state.io {
            Io::Stream(stream) => Ok(Connection::Stream(stream.clone())),
            Io::Datagram(socket) if state.peer.is_some() => {
                Ok(Connection::Datagram(socket.clone()))
            }
            Io::Closed => Err(SocketError::Disposed),
            _ => Err(SocketError::fault(
                io::ErrorKind::NotConnected,
                "socket is not connected",
            )),
        }
    }

    fn receive_timeout(&self) -> Option<Duration> {
        self.state().receive_timeout
    }

    pub(crate) async fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        let sent = match self.connection()? {
            Connection::Stream(stream) => self.guarded(write_stream(&stream, data)).await?,
            Connection::Datagram(socket) => {
                self.guarded(async { socket.send(data).await.map_err(SocketError::from) })
                    .await?
            }
        };
        log::trace!("sent {} bytes", sent);
        Ok(sent)
    }

    pub(crate) async fn receive(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let connection = self.connection()?;
        let timeout = self.receive_timeout();
        let received = match connection {
            Connection::Stream(stream) => {
                self.guarded(with_timeout(timeout, read_stream(&stream, buf)))
                    .await?
            }
            Connection::Datagram(socket) => {
                self.guarded(with_timeout(timeout, async {
                    socket.recv(buf).await.map_err(SocketError::from)
                }))
                .await?
            }
        };
        log::trace!("received {} bytes", received);
        Ok(received)
    }

    fn send_target(&self, endpoint: &Endpoint) -> Result<SocketAddr, SocketError> {
        match endpoint {
            Endpoint::Ip(addr) => self.normalize(*addr, Purpose::Connect),
            Endpoint::Host(..) => Err(SocketError::InvalidArgument(
                "connectionless operations need an address, not a host name",
            )),
        }
    }

    pub(crate) async fn send_to(
        &self,
        data: &[u8],
        endpoint: &Endpoint,
    ) -> Result<usize, SocketError> {
        let socket = self.datagram()?;
        let target = self.send_target(endpoint)?;
        let sent = self
            .guarded(async { socket.send_to(data, target).await.map_err(SocketError::from) })
            .await?;
        log::trace!("sent {} bytes to {}", sent, target);
        Ok(sent)
    }

    /// Checks the caller's placeholder remote endpoint against the socket's
    /// mode before anything is received.
    fn receive_source(&self, placeholder: &Endpoint) -> Result<Arc<UdpSocket>, SocketError> {
        if self.kind != SocketKind::Datagram {
            return Err(SocketError::UnsupportedOperation(
                "connectionless operation on a stream socket",
            ));
        }
        let family = match placeholder {
            Endpoint::Ip(addr) => AddressFamily::of(&addr.ip()),
            Endpoint::Host(..) => {
                return Err(SocketError::InvalidArgument(
                    "connectionless operations need an address, not a host name",
                ))
            }
        };
        let compatible = family == self.family
            || (family == AddressFamily::V4
                && self.family == AddressFamily::V6
                && self.dual_mode()?);
        if !compatible {
            return Err(SocketError::InvalidArgument(
                "remote endpoint family does not match the socket's mode",
            ));
        }
        if !self.is_bound() {
            return Err(SocketError::InvalidArgument(
                "socket must be bound before receiving from an unknown peer",
            ));
        }
        self.datagram()
    }

    pub(crate) async fn receive_from(
        &self,
        buf: &mut [u8],
        placeholder: &Endpoint,
    ) -> Result<(usize, SocketAddr), SocketError> {
        let socket = self.receive_source(placeholder)?;
        let timeout = self.receive_timeout();
        let (received, from) = self
            .guarded(with_timeout(timeout, async {
                socket.recv_from(buf).await.map_err(SocketError::from)
            }))
            .await?;
        log::trace!("received {} bytes from {}", received, from);
        Ok((received, from))
    }

    pub(crate) async fn receive_from_with_packet_info(
        &self,
        buf: &mut [u8],
        placeholder: &Endpoint,
    ) -> Result<ReceivedMessage, SocketError> {
        let socket = self.receive_source(placeholder)?;
        if !self.state().packet_information {
            self.set_packet_information(true)?;
        }
        let timeout = self.receive_timeout();
        let message = self
            .guarded(with_timeout(timeout, pktinfo::recv_msg(&socket, buf)))
            .await?;
        log::trace!(
            "received {} bytes from {} ({:?})",
            message.len,
            message.remote,
            message.packet_info
        );
        Ok(message)
    }

    fn set_packet_information(&self, enabled: bool) -> Result<(), SocketError> {
        if self.kind != SocketKind::Datagram {
            return Err(SocketError::UnsupportedOperation(
                "packet information is only captured for datagram sockets",
            ));
        }
        let family = self.family;
        self.with_sock(|sock| pktinfo::enable(&sock, family, enabled))?;
        self.state().packet_information = enabled;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        let addr = self.with_sock(|sock| sock.local_addr())?;
        addr.as_socket().ok_or(SocketError::fault(
            io::ErrorKind::InvalidData,
            "socket has no IP address",
        ))
    }

    fn remote_addr(&self) -> Result<SocketAddr, SocketError> {
        let addr = self.with_sock(|sock| sock.peer_addr())?;
        addr.as_socket().ok_or(SocketError::fault(
            io::ErrorKind::InvalidData,
            "peer has no IP address",
        ))
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.remote_addr().ok()
    }

    fn is_bound(&self) -> bool {
        matches!(self.local_addr(), Ok(addr) if addr.port() != 0)
    }

    fn set_ttl(&self, ttl: u32) -> Result<(), SocketError> {
        let dual = self.family == AddressFamily::V6 && self.dual_mode()?;
        let family = self.family;
        self.with_sock(|sock| apply_ttl(sock, family, dual, ttl))?;
        self.state().ttl = Some(ttl);
        Ok(())
    }

    fn set_reuse_address(&self, reuse: bool) -> Result<(), SocketError> {
        self.with_sock(|sock| sock.set_reuse_address(reuse))?;
        self.state().reuse_address = reuse;
        Ok(())
    }

    pub(crate) fn close(&self) {
        let io = mem::replace(&mut self.state().io, Io::Closed);
        if let Io::Closed = io {
            return;
        }
        self.closed.send_replace(true);
        drop(io);
        log::debug!("closed {} {:?} socket", self.family, self.kind);
    }

    pub(crate) fn track(&self, id: Uuid, kind: OperationKind) {
        lock(&self.pending).insert(id, kind);
    }

    pub(crate) fn untrack(&self, id: Uuid) {
        lock(&self.pending).remove(&id);
    }
}

/// Gives the socket a usable descriptor back when a connect future is dropped
/// before it settles.
struct ConnectAttempt<'a> {
    core: &'a SocketCore,
    settled: bool,
}

impl ConnectAttempt<'_> {
    fn settle(mut self, result: Result<TcpStream, SocketError>) -> Result<(), SocketError> {
        self.settled = true;
        self.core.finish_stream(result)
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.core.finish_stream(Err(SocketError::Disposed));
        }
    }
}

/// One socket that carries both IPv4 and IPv6 traffic.
///
/// IPv6 sockets in dual mode reach IPv4 peers through `::ffff:a.b.c.d`
/// addresses, so everything the socket reports about an IPv4 peer (accepted
/// peers, datagram sources, packet destinations) comes back in that mapped
/// form. Dropping the socket closes it; operations still outstanding at that
/// point complete with [`SocketError::Disposed`].
pub struct DualStackSocket {
    pub(crate) core: Arc<SocketCore>,
}

impl DualStackSocket {
    /// IPv6 socket with dual mode enabled.
    pub fn new(kind: SocketKind) -> Result<DualStackSocket, SocketError> {
        DualStackSocket::create(AddressFamily::V6, kind, true)
    }

    pub fn stream() -> Result<DualStackSocket, SocketError> {
        DualStackSocket::new(SocketKind::Stream)
    }

    pub fn datagram() -> Result<DualStackSocket, SocketError> {
        DualStackSocket::new(SocketKind::Datagram)
    }

    /// Socket of an explicit family. IPv6 sockets made this way start with
    /// dual mode disabled.
    pub fn with_family(
        family: AddressFamily,
        kind: SocketKind,
    ) -> Result<DualStackSocket, SocketError> {
        DualStackSocket::create(family, kind, false)
    }

    fn create(
        family: AddressFamily,
        kind: SocketKind,
        dual: bool,
    ) -> Result<DualStackSocket, SocketError> {
        let runtime = runtime::current_or_background()?;
        let dual = dual && family == AddressFamily::V6;
        let socket = open(family, kind, dual)?;
        log::debug!("created {} {:?} socket (dual mode {})", family, kind, dual);
        Ok(DualStackSocket::from_core(SocketCore::new(
            family,
            kind,
            runtime,
            Io::Fresh(socket),
            dual,
            Arc::new(SystemResolver),
        )))
    }

    fn from_core(core: SocketCore) -> DualStackSocket {
        DualStackSocket { core: Arc::new(core) }
    }

    pub fn family(&self) -> AddressFamily {
        self.core.family
    }

    pub fn kind(&self) -> SocketKind {
        self.core.kind
    }

    /// Fails with `UnsupportedOperation` on IPv4 sockets.
    pub fn dual_mode(&self) -> Result<bool, SocketError> {
        self.core.dual_mode()
    }

    /// Only possible before the socket is bound.
    pub fn set_dual_mode(&self, enabled: bool) -> Result<(), SocketError> {
        self.core.set_dual_mode(enabled)
    }

    pub fn set_resolver(&self, resolver: Arc<dyn AddressResolver>) {
        *lock(&self.core.resolver) = resolver;
    }

    /// Port 0 picks an ephemeral port; read it back with [`local_addr`](Self::local_addr).
    pub fn bind(&self, endpoint: impl Into<Endpoint>) -> Result<(), SocketError> {
        self.core.bind(&endpoint.into())
    }

    pub fn listen(&self, backlog: i32) -> Result<(), SocketError> {
        self.core.listen(backlog)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.core.local_addr()
    }

    pub fn remote_addr(&self) -> Result<SocketAddr, SocketError> {
        self.core.remote_addr()
    }

    pub fn is_bound(&self) -> bool {
        self.core.is_bound()
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.core.state().io, Io::Listener(_))
    }

    pub fn is_connected(&self) -> bool {
        let state = self.core.state();
        match state.io {
            Io::Stream(_) => true,
            Io::Datagram(_) => state.peer.is_some(),
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.core.state().io, Io::Closed)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.core.receive_timeout()
    }

    /// Bounds every receive. An expired receive fails with `TimedOut` and
    /// leaves the socket usable.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) {
        self.core.state().receive_timeout = timeout;
    }

    pub fn packet_information(&self) -> bool {
        self.core.state().packet_information
    }

    /// Only packets that arrive after this is enabled carry packet information.
    pub fn set_packet_information(&self, enabled: bool) -> Result<(), SocketError> {
        self.core.set_packet_information(enabled)
    }

    pub fn set_reuse_address(&self, reuse: bool) -> Result<(), SocketError> {
        self.core.set_reuse_address(reuse)
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<(), SocketError> {
        self.core.set_ttl(ttl)
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<(), SocketError> {
        self.core.with_sock(|sock| sock.shutdown(how))
    }

    pub fn close(&self) {
        self.core.close()
    }

    pub async fn accept(&self) -> Result<DualStackSocket, SocketError> {
        self.core.accept().await
    }

    pub async fn connect(&self, endpoint: impl Into<Endpoint>) -> Result<(), SocketError> {
        self.core.connect(endpoint.into()).await
    }

    /// Tries each usable candidate in order. Fails with
    /// `AddressFamilyMismatch` without touching the network when no candidate
    /// fits the socket's family and mode.
    pub async fn connect_any(&self, addresses: &[IpAddr], port: u16) -> Result<(), SocketError> {
        self.core.connect_any(addresses, port).await
    }

    pub async fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        self.core.send(data).await
    }

    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.core.receive(buf).await
    }

    pub async fn send_to(
        &self,
        data: &[u8],
        endpoint: impl Into<Endpoint>,
    ) -> Result<usize, SocketError> {
        self.core.send_to(data, &endpoint.into()).await
    }

    /// `placeholder` names the family of peer the caller expects; its address
    /// and port are ignored.
    pub async fn receive_from(
        &self,
        buf: &mut [u8],
        placeholder: impl Into<Endpoint>,
    ) -> Result<(usize, SocketAddr), SocketError> {
        self.core.receive_from(buf, &placeholder.into()).await
    }

    pub async fn receive_from_with_packet_info(
        &self,
        buf: &mut [u8],
        placeholder: impl Into<Endpoint>,
    ) -> Result<ReceivedMessage, SocketError> {
        self.core
            .receive_from_with_packet_info(buf, &placeholder.into())
            .await
    }

    pub fn accept_blocking(&self) -> Result<DualStackSocket, SocketError> {
        runtime::block_on(&self.core.runtime, self.core.accept())?
    }

    pub fn connect_blocking(&self, endpoint: impl Into<Endpoint>) -> Result<(), SocketError> {
        runtime::block_on(&self.core.runtime, self.core.connect(endpoint.into()))?
    }

    pub fn connect_any_blocking(&self, addresses: &[IpAddr], port: u16) -> Result<(), SocketError> {
        runtime::block_on(&self.core.runtime, self.core.connect_any(addresses, port))?
    }

    pub fn send_blocking(&self, data: &[u8]) -> Result<usize, SocketError> {
        runtime::block_on(&self.core.runtime, self.core.send(data))?
    }

    pub fn receive_blocking(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        runtime::block_on(&self.core.runtime, self.core.receive(buf))?
    }

    pub fn send_to_blocking(
        &self,
        data: &[u8],
        endpoint: impl Into<Endpoint>,
    ) -> Result<usize, SocketError> {
        let endpoint = endpoint.into();
        runtime::block_on(&self.core.runtime, self.core.send_to(data, &endpoint))?
    }

    pub fn receive_from_blocking(
        &self,
        buf: &mut [u8],
        placeholder: impl Into<Endpoint>,
    ) -> Result<(usize, SocketAddr), SocketError> {
        let placeholder = placeholder.into();
        runtime::block_on(&self.core.runtime, self.core.receive_from(buf, &placeholder))?
    }

    pub fn receive_from_with_packet_info_blocking(
        &self,
        buf: &mut [u8],
        placeholder: impl Into<Endpoint>,
    ) -> Result<ReceivedMessage, SocketError> {
        let placeholder = placeholder.into();
        runtime::block_on(
            &self.core.runtime,
            self.core.receive_from_with_packet_info(buf, &placeholder),
        )?
    }

    /// Operations issued with `submit`/`start` that have not completed yet.
    pub fn outstanding(&self) -> Vec<(Uuid, OperationKind)> {
        lock(&self.core.pending)
            .iter()
            .map(|(id, kind)| (*id, *kind))
            .collect()
    }
}

impl Drop for DualStackSocket {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl fmt::Debug for DualStackSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualStackSocket")
            .field("family", &self.core.family)
            .field("kind", &self.core.kind)
            .field("local_addr", &self.local_addr().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
        sync::Arc,
        time::Duration,
    };

    use crate::{
        dualstack::address::{AddressFamily, Endpoint, MappedAddress, SocketKind},
        error::Kind,
        resolver::StaticResolver,
    };

    use super::DualStackSocket;

    const LOCALHOST_V4: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn ipv6_loopback() -> bool {
        std::net::TcpListener::bind("[::1]:0").is_ok()
    }

    fn dual_listener() -> (DualStackSocket, u16) {
        let listener = DualStackSocket::stream().unwrap();
        listener.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap();
        listener.listen(16).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn unused_port() -> u16 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_default_is_dual_mode_ipv6() {
        for kind in [SocketKind::Stream, SocketKind::Datagram] {
            let socket = DualStackSocket::new(kind).unwrap();
            assert_eq!(AddressFamily::V6, socket.family());
            assert!(socket.dual_mode().unwrap());
        }
    }

    #[tokio::test]
    async fn test_explicit_ipv6_toggles_before_bind() {
        let socket = DualStackSocket::with_family(AddressFamily::V6, SocketKind::Stream).unwrap();
        assert!(!socket.dual_mode().unwrap());
        socket.set_dual_mode(true).unwrap();
        assert!(socket.dual_mode().unwrap());
        socket.set_dual_mode(false).unwrap();
        assert!(!socket.dual_mode().unwrap());
        socket.set_dual_mode(true).unwrap();
        socket.set_dual_mode(true).unwrap();
        assert!(socket.dual_mode().unwrap());
    }

    #[tokio::test]
    async fn test_ipv4_dual_mode_unsupported() {
        let socket = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Datagram).unwrap();
        assert_eq!(Kind::UnsupportedOperation, socket.dual_mode().unwrap_err().kind());
        assert_eq!(Kind::UnsupportedOperation, socket.set_dual_mode(true).unwrap_err().kind());
        assert_eq!(Kind::UnsupportedOperation, socket.set_dual_mode(false).unwrap_err().kind());
    }

    #[tokio::test]
    async fn test_dual_mode_fixed_after_specific_bind() {
        if !ipv6_loopback() {
            return;
        }
        let socket = DualStackSocket::with_family(AddressFamily::V6, SocketKind::Stream).unwrap();
        socket.bind((Ipv6Addr::LOCALHOST, 0)).unwrap();
        assert_eq!(Kind::SocketFault, socket.set_dual_mode(true).unwrap_err().kind());
        assert!(!socket.dual_mode().unwrap());
    }

    #[tokio::test]
    async fn test_dual_mode_fixed_after_wildcard_bind() {
        let socket = DualStackSocket::stream().unwrap();
        socket.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap();
        assert_eq!(Kind::SocketFault, socket.set_dual_mode(false).unwrap_err().kind());
        assert!(socket.dual_mode().unwrap());
    }

    #[tokio::test]
    async fn test_bind_port_zero_assigns_port() {
        let socket = DualStackSocket::datagram().unwrap();
        assert!(!socket.is_bound());
        socket.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap();
        assert!(socket.is_bound());
        assert_ne!(0, socket.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_bind_ipv4_on_ipv6_only_faults() {
        let socket = DualStackSocket::with_family(AddressFamily::V6, SocketKind::Stream).unwrap();
        let err = socket.bind((Ipv4Addr::LOCALHOST, 0)).unwrap_err();
        assert_eq!(Kind::SocketFault, err.kind());
    }

    #[tokio::test]
    async fn test_bind_host_name_rejected() {
        let socket = DualStackSocket::stream().unwrap();
        let err = socket.bind(Endpoint::host("localhost", 0)).unwrap_err();
        assert_eq!(Kind::InvalidArgument, err.kind());
    }

    #[tokio::test]
    async fn test_bind_ipv4_any_on_dual_socket_uses_ipv6_any() {
        let socket = DualStackSocket::stream().unwrap();
        socket.bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        assert_eq!(IpAddr::V6(Ipv6Addr::UNSPECIFIED), socket.local_addr().unwrap().ip());
    }

    #[tokio::test]
    async fn test_connect_ipv4_on_dual_socket_is_mapped() {
        let (listener, port) = dual_listener();
        let client = DualStackSocket::stream().unwrap();
        client.connect((LOCALHOST_V4, port)).await.unwrap();
        assert!(client.is_connected());
        let remote = client.remote_addr().unwrap();
        assert_eq!(LOCALHOST_V4.map_to_v6(), remote.ip());
        assert_eq!(port, remote.port());
        let accepted = listener.accept().await.unwrap();
        assert_eq!(AddressFamily::V6, accepted.family());
    }

    #[tokio::test]
    async fn test_connect_ipv4_without_dual_mode_unsupported() {
        let (_listener, port) = dual_listener();
        for port in [port, unused_port()] {
            let client =
                DualStackSocket::with_family(AddressFamily::V6, SocketKind::Stream).unwrap();
            let err = client.connect((LOCALHOST_V4, port)).await.unwrap_err();
            assert_eq!(Kind::UnsupportedOperation, err.kind());
        }
    }

    #[tokio::test]
    async fn test_connect_mapped_without_dual_mode_not_rejected_up_front() {
        let client = DualStackSocket::with_family(AddressFamily::V6, SocketKind::Stream).unwrap();
        let target = SocketAddr::new(LOCALHOST_V4.map_to_v6(), unused_port());
        let err = client.connect(target).await.unwrap_err();
        assert_eq!(Kind::SocketFault, err.kind());
    }

    #[tokio::test]
    async fn test_connect_ipv6_target_on_ipv4_socket_faults() {
        let client = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Stream).unwrap();
        let err = client.connect((Ipv6Addr::LOCALHOST, 80)).await.unwrap_err();
        assert_eq!(Kind::SocketFault, err.kind());
    }

    #[tokio::test]
    async fn test_connect_ipv4_to_ipv6_only_listener_faults() {
        if !ipv6_loopback() {
            return;
        }
        let listener = DualStackSocket::with_family(AddressFamily::V6, SocketKind::Stream).unwrap();
        listener.bind((Ipv6Addr::LOCALHOST, 0)).unwrap();
        listener.listen(4).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = DualStackSocket::stream().unwrap();
        let err = client.connect((LOCALHOST_V4, port)).await.unwrap_err();
        assert_eq!(Kind::SocketFault, err.kind());

        let waiting = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(waiting.is_err());
    }

    #[tokio::test]
    async fn test_connect_ipv6_to_ipv4_only_listener_faults() {
        if !ipv6_loopback() {
            return;
        }
        let listener = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Stream).unwrap();
        listener.bind((LOCALHOST_V4, 0)).unwrap();
        listener.listen(4).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = DualStackSocket::stream().unwrap();
        let err = client.connect((Ipv6Addr::LOCALHOST, port)).await.unwrap_err();
        assert_eq!(Kind::SocketFault, err.kind());
    }

    #[tokio::test]
    async fn test_connect_any_without_usable_candidate() {
        let client = DualStackSocket::with_family(AddressFamily::V6, SocketKind::Stream).unwrap();
        let err = client
            .connect_any(&[LOCALHOST_V4, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))], 9)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::SocketError::AddressFamilyMismatch { candidates: 2 }
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_any_moves_past_refused_candidate() {
        if !ipv6_loopback() {
            return;
        }
        let listener = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Stream).unwrap();
        listener.bind((LOCALHOST_V4, 0)).unwrap();
        listener.listen(4).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = DualStackSocket::stream().unwrap();
        client
            .connect_any(&[IpAddr::V6(Ipv6Addr::LOCALHOST), LOCALHOST_V4], port)
            .await
            .unwrap();
        assert_eq!(
            SocketAddr::new(LOCALHOST_V4.map_to_v6(), port),
            client.remote_addr().unwrap()
        );
    }

    #[tokio::test]
    async fn test_connect_any_filters_by_family() {
        let (listener, port) = dual_listener();
        let client = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Stream).unwrap();
        client
            .connect_any(&[IpAddr::V6(Ipv6Addr::LOCALHOST), LOCALHOST_V4], port)
            .await
            .unwrap();
        let accepted = listener.accept().await.unwrap();
        assert_eq!(LOCALHOST_V4.map_to_v6(), accepted.remote_addr().unwrap().ip());
    }

    #[tokio::test]
    async fn test_connect_host_through_resolver() {
        let (listener, port) = dual_listener();
        let client = DualStackSocket::stream().unwrap();
        client.set_resolver(Arc::new(
            StaticResolver::new().with("service.test", vec![LOCALHOST_V4]),
        ));
        client.connect(Endpoint::host("service.test", port)).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        assert_eq!(
            LOCALHOST_V4.map_to_v6(),
            accepted.local_addr().unwrap().ip()
        );
    }

    #[tokio::test]
    async fn test_connect_host_without_matching_family() {
        let client = DualStackSocket::with_family(AddressFamily::V6, SocketKind::Stream).unwrap();
        client.set_resolver(Arc::new(
            StaticResolver::new().with("v4only.test", vec![LOCALHOST_V4]),
        ));
        let err = client.connect(Endpoint::host("v4only.test", 80)).await.unwrap_err();
        assert_eq!(Kind::AddressFamilyMismatch, err.kind());
    }

    #[tokio::test]
    async fn test_connect_host_skips_refused_address() {
        if !ipv6_loopback() {
            return;
        }
        let listener = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Stream).unwrap();
        listener.bind((LOCALHOST_V4, 0)).unwrap();
        listener.listen(4).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = DualStackSocket::stream().unwrap();
        client.set_resolver(Arc::new(StaticResolver::new().with(
            "both.test",
            vec![IpAddr::V6(Ipv6Addr::LOCALHOST), LOCALHOST_V4],
        )));
        client.connect(Endpoint::host("both.test", port)).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        assert_eq!(LOCALHOST_V4, accepted.remote_addr().unwrap().ip());
        assert!(client.dual_mode().unwrap());
    }

    #[tokio::test]
    async fn test_connect_again_after_refused() {
        let client = DualStackSocket::stream().unwrap();
        let err = client.connect((LOCALHOST_V4, unused_port())).await.unwrap_err();
        assert_eq!(Kind::SocketFault, err.kind());
        assert!(!client.is_connected());
        assert!(!client.is_closed());

        let (listener, port) = dual_listener();
        client.connect((LOCALHOST_V4, port)).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        client.send(&[7, 7]).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(2, accepted.receive(&mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_connect_leaves_socket_usable() {
        let client = DualStackSocket::stream().unwrap();
        let unroutable = (IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9);
        let _ = tokio::time::timeout(Duration::from_millis(50), client.connect(unroutable)).await;
        assert!(!client.is_connected());

        let (listener, port) = dual_listener();
        client.connect((LOCALHOST_V4, port)).await.unwrap();
        assert!(listener.accept().await.is_ok());
    }

    #[tokio::test]
    async fn test_listen_twice_keeps_listener() {
        let (listener, port) = dual_listener();
        listener.listen(4).unwrap();
        assert!(listener.is_listening());
        assert_eq!(port, listener.local_addr().unwrap().port());

        let client = DualStackSocket::stream().unwrap();
        client.connect((LOCALHOST_V4, port)).await.unwrap();
        assert!(listener.accept().await.is_ok());
    }

    #[tokio::test]
    async fn test_accept_ipv4_peer_is_mapped() {
        let (listener, port) = dual_listener();
        let client = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Stream).unwrap();
        let (accepted, connected) =
            tokio::join!(listener.accept(), client.connect((LOCALHOST_V4, port)));
        connected.unwrap();
        let accepted = accepted.unwrap();
        assert_eq!(AddressFamily::V6, accepted.family());
        let local = accepted.local_addr().unwrap();
        assert!(local.is_ipv6());
        assert_eq!("::ffff:127.0.0.1".parse::<IpAddr>().unwrap(), local.ip());
        assert_eq!(
            client.local_addr().unwrap().map_to_v6(),
            accepted.remote_addr().unwrap()
        );
    }

    #[tokio::test]
    async fn test_stream_send_receive() {
        let (listener, port) = dual_listener();
        let client = DualStackSocket::stream().unwrap();
        client.connect((LOCALHOST_V4, port)).await.unwrap();
        let accepted = listener.accept().await.unwrap();

        assert_eq!(4, client.send(&[1, 2, 3, 4]).await.unwrap());
        let mut buf = [0u8; 16];
        let n = accepted.receive(&mut buf).await.unwrap();
        assert_eq!(&[1, 2, 3, 4], &buf[..n]);
    }

    #[tokio::test]
    async fn test_listen_on_datagram_unsupported() {
        let socket = DualStackSocket::datagram().unwrap();
        assert_eq!(Kind::UnsupportedOperation, socket.listen(1).unwrap_err().kind());
    }

    #[tokio::test]
    async fn test_accept_without_listen() {
        let socket = DualStackSocket::stream().unwrap();
        assert_eq!(Kind::InvalidArgument, socket.accept().await.unwrap_err().kind());
    }

    #[tokio::test]
    async fn test_datagram_from_ipv4_client_is_mapped() {
        let server = DualStackSocket::datagram().unwrap();
        server.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap();
        let port = server.local_addr().unwrap().port();

        let client = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Datagram).unwrap();
        client.bind((LOCALHOST_V4, 0)).unwrap();
        client.send_to(&[42], (LOCALHOST_V4, port)).await.unwrap();

        let mut buf = [0u8; 8];
        let (n, from) = server
            .receive_from(&mut buf, (Ipv6Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
        assert_eq!(1, n);
        assert_eq!(client.local_addr().unwrap().map_to_v6(), from);
    }

    #[tokio::test]
    async fn test_send_to_ipv4_without_dual_mode_unsupported() {
        let socket = DualStackSocket::with_family(AddressFamily::V6, SocketKind::Datagram).unwrap();
        let err = socket.send_to(&[1], (LOCALHOST_V4, 9)).await.unwrap_err();
        assert_eq!(Kind::UnsupportedOperation, err.kind());
    }

    #[tokio::test]
    async fn test_connectionless_rejects_host_names() {
        let socket = DualStackSocket::datagram().unwrap();
        socket.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap();
        let host = Endpoint::host("localhost", 9);
        let mut buf = [0u8; 4];
        let err = socket.send_to(&[1], host.clone()).await.unwrap_err();
        assert_eq!(Kind::InvalidArgument, err.kind());
        assert_eq!(
            Kind::InvalidArgument,
            socket.receive_from(&mut buf, host.clone()).await.unwrap_err().kind()
        );
        assert_eq!(
            Kind::InvalidArgument,
            socket
                .receive_from_with_packet_info(&mut buf, host)
                .await
                .unwrap_err()
                .kind()
        );
    }

    #[tokio::test]
    async fn test_receive_from_placeholder_family_checked() {
        let v6_only =
            DualStackSocket::with_family(AddressFamily::V6, SocketKind::Datagram).unwrap();
        v6_only.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap();
        let mut buf = [0u8; 4];
        let err = v6_only
            .receive_from(&mut buf, (Ipv4Addr::UNSPECIFIED, 0))
            .await
            .unwrap_err();
        assert_eq!(Kind::InvalidArgument, err.kind());

        let v4 = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Datagram).unwrap();
        v4.bind((LOCALHOST_V4, 0)).unwrap();
        let err = v4
            .receive_from(&mut buf, (Ipv6Addr::UNSPECIFIED, 0))
            .await
            .unwrap_err();
        assert_eq!(Kind::InvalidArgument, err.kind());
    }

    #[tokio::test]
    async fn test_receive_from_requires_bind() {
        let socket = DualStackSocket::datagram().unwrap();
        let mut buf = [0u8; 4];
        let err = socket
            .receive_from(&mut buf, (Ipv6Addr::UNSPECIFIED, 0))
            .await
            .unwrap_err();
        assert_eq!(Kind::InvalidArgument, err.kind());
    }

    #[tokio::test]
    async fn test_receive_timeout_leaves_socket_usable() {
        let server = DualStackSocket::datagram().unwrap();
        server.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap();
        server.set_receive_timeout(Some(Duration::from_millis(50)));
        let port = server.local_addr().unwrap().port();

        let mut buf = [0u8; 8];
        let err = server
            .receive_from(&mut buf, (Ipv6Addr::UNSPECIFIED, 0))
            .await
            .unwrap_err();
        assert_eq!(Kind::TimedOut, err.kind());

        server.set_receive_timeout(Some(Duration::from_secs(5)));
        let client = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Datagram).unwrap();
        client.send_to(&[7, 7], (LOCALHOST_V4, port)).await.unwrap();
        let (n, _) = server
            .receive_from(&mut buf, (Ipv4Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
        assert_eq!(2, n);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[tokio::test]
    async fn test_packet_info_reports_mapped_destination() {
        let server = DualStackSocket::datagram().unwrap();
        server.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap();
        server.set_packet_information(true).unwrap();
        assert!(server.packet_information());
        let port = server.local_addr().unwrap().port();

        let client = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Datagram).unwrap();
        client.send_to(&[9], (LOCALHOST_V4, port)).await.unwrap();

        let mut buf = [0u8; 8];
        let message = server
            .receive_from_with_packet_info(&mut buf, (Ipv6Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
        assert_eq!(1, message.len);
        assert_eq!(LOCALHOST_V4.map_to_v6(), message.remote.ip());
        let info = message.packet_info.unwrap();
        assert_eq!(LOCALHOST_V4.map_to_v6(), info.local);
    }

    #[tokio::test]
    async fn test_connected_datagram() {
        let server = DualStackSocket::datagram().unwrap();
        server.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap();
        let port = server.local_addr().unwrap().port();

        let client = DualStackSocket::datagram().unwrap();
        client.connect((LOCALHOST_V4, port)).await.unwrap();
        assert!(client.is_connected());
        client.send(b"hi").await.unwrap();

        let mut buf = [0u8; 8];
        let (n, from) = server
            .receive_from(&mut buf, (Ipv6Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
        assert_eq!(b"hi", &buf[..n]);
        assert_eq!(client.local_addr().unwrap(), from);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_accept() {
        let (listener, _) = dual_listener();
        let listener = Arc::new(listener);
        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.close();
        let result = tokio::time::timeout(Duration::from_secs(5), accepting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Kind::Disposed, result.unwrap_err().kind());
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_operations_after_close_are_disposed() {
        let socket = DualStackSocket::datagram().unwrap();
        socket.close();
        assert_eq!(Kind::Disposed, socket.bind((Ipv6Addr::UNSPECIFIED, 0)).unwrap_err().kind());
        assert_eq!(
            Kind::Disposed,
            socket.send_to(&[1], (LOCALHOST_V4, 9)).await.unwrap_err().kind()
        );
    }

    #[test]
    fn test_blocking_accept_unblocked_by_close() {
        let (listener, _) = dual_listener();
        let listener = Arc::new(listener);
        let accepting = {
            let listener = listener.clone();
            std::thread::spawn(move || listener.accept_blocking())
        };
        std::thread::sleep(Duration::from_millis(100));
        listener.close();
        let result = accepting.join().unwrap();
        assert_eq!(Kind::Disposed, result.unwrap_err().kind());
    }

    #[test]
    fn test_blocking_round_trip() {
        let (listener, port) = dual_listener();
        let client = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Stream).unwrap();
        client.connect_blocking((LOCALHOST_V4, port)).unwrap();
        let accepted = listener.accept_blocking().unwrap();
        client.send_blocking(b"ping").unwrap();
        let mut buf = [0u8; 8];
        let n = accepted.receive_blocking(&mut buf).unwrap();
        assert_eq!(b"ping", &buf[..n]);
        assert_eq!(LOCALHOST_V4.map_to_v6(), accepted.remote_addr().unwrap().ip());
    }

    #[test]
    fn test_blocking_and_async_agree_on_errors() {
        let socket = DualStackSocket::with_family(AddressFamily::V6, SocketKind::Stream).unwrap();
        let err = socket.connect_blocking((LOCALHOST_V4, 80)).unwrap_err();
        assert_eq!(Kind::UnsupportedOperation, err.kind());
    }

    #[tokio::test]
    async fn test_blocking_call_inside_runtime_refused() {
        let socket = DualStackSocket::stream().unwrap();
        assert_eq!(Kind::InvalidArgument, socket.accept_blocking().unwrap_err().kind());
    }
}
