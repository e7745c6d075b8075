use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use socket2::Socket;
use tokio::net::UdpSocket;

use crate::error::SocketError;

use super::address::AddressFamily;

/// Where a datagram was delivered on this host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PacketInfo {
    /// Destination address of the packet. IPv4 destinations on a dual-mode
    /// socket come back mapped.
    pub local: IpAddr,
    pub interface: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub len: usize,
    pub remote: SocketAddr,
    /// `None` when the packet arrived before capture was switched on.
    pub packet_info: Option<PacketInfo>,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn enable(
    socket: &Socket,
    family: AddressFamily,
    enabled: bool,
) -> Result<(), SocketError> {
    use nix::sys::socket::{setsockopt, sockopt};

    let result = match family {
        AddressFamily::V4 => setsockopt(socket, sockopt::Ipv4PacketInfo, &enabled),
        AddressFamily::V6 => setsockopt(socket, sockopt::Ipv6RecvPacketInfo, &enabled),
    };
    result.map_err(|errno| SocketError::SocketFault(errno.into()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn enable(
    _socket: &Socket,
    _family: AddressFamily,
    _enabled: bool,
) -> Result<(), SocketError> {
    Err(SocketError::UnsupportedOperation(
        "packet information is not available on this platform",
    ))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) async fn recv_msg(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> Result<ReceivedMessage, SocketError> {
    use std::{
        io::{self, IoSliceMut},
        net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6},
        os::fd::AsRawFd,
    };

    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, SockaddrLike, SockaddrStorage};
    use tokio::io::Interest;

    use super::address::MappedAddress;

    fn source(storage: &SockaddrStorage) -> Option<SocketAddr> {
        if let Some(v6) = storage.as_sockaddr_in6() {
            return Some(SocketAddr::V6(SocketAddrV6::from(*v6)));
        }
        storage
            .as_sockaddr_in()
            .map(|v4| SocketAddr::V4(SocketAddrV4::from(*v4)))
    }

    let fd = socket.as_raw_fd();
    let mapped = socket.local_addr()?.is_ipv6();
    loop {
        socket.readable().await?;
        let received = socket.try_io(Interest::READABLE, || {
            let mut iov = [IoSliceMut::new(&mut buf[..])];
            let mut control = nix::cmsg_space!(libc::in6_pktinfo, libc::in_pktinfo);
            let flags = MsgFlags::empty();
            let msg = recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut control), flags)
                .map_err(io::Error::from)?;
            let remote = msg
                .address
                .as_ref()
                .filter(|storage| storage.family().is_some())
                .and_then(source)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "datagram without a source address")
                })?;
            let mut packet_info = None;
            for cmsg in msg.cmsgs()? {
                match cmsg {
                    ControlMessageOwned::Ipv6PacketInfo(info) => {
                        packet_info = Some(PacketInfo {
                            local: IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)),
                            interface: info.ipi6_ifindex as u32,
                        });
                    }
                    ControlMessageOwned::Ipv4PacketInfo(info) => {
                        let local = IpAddr::V4(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
                        packet_info = Some(PacketInfo {
                            local: if mapped { local.map_to_v6() } else { local },
                            interface: info.ipi_ifindex as u32,
                        });
                    }
                    _ => {}
                }
            }
            Ok(ReceivedMessage {
                len: msg.bytes,
                remote,
                packet_info,
            })
        });
        match received {
            Ok(message) => return Ok(message),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) async fn recv_msg(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> Result<ReceivedMessage, SocketError> {
    let (len, remote) = socket.recv_from(buf).await?;
    Ok(ReceivedMessage {
        len,
        remote,
        packet_info: None,
    })
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use crate::dualstack::{
        address::{AddressFamily, SocketKind},
        socket::DualStackSocket,
    };

    #[tokio::test]
    async fn test_ipv4_socket_reports_plain_destination() {
        let server = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Datagram).unwrap();
        server.bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = server.local_addr().unwrap().port();
        server.set_packet_information(true).unwrap();

        let client = DualStackSocket::with_family(AddressFamily::V4, SocketKind::Datagram).unwrap();
        client.send_to(b"pkt", (Ipv4Addr::LOCALHOST, port)).await.unwrap();

        let mut buf = [0u8; 16];
        let message = server
            .receive_from_with_packet_info(&mut buf, (Ipv4Addr::UNSPECIFIED, 0))
            .await
            .unwrap();
        assert_eq!(3, message.len);
        let info = message.packet_info.unwrap();
        assert_eq!(IpAddr::V4(Ipv4Addr::LOCALHOST), info.local);
        assert_ne!(0, info.interface);
    }

    #[tokio::test]
    async fn test_stream_socket_has_no_packet_info() {
        let socket = DualStackSocket::stream().unwrap();
        assert!(socket.set_packet_information(true).unwrap_err().is_configuration());
    }
}
