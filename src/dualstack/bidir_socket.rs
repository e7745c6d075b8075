use std::{future::Future, net::SocketAddr};

use crate::error::SocketError;

use super::{
    address::{unspecified, Endpoint},
    socket::DualStackSocket,
};

/// Connectionless send/receive over whatever address families the socket
/// can reach.
pub trait BidirSocket {
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(usize, SocketAddr), SocketError>> + Send;
    fn set_ttl(&self, ttl: u32) -> Result<(), SocketError>;
    fn send_to(
        &self,
        buf: &[u8],
        addr: SocketAddr,
    ) -> impl Future<Output = Result<usize, SocketError>> + Send;
}

impl BidirSocket for DualStackSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        let placeholder = Endpoint::Ip(SocketAddr::new(unspecified(self.family()), 0));
        self.receive_from(buf, placeholder).await
    }

    fn set_ttl(&self, ttl: u32) -> Result<(), SocketError> {
        DualStackSocket::set_ttl(self, ttl)
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        DualStackSocket::send_to(self, buf, addr).await
    }
}
