//! Socket construction for sessions and the push listener.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::types::Interface;

/// Binds an ephemeral unicast socket on the selected interface.
pub(crate) async fn command_socket(interface: Interface) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddrV4::new(interface.ipv4(), 0)).await
}

/// Binds `port` with `SO_REUSEADDR` and joins `group` on the interface.
pub(crate) fn multicast_socket(
    interface: Interface,
    group: Ipv4Addr,
    port: u16,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group, &interface.ipv4())?;
    socket.set_nonblocking(true)?;
    debug!(%group, port, %interface, "joined multicast group");

    UdpSocket::from_std(socket.into())
}
