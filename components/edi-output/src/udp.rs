use crate::UdpDestConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// One UDP destination with an optional source binding and TTL.
#[derive(Debug)]
pub struct UdpDestination {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl UdpDestination {
    /// Opens the socket. Must be called within a tokio runtime.
    pub fn open(config: &UdpDestConfig) -> io::Result<Self> {
        let dest = SocketAddr::new(config.dest_addr, config.dest_port);
        let domain = if dest.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        let bind_ip = config.source_addr.unwrap_or(match dest {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        let bind_addr = SocketAddr::new(bind_ip, config.source_port.unwrap_or(0));
        socket.bind(&bind_addr.into())?;

        if let Some(ttl) = config.ttl {
            if config.dest_addr.is_multicast() {
                socket.set_multicast_ttl_v4(ttl)?;
            } else {
                socket.set_ttl(ttl)?;
            }
        }

        socket.set_nonblocking(true)?;
        Ok(Self { socket: UdpSocket::from_std(socket.into())?, dest })
    }

    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.dest).await.map(|_| ())
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }
}
