//! Networking helpers: local address discovery, reconnect backoff, and the
//! byte splice joining two established streams.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

/// Smallest delay between reconnect attempts.
pub const MIN_BACKOFF: Duration = Duration::from_millis(50);

/// Largest delay between reconnect attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(15);

/// QUIC keep-alive period used on every connection in the fabric.
pub const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(25);

/// Next bounded-exponential backoff delay.
#[must_use]
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Addresses this host is reachable at on its local networks.
///
/// Includes the loopback addresses and, when the host has a default route,
/// the address the kernel picks for outbound traffic. No packets are sent;
/// the connected UDP socket only fixes a local address.
pub fn local_addrs() -> io::Result<Vec<IpAddr>> {
    let mut addrs: Vec<IpAddr> = vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ];

    let probe = std::net::UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
    if probe.connect(("8.8.8.8", 53)).is_ok() {
        if let Ok(local) = probe.local_addr() {
            if !addrs.contains(&local.ip()) {
                addrs.push(local.ip());
            }
        }
    }

    Ok(addrs)
}

/// Copy bytes in both directions until either side reaches EOF or errors.
///
/// Returns the totals copied in each direction. This is the splice step of a
/// forward: one side is typically a TCP connection, the other a QUIC stream
/// pair wrapped with [`tokio::io::join`].
pub async fn join<A, B>(a: &mut A, b: &mut B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::io::copy_bidirectional(a, b).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut d = MIN_BACKOFF;
        for _ in 0..20 {
            let next = next_backoff(d);
            assert!(next >= d);
            assert!(next <= MAX_BACKOFF);
            d = next;
        }
        assert_eq!(d, MAX_BACKOFF);
    }

    #[test]
    fn test_local_addrs_contains_loopback() {
        let addrs = local_addrs().unwrap();
        assert!(addrs.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[tokio::test]
    async fn test_join_copies_both_directions() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let (mut near, mut far) = tokio::io::duplex(1024);

        let task = tokio::spawn(async move { join(&mut server, &mut near).await });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        drop(far);
        task.await.unwrap().ok();
    }
}
