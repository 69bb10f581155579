//! Listening socket bootstrap and the URLs worth printing for it.

use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tokio::net::TcpListener;

/// Binds the serving socket.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.with_context(|| {
        format!(
            "Failed to bind to {addr} - port already in use.\n\n\
             Is another oneshot instance running?\n\
             Or is another service using this port?"
        )
    })
}

/// Best-effort local non-loopback IP discovery for display.
pub fn get_local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind socket for IP detection")?;

    socket
        .connect("8.8.8.8:80")
        .context("Failed to connect socket for IP detection")?;

    let local_addr = socket.local_addr().context("Failed to get local address")?;

    Ok(local_addr.ip())
}

/// URLs a client can use to reach `local`. A wildcard bind lists the LAN
/// address (when one can be found) and loopback.
pub fn display_urls(local: SocketAddr) -> Vec<String> {
    let port = local.port();
    if !local.ip().is_unspecified() {
        return vec![format!("http://{}", local)];
    }

    let mut urls = Vec::new();
    if let Ok(ip) = get_local_ip() {
        if !ip.is_loopback() {
            urls.push(format!("http://{}", SocketAddr::new(ip, port)));
        }
    }
    let loopback = if local.is_ipv6() {
        IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1])
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    urls.push(format!("http://{}", SocketAddr::new(loopback, port)));
    urls
}
