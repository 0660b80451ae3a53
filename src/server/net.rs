// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Listener binding for the tcp, tcp4 and tcp6 networks.

use std::io;
use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpListener};

use crate::error::ServerError;

/// Expands Go-style `:port` addresses to the wildcard host of the network.
fn resolve_target(network: &str, address: &str) -> String {
    if address.starts_with(':') {
        let host = if network == "tcp6" { "[::]" } else { "0.0.0.0" };
        format!("{host}{address}")
    } else {
        address.to_string()
    }
}

fn matches_network(network: &str, addr: &SocketAddr) -> bool {
    match network {
        "tcp4" => addr.is_ipv4(),
        "tcp6" => addr.is_ipv6(),
        _ => true,
    }
}

pub async fn bind(network: &str, address: &str) -> Result<TcpListener, ServerError> {
    let bind_error = |source: io::Error| ServerError::Bind {
        network: network.to_string(),
        address: address.to_string(),
        source,
    };

    let candidates = lookup_host(resolve_target(network, address))
        .await
        .map_err(bind_error)?;

    let mut last_error = None;
    for addr in candidates.filter(|addr| matches_network(network, addr)) {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => last_error = Some(err),
        }
    }

    Err(bind_error(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {network} address resolved from {address}"),
        )
    })))
}
