//! Utility functions
use std::net::IpAddr;

use tokio::net::UdpSocket;

use crate::error::Error;

/// transform bytes into a human readable format.
pub fn to_human_readable(n: f64) -> String {
    let mut n = n;

    let units = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let delimiter = 1000_f64;

    if n < delimiter {
        return format!("{:.0} {}", n, "B");
    }

    let mut u: usize = 0;
    let r = 10_f64;

    while (n * r).round() / r >= delimiter && u < units.len() - 1 {
        n /= delimiter;
        u += 1;
    }

    format!("{:.2} {}", n, units[u])
}

/// Median of a list of samples, 0 when there are none.
pub fn median(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Address of the interface used by the default route. Connecting a UDP
/// socket sends no packet, it only makes the kernel pick a source address.
pub async fn default_route_ip() -> Result<IpAddr, Error> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await.map_err(|_| Error::NoDefaultRoute)?;
    let addr = socket.local_addr()?;

    if addr.ip().is_unspecified() {
        return Err(Error::NoDefaultRoute);
    }
    Ok(addr.ip())
}
