use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use thiserror::Error;

use crate::models::{BridgeIdentity, MacAddress};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no usable network address to advertise")]
    NoNetworkAddress,
}

/// Hue bridge ids splice `FFFE` into the middle of the MAC.
pub fn bridge_id_from_mac(mac: &MacAddress) -> String {
    let octets = mac.octets();
    let hex = |bytes: &[u8]| bytes.iter().map(|b| format!("{b:02X}")).collect::<String>();
    format!("{}FFFE{}", hex(&octets[..3]), hex(&octets[3..]))
}

pub fn derive_identity(
    mac: &MacAddress,
    host_address: Option<Ipv4Addr>,
) -> Result<BridgeIdentity, IdentityError> {
    let advertised_address = host_address
        .filter(|ip| !ip.is_unspecified())
        .ok_or(IdentityError::NoNetworkAddress)?;

    Ok(BridgeIdentity {
        bridge_id: bridge_id_from_mac(mac),
        mac: *mac,
        advertised_address,
    })
}

/// Finds the IPv4 address of the interface holding the default route.
///
/// Connecting a UDP socket only selects a route; no packet leaves the host.
pub fn resolve_local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).ok()?;
    socket
        .connect(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 80)))
        .ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}
