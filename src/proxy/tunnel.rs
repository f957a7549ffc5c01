//! Raw tunnel ingress frontend.
//!
//! No protocol parsing: the accepted byte stream is relayed verbatim to the
//! selected upstream relay. Dial failures fail over across the egress set
//! and an exhausted set closes the client silently.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::debug;

use crate::egress::connect_via;
use crate::error::Result;
use crate::proxy::relay;
use crate::server::Core;

/// Handle one accepted tunnel client.
pub async fn handle(core: &Core, client: TcpStream, peer: SocketAddr) -> Result<()> {
    // The relay endpoint is the destination; the dialer ignores the target
    // in tunnel mode.
    let (remote, selection) = connect_via(&core.registry, &core.dialer, peer.ip(), "").await?;
    debug!(%peer, relay = %selection.egress.address, "tunnelled");

    let target = selection.egress.address.clone();
    relay::run(core, client, remote, peer, &target, selection).await;
    Ok(())
}
