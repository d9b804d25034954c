//! Phase-transition handshake.
//!
//! Tokens are raw, un-delimited byte sequences. The ready token may sit
//! in the middle of other traffic and arrive split across reads, so it is
//! matched byte by byte against a rolling window instead of per line.

use std::ops::ControlFlow;
use std::time::Duration;

use tracing::{debug, trace};

use crate::deadline::{Deadline, poll_until};
use crate::error::Result;
use crate::link::LinkTransport;

/// Device → host: "ready for phase 2".
pub const DEFAULT_READY_TOKEN: &str = "#READY2#";

/// Host → device: "phase 2 data follows".
pub const DEFAULT_GO_TOKEN: &str = "#GO2#";

/// Write `token` verbatim and flush.
pub async fn send_token<L: LinkTransport + ?Sized>(link: &mut L, token: &[u8]) -> Result<()> {
    link.write(token).await?;
    debug!("sent token {:?}", String::from_utf8_lossy(token));
    Ok(())
}

/// Wait until `token` appears anywhere in the incoming byte stream.
///
/// Returns `Ok(false)` once `timeout` has elapsed without a match. Bytes
/// consumed while searching are not returned to the link.
pub async fn wait_for_token<L: LinkTransport + ?Sized>(
    link: &mut L,
    token: &[u8],
    timeout: Duration,
) -> Result<bool> {
    if token.is_empty() {
        return Ok(true);
    }
    let deadline = Deadline::after(timeout);
    let mut window: Vec<u8> = Vec::with_capacity(token.len());
    let mut scanned = 0usize;

    let found = poll_until(deadline, async || {
        let Some(byte) = link.read_byte(deadline).await? else {
            return Ok(ControlFlow::Continue(()));
        };
        scanned += 1;
        if window.len() == token.len() {
            window.remove(0);
        }
        window.push(byte);
        Ok(if window == token {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    })
    .await?
    .is_some();

    if found {
        debug!("token {:?} matched after {scanned} bytes", String::from_utf8_lossy(token));
    } else {
        trace!("token {:?} not seen in {scanned} bytes", String::from_utf8_lossy(token));
    }
    Ok(found)
}
