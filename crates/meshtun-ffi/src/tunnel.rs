//! Tunnel FFI

use meshtun_core::ErrorCode;
use tracing::error;

use crate::boundary;

/// Open a tunnel over two host file descriptors.
///
/// Both descriptors are duplicated; the caller keeps ownership of the
/// originals and may close them once this returns. Returns `0` on success
/// or a negative code. The duplicates share the file description with the
/// originals, so `O_NONBLOCK` set on them is visible through the host's
/// descriptors too.
///
/// Codes:
///
/// - `-2` the read descriptor could not be duplicated
/// - `-3` the write descriptor could not be duplicated
/// - `-4` the duplicates could not be turned into a pipe
/// - `-5` the tunnel session could not be started
///
/// Blocks until the manager on the other end completes the handshake or
/// the handshake times out. Must not be called from a tokio worker thread.
#[unsafe(no_mangle)]
pub extern "C" fn meshtun_open_tunnel(read_fd: i32, write_fd: i32) -> i32 {
    match boundary::global() {
        Ok(boundary) => boundary.open_tunnel(read_fd, write_fd).as_i32(),
        Err(err) => {
            error!(error = %err, "meshtun boundary unavailable");
            ErrorCode::NewTunnel.as_i32()
        }
    }
}
