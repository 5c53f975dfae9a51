//! The process-wide object behind the C functions.
//!
//! A [`Boundary`] owns the runtime, the node identity, the presence table,
//! the relay mesh and every tunnel session opened through it. The C exports
//! hold exactly one of these; Rust callers can build their own.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use meshtun_core::pipe::{HandleDuplicator, OsDuplicator};
use meshtun_core::tunnel::{LogHub, TunnelLogLayer};
use meshtun_core::{ErrorCode, PresenceTable, SessionHandle, SessionOptions, TunnelConfig};
use meshtun_relay::{AddressMesh, Identity, MeshConfig, MeshDiff, MeshError};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::BoundaryError;

/// Time given to the runtime to finish outstanding tasks on shutdown
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the C exports need
pub struct Boundary {
    runtime: Runtime,
    identity: Arc<Identity>,
    presence: Arc<PresenceTable>,
    logs: LogHub,
    mesh: AddressMesh,
    tunnel_config: TunnelConfig,
    sessions: Mutex<Vec<SessionHandle>>,
}

impl Boundary {
    /// Build a boundary with a fresh identity and default configuration
    pub fn new(logs: LogHub) -> Result<Self, BoundaryError> {
        Self::with_config(
            logs,
            Identity::generate(),
            MeshConfig::default(),
            TunnelConfig::default(),
        )
    }

    /// Build a boundary with explicit identity and configuration
    pub fn with_config(
        logs: LogHub,
        identity: Identity,
        mesh_config: MeshConfig,
        tunnel_config: TunnelConfig,
    ) -> Result<Self, BoundaryError> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("meshtun")
            .build()
            .map_err(BoundaryError::Runtime)?;

        let identity = Arc::new(identity);
        let presence = Arc::new(PresenceTable::new());
        let mesh = AddressMesh::with_runtime(
            runtime.handle().clone(),
            identity.clone(),
            mesh_config,
            presence.clone(),
        );
        info!(node = %identity.public_key().short(), "meshtun boundary ready");

        Ok(Self {
            runtime,
            identity,
            presence,
            logs,
            mesh,
            tunnel_config,
            sessions: Mutex::new(Vec::new()),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, Vec<SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Node identity used to authenticate to relays
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Reachable peers as reported by the mesh
    pub fn presence(&self) -> &Arc<PresenceTable> {
        &self.presence
    }

    /// The relay mesh
    pub fn mesh(&self) -> &AddressMesh {
        &self.mesh
    }

    /// Open a tunnel over the host's descriptors.
    ///
    /// Blocks until the session has started or failed. Must not be called
    /// from inside an async context.
    pub fn open_tunnel(&self, read_fd: RawFd, write_fd: RawFd) -> ErrorCode {
        self.open_tunnel_with(&OsDuplicator, read_fd, write_fd)
    }

    /// [`open_tunnel`](Self::open_tunnel) with a caller-supplied duplicator
    pub fn open_tunnel_with(
        &self,
        duplicator: &dyn HandleDuplicator,
        read_fd: RawFd,
        write_fd: RawFd,
    ) -> ErrorCode {
        let options = SessionOptions {
            backend: None,
            presence: Some(self.presence.clone()),
            logs: Some(self.logs.clone()),
        };
        let opened = self.runtime.block_on(meshtun_core::open_tunnel(
            read_fd,
            write_fd,
            duplicator,
            self.tunnel_config.clone(),
            options,
        ));

        match opened {
            Ok(session) => {
                let mut sessions = self.sessions();
                sessions.retain(SessionHandle::is_running);
                sessions.push(session);
                debug!(read_fd, write_fd, sessions = sessions.len(), "tunnel opened");
                ErrorCode::Success
            }
            Err(err) => {
                let code = err.code();
                warn!(read_fd, write_fd, code = code.as_i32(), error = %err, "open tunnel failed");
                code
            }
        }
    }

    /// Replace the relay address set; failures are logged
    pub fn set_addresses<S: AsRef<str>>(&self, addresses: &[S]) -> Result<MeshDiff, MeshError> {
        self.mesh
            .set_addresses(addresses.iter().map(AsRef::<str>::as_ref))
            .inspect_err(|e| warn!(error = %e, "set_addresses ignored"))
    }

    /// Sessions still running
    pub fn session_count(&self) -> usize {
        let mut sessions = self.sessions();
        sessions.retain(SessionHandle::is_running);
        sessions.len()
    }

    /// Stop every session, close the mesh and stop the runtime
    pub fn shutdown(self) {
        let sessions = std::mem::take(&mut *self.sessions());
        let Boundary { runtime, mesh, .. } = self;

        runtime.block_on(async {
            for session in &sessions {
                session.stop().await;
            }
            mesh.close().await;
        });
        drop(mesh);
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        info!(sessions = sessions.len(), "meshtun boundary shut down");
    }
}

impl std::fmt::Debug for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Boundary")
            .field("node", &self.identity.public_key())
            .field("mesh", &self.mesh)
            .field("sessions", &self.sessions().len())
            .finish()
    }
}

/// The single boundary used by the C exports
struct Global {
    logs: OnceLock<LogHub>,
    boundary: Mutex<Option<Arc<Boundary>>>,
}

static GLOBAL: Global = Global {
    logs: OnceLock::new(),
    boundary: Mutex::new(None),
};

/// Install the process tracing subscriber once and return its log hub.
///
/// Records go to stderr (filtered by `RUST_LOG`, default `info`) and to
/// every tunnel session opened through the boundary.
pub(crate) fn log_hub() -> &'static LogHub {
    GLOBAL.logs.get_or_init(|| {
        let hub = LogHub::new();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(TunnelLogLayer::new(hub.clone()))
            .try_init();
        hub
    })
}

fn global_slot() -> MutexGuard<'static, Option<Arc<Boundary>>> {
    GLOBAL.boundary.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The process boundary, creating it on first use
pub(crate) fn global() -> Result<Arc<Boundary>, BoundaryError> {
    let logs = log_hub();
    let mut slot = global_slot();
    if let Some(boundary) = slot.as_ref() {
        return Ok(boundary.clone());
    }
    let boundary = Arc::new(Boundary::new(logs.clone())?);
    *slot = Some(boundary.clone());
    Ok(boundary)
}

/// Remove and shut down the process boundary, if any
pub(crate) fn shutdown_global() {
    let Some(boundary) = global_slot().take() else {
        return;
    };
    match Arc::try_unwrap(boundary) {
        Ok(boundary) => boundary.shutdown(),
        Err(shared) => {
            // Another call is still using it; the last user drops it.
            shared.runtime.block_on(shared.mesh.close());
            warn!("boundary still in use during shutdown");
        }
    }
}
