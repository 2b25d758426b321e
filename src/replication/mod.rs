//! Replication session and transport
//!
//! The session owns the scoped lifecycle of a logical replication stream:
//! connection and cursor acquisition, slot creation on first use, per-message
//! dispatch and LSN feedback. The transport seam keeps the session testable
//! without a server.

pub mod session;
pub mod transport;

// Re-export for convenience
pub use session::ReplicationSession;
pub use transport::{CreatedSlot, PgReplicationTransport, ReplicationTransport};
