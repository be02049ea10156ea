//! Backend connection factory
//!
//! The pool never knows how to talk to the backend. Whoever builds the pool
//! supplies a factory that opens connections and answers liveness checks.

use async_trait::async_trait;

/// Produces and validates backend connections for a [`ResourcePool`].
///
/// [`ResourcePool`]: super::ResourcePool
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The live backend handle handed out by the pool
    type Connection: Send + 'static;

    /// Open a new connection to the backend
    async fn create(&self) -> anyhow::Result<Self::Connection>;

    /// Cheap liveness check, run on idle connections before they are reused
    async fn is_alive(&self, conn: &mut Self::Connection) -> bool;

    /// Close a retired connection. Dropping it is enough for most backends.
    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}
