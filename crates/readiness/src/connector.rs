use std::future::Future;

/// Opens a connection to the dependency the gate waits for.
///
/// Uses native async fn in traits; the returned future must be `Send` so the
/// gate can run on a multi-threaded runtime.
pub trait Connector: Send + Sync {
    /// Handle returned on success, shared with the rest of the service
    type Connection: Send;
    /// Failure of a single attempt
    type Error: std::error::Error + Send + Sync + 'static;

    /// Makes one connection attempt using `dsn`.
    fn connect(&self, dsn: &str) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;
}

impl<C: Connector> Connector for &C {
    type Connection = C::Connection;
    type Error = C::Error;

    fn connect(&self, dsn: &str) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        (**self).connect(dsn)
    }
}
