//! Collaborator interfaces: the relational query execution engine and the
//! SOAP-based record interface. Only the seams live here; the real
//! implementations are external to this service. The auth routes use the
//! connect checks to decide whether a capability tier may be verified.

use futures::future::BoxFuture;

pub type BackendResult<T> = std::result::Result<T, String>;

/// Relational query execution engine (capability tier A).
pub trait QueryEngine: Send + Sync {
    /// Authenticate a principal against the backend.
    fn connect<'a>(&'a self, principal: &'a str) -> BoxFuture<'a, BackendResult<()>>;

    fn execute<'a>(
        &'a self,
        id: &'a str,
        params: &'a serde_json::Value,
    ) -> BoxFuture<'a, BackendResult<Vec<serde_json::Value>>>;
}

/// SOAP record interface (capability tier B).
pub trait RecordInterfaceClient: Send + Sync {
    fn connect<'a>(&'a self, principal: &'a str) -> BoxFuture<'a, BackendResult<()>>;

    fn submit<'a>(
        &'a self,
        name: &'a str,
        action: &'a str,
        payload: &'a serde_json::Value,
    ) -> BoxFuture<'a, BackendResult<serde_json::Value>>;
}

/// Pass-through collaborator used when no real backend is wired in.
/// Accepts any non-empty principal; query/submit are not available.
pub struct PassthroughBackend;

impl PassthroughBackend {
    fn check(principal: &str) -> BackendResult<()> {
        if principal.trim().is_empty() {
            Err("empty principal".to_string())
        } else {
            Ok(())
        }
    }
}

impl QueryEngine for PassthroughBackend {
    fn connect<'a>(&'a self, principal: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move { Self::check(principal) })
    }

    fn execute<'a>(
        &'a self,
        _id: &'a str,
        _params: &'a serde_json::Value,
    ) -> BoxFuture<'a, BackendResult<Vec<serde_json::Value>>> {
        Box::pin(async move { Err("no query engine configured".to_string()) })
    }
}

impl RecordInterfaceClient for PassthroughBackend {
    fn connect<'a>(&'a self, principal: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move { Self::check(principal) })
    }

    fn submit<'a>(
        &'a self,
        _name: &'a str,
        _action: &'a str,
        _payload: &'a serde_json::Value,
    ) -> BoxFuture<'a, BackendResult<serde_json::Value>> {
        Box::pin(async move { Err("no record interface configured".to_string()) })
    }
}
