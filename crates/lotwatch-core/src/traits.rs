use std::future::Future;

use futures::Stream;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{CollectorIdentity, NormalizedRecord, RawItem, SourceKind, TargetKey};
use crate::pool::ProxyLease;

/// Uniform capability set every data source implements.
///
/// The engine only ever talks to sources through this trait; API-backed and
/// browser-backed collectors differ in whether they need a proxy lease and in
/// how they manage their own sessions.
pub trait Collector: Send + Sync {
    fn identity(&self) -> CollectorIdentity;

    /// Whether each attempt must hold a lease from the resource pool.
    fn uses_proxy(&self) -> bool {
        self.identity().kind == SourceKind::Browser
    }

    /// Validate credentials/connectivity before a campaign starts.
    fn health_check(&self) -> impl Future<Output = Result<(), AppError>> + Send {
        async { Ok(()) }
    }

    /// Stream raw items for one key.
    ///
    /// Items already yielded before an error are kept by the caller, so a
    /// retried attempt may re-yield them.
    fn collect<'a>(
        &'a self,
        key: &'a TargetKey,
        lease: Option<&'a ProxyLease>,
    ) -> impl Stream<Item = Result<RawItem, AppError>> + Send + 'a;

    /// Turn a raw item into a storable record, or `DataInvalid`.
    fn normalize(&self, item: RawItem) -> Result<NormalizedRecord, AppError>;
}

/// Persistence collaborator for normalized records.
pub trait RecordStore: Send + Sync + Clone {
    /// Store one record. Returns `AppError::Duplicate` if it is already persisted.
    fn store(
        &self,
        record: &NormalizedRecord,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;
}

/// A no-op RecordStore for dry runs.
#[derive(Debug, Clone)]
pub struct NullStore;

impl RecordStore for NullStore {
    async fn store(&self, _record: &NormalizedRecord) -> Result<Uuid, AppError> {
        Ok(Uuid::nil())
    }
}
