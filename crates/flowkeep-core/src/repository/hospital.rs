//! Hospital case repository trait definition.

use std::sync::Arc;

use flowkeep_types::error::RepositoryError;
use flowkeep_types::hospital::HospitalCase;
use uuid::Uuid;

/// Storage interface for hospital cases, one per run.
///
/// Persisting cases keeps a run in observation across process restarts.
pub trait HospitalRepository: Send + Sync {
    /// Insert or replace the case for `case.run_id`.
    fn save_case(
        &self,
        case: &HospitalCase,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_case(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<HospitalCase>, RepositoryError>> + Send;

    /// All cases, most recently admitted first.
    fn list_cases(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<HospitalCase>, RepositoryError>> + Send;

    /// Delete a case. Returns `true` if it existed.
    fn delete_case(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

impl<T: HospitalRepository> HospitalRepository for Arc<T> {
    async fn save_case(&self, case: &HospitalCase) -> Result<(), RepositoryError> {
        (**self).save_case(case).await
    }

    async fn get_case(&self, run_id: &Uuid) -> Result<Option<HospitalCase>, RepositoryError> {
        (**self).get_case(run_id).await
    }

    async fn list_cases(&self) -> Result<Vec<HospitalCase>, RepositoryError> {
        (**self).list_cases().await
    }

    async fn delete_case(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        (**self).delete_case(run_id).await
    }
}
