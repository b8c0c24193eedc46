//! SQLite hospital case repository implementation.

use flowkeep_core::repository::hospital::HospitalRepository;
use flowkeep_types::error::RepositoryError;
use flowkeep_types::hospital::HospitalCase;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime};

/// SQLite-backed implementation of `HospitalRepository`.
pub struct SqliteHospitalRepository {
    pool: DatabasePool,
}

impl SqliteHospitalRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct CaseRow {
    run_id: String,
    cause: String,
    class: String,
    attempt_count: i64,
    state: String,
    admitted_at: String,
    updated_at: String,
}

impl CaseRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            cause: row.try_get("cause")?,
            class: row.try_get("class")?,
            attempt_count: row.try_get("attempt_count")?,
            state: row.try_get("state")?,
            admitted_at: row.try_get("admitted_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_case(self) -> Result<HospitalCase, RepositoryError> {
        let run_id = Uuid::parse_str(&self.run_id)
            .map_err(|e| RepositoryError::Query(format!("invalid run_id: {e}")))?;
        let attempt_count = u32::try_from(self.attempt_count)
            .map_err(|e| RepositoryError::Query(format!("invalid attempt_count: {e}")))?;

        Ok(HospitalCase {
            run_id,
            cause: self.cause,
            class: self.class.parse().map_err(RepositoryError::Query)?,
            attempt_count,
            state: self.state.parse().map_err(RepositoryError::Query)?,
            admitted_at: parse_datetime(&self.admitted_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// HospitalRepository implementation
// ---------------------------------------------------------------------------

impl HospitalRepository for SqliteHospitalRepository {
    async fn save_case(&self, case: &HospitalCase) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO hospital_cases
                   (run_id, cause, class, attempt_count, state, admitted_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (run_id) DO UPDATE SET
                   cause = excluded.cause,
                   class = excluded.class,
                   attempt_count = excluded.attempt_count,
                   state = excluded.state,
                   admitted_at = excluded.admitted_at,
                   updated_at = excluded.updated_at"#,
        )
        .bind(case.run_id.to_string())
        .bind(&case.cause)
        .bind(case.class.to_string())
        .bind(i64::from(case.attempt_count))
        .bind(case.state.to_string())
        .bind(format_datetime(&case.admitted_at))
        .bind(format_datetime(&case.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_case(&self, run_id: &Uuid) -> Result<Option<HospitalCase>, RepositoryError> {
        let row = sqlx::query(
            "SELECT run_id, cause, class, attempt_count, state, admitted_at, updated_at \
             FROM hospital_cases WHERE run_id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let case_row =
                    CaseRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(case_row.into_case()?))
            }
            None => Ok(None),
        }
    }

    async fn list_cases(&self) -> Result<Vec<HospitalCase>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT run_id, cause, class, attempt_count, state, admitted_at, updated_at \
             FROM hospital_cases ORDER BY admitted_at DESC, run_id DESC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                CaseRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_case()
            })
            .collect()
    }

    async fn delete_case(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM hospital_cases WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkeep_types::hospital::{CaseState, FailureClass};

    async fn test_repo() -> SqliteHospitalRepository {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        std::mem::forget(dir);
        SqliteHospitalRepository::new(pool)
    }

    #[tokio::test]
    async fn test_save_and_get_case() {
        let repo = test_repo().await;
        let case = HospitalCase::new(Uuid::now_v7(), "connection reset", FailureClass::Retryable);
        repo.save_case(&case).await.unwrap();

        let loaded = repo.get_case(&case.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, case.run_id);
        assert_eq!(loaded.cause, "connection reset");
        assert_eq!(loaded.class, FailureClass::Retryable);
        assert_eq!(loaded.state, CaseState::Admitted);
        assert_eq!(loaded.admitted_at, case.admitted_at);
    }

    #[tokio::test]
    async fn test_save_replaces_existing_case() {
        let repo = test_repo().await;
        let mut case = HospitalCase::new(Uuid::now_v7(), "timeout", FailureClass::Retryable);
        repo.save_case(&case).await.unwrap();

        case.attempt_count = 2;
        case.state = CaseState::Retrying;
        repo.save_case(&case).await.unwrap();

        let loaded = repo.get_case(&case.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.attempt_count, 2);
        assert_eq!(loaded.state, CaseState::Retrying);
        assert_eq!(repo.list_cases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_delete_cases() {
        let repo = test_repo().await;
        let older = HospitalCase::new(Uuid::now_v7(), "bad state", FailureClass::Unrecoverable);
        repo.save_case(&older).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = HospitalCase::new(Uuid::now_v7(), "refused", FailureClass::Business);
        repo.save_case(&newer).await.unwrap();

        let cases = repo.list_cases().await.unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].run_id, newer.run_id);

        assert!(repo.delete_case(&older.run_id).await.unwrap());
        assert!(!repo.delete_case(&older.run_id).await.unwrap());
        assert!(repo.get_case(&older.run_id).await.unwrap().is_none());
    }
}
