//! Database schema constants and SQL queries for the job queue.

/// The `jobs` table. One row per job; `status` is stored as text so the
/// table stays readable from `psql`.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    queue VARCHAR(255) NOT NULL,
    task_kind VARCHAR(255) NOT NULL,
    payload JSONB NOT NULL,
    status VARCHAR(16) NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'claimed', 'succeeded', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    max_attempts INTEGER NOT NULL CHECK (max_attempts > 0),
    scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    claimed_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    CHECK (attempts <= max_attempts)
)
"#;

/// Partial index serving the claim query: due pending jobs, oldest first.
pub const CREATE_DUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_due
    ON jobs (queue, scheduled_at)
    WHERE status = 'pending'
"#;

/// Partial index serving the stale-claim sweep.
pub const CREATE_CLAIMED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_claimed
    ON jobs (queue, claimed_at)
    WHERE status = 'claimed'
"#;

/// Partial index serving the failed-jobs alerting query.
pub const CREATE_FAILED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_failed
    ON jobs (queue, finished_at DESC)
    WHERE status = 'failed'
"#;

/// Columns selected whenever a full job row is read back.
pub const JOB_COLUMNS: &str = "id, queue, task_kind, payload, status, attempts, max_attempts, \
     scheduled_at, last_error, created_at, updated_at, claimed_at, finished_at";

/// Returns all schema creation statements in the order they must run,
/// each paired with its migration name.
pub fn all_schema_statements() -> Vec<(&'static str, &'static str)> {
    vec![
        ("0001_create_jobs", CREATE_JOBS_TABLE),
        ("0002_index_due_jobs", CREATE_DUE_INDEX),
        ("0003_index_claimed_jobs", CREATE_CLAIMED_INDEX),
        ("0004_index_failed_jobs", CREATE_FAILED_INDEX),
    ]
}

pub mod tables {
    pub const JOBS: &str = "jobs";
    pub const MIGRATIONS: &str = "_migrations";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 4);
        // The table must exist before any index on it.
        assert!(statements[0].1.contains("CREATE TABLE IF NOT EXISTS jobs"));
        assert!(statements[1..]
            .iter()
            .all(|(_, sql)| sql.contains("CREATE INDEX IF NOT EXISTS")));
    }

    #[test]
    fn test_migration_names_unique_and_ordered() {
        let names: Vec<&str> = all_schema_statements().iter().map(|(n, _)| *n).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_job_columns_cover_table() {
        for column in JOB_COLUMNS.split(',').map(str::trim) {
            assert!(CREATE_JOBS_TABLE.contains(column), "missing column {column}");
        }
    }
}
