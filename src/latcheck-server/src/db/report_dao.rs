//! Report persistence: transactional ingest and the read side.
//!
//! `create_report` is the atomicity-critical path: header insert, generated
//! id capture and every record insert run inside one transaction on one
//! borrowed connection. Any failure rolls the whole bundle back.

use std::sync::Arc;

use chrono::DateTime;
use sqlx::any::AnyRow;
use sqlx::{Connection, Row};
use tracing::{error, info};

use super::{DaoError, DbError, DbPool};
use crate::types::{NewRecord, NewReport, Report, ReportRecord};

/// Data access for `latcheck_report` and `report_record`.
#[derive(Clone)]
pub struct ReportDao {
    pool: Arc<DbPool>,
}

impl ReportDao {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Persist a report bundle atomically. Returns the generated `report_id`.
    ///
    /// Either the header row and all `records` land, or none of them do.
    pub async fn create_report(
        &self,
        report: &NewReport,
        records: &[NewRecord],
    ) -> Result<i64, DaoError> {
        validate_report(report)?;

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await.map_err(DbError::Transaction)?;

        let inserted = sqlx::query(
            "INSERT INTO latcheck_report (check_location, user_name, created_time) VALUES (?, ?, ?)",
        )
        .bind(&report.location)
        .bind(&report.user_name)
        .bind(report.created_at.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        let report_id = match inserted.last_insert_id() {
            Some(id) => id,
            None => {
                tx.rollback().await.map_err(DbError::Transaction)?;
                conn.release().await;
                return Err(DbError::Decode("insert id missing for latcheck_report".into()).into());
            }
        };

        for record in records {
            let result = sqlx::query(
                "INSERT INTO report_record (report_id, server_ip, server_id, latency) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(report_id)
            .bind(record.server_ip as i64)
            .bind(record.server_id as i64)
            .bind(record.latency as i64)
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                error!(report_id, error = %e, "record insert failed, rolling back report");
                tx.rollback().await.map_err(DbError::Transaction)?;
                conn.release().await;
                return Err(DbError::Query(e).into());
            }
        }

        tx.commit().await.map_err(DbError::Transaction)?;
        conn.release().await;

        info!(
            report_id,
            user = %report.user_name,
            location = %report.location,
            records = records.len(),
            "report persisted"
        );
        Ok(report_id)
    }

    pub async fn get_report(&self, report_id: i64) -> Result<Option<Report>, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT report_id, check_location, user_name, created_time \
             FROM latcheck_report WHERE report_id = ?",
        )
        .bind(report_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        row.as_ref().map(report_from_row).transpose().map_err(Into::into)
    }

    /// Reports submitted by one user, newest first.
    pub async fn reports_by_user(
        &self,
        user_name: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Report>, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT report_id, check_location, user_name, created_time \
             FROM latcheck_report WHERE user_name = ? \
             ORDER BY created_time DESC LIMIT ? OFFSET ?",
        )
        .bind(user_name)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        rows.iter()
            .map(report_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Records of one report in `record_id` order.
    pub async fn report_records(&self, report_id: i64) -> Result<Vec<ReportRecord>, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT record_id, report_id, server_ip, server_id, latency \
             FROM report_record WHERE report_id = ? ORDER BY record_id",
        )
        .bind(report_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::Query)?;
        conn.release().await;

        rows.iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub async fn report_count(&self) -> Result<i64, DaoError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT COUNT(*) FROM latcheck_report")
            .fetch_one(&mut *conn)
            .await
            .map_err(DbError::Query)?;
        conn.release().await;

        row.try_get(0)
            .map_err(|e| DbError::Decode(e.to_string()).into())
    }
}

fn validate_report(report: &NewReport) -> Result<(), DaoError> {
    if report.location.is_empty() || report.location.len() > 128 {
        return Err(DaoError::InvalidParameter("location"));
    }
    if report.user_name.is_empty() || report.user_name.len() > 32 {
        return Err(DaoError::InvalidParameter("user_name"));
    }
    Ok(())
}

fn report_from_row(row: &AnyRow) -> Result<Report, DbError> {
    let created: i64 = row
        .try_get("created_time")
        .map_err(|e| DbError::Decode(e.to_string()))?;
    Ok(Report {
        report_id: row
            .try_get("report_id")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        location: row
            .try_get("check_location")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        user_name: row
            .try_get("user_name")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        created_at: DateTime::from_timestamp(created, 0).unwrap_or_default(),
    })
}

fn record_from_row(row: &AnyRow) -> Result<ReportRecord, DbError> {
    let server_ip: i64 = row
        .try_get("server_ip")
        .map_err(|e| DbError::Decode(e.to_string()))?;
    let server_id: i64 = row
        .try_get("server_id")
        .map_err(|e| DbError::Decode(e.to_string()))?;
    let latency: i64 = row
        .try_get("latency")
        .map_err(|e| DbError::Decode(e.to_string()))?;
    Ok(ReportRecord {
        record_id: row
            .try_get("record_id")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        report_id: row
            .try_get("report_id")
            .map_err(|e| DbError::Decode(e.to_string()))?,
        server_ip: server_ip as u32,
        server_id: server_id as u32,
        latency: latency as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::PoolOptions;
    use crate::db::schema::apply_schema;
    use chrono::Utc;
    use latcheck_proto::MAX_LATENCY;
    use std::time::Duration;

    async fn test_dao() -> ReportDao {
        let opts = PoolOptions {
            min_connections: 1,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(2),
            ..PoolOptions::new("sqlite::memory:")
        };
        let pool = DbPool::connect(opts).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        apply_schema(&mut conn, "sqlite::memory:").await.unwrap();
        conn.release().await;
        ReportDao::new(pool)
    }

    fn sample_report() -> NewReport {
        NewReport {
            user_name: "alice".into(),
            location: "lab".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn bundle_persists_header_and_records() {
        let dao = test_dao().await;
        let records = vec![
            NewRecord {
                server_id: 1,
                server_ip: 0xC0A8_0164,
                latency: 27,
            },
            NewRecord {
                server_id: 2,
                server_ip: 0xC0A8_0165,
                latency: MAX_LATENCY,
            },
        ];

        let report_id = dao.create_report(&sample_report(), &records).await.unwrap();
        assert!(report_id > 0);

        let stored = dao.get_report(report_id).await.unwrap().unwrap();
        assert_eq!(stored.user_name, "alice");
        assert_eq!(stored.location, "lab");

        let stored_records = dao.report_records(report_id).await.unwrap();
        assert_eq!(stored_records.len(), 2);
        assert_eq!(stored_records[0].server_id, 1);
        assert_eq!(stored_records[0].latency, 27);
        assert_eq!(stored_records[1].latency, MAX_LATENCY);
        assert!(stored_records.iter().all(|r| r.report_id == report_id));

        assert_eq!(dao.report_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_record_set_is_allowed() {
        let dao = test_dao().await;
        let report_id = dao.create_report(&sample_report(), &[]).await.unwrap();
        assert!(dao.report_records(report_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_record_insert_rolls_back_header() {
        let dao = test_dao().await;
        // Sabotage the record table so the second phase of the transaction
        // must fail after the header insert succeeded.
        {
            let mut conn = dao.pool.acquire().await.unwrap();
            sqlx::query("DROP TABLE report_record")
                .execute(&mut *conn)
                .await
                .unwrap();
            conn.release().await;
        }

        let records = [NewRecord {
            server_id: 1,
            server_ip: 1,
            latency: 10,
        }];
        let err = dao.create_report(&sample_report(), &records).await.unwrap_err();
        assert!(matches!(err, DaoError::Db(DbError::Query(_))));

        // The header never became visible.
        assert_eq!(dao.report_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_header_rejected_before_touching_db() {
        let dao = test_dao().await;
        let too_long = NewReport {
            user_name: "alice".into(),
            location: "x".repeat(129),
            created_at: Utc::now(),
        };
        let err = dao.create_report(&too_long, &[]).await.unwrap_err();
        assert!(matches!(err, DaoError::InvalidParameter("location")));
        assert_eq!(dao.report_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reports_by_user_pages_newest_first() {
        let dao = test_dao().await;
        for i in 0..3 {
            let report = NewReport {
                user_name: "alice".into(),
                location: format!("run-{i}"),
                created_at: DateTime::from_timestamp(1_700_000_000 + i, 0).unwrap(),
            };
            dao.create_report(&report, &[]).await.unwrap();
        }

        let page = dao.reports_by_user("alice", 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].location, "run-2");

        let rest = dao.reports_by_user("alice", 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(dao.reports_by_user("bob", 10, 0).await.unwrap().is_empty());
    }
}
