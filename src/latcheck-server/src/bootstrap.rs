//! Test-server bootstrap from `ip_result.txt`.
//!
//! The file is CSV-like: `id, status, ip, latency, description` per line.
//! Lines whose status is `success` are upserted into `test_server` with
//! `location = description` and `active = true`; the whole batch lands in a
//! single transaction. Malformed lines are skipped with a warning so one bad
//! row cannot block startup.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::db::ServerDao;

/// One parsed row of the bootstrap file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpResultRow {
    pub id: u32,
    pub status: String,
    pub ip: Ipv4Addr,
    pub latency: u32,
    pub description: String,
}

/// Parse one line; `None` for blank, comment or malformed lines.
pub fn parse_line(line: &str) -> Option<IpResultRow> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let mut fields = trimmed.splitn(5, ',').map(str::trim);
    let id = fields.next()?.parse().ok()?;
    let status = fields.next()?.to_string();
    let ip = fields.next()?.parse().ok()?;
    let latency = fields.next()?.parse().ok()?;
    let description = fields.next()?.to_string();
    if description.is_empty() {
        return None;
    }

    Some(IpResultRow {
        id,
        status,
        ip,
        latency,
        description,
    })
}

/// Read the bootstrap file and upsert every `success` row.
/// Returns the number of servers written.
pub async fn load_ip_results(path: &Path, servers: &ServerDao) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading bootstrap file {}", path.display()))?;

    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for (number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some(row) if row.status == "success" => {
                entries.push((row.description, u32::from(row.ip), true));
            }
            Some(_) => {}
            None => {
                warn!(line = number + 1, "skipping malformed bootstrap line");
                skipped += 1;
            }
        }
    }

    let written = servers
        .upsert_many(&entries)
        .await
        .context("upserting bootstrap servers")?;
    info!(
        written,
        skipped,
        file = %path.display(),
        "test-server bootstrap complete"
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{DbPool, PoolOptions};
    use crate::db::schema::apply_schema;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn parses_well_formed_line() {
        let row = parse_line("3, success, 192.168.1.100, 27, Tokyo DC").unwrap();
        assert_eq!(
            row,
            IpResultRow {
                id: 3,
                status: "success".into(),
                ip: Ipv4Addr::new(192, 168, 1, 100),
                latency: 27,
                description: "Tokyo DC".into(),
            }
        );
    }

    #[test]
    fn description_may_contain_commas() {
        let row = parse_line("1, success, 10.0.0.1, 5, Osaka, rack 2").unwrap();
        assert_eq!(row.description, "Osaka, rack 2");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("# comment"), None);
        assert_eq!(parse_line("x, success, 10.0.0.1, 5, A"), None);
        assert_eq!(parse_line("1, success, not-an-ip, 5, A"), None);
        assert_eq!(parse_line("1, success, 10.0.0.1, -2, A"), None);
        assert_eq!(parse_line("1, success, 10.0.0.1, 5"), None);
    }

    async fn test_dao() -> ServerDao {
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
        ServerDao::new(pool)
    }

    #[tokio::test]
    async fn loads_success_rows_only() {
        let dao = test_dao().await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# id, status, ip, latency, description").unwrap();
        writeln!(file, "1, success, 192.168.1.100, 27, Tokyo").unwrap();
        writeln!(file, "2, timeout, 192.168.1.101, 10000, Osaka").unwrap();
        writeln!(file, "3, success, 192.168.1.102, 41, Nagoya").unwrap();
        writeln!(file, "garbage line without commas").unwrap();

        let written = load_ip_results(file.path(), &dao).await.unwrap();
        assert_eq!(written, 2);

        let servers = dao.get_active_servers().await.unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].location, "Tokyo");
        assert_eq!(servers[0].ip_addr, u32::from(Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(servers[1].location, "Nagoya");
    }

    #[tokio::test]
    async fn rerun_updates_in_place() {
        let dao = test_dao().await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1, success, 10.0.0.1, 5, Tokyo").unwrap();
        load_ip_results(file.path(), &dao).await.unwrap();

        let mut file2 = tempfile::NamedTempFile::new().unwrap();
        writeln!(file2, "1, success, 10.0.0.2, 5, Tokyo").unwrap();
        load_ip_results(file2.path(), &dao).await.unwrap();

        let servers = dao.get_all_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].ip_addr, u32::from(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
