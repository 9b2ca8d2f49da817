//! Domain types for users, test servers and reports.
//!
//! Enum discriminants match the integer values persisted in the database, so
//! conversions are explicit and a corrupt row surfaces as a decode error
//! instead of a silently coerced value.

use chrono::{DateTime, Utc};

/// Account role. Only `Admin` and `ReportUploader` may submit reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum UserRole {
    Admin = 0,
    ReportUploader = 1,
    ReportViewer = 2,
}

impl UserRole {
    pub fn from_db(value: i64) -> Option<Self> {
        Some(match value {
            0 => UserRole::Admin,
            1 => UserRole::ReportUploader,
            2 => UserRole::ReportViewer,
            _ => return None,
        })
    }

    pub fn as_db(self) -> i64 {
        self as i64
    }

    /// True when this role is allowed to upload latency reports.
    pub fn may_upload_reports(self) -> bool {
        matches!(self, UserRole::Admin | UserRole::ReportUploader)
    }
}

/// Account status. `Deleted` rows are treated as absent; only `Active`
/// accounts may authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum UserStatus {
    Active = 0,
    Inactive = 1,
    Suspended = 2,
    Deleted = 3,
}

impl UserStatus {
    pub fn from_db(value: i64) -> Option<Self> {
        Some(match value {
            0 => UserStatus::Active,
            1 => UserStatus::Inactive,
            2 => UserStatus::Suspended,
            3 => UserStatus::Deleted,
            _ => return None,
        })
    }

    pub fn as_db(self) -> i64 {
        self as i64
    }
}

/// A user row, including credential material for verification.
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: i64,
    pub user_name: String,
    /// Hex SHA-256 of password ∥ salt
    pub password_hash: String,
    /// Opaque hex salt, 16+ bytes before encoding
    pub salt: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// A probing target row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestServer {
    pub server_id: u32,
    pub location: String,
    /// IPv4 address in host order
    pub ip_addr: u32,
    pub active: bool,
}

/// A persisted report header.
#[derive(Debug, Clone)]
pub struct Report {
    pub report_id: i64,
    pub user_name: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

/// Input for a new report header.
#[derive(Debug, Clone)]
pub struct NewReport {
    pub user_name: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

/// One measurement row owned by a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    pub record_id: i64,
    pub report_id: i64,
    pub server_id: u32,
    /// IPv4 address in host order
    pub server_ip: u32,
    /// Milliseconds; `MAX_LATENCY` stands for no reply
    pub latency: u32,
}

/// Input for a new report record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRecord {
    pub server_id: u32,
    pub server_ip: u32,
    pub latency: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_db_roundtrip() {
        for role in [UserRole::Admin, UserRole::ReportUploader, UserRole::ReportViewer] {
            assert_eq!(UserRole::from_db(role.as_db()), Some(role));
        }
        assert_eq!(UserRole::from_db(7), None);
    }

    #[test]
    fn status_db_roundtrip() {
        for status in [
            UserStatus::Active,
            UserStatus::Inactive,
            UserStatus::Suspended,
            UserStatus::Deleted,
        ] {
            assert_eq!(UserStatus::from_db(status.as_db()), Some(status));
        }
        assert_eq!(UserStatus::from_db(-1), None);
    }

    #[test]
    fn report_upload_permission() {
        assert!(UserRole::Admin.may_upload_reports());
        assert!(UserRole::ReportUploader.may_upload_reports());
        assert!(!UserRole::ReportViewer.may_upload_reports());
    }
}
