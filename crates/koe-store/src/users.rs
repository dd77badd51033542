use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

use koe_core::clock::to_stored;
use koe_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub identity_hash: String,
    pub total_points: i64,
    pub created_at: DateTime<Utc>,
}

/// Salted one-way hash of a messaging-platform user id. The raw id is never
/// stored.
pub fn hash_identity(platform_id: &str, salt: &SecretString) -> String {
    let mut hasher = Sha256::new();
    hasher.update(platform_id.as_bytes());
    hasher.update(salt.expose_secret().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get the user for a platform id, creating it on first contact. Safe
    /// against two processes racing on the same new user.
    #[instrument(skip_all)]
    pub fn get_or_create(
        &self,
        platform_id: &str,
        salt: &SecretString,
        now: DateTime<Utc>,
    ) -> Result<UserRow, StoreError> {
        let identity_hash = hash_identity(platform_id, salt);
        let now = to_stored(now);
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO users (id, identity_hash, total_points, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?3)",
                rusqlite::params![UserId::new().as_str(), identity_hash, now],
            )?;
            tx.query_row(
                "SELECT id, identity_hash, total_points, created_at
                 FROM users WHERE identity_hash = ?1",
                [&identity_hash],
                |row| Ok(row_to_user(row)),
            )?
        })
    }

    #[instrument(skip(self), fields(user = %id))]
    pub fn get(&self, id: &UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, identity_hash, total_points, created_at
                 FROM users WHERE id = ?1",
                [id.as_str()],
                |row| Ok(row_to_user(row)),
            )
            .optional()?
            .unwrap_or_else(|| Err(StoreError::NotFound(format!("user {id}"))))
        })
    }

    /// Delete a user. Sessions and their messages go with it; opinions and
    /// ledger entries stay, with the user reference cleared.
    #[instrument(skip(self), fields(user = %id))]
    pub fn delete(&self, id: &UserId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM users WHERE id = ?1", [id.as_str()])?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("user {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserRow, StoreError> {
    Ok(UserRow {
        id: UserId::from_raw(row_helpers::get::<String>(row, 0, "users", "id")?),
        identity_hash: row_helpers::get(row, 1, "users", "identity_hash")?,
        total_points: row_helpers::get(row, 2, "users", "total_points")?,
        created_at: row_helpers::get_time(row, 3, "users", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn salt() -> SecretString {
        SecretString::from("pepper".to_string())
    }

    #[test]
    fn hash_is_stable_and_salted() {
        let a = hash_identity("U123", &salt());
        assert_eq!(a, hash_identity("U123", &salt()));
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_identity("U123", &SecretString::from("other".to_string())));
        assert!(!a.contains("U123"));
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let repo = UserRepo::new(Database::in_memory().unwrap());
        let first = repo.get_or_create("U123", &salt(), Utc::now()).unwrap();
        let second = repo.get_or_create("U123", &salt(), Utc::now()).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.total_points, 0);
        assert!(first.id.as_str().starts_with("usr_"));
    }

    #[test]
    fn get_missing_user_is_not_found() {
        let repo = UserRepo::new(Database::in_memory().unwrap());
        let err = repo.get(&UserId::from_raw("usr_missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
