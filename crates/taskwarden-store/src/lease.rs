use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{lock, now_timestamp, SharedConnection};
use crate::error::Result;

/// Current owner of the engine lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseHolder {
    pub owner: String,
    pub expires_at: String,
}

/// Time-limited claim on a database, held by the one process that schedules
/// and admits firings for it. The holder renews it well before expiry; a
/// claim nobody renews lapses and can be taken over.
#[derive(Clone)]
pub struct EngineLease {
    conn: SharedConnection,
}

impl EngineLease {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Take or renew the lease for `owner`. Returns `false` if another owner
    /// holds an unexpired claim.
    pub fn acquire(&self, owner: &str, ttl: std::time::Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl =
            chrono::Duration::milliseconds(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let expires_at = now
            .checked_add_signed(ttl)
            .unwrap_or(now)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let now = now.to_rfc3339_opts(SecondsFormat::Millis, true);

        let db = lock(&self.conn)?;
        let changed = db.execute(
            "INSERT INTO engine_lease (id, owner, expires_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE
             SET owner = excluded.owner, expires_at = excluded.expires_at
             WHERE engine_lease.owner = excluded.owner OR engine_lease.expires_at < ?3",
            params![owner, expires_at, now],
        )?;
        debug!(owner, held = changed == 1, "lease acquire");
        Ok(changed == 1)
    }

    /// Give the lease up. Returns `false` if `owner` did not hold it.
    pub fn release(&self, owner: &str) -> Result<bool> {
        let db = lock(&self.conn)?;
        let changed = db.execute("DELETE FROM engine_lease WHERE owner = ?1", [owner])?;
        Ok(changed == 1)
    }

    /// The unexpired holder, if any.
    pub fn holder(&self) -> Result<Option<LeaseHolder>> {
        let db = lock(&self.conn)?;
        Ok(db
            .query_row(
                "SELECT owner, expires_at FROM engine_lease WHERE id = 1 AND expires_at >= ?1",
                [now_timestamp()],
                |row| {
                    Ok(LeaseHolder {
                        owner: row.get(0)?,
                        expires_at: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }
}
