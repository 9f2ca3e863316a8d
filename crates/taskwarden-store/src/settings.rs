use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

use crate::db::{lock, SharedConnection, MAX_CONCURRENT_RUNS_KEY};
use crate::error::Result;
use crate::types::ConcurrencyLimit;

/// Key/value engine settings.
#[derive(Clone)]
pub struct SettingsStore {
    conn: SharedConnection,
}

impl SettingsStore {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let db = lock(&self.conn)?;
        Ok(db
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let db = lock(&self.conn)?;
        db.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Stored concurrency limit. A missing or out-of-range value falls back
    /// to the default.
    pub fn concurrency_limit(&self) -> Result<ConcurrencyLimit> {
        let Some(raw) = self.get(MAX_CONCURRENT_RUNS_KEY)? else {
            return Ok(ConcurrencyLimit::default());
        };
        match raw.trim().parse::<i64>().map(ConcurrencyLimit::new) {
            Ok(Ok(limit)) => Ok(limit),
            _ => {
                warn!(value = %raw, "invalid stored concurrency limit, using default");
                Ok(ConcurrencyLimit::default())
            }
        }
    }

    /// Validate and persist a new limit. On error the stored value is kept.
    pub fn set_concurrency_limit(&self, value: i64) -> Result<ConcurrencyLimit> {
        let limit = ConcurrencyLimit::new(value)?;
        self.set(MAX_CONCURRENT_RUNS_KEY, &limit.to_string())?;
        info!(limit = limit.get(), "concurrency limit updated");
        Ok(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::Database;

    #[test]
    fn seeded_default_is_three() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.settings().concurrency_limit().unwrap().get(), 3);
    }

    #[test]
    fn out_of_range_keeps_previous_value() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.settings();
        settings.set_concurrency_limit(5).unwrap();
        assert!(matches!(
            settings.set_concurrency_limit(11),
            Err(StoreError::ConcurrencyLimit { value: 11, .. })
        ));
        assert!(settings.set_concurrency_limit(0).is_err());
        assert_eq!(settings.concurrency_limit().unwrap().get(), 5);
    }

    #[test]
    fn garbage_value_falls_back_to_default() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.settings();
        settings.set(MAX_CONCURRENT_RUNS_KEY, "lots").unwrap();
        assert_eq!(settings.concurrency_limit().unwrap(), ConcurrencyLimit::default());
    }
}
