//! Settings repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::Settings;

const BACKGROUND_SYNC_ENABLED: &str = "background_sync_enabled";
const LAST_SYNC_AT: &str = "last_sync_at";
const LAST_SYNC_ERROR: &str = "last_sync_error";

/// Trait for settings storage operations
pub trait SettingsRepository {
    /// Load settings from the database
    fn load(&self) -> Result<Settings>;

    /// Save settings to the database
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// `SQLite` implementation of `SettingsRepository`
pub struct SqliteSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingsRepository for SqliteSettingsRepository<'_> {
    fn load(&self) -> Result<Settings> {
        let mut settings = Settings::default();

        if let Some(value) = self.get_setting(BACKGROUND_SYNC_ENABLED)? {
            settings.background_sync_enabled = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        if let Some(value) = self.get_setting(LAST_SYNC_AT)? {
            settings.last_sync_at = value.trim().parse().ok();
        }

        settings.last_sync_error = self
            .get_setting(LAST_SYNC_ERROR)?
            .filter(|value| !value.is_empty());

        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        self.set_setting(
            BACKGROUND_SYNC_ENABLED,
            if settings.background_sync_enabled {
                "true"
            } else {
                "false"
            },
        )?;

        match settings.last_sync_at {
            Some(at) => self.set_setting(LAST_SYNC_AT, &at.to_string())?,
            None => self.remove_setting(LAST_SYNC_AT)?,
        }

        match settings.last_sync_error.as_deref() {
            Some(message) => self.set_setting(LAST_SYNC_ERROR, message)?,
            None => self.remove_setting(LAST_SYNC_ERROR)?,
        }
        Ok(())
    }
}

impl SqliteSettingsRepository<'_> {
    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_load_default_settings() {
        let db = setup();
        let repo = SqliteSettingsRepository::new(db.connection());

        let settings = repo.load().unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_and_load_settings() {
        let db = setup();
        let repo = SqliteSettingsRepository::new(db.connection());

        let settings = Settings {
            background_sync_enabled: true,
            last_sync_at: Some(1_700_000_000_000),
            last_sync_error: Some("HTTP 503".to_string()),
        };
        repo.save(&settings).unwrap();

        assert_eq!(repo.load().unwrap(), settings);
    }

    #[test]
    fn test_save_clears_error() {
        let db = setup();
        let repo = SqliteSettingsRepository::new(db.connection());

        repo.save(&Settings {
            last_sync_error: Some("timeout".to_string()),
            ..Settings::default()
        })
        .unwrap();
        repo.save(&Settings::default()).unwrap();

        assert_eq!(repo.load().unwrap().last_sync_error, None);
    }
}
