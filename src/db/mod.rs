pub mod schema;
mod store;

pub use store::SqliteStore;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Shared SQLite connection holding the job queue and local entity rows
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_open_creates_parent_and_is_reopenable() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested").join("fieldsync.db");

    {
      let db = Database::open(&path).unwrap();
      db.conn()
        .unwrap()
        .execute(
          "INSERT INTO clients (id, name) VALUES ('c-1', 'Ferreteria')",
          [],
        )
        .unwrap();
    }

    // Migrations are idempotent and data survives
    let db = Database::open(&path).unwrap();
    let count: i64 = db
      .conn()
      .unwrap()
      .query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))
      .unwrap();
    assert_eq!(count, 1);
  }
}
