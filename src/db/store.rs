//! SQLite implementation of the entity stores.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::Database;
use crate::entities::{
  Client, ClientAttachment, ClientStore, TransferLine, TransferStore, WarehouseTransfer,
};

/// Entity rows backed by the shared database.
#[derive(Clone)]
pub struct SqliteStore {
  db: Arc<Database>,
}

impl SqliteStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Insert or replace a client row.
  pub fn save_client(&self, client: &Client) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO clients (id, server_id, name, tax_id, phone, address, synced, sync_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          client.id,
          client.server_id,
          client.name,
          client.tax_id,
          client.phone,
          client.address,
          client.synced,
          client.sync_error
        ],
      )
      .map_err(|e| eyre!("Failed to store client: {}", e))?;
    Ok(())
  }

  /// Append an attachment after the client's existing ones. Saving an
  /// attachment again updates it in place and keeps its position.
  pub fn add_attachment(&self, attachment: &ClientAttachment) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT INTO client_attachments (id, client_id, file_name, mime_type, data, synced, position)
         VALUES (?, ?, ?, ?, ?, ?,
                 (SELECT COALESCE(MAX(position), -1) + 1 FROM client_attachments WHERE client_id = ?))
         ON CONFLICT(id) DO UPDATE SET
           client_id = excluded.client_id,
           file_name = excluded.file_name,
           mime_type = excluded.mime_type,
           data = excluded.data,
           synced = excluded.synced",
        params![
          attachment.id,
          attachment.client_id,
          attachment.file_name,
          attachment.mime_type,
          attachment.data,
          attachment.synced,
          attachment.client_id
        ],
      )
      .map_err(|e| eyre!("Failed to store attachment: {}", e))?;
    Ok(())
  }

  /// Insert or replace a transfer row.
  pub fn save_transfer(&self, transfer: &WarehouseTransfer) -> Result<()> {
    let lines = serde_json::to_string(&transfer.lines)
      .map_err(|e| eyre!("Failed to serialize transfer lines: {}", e))?;
    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO warehouse_transfers
           (id, server_id, source_warehouse_id, destination_warehouse_id, lines, synced, needs_review, sync_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          transfer.id,
          transfer.server_id,
          transfer.source_warehouse_id,
          transfer.destination_warehouse_id,
          lines,
          transfer.synced,
          transfer.needs_review,
          transfer.sync_error
        ],
      )
      .map_err(|e| eyre!("Failed to store transfer: {}", e))?;
    Ok(())
  }

  /// All client rows, for seeding the local cache.
  pub fn clients(&self) -> Result<Vec<Client>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, server_id, name, tax_id, phone, address, synced, sync_error
         FROM clients ORDER BY name",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let clients = stmt
      .query_map([], row_to_client)
      .map_err(|e| eyre!("Failed to query clients: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read client: {}", e))?;
    Ok(clients)
  }
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
  Ok(Client {
    id: row.get(0)?,
    server_id: row.get(1)?,
    name: row.get(2)?,
    tax_id: row.get(3)?,
    phone: row.get(4)?,
    address: row.get(5)?,
    synced: row.get(6)?,
    sync_error: row.get(7)?,
  })
}

impl ClientStore for SqliteStore {
  fn client(&self, id: &str) -> Result<Option<Client>> {
    self
      .db
      .conn()?
      .query_row(
        "SELECT id, server_id, name, tax_id, phone, address, synced, sync_error
         FROM clients WHERE id = ?",
        params![id],
        row_to_client,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load client {}: {}", id, e))
  }

  fn attachments(&self, client_id: &str) -> Result<Vec<ClientAttachment>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, client_id, file_name, mime_type, data, synced
         FROM client_attachments WHERE client_id = ? ORDER BY position",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let attachments = stmt
      .query_map(params![client_id], |row| {
        Ok(ClientAttachment {
          id: row.get(0)?,
          client_id: row.get(1)?,
          file_name: row.get(2)?,
          mime_type: row.get(3)?,
          data: row.get(4)?,
          synced: row.get(5)?,
        })
      })
      .map_err(|e| eyre!("Failed to query attachments: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read attachment: {}", e))?;
    Ok(attachments)
  }

  fn mark_client_synced(&self, id: &str, server_id: Option<&str>) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "UPDATE clients SET synced = 1, sync_error = NULL, server_id = COALESCE(?, server_id)
         WHERE id = ?",
        params![server_id, id],
      )
      .map_err(|e| eyre!("Failed to mark client {} synced: {}", id, e))?;
    Ok(())
  }

  fn mark_attachments_synced(&self, ids: &[String]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    for id in ids {
      tx.execute(
        "UPDATE client_attachments SET synced = 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to mark attachment {} synced: {}", id, e))?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn record_client_error(&self, id: &str, message: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "UPDATE clients SET sync_error = ? WHERE id = ?",
        params![message, id],
      )
      .map_err(|e| eyre!("Failed to record client error: {}", e))?;
    Ok(())
  }
}

impl TransferStore for SqliteStore {
  fn transfer(&self, id: &str) -> Result<Option<WarehouseTransfer>> {
    let row: Option<(WarehouseTransfer, String)> = self
      .db
      .conn()?
      .query_row(
        "SELECT id, server_id, source_warehouse_id, destination_warehouse_id, lines, synced, needs_review, sync_error
         FROM warehouse_transfers WHERE id = ?",
        params![id],
        |row| {
          Ok((
            WarehouseTransfer {
              id: row.get(0)?,
              server_id: row.get(1)?,
              source_warehouse_id: row.get(2)?,
              destination_warehouse_id: row.get(3)?,
              lines: Vec::new(),
              synced: row.get(5)?,
              needs_review: row.get(6)?,
              sync_error: row.get(7)?,
            },
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to load transfer {}: {}", id, e))?;

    match row {
      Some((mut transfer, lines)) => {
        transfer.lines = serde_json::from_str::<Vec<TransferLine>>(&lines)
          .map_err(|e| eyre!("Corrupted lines for transfer {}: {}", id, e))?;
        Ok(Some(transfer))
      }
      None => Ok(None),
    }
  }

  fn mark_transfer_synced(&self, id: &str, server_id: Option<&str>) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "UPDATE warehouse_transfers
         SET synced = 1, needs_review = 0, sync_error = NULL, server_id = COALESCE(?, server_id)
         WHERE id = ?",
        params![server_id, id],
      )
      .map_err(|e| eyre!("Failed to mark transfer {} synced: {}", id, e))?;
    Ok(())
  }

  fn flag_transfer(&self, id: &str, reason: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "UPDATE warehouse_transfers SET needs_review = 1, sync_error = ? WHERE id = ?",
        params![reason, id],
      )
      .map_err(|e| eyre!("Failed to flag transfer {}: {}", id, e))?;
    Ok(())
  }

  fn record_transfer_error(&self, id: &str, message: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "UPDATE warehouse_transfers SET sync_error = ? WHERE id = ?",
        params![message, id],
      )
      .map_err(|e| eyre!("Failed to record transfer error: {}", e))?;
    Ok(())
  }
}
