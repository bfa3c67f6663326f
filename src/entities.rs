//! Local business records synchronized by the bundled handlers, and the
//! storage interfaces the handlers load and flag them through.

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::cache::Cacheable;

/// Entity type name for clients.
pub const CLIENTS: &str = "clients";

/// Entity type name for warehouse transfers.
pub const WAREHOUSE_TRANSFERS: &str = "warehouse_transfers";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
  /// Local identifier assigned when the record was captured
  pub id: String,
  /// Identifier assigned by the server after the first sync
  pub server_id: Option<String>,
  pub name: String,
  pub tax_id: Option<String>,
  pub phone: Option<String>,
  pub address: Option<String>,
  #[serde(default)]
  pub synced: bool,
  #[serde(default)]
  pub sync_error: Option<String>,
}

impl Client {
  pub fn new(id: &str, name: &str) -> Self {
    Self {
      id: id.to_string(),
      server_id: None,
      name: name.to_string(),
      tax_id: None,
      phone: None,
      address: None,
      synced: false,
      sync_error: None,
    }
  }

  /// Identifier used in remote paths.
  pub fn remote_id(&self) -> &str {
    self.server_id.as_deref().unwrap_or(&self.id)
  }
}

impl Cacheable for Client {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    CLIENTS
  }
}

/// Photo or document captured for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAttachment {
  pub id: String,
  pub client_id: String,
  pub file_name: String,
  pub mime_type: String,
  pub data: Vec<u8>,
  pub synced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferLine {
  pub product_id: String,
  pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseTransfer {
  pub id: String,
  pub server_id: Option<String>,
  pub source_warehouse_id: String,
  pub destination_warehouse_id: String,
  pub lines: Vec<TransferLine>,
  #[serde(default)]
  pub synced: bool,
  /// Set when the server refused the movement and a user has to decide
  #[serde(default)]
  pub needs_review: bool,
  #[serde(default)]
  pub sync_error: Option<String>,
}

impl WarehouseTransfer {
  pub fn remote_id(&self) -> &str {
    self.server_id.as_deref().unwrap_or(&self.id)
  }
}

impl Cacheable for WarehouseTransfer {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    WAREHOUSE_TRANSFERS
  }
}

/// Client rows as seen by the sync handler.
pub trait ClientStore: Send + Sync {
  fn client(&self, id: &str) -> Result<Option<Client>>;

  /// Attachments in capture order.
  fn attachments(&self, client_id: &str) -> Result<Vec<ClientAttachment>>;

  fn mark_client_synced(&self, id: &str, server_id: Option<&str>) -> Result<()>;

  fn mark_attachments_synced(&self, ids: &[String]) -> Result<()>;

  fn record_client_error(&self, id: &str, message: &str) -> Result<()>;
}

/// Transfer rows as seen by the sync handler.
pub trait TransferStore: Send + Sync {
  fn transfer(&self, id: &str) -> Result<Option<WarehouseTransfer>>;

  fn mark_transfer_synced(&self, id: &str, server_id: Option<&str>) -> Result<()>;

  /// Flag a transfer for user intervention.
  fn flag_transfer(&self, id: &str, reason: &str) -> Result<()>;

  fn record_transfer_error(&self, id: &str, message: &str) -> Result<()>;
}
