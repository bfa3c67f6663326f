/// Schema for the job queue and the local entity rows.
pub const SCHEMA: &str = r#"
-- Durable sync queue, one row per enqueued job
CREATE TABLE IF NOT EXISTS sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    config TEXT NOT NULL,
    context TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    run_at INTEGER NOT NULL,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_jobs_key
    ON sync_jobs(entity_type, entity_id, state);

CREATE INDEX IF NOT EXISTS idx_sync_jobs_due
    ON sync_jobs(state, run_at);

-- Clients captured in the field
CREATE TABLE IF NOT EXISTS clients (
    id TEXT PRIMARY KEY,
    server_id TEXT,
    name TEXT NOT NULL,
    tax_id TEXT,
    phone TEXT,
    address TEXT,
    synced INTEGER NOT NULL DEFAULT 0,
    sync_error TEXT
);

CREATE TABLE IF NOT EXISTS client_attachments (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    data BLOB NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    position INTEGER NOT NULL,
    FOREIGN KEY (client_id) REFERENCES clients(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_client_attachments_client
    ON client_attachments(client_id, position);

-- Stock movements between warehouses
CREATE TABLE IF NOT EXISTS warehouse_transfers (
    id TEXT PRIMARY KEY,
    server_id TEXT,
    source_warehouse_id TEXT NOT NULL,
    destination_warehouse_id TEXT NOT NULL,
    lines TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    needs_review INTEGER NOT NULL DEFAULT 0,
    sync_error TEXT
);
"#;
