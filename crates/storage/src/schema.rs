use rusqlite::Connection;

use workbench_core::BodyKind;

use crate::error::StorageError;

const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection, busy_timeout_ms: u64) -> Result<(), StorageError> {
    conn.execute_batch(&format!(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = {busy_timeout_ms};
    "
    ))?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
    conn.execute_batch(SCHEMA_SQL)?;
    for kind in BodyKind::ALL {
        conn.execute_batch(&body_table_sql(kind.table()))?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Every ordered body table shares one shape: owning example, optional
/// parent row in the origin example, and the list pointers.
fn body_table_sql(table: &str) -> String {
    format!(
        "
CREATE TABLE IF NOT EXISTS {table} (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    example_id BLOB NOT NULL REFERENCES examples(id) ON DELETE CASCADE,
    delta_parent_id BLOB REFERENCES {table}(id) ON DELETE SET NULL,
    key TEXT NOT NULL DEFAULT '',
    value TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    prev BLOB CHECK (prev IS NULL OR prev <> id),
    next BLOB CHECK (next IS NULL OR next <> id)
);
CREATE INDEX IF NOT EXISTS idx_{table}_example_head ON {table} (example_id, prev IS NULL);
CREATE INDEX IF NOT EXISTS idx_{table}_example_tail ON {table} (example_id, next IS NULL);
CREATE INDEX IF NOT EXISTS idx_{table}_delta_parent ON {table} (delta_parent_id);
"
    )
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS workspaces (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    name TEXT NOT NULL,
    updated INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS collections (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    workspace_id BLOB NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS endpoints (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    collection_id BLOB NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT 'GET',
    url TEXT NOT NULL DEFAULT '',
    hidden INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_endpoints_collection ON endpoints (collection_id);

CREATE TABLE IF NOT EXISTS examples (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    endpoint_id BLOB NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
    collection_id BLOB NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    body_kind INTEGER NOT NULL DEFAULT 0,
    version_parent_id BLOB REFERENCES examples(id) ON DELETE SET NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    prev BLOB CHECK (prev IS NULL OR prev <> id),
    next BLOB CHECK (next IS NULL OR next <> id),
    updated INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_examples_endpoint_head ON examples (endpoint_id, prev IS NULL);
CREATE INDEX IF NOT EXISTS idx_examples_endpoint_tail ON examples (endpoint_id, next IS NULL);
CREATE INDEX IF NOT EXISTS idx_examples_version_parent ON examples (version_parent_id);

CREATE TABLE IF NOT EXISTS overlay_state (
    example_id BLOB NOT NULL REFERENCES examples(id) ON DELETE CASCADE,
    body_id BLOB NOT NULL CHECK (length(body_id) = 16),
    body_kind TEXT NOT NULL,
    key TEXT,
    value TEXT,
    description TEXT,
    enabled INTEGER,
    suppressed INTEGER NOT NULL DEFAULT 0,
    seq INTEGER,
    updated INTEGER NOT NULL,
    PRIMARY KEY (example_id, body_id)
);

CREATE TABLE IF NOT EXISTS overlay_order (
    example_id BLOB NOT NULL REFERENCES examples(id) ON DELETE CASCADE,
    body_id BLOB NOT NULL CHECK (length(body_id) = 16),
    body_kind TEXT NOT NULL,
    rank INTEGER,
    PRIMARY KEY (example_id, body_id)
);
CREATE INDEX IF NOT EXISTS idx_overlay_order_kind ON overlay_order (example_id, body_kind);

CREATE TABLE IF NOT EXISTS auth_user (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    email_verified INTEGER NOT NULL,
    image TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_session (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES auth_user(id) ON DELETE CASCADE,
    token TEXT NOT NULL UNIQUE,
    expires_at INTEGER NOT NULL,
    ip_address TEXT,
    user_agent TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_auth_session_user ON auth_session (user_id);

CREATE TABLE IF NOT EXISTS auth_account (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES auth_user(id) ON DELETE CASCADE,
    account_id TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    access_token TEXT,
    refresh_token TEXT,
    access_token_expires_at INTEGER,
    scope TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_auth_account_user ON auth_account (user_id);

CREATE TABLE IF NOT EXISTS auth_verification (
    id TEXT PRIMARY KEY,
    identifier TEXT NOT NULL,
    value TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_auth_verification_identifier ON auth_verification (identifier);
";
