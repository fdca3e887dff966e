//! redb table definitions for the Slipway state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Shape shared by every table: string keys, JSON-encoded values.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Projects keyed by `{name}`.
pub const PROJECTS: JsonTable = TableDefinition::new("projects");

/// Slot registry entries keyed by `{project}/{environment}`.
pub const REGISTRY: JsonTable = TableDefinition::new("slot_registry");

/// Deployment history keyed by `{project}/{environment}:{deployment_id}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

/// Audit entries keyed by `{recorded_at_ms:020}:{id}`.
pub const AUDIT: JsonTable = TableDefinition::new("audit");

/// Credentials keyed by the hex SHA-256 of their secret token.
pub const CREDENTIALS: JsonTable = TableDefinition::new("credentials");
