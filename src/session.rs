//! The single active connection context.
//!
//! Exactly one backend is live at a time. [`Connection`] is a tagged union, so a
//! semantic context cannot coexist with a warehouse context: every set-op replaces
//! the whole variant.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::Limits;
use crate::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    None,
    SemanticModel,
    DataWarehouse,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticColumn {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticTable {
    pub name: String,
    pub columns: Vec<SemanticColumn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticContext {
    pub workspace_id: String,
    pub workspace_name: String,
    pub model_id: String,
    pub model_name: String,
    pub schema_loaded: bool,
    pub tables: Vec<SemanticTable>,
    pub measures: Vec<Value>,
    pub relationships: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSummary {
    pub schema: String,
    pub name: String,
    pub full_name: String,
    pub row_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarehouseContext {
    pub sql_endpoint: String,
    pub database_name: Option<String>,
    pub schemas: Vec<String>,
    pub tables_overview: Vec<TableSummary>,
}

#[derive(Debug, Clone, Default)]
pub enum Connection {
    #[default]
    None,
    Semantic(SemanticContext),
    Warehouse(WarehouseContext),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("No semantic model connected. Use connect_dataset first.")]
    NoSemanticModel,
    #[error("No warehouse connected. Use connect_warehouse first.")]
    NoWarehouse,
}

impl From<SessionError> for ToolError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NoSemanticModel => {
                ToolError::NoSession("No semantic model connected. Use connect_dataset first.")
            }
            SessionError::NoWarehouse => {
                ToolError::NoSession("No warehouse connected. Use connect_warehouse first.")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    limits: Limits,
    connection: Connection,
}

impl Session {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            connection: Connection::None,
        }
    }

    /// Rebuild a session from the persisted context. Incomplete records are ignored.
    pub fn restore(limits: Limits, persisted: Option<&PersistedContext>) -> Self {
        let mut session = Self::new(limits);
        let Some(p) = persisted else { return session };
        match p.mode.as_str() {
            "semantic" => {
                if let (Some(ws), Some(item)) = (p.workspace_id.as_deref(), p.item_id.as_deref()) {
                    session.set_semantic_model(
                        ws,
                        p.workspace_name.as_deref().unwrap_or(ws),
                        item,
                        p.item_name.as_deref().unwrap_or(item),
                    );
                }
            }
            "warehouse" => {
                if let Some(endpoint) = p.sql_endpoint.as_deref() {
                    session.set_warehouse(endpoint, p.item_name.as_deref());
                }
            }
            _ => {}
        }
        session
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn mode(&self) -> ConnectionMode {
        match self.connection {
            Connection::None => ConnectionMode::None,
            Connection::Semantic(_) => ConnectionMode::SemanticModel,
            Connection::Warehouse(_) => ConnectionMode::DataWarehouse,
        }
    }

    pub fn semantic(&self) -> Option<&SemanticContext> {
        match &self.connection {
            Connection::Semantic(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn warehouse(&self) -> Option<&WarehouseContext> {
        match &self.connection {
            Connection::Warehouse(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn set_semantic_model(
        &mut self,
        workspace_id: &str,
        workspace_name: &str,
        model_id: &str,
        model_name: &str,
    ) {
        self.connection = Connection::Semantic(SemanticContext {
            workspace_id: workspace_id.to_string(),
            workspace_name: workspace_name.to_string(),
            model_id: model_id.to_string(),
            model_name: model_name.to_string(),
            schema_loaded: false,
            tables: Vec::new(),
            measures: Vec::new(),
            relationships: Vec::new(),
        });
    }

    pub fn set_warehouse(&mut self, endpoint: &str, database: Option<&str>) {
        self.connection = Connection::Warehouse(WarehouseContext {
            sql_endpoint: endpoint.to_string(),
            database_name: database.map(str::to_string),
            schemas: Vec::new(),
            tables_overview: Vec::new(),
        });
    }

    pub fn update_semantic_schema(
        &mut self,
        mut tables: Vec<SemanticTable>,
        measures: Vec<Value>,
        relationships: Vec<Value>,
    ) -> Result<(), SessionError> {
        let Connection::Semantic(ctx) = &mut self.connection else {
            return Err(SessionError::NoSemanticModel);
        };
        tables.truncate(self.limits.max_tables_in_context);
        for table in &mut tables {
            table.columns.truncate(self.limits.max_columns_per_table);
        }
        ctx.tables = tables;
        ctx.measures = measures;
        ctx.relationships = relationships;
        ctx.schema_loaded = true;
        Ok(())
    }

    /// Replace measures and/or relationships without touching the table schema.
    pub fn record_model_objects(
        &mut self,
        measures: Option<Vec<Value>>,
        relationships: Option<Vec<Value>>,
    ) -> Result<(), SessionError> {
        let Connection::Semantic(ctx) = &mut self.connection else {
            return Err(SessionError::NoSemanticModel);
        };
        if let Some(m) = measures {
            ctx.measures = m;
        }
        if let Some(r) = relationships {
            ctx.relationships = r;
        }
        Ok(())
    }

    pub fn update_warehouse_overview(
        &mut self,
        schemas: Vec<String>,
        mut tables: Vec<TableSummary>,
    ) -> Result<(), SessionError> {
        let Connection::Warehouse(ctx) = &mut self.connection else {
            return Err(SessionError::NoWarehouse);
        };
        tables.truncate(self.limits.max_tables_in_context);
        ctx.schemas = schemas;
        ctx.tables_overview = tables;
        Ok(())
    }

    /// Cheap projection for polling: names and counts, never the table payload.
    pub fn summary(&self) -> Value {
        let mut out = json!({
            "mode": self.mode(),
            "limits": {
                "max_dax_rows": self.limits.max_dax_rows,
                "max_sql_result_rows": self.limits.max_sql_result_rows,
                "sample_rows": self.limits.sample_rows,
            }
        });
        match &self.connection {
            Connection::None => {}
            Connection::Semantic(ctx) => {
                out["semantic_model"] = json!({
                    "workspace_id": ctx.workspace_id,
                    "workspace": ctx.workspace_name,
                    "model_id": ctx.model_id,
                    "model": ctx.model_name,
                    "schema_loaded": ctx.schema_loaded,
                    "table_count": ctx.tables.len(),
                    "measure_count": ctx.measures.len(),
                    "relationship_count": ctx.relationships.len(),
                });
            }
            Connection::Warehouse(ctx) => {
                out["warehouse"] = json!({
                    "endpoint": ctx.sql_endpoint,
                    "database": ctx.database_name,
                    "schema_count": ctx.schemas.len(),
                    "table_count": ctx.tables_overview.len(),
                });
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.connection = Connection::None;
    }

    pub fn to_persisted(&self) -> PersistedContext {
        match &self.connection {
            Connection::None => PersistedContext {
                mode: "none".to_string(),
                ..PersistedContext::default()
            },
            Connection::Semantic(ctx) => PersistedContext {
                mode: "semantic".to_string(),
                workspace_id: Some(ctx.workspace_id.clone()),
                workspace_name: Some(ctx.workspace_name.clone()),
                item_id: Some(ctx.model_id.clone()),
                item_name: Some(ctx.model_name.clone()),
                sql_endpoint: None,
            },
            Connection::Warehouse(ctx) => PersistedContext {
                mode: "warehouse".to_string(),
                item_name: ctx.database_name.clone(),
                sql_endpoint: Some(ctx.sql_endpoint.clone()),
                ..PersistedContext::default()
            },
        }
    }
}

/// On-disk shape of `context.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedContext {
    pub mode: String,
    pub workspace_id: Option<String>,
    pub workspace_name: Option<String>,
    pub item_id: Option<String>,
    pub item_name: Option<String>,
    pub sql_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContextStore {
    path: PathBuf,
}

impl ContextStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("context.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<PersistedContext> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&text) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring corrupt context file");
                None
            }
        }
    }

    pub fn save(&self, ctx: &PersistedContext) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(ctx)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
