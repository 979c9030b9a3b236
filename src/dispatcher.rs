//! Routes `tools/call` requests to the active backend.
//!
//! The dispatcher owns the [`Session`] and is its only writer. Every outcome,
//! including failures, comes back as a JSON value; nothing propagates to the
//! protocol loop.

use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::config::Limits;
use crate::error::{ToolError, ToolResult};
use crate::guard::{check_dax_query, check_sql, split_schema_table};
use crate::powerbi::SemanticApi;
use crate::session::{
    ContextStore, SemanticColumn, SemanticTable, Session, SessionError, TableSummary,
};
use crate::tmsl::{self, StructuredCommand};
use crate::tools::{self, Tool};
use crate::warehouse::{self, SqlTarget, WarehouseApi};
use crate::xmla::{ExecutionResult, ExecutionStatus};

const COLUMN_STATISTICS_DAX: &str = "EVALUATE COLUMNSTATISTICS()";

const MEASURES_DAX: &str = "EVALUATE SELECTCOLUMNS(INFO.MEASURES(),\
\"TableID\",[TableID],\"Name\",[Name],\"Expression\",[Expression],\
\"Description\",[Description],\"DataType\",[DataType],\"IsHidden\",[IsHidden])";

const MEASURES_DMV: &str = "SELECT [TableID],[Name],[Expression],[Description],[DataType],[IsHidden] \
FROM $SYSTEM.TMSCHEMA_MEASURES";

const RELATIONSHIPS_DAX: &str = "EVALUATE SELECTCOLUMNS(INFO.RELATIONSHIPS(),\
\"ID\",[ID],\"FromTableID\",[FromTableID],\"FromColumnID\",[FromColumnID],\
\"ToTableID\",[ToTableID],\"ToColumnID\",[ToColumnID],\"IsActive\",[IsActive],\
\"CrossFilteringBehavior\",[CrossFilteringBehavior])";

const RELATIONSHIPS_DMV: &str = "SELECT [ID],[FromTableID],[FromColumnID],[ToTableID],[ToColumnID],\
[IsActive],[CrossFilteringBehavior] FROM $SYSTEM.TMSCHEMA_RELATIONSHIPS";

/// Columns beyond this many are listed by `profile_table` but not scanned.
const PROFILED_COLUMNS: usize = 10;

const XMLA_UNAVAILABLE_NOTE: &str =
    "XMLA client not available. Execute this TMSL manually in SSMS or Tabular Editor.";

/// Owned copy of the connected model's identifiers, so handlers can call the
/// backend while the session is borrowed mutably later on.
struct ModelRef {
    workspace_id: String,
    workspace_name: String,
    model_id: String,
    model_name: String,
}

pub struct Dispatcher {
    session: Session,
    store: Option<ContextStore>,
    semantic: Box<dyn SemanticApi>,
    warehouse: Box<dyn WarehouseApi>,
}

impl Dispatcher {
    pub fn new(
        session: Session,
        store: Option<ContextStore>,
        semantic: Box<dyn SemanticApi>,
        warehouse: Box<dyn WarehouseApi>,
    ) -> Self {
        Self {
            session,
            store,
            semantic,
            warehouse,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Catalog for the current mode; recomputed on every call.
    pub fn tool_list(&self) -> Value {
        tools::tool_list(self.session.mode())
    }

    pub fn handle(&mut self, name: &str, args: &Value) -> Value {
        let Some(tool) = Tool::from_name(name).filter(|t| t.available_in(self.session.mode())) else {
            tracing::debug!(tool = name, mode = ?self.session.mode(), "tool not in current catalog");
            return json!({ "error": format!("Unknown tool: {name}") });
        };
        // Explicit nulls count as absent.
        let args = match args {
            Value::Null => Value::Object(Map::new()),
            Value::Object(obj) => Value::Object(
                obj.iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        };

        let outcome = tools::validate_arguments(tool, &args).and_then(|()| self.run(tool, &args));
        match outcome {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(tool = name, error = %err, "tool call failed");
                err.into_value()
            }
        }
    }

    fn run(&mut self, tool: Tool, args: &Value) -> ToolResult {
        match tool {
            Tool::GetContext => Ok(self.session.summary()),
            Tool::ClearContext => self.clear_context(),
            Tool::ConnectWarehouse => self.connect_warehouse(args),
            Tool::ListWorkspaces => self.list_workspaces(),
            Tool::ListDatasets => self.list_datasets(args),
            Tool::ConnectDataset => self.connect_dataset(args),
            Tool::GetTables => self.get_tables(),
            Tool::GetColumns => self.get_columns(args),
            Tool::GetMeasures => self.get_measures(),
            Tool::GetRelationships => self.get_relationships(),
            Tool::ExecuteDax => self.execute_dax(args),
            Tool::GetDatasetInfo => self.get_dataset_info(),
            Tool::RefreshDataset => self.refresh_dataset(args),
            Tool::CreateMeasure => self.create_measure(args),
            Tool::DeleteMeasure => self.delete_measure(args),
            Tool::CreateRelationship => self.create_relationship(args),
            Tool::ListTables => self.list_tables(args),
            Tool::ExecuteSql => self.execute_sql(args),
            Tool::DescribeTable => self.describe_table(args),
            Tool::ScanWarehouse => self.scan_warehouse(),
            Tool::ProfileTable => self.profile_table(args),
            Tool::SampleTable => self.sample_table(args),
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.save(&self.session.to_persisted()) {
            tracing::warn!(path = %store.path().display(), error = %e, "failed to persist context");
        }
    }

    fn limits(&self) -> Limits {
        *self.session.limits()
    }

    fn model(&self) -> Result<ModelRef, ToolError> {
        let ctx = self.session.semantic().ok_or(SessionError::NoSemanticModel)?;
        Ok(ModelRef {
            workspace_id: ctx.workspace_id.clone(),
            workspace_name: ctx.workspace_name.clone(),
            model_id: ctx.model_id.clone(),
            model_name: ctx.model_name.clone(),
        })
    }

    fn sql_target(&self) -> Result<SqlTarget, ToolError> {
        let ctx = self.session.warehouse().ok_or(SessionError::NoWarehouse)?;
        Ok(SqlTarget {
            endpoint: ctx.sql_endpoint.clone(),
            database: ctx.database_name.clone(),
        })
    }

    /// `workspace_id` from the arguments, else from the connected model.
    fn workspace_id(&self, args: &Value) -> Result<String, ToolError> {
        str_arg(args, "workspace_id")
            .map(str::to_string)
            .or_else(|| self.session.semantic().map(|c| c.workspace_id.clone()))
            .ok_or_else(|| ToolError::Required("workspace_id".to_string()))
    }

    // ---- session -------------------------------------------------------

    fn clear_context(&mut self) -> ToolResult {
        self.session.clear();
        self.persist();
        tracing::info!("context cleared");
        Ok(json!({ "status": "success", "message": "Context cleared" }))
    }

    fn connect_warehouse(&mut self, args: &Value) -> ToolResult {
        let endpoint = required(args, "sql_endpoint")?;
        let database = str_arg(args, "database");
        self.session.set_warehouse(endpoint, database);
        self.persist();
        tracing::info!(%endpoint, ?database, "switched to warehouse");
        Ok(json!({
            "status": "success",
            "message": format!("Connected to warehouse {endpoint}"),
            "context": self.session.summary(),
        }))
    }

    // ---- discovery -----------------------------------------------------

    // Discovery listings share the DAX row cap.
    fn list_workspaces(&self) -> ToolResult {
        let mut workspaces = self.semantic.list_workspaces()?;
        let total = workspaces.len();
        workspaces.truncate(self.limits().max_dax_rows);
        Ok(json!({
            "count": workspaces.len(),
            "total": total,
            "truncated": total > workspaces.len(),
            "workspaces": workspaces,
        }))
    }

    fn list_datasets(&self, args: &Value) -> ToolResult {
        let workspace_id = self.workspace_id(args)?;
        let mut datasets = self.semantic.list_datasets(&workspace_id)?;
        let total = datasets.len();
        datasets.truncate(self.limits().max_dax_rows);
        Ok(json!({
            "workspace_id": workspace_id,
            "count": datasets.len(),
            "total": total,
            "truncated": total > datasets.len(),
            "datasets": datasets,
        }))
    }

    fn connect_dataset(&mut self, args: &Value) -> ToolResult {
        let dataset_id = required(args, "dataset_id")?.to_string();
        let workspace_id = self.workspace_id(args)?;

        let workspace_name = match self.semantic.list_workspaces() {
            Ok(list) => find_name(&list, &workspace_id),
            Err(e) => {
                tracing::warn!(error = %e, "could not resolve workspace name");
                None
            }
        }
        .unwrap_or_else(|| workspace_id.clone());

        let model_name = match self.semantic.list_datasets(&workspace_id) {
            Ok(list) => find_name(&list, &dataset_id).ok_or_else(|| {
                ToolError::invalid(format!(
                    "Dataset '{dataset_id}' not found in workspace '{workspace_name}'"
                ))
            })?,
            Err(e) => {
                tracing::warn!(error = %e, "could not resolve dataset name");
                dataset_id.clone()
            }
        };

        self.session
            .set_semantic_model(&workspace_id, &workspace_name, &dataset_id, &model_name);
        self.persist();
        tracing::info!(workspace = %workspace_name, model = %model_name, "switched to semantic model");
        Ok(json!({
            "status": "success",
            "message": format!("Connected to '{model_name}' in workspace '{workspace_name}'"),
            "context": self.session.summary(),
        }))
    }

    // ---- semantic ------------------------------------------------------

    fn get_tables(&mut self) -> ToolResult {
        let m = self.model()?;
        let rows = self
            .semantic
            .execute_queries(&m.workspace_id, &m.model_id, COLUMN_STATISTICS_DAX)?;
        let tables = group_columns(&rows);
        let total = tables.len();
        let listed: Vec<Value> = tables
            .iter()
            .take(self.limits().max_tables_in_context)
            .map(|t| json!({ "name": t.name, "column_count": t.columns.len() }))
            .collect();

        let (measures, relationships) = self
            .session
            .semantic()
            .map(|c| (c.measures.clone(), c.relationships.clone()))
            .unwrap_or_default();
        self.session
            .update_semantic_schema(tables, measures, relationships)?;

        Ok(json!({
            "count": listed.len(),
            "total_tables": total,
            "truncated": total > listed.len(),
            "tables": listed,
        }))
    }

    fn get_columns(&self, args: &Value) -> ToolResult {
        let m = self.model()?;
        let limits = self.limits();
        let rows = self
            .semantic
            .execute_queries(&m.workspace_id, &m.model_id, COLUMN_STATISTICS_DAX)?;
        let mut tables = group_columns(&rows);
        if let Some(filter) = str_arg(args, "table_name") {
            tables.retain(|t| t.name.eq_ignore_ascii_case(filter));
            if tables.is_empty() {
                return Err(ToolError::invalid(format!("Table '{filter}' not found")));
            }
        }
        tables.truncate(limits.max_tables_in_context);
        for t in &mut tables {
            t.columns.truncate(limits.max_columns_per_table);
        }
        Ok(json!({ "tables": tables }))
    }

    /// REST `executeQueries` first; the XMLA DMV when REST refuses and XMLA is on.
    fn model_rows(&self, m: &ModelRef, dax: &str, dmv: &str) -> Result<Vec<Value>, ToolError> {
        let cap = self.limits().max_dax_rows;
        let mut rows = match self.semantic.execute_queries(&m.workspace_id, &m.model_id, dax) {
            Ok(rows) => rows.iter().map(|r| Value::Object(normalize_row(r))).collect(),
            Err(e) if self.semantic.can_execute_commands() => {
                tracing::info!(error = %e, "executeQueries failed; retrying over XMLA");
                self.semantic
                    .xmla_query(&m.workspace_name, &m.model_name, dmv, cap)?
            }
            Err(e) => return Err(e.into()),
        };
        rows.truncate(cap);
        Ok(rows)
    }

    fn get_measures(&mut self) -> ToolResult {
        let m = self.model()?;
        let measures = self.model_rows(&m, MEASURES_DAX, MEASURES_DMV)?;
        self.session.record_model_objects(Some(measures.clone()), None)?;
        Ok(json!({ "count": measures.len(), "measures": measures }))
    }

    fn get_relationships(&mut self) -> ToolResult {
        let m = self.model()?;
        let relationships = self.model_rows(&m, RELATIONSHIPS_DAX, RELATIONSHIPS_DMV)?;
        self.session
            .record_model_objects(None, Some(relationships.clone()))?;
        Ok(json!({ "count": relationships.len(), "relationships": relationships }))
    }

    fn execute_dax(&self, args: &Value) -> ToolResult {
        let query = required(args, "query")?;
        check_dax_query(query).map_err(ToolError::Invalid)?;
        let m = self.model()?;
        let cap = Limits::clamp(u64_arg(args, "max_rows"), self.limits().max_dax_rows);

        let mut rows = self
            .semantic
            .execute_queries(&m.workspace_id, &m.model_id, query)?;
        let truncated = rows.len() > cap;
        rows.truncate(cap);
        let row_count = rows.len();
        Ok(json!({ "row_count": row_count, "truncated": truncated, "rows": rows }))
    }

    fn get_dataset_info(&self) -> ToolResult {
        let m = self.model()?;
        let info = self.semantic.dataset_info(&m.workspace_id, &m.model_id)?;
        Ok(json!({
            "workspace_id": m.workspace_id,
            "workspace_name": m.workspace_name,
            "dataset": info,
        }))
    }

    fn refresh_dataset(&self, args: &Value) -> ToolResult {
        let m = self.model()?;
        match str_arg(args, "table") {
            None => {
                self.semantic.trigger_refresh(&m.workspace_id, &m.model_id)?;
                Ok(json!({
                    "status": "success",
                    "message": format!("Refresh triggered for dataset '{}'", m.model_name),
                }))
            }
            Some(table) => {
                let command = tmsl::generate_refresh(Some(table), str_arg(args, "refresh_type"));
                self.run_command(
                    &m,
                    command,
                    bool_arg(args, "dry_run", false),
                    format!("Table '{table}' refreshed successfully!"),
                )
            }
        }
    }

    fn create_measure(&self, args: &Value) -> ToolResult {
        let table = required(args, "table_name")?;
        let name = required(args, "name")?;
        let expression = required(args, "expression")?;
        let m = self.model()?;

        let command = tmsl::generate_upsert_measure(
            name,
            expression,
            Some(table),
            str_arg(args, "description"),
            str_arg(args, "format_string"),
            str_arg(args, "display_folder"),
        );
        let mut out = self.run_command(
            &m,
            command,
            bool_arg(args, "dry_run", false),
            format!("Measure '{name}' created successfully!"),
        )?;
        if let Err(warning) = tmsl::validate_dax(expression) {
            out["warning"] = json!(warning);
        }
        Ok(out)
    }

    fn delete_measure(&self, args: &Value) -> ToolResult {
        let table = required(args, "table_name")?;
        let name = required(args, "name")?;
        let m = self.model()?;
        let command = tmsl::generate_delete_measure(name, Some(table));
        self.run_command(
            &m,
            command,
            bool_arg(args, "dry_run", false),
            format!("Measure '{name}' deleted successfully!"),
        )
    }

    fn create_relationship(&self, args: &Value) -> ToolResult {
        let from_table = required(args, "from_table")?;
        let from_column = required(args, "from_column")?;
        let to_table = required(args, "to_table")?;
        let to_column = required(args, "to_column")?;
        let m = self.model()?;

        let command = tmsl::generate_create_relationship(
            from_table,
            from_column,
            to_table,
            to_column,
            bool_arg(args, "is_active", true),
        );
        let name = tmsl::relationship_name(from_table, from_column, to_table, to_column);
        self.run_command(
            &m,
            command,
            bool_arg(args, "dry_run", false),
            format!("Relationship '{name}' created successfully!"),
        )
    }

    /// Resolve the database, then preview, hand back, or execute the command.
    fn run_command(
        &self,
        m: &ModelRef,
        command: StructuredCommand,
        dry_run: bool,
        success_message: String,
    ) -> ToolResult {
        let command = command.resolve_database(&m.model_name);
        let tmsl = command.to_tmsl();

        if dry_run {
            let preview = ExecutionResult::new(ExecutionStatus::Preview, "Dry run: command generated, not sent");
            let mut out = json!(preview);
            out["tmsl"] = tmsl;
            return Ok(out);
        }
        if !self.semantic.can_execute_commands() {
            let mut out = json!(ExecutionResult::new(ExecutionStatus::TmslGenerated, "TMSL generated"));
            out["note"] = json!(XMLA_UNAVAILABLE_NOTE);
            out["tmsl"] = tmsl;
            return Ok(out);
        }
        if !command.is_resolved() {
            return Err(ToolError::invalid(
                "Connected model has no name; reconnect with connect_dataset before executing",
            ));
        }

        let mut result = self
            .semantic
            .execute_command(&m.workspace_name, &m.model_name, &tmsl)?;
        let succeeded = result.status == ExecutionStatus::Success;
        if succeeded {
            result.message = success_message;
        }
        tracing::info!(model = %m.model_name, status = ?result.status, "tmsl command executed");
        let mut out = json!(result);
        if !succeeded {
            out["tmsl"] = tmsl;
        }
        Ok(out)
    }

    // ---- warehouse -----------------------------------------------------

    fn list_tables(&mut self, args: &Value) -> ToolResult {
        let target = self.sql_target()?;
        let cap = self.limits().max_sql_result_rows;
        let result = match str_arg(args, "schema") {
            Some(schema) => self.warehouse.query(
                &target,
                warehouse::LIST_TABLES_IN_SCHEMA_SQL,
                &[schema],
                cap,
            )?,
            None => self
                .warehouse
                .query(&target, warehouse::LIST_TABLES_SQL, &[], cap)?,
        };
        let tables: Vec<String> = result
            .rows
            .iter()
            .filter_map(|row| Some(format!("{}.{}", text(row, 0)?, text(row, 1)?)))
            .collect();
        Ok(json!({ "count": tables.len(), "truncated": result.truncated, "tables": tables }))
    }

    fn execute_sql(&mut self, args: &Value) -> ToolResult {
        let query = required(args, "query")?;
        check_sql(query).map_err(ToolError::Invalid)?;
        let target = self.sql_target()?;
        let cap = Limits::clamp(u64_arg(args, "max_rows"), self.limits().max_sql_result_rows);

        let result = self.warehouse.query(&target, query, &[], cap)?;
        Ok(json!({
            "columns": &result.columns,
            "row_count": result.rows.len(),
            "truncated": result.truncated,
            "rows": result.records(),
        }))
    }

    fn describe_table(&mut self, args: &Value) -> ToolResult {
        let table = required(args, "table_name")?;
        let schema = str_arg(args, "schema").unwrap_or("dbo");
        let target = self.sql_target()?;
        let result = self.warehouse.query(
            &target,
            warehouse::DESCRIBE_TABLE_SQL,
            &[schema, table],
            self.limits().max_columns_per_table,
        )?;
        if result.rows.is_empty() {
            return Err(ToolError::invalid(format!("Table '{schema}.{table}' not found")));
        }
        Ok(json!({
            "table": format!("{schema}.{table}"),
            "column_count": result.rows.len(),
            "truncated": result.truncated,
            "columns": result.records(),
        }))
    }

    fn scan_warehouse(&mut self) -> ToolResult {
        let target = self.sql_target()?;
        let cap = self.limits().max_sql_result_rows;

        let schema_rows = self
            .warehouse
            .query(&target, warehouse::LIST_SCHEMAS_SQL, &[], cap)?;
        let schemas: Vec<String> = schema_rows
            .rows
            .iter()
            .filter_map(|row| text(row, 0).map(str::to_string))
            .collect();

        let count_rows = self
            .warehouse
            .query(&target, warehouse::TABLE_ROW_COUNTS_SQL, &[], cap)?;
        let tables: Vec<TableSummary> = count_rows
            .rows
            .iter()
            .filter_map(|row| {
                let schema = text(row, 0)?;
                let name = text(row, 1)?;
                let row_count = row
                    .get(2)
                    .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
                    .unwrap_or(0);
                Some(TableSummary {
                    schema: schema.to_string(),
                    name: name.to_string(),
                    full_name: format!("{schema}.{name}"),
                    row_count,
                })
            })
            .collect();
        let total = tables.len();

        self.session.update_warehouse_overview(schemas, tables)?;
        let ctx = self.session.warehouse().ok_or(SessionError::NoWarehouse)?;
        tracing::info!(schemas = ctx.schemas.len(), tables = total, "warehouse scanned");
        Ok(json!({
            "schemas": ctx.schemas,
            "table_count": total,
            "truncated": total > ctx.tables_overview.len(),
            "tables": ctx.tables_overview,
        }))
    }

    /// Column definitions, plus null ratio and distinct count for the leading
    /// columns. A column whose statistics query fails keeps its definition and
    /// gets `profile_error` instead.
    fn profile_table(&mut self, args: &Value) -> ToolResult {
        let (schema, table) =
            split_schema_table(required(args, "table")?).map_err(ToolError::Invalid)?;
        let target = self.sql_target()?;
        let defs = self.warehouse.query(
            &target,
            warehouse::PROFILE_COLUMNS_SQL,
            &[schema.as_str(), table.as_str()],
            self.limits().max_columns_per_table,
        )?;
        if defs.rows.is_empty() {
            return Err(ToolError::invalid(format!("Table '{schema}.{table}' not found")));
        }

        let mut columns: Vec<Map<String, Value>> = defs
            .rows
            .iter()
            .map(|row| {
                let cell = |i: usize| row.get(i).cloned().unwrap_or(Value::Null);
                let mut col = Map::new();
                col.insert("name".into(), cell(0));
                col.insert("type".into(), cell(1));
                col.insert("nullable".into(), json!(text(row, 2) == Some("YES")));
                col.insert("max_length".into(), cell(3));
                col.insert("precision".into(), cell(4));
                col.insert("scale".into(), cell(5));
                col
            })
            .collect();

        let profiled = columns.len().min(PROFILED_COLUMNS);
        for col in columns.iter_mut().take(profiled) {
            let Some(name) = col.get("name").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            let sql = warehouse::column_profile_sql(&schema, &table, &name);
            match self.warehouse.query(&target, &sql, &[], 1) {
                Ok(stats) => {
                    let Some(row) = stats.rows.first() else { continue };
                    let count = |i: usize| row.get(i).and_then(Value::as_i64);
                    if let Some(total) = count(0).filter(|&t| t > 0) {
                        let ratio = count(1).unwrap_or(0) as f64 / total as f64;
                        col.insert("null_ratio".into(), json!((ratio * 10_000.0).round() / 10_000.0));
                    }
                    col.insert("distinct_count".into(), json!(count(2)));
                }
                Err(e) => {
                    tracing::debug!(column = %name, error = %e, "column profile failed");
                    col.insert("profile_error".into(), json!(e.to_string()));
                }
            }
        }

        Ok(json!({
            "table": format!("{schema}.{table}"),
            "column_count": columns.len(),
            "truncated": defs.truncated,
            "profiled_columns": profiled,
            "columns": columns,
        }))
    }

    fn sample_table(&mut self, args: &Value) -> ToolResult {
        let (schema, table) =
            split_schema_table(required(args, "table")?).map_err(ToolError::Invalid)?;
        let target = self.sql_target()?;
        let n = Limits::clamp(u64_arg(args, "n"), self.limits().sample_rows);
        let sql = warehouse::sample_sql(&schema, &table, n);

        let result = self.warehouse.query(&target, &sql, &[], n)?;
        Ok(json!({
            "table": format!("{schema}.{table}"),
            "columns": &result.columns,
            "rows": result.records(),
        }))
    }
}

/// A tool result counts as an error when it carries `error` or an error status.
pub fn is_error_result(result: &Value) -> bool {
    result.get("error").is_some()
        || result.get("status").and_then(Value::as_str) == Some("error")
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    str_arg(args, key).ok_or_else(|| ToolError::Required(key.to_string()))
}

fn bool_arg(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn u64_arg(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

fn text(row: &[Value], i: usize) -> Option<&str> {
    row.get(i).and_then(Value::as_str)
}

fn find_name(items: &[Value], id: &str) -> Option<String> {
    items
        .iter()
        .find(|item| item.get("id").and_then(Value::as_str) == Some(id))
        .and_then(|item| item.get("name").and_then(Value::as_str))
        .map(str::to_string)
}

/// `[Name]` and `Table[Name]` keys from executeQueries become `Name`.
fn clean_key(key: &str) -> &str {
    match key.find('[') {
        Some(open) if key.ends_with(']') && key.len() > open + 2 => &key[open + 1..key.len() - 1],
        _ => key,
    }
}

fn normalize_row(row: &Value) -> Map<String, Value> {
    row.as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| (clean_key(k).to_string(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// COLUMNSTATISTICS rows grouped by table, in first-seen order. Internal
/// `RowNumber-*` columns are dropped.
fn group_columns(rows: &[Value]) -> Vec<SemanticTable> {
    let mut tables: Vec<SemanticTable> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows.iter().map(normalize_row) {
        let (Some(table), Some(column)) = (
            row.get("Table Name").and_then(Value::as_str),
            row.get("Column Name").and_then(Value::as_str),
        ) else {
            continue;
        };
        if column.starts_with("RowNumber-") {
            continue;
        }
        let col = SemanticColumn {
            name: column.to_string(),
            cardinality: row.get("Column Cardinality").and_then(Value::as_i64),
            max_length: row.get("Max Length").and_then(Value::as_i64),
        };
        match index.get(table) {
            Some(&i) => tables[i].columns.push(col),
            None => {
                index.insert(table.to_string(), tables.len());
                tables.push(SemanticTable {
                    name: table.to_string(),
                    columns: vec![col],
                });
            }
        }
    }
    tables
}
