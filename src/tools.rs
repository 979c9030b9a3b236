//! Tool catalog: names, descriptions, input schemas, and which mode offers them.

use jsonschema::Draft;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::session::ConnectionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolGroup {
    /// Session bookkeeping; offered in every mode.
    Session,
    /// Semantic-model discovery and connect; needs no active context, offered in every mode.
    Discovery,
    /// Needs an active semantic model.
    Semantic,
    /// Needs an active warehouse.
    Warehouse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    GetContext,
    ClearContext,
    ConnectWarehouse,
    ListWorkspaces,
    ListDatasets,
    ConnectDataset,
    GetTables,
    GetColumns,
    GetMeasures,
    GetRelationships,
    ExecuteDax,
    GetDatasetInfo,
    RefreshDataset,
    CreateMeasure,
    DeleteMeasure,
    CreateRelationship,
    ListTables,
    ExecuteSql,
    DescribeTable,
    ScanWarehouse,
    ProfileTable,
    SampleTable,
}

impl Tool {
    pub const ALL: [Tool; 22] = [
        Tool::GetContext,
        Tool::ClearContext,
        Tool::ConnectWarehouse,
        Tool::ListWorkspaces,
        Tool::ListDatasets,
        Tool::ConnectDataset,
        Tool::GetTables,
        Tool::GetColumns,
        Tool::GetMeasures,
        Tool::GetRelationships,
        Tool::ExecuteDax,
        Tool::GetDatasetInfo,
        Tool::RefreshDataset,
        Tool::CreateMeasure,
        Tool::DeleteMeasure,
        Tool::CreateRelationship,
        Tool::ListTables,
        Tool::ExecuteSql,
        Tool::DescribeTable,
        Tool::ScanWarehouse,
        Tool::ProfileTable,
        Tool::SampleTable,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tool::GetContext => "get_context",
            Tool::ClearContext => "clear_context",
            Tool::ConnectWarehouse => "connect_warehouse",
            Tool::ListWorkspaces => "list_workspaces",
            Tool::ListDatasets => "list_datasets",
            Tool::ConnectDataset => "connect_dataset",
            Tool::GetTables => "get_tables",
            Tool::GetColumns => "get_columns",
            Tool::GetMeasures => "get_measures",
            Tool::GetRelationships => "get_relationships",
            Tool::ExecuteDax => "execute_dax",
            Tool::GetDatasetInfo => "get_dataset_info",
            Tool::RefreshDataset => "refresh_dataset",
            Tool::CreateMeasure => "create_measure",
            Tool::DeleteMeasure => "delete_measure",
            Tool::CreateRelationship => "create_relationship",
            Tool::ListTables => "list_tables",
            Tool::ExecuteSql => "execute_sql",
            Tool::DescribeTable => "describe_table",
            Tool::ScanWarehouse => "scan_warehouse",
            Tool::ProfileTable => "profile_table",
            Tool::SampleTable => "sample_table",
        }
    }

    pub fn from_name(name: &str) -> Option<Tool> {
        Tool::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn group(self) -> ToolGroup {
        match self {
            Tool::GetContext | Tool::ClearContext | Tool::ConnectWarehouse => ToolGroup::Session,
            Tool::ListWorkspaces | Tool::ListDatasets | Tool::ConnectDataset => ToolGroup::Discovery,
            Tool::ListTables
            | Tool::ExecuteSql
            | Tool::DescribeTable
            | Tool::ScanWarehouse
            | Tool::ProfileTable
            | Tool::SampleTable => ToolGroup::Warehouse,
            _ => ToolGroup::Semantic,
        }
    }

    pub fn available_in(self, mode: ConnectionMode) -> bool {
        match self.group() {
            ToolGroup::Session | ToolGroup::Discovery => true,
            ToolGroup::Semantic => mode == ConnectionMode::SemanticModel,
            ToolGroup::Warehouse => mode == ConnectionMode::DataWarehouse,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Tool::GetContext => "Show the active connection mode, its identifiers and resource limits. Cheap; call it first.",
            Tool::ClearContext => "Disconnect from the current semantic model or warehouse.",
            Tool::ConnectWarehouse => "Switch to warehouse mode and target a Fabric SQL endpoint. Replaces any semantic model connection.",
            Tool::ListWorkspaces => "List all Power BI workspaces accessible to the user.",
            Tool::ListDatasets => "List semantic models (datasets) in a workspace. Defaults to the connected workspace.",
            Tool::ConnectDataset => "Switch to semantic-model mode and connect to a dataset. Replaces any warehouse connection.",
            Tool::GetTables => "Get all tables in the connected model with column counts.",
            Tool::GetColumns => "Get column details (cardinality, max length). Optionally filter by table_name.",
            Tool::GetMeasures => "Get all measures in the model with their DAX expressions (requires Premium/Fabric).",
            Tool::GetRelationships => "Get all relationships in the model (requires Premium/Fabric).",
            Tool::ExecuteDax => "Execute a DAX query on the connected model. The query must start with EVALUATE.",
            Tool::GetDatasetInfo => "Get metadata about the connected dataset.",
            Tool::RefreshDataset => "Trigger a refresh of the connected dataset, or a TMSL refresh of one table.",
            Tool::CreateMeasure => "Create or replace a measure via TMSL. Set dry_run to preview the command without sending it.",
            Tool::DeleteMeasure => "Delete a measure via TMSL. Set dry_run to preview the command without sending it.",
            Tool::CreateRelationship => "Create or replace a relationship via TMSL. Set dry_run to preview the command without sending it.",
            Tool::ListTables => "List tables in the warehouse. Use schema to filter.",
            Tool::ExecuteSql => "Execute a read-only SQL query. Statements with INSERT/UPDATE/DELETE/DROP/TRUNCATE/ALTER/CREATE/EXEC are refused.",
            Tool::DescribeTable => "Get column definitions for a warehouse table.",
            Tool::ScanWarehouse => "Scan schemas and tables with row counts and keep the overview in context.",
            Tool::ProfileTable => "Profile a table given as schema.table: column types plus null ratio and distinct count for the first columns.",
            Tool::SampleTable => "Return a few sample rows from a table given as schema.table.",
        }
    }

    pub fn input_schema(self) -> Value {
        let string = |desc: &str| json!({ "type": "string", "description": desc });
        let rows = |desc: &str| json!({ "type": "integer", "minimum": 1, "description": desc });
        let dry_run = json!({ "type": "boolean", "description": "Only generate and return the TMSL (default false)" });
        let (properties, required): (Value, Vec<&str>) = match self {
            Tool::GetContext
            | Tool::ClearContext
            | Tool::ListWorkspaces
            | Tool::GetTables
            | Tool::GetMeasures
            | Tool::GetRelationships
            | Tool::GetDatasetInfo
            | Tool::ScanWarehouse => (json!({}), vec![]),
            Tool::ConnectWarehouse => (
                json!({
                    "sql_endpoint": string("SQL connection string host, e.g. xxx.datawarehouse.fabric.microsoft.com"),
                    "database": string("Optional warehouse (database) name")
                }),
                vec!["sql_endpoint"],
            ),
            Tool::ListDatasets => (
                json!({ "workspace_id": string("Optional workspace ID; defaults to the connected workspace") }),
                vec![],
            ),
            Tool::ConnectDataset => (
                json!({
                    "workspace_id": string("Workspace ID; defaults to the connected workspace"),
                    "dataset_id": string("Dataset (semantic model) ID")
                }),
                vec!["dataset_id"],
            ),
            Tool::GetColumns => (
                json!({ "table_name": string("Optional table name filter") }),
                vec![],
            ),
            Tool::ExecuteDax => (
                json!({
                    "query": string("DAX query starting with EVALUATE"),
                    "max_rows": rows("Optional row cap; never above the configured limit")
                }),
                vec!["query"],
            ),
            Tool::RefreshDataset => (
                json!({
                    "table": string("Optional table to refresh via TMSL instead of a full dataset refresh"),
                    "refresh_type": string("TMSL refresh type (default full)"),
                    "dry_run": dry_run
                }),
                vec![],
            ),
            Tool::CreateMeasure => (
                json!({
                    "table_name": string("Table to add the measure to"),
                    "name": string("Measure name"),
                    "expression": string("DAX expression"),
                    "description": string("Optional description"),
                    "format_string": string("Optional format string, e.g. #,##0.00"),
                    "display_folder": string("Optional display folder"),
                    "dry_run": dry_run
                }),
                vec!["table_name", "name", "expression"],
            ),
            Tool::DeleteMeasure => (
                json!({
                    "table_name": string("Table containing the measure"),
                    "name": string("Measure name to delete"),
                    "dry_run": dry_run
                }),
                vec!["table_name", "name"],
            ),
            Tool::CreateRelationship => (
                json!({
                    "from_table": string("Many-side table"),
                    "from_column": string("Many-side column"),
                    "to_table": string("One-side table"),
                    "to_column": string("One-side column"),
                    "is_active": { "type": "boolean", "description": "Default true" },
                    "dry_run": dry_run
                }),
                vec!["from_table", "from_column", "to_table", "to_column"],
            ),
            Tool::ListTables => (
                json!({ "schema": string("Optional schema filter") }),
                vec![],
            ),
            Tool::ExecuteSql => (
                json!({
                    "query": string("SQL SELECT query"),
                    "max_rows": rows("Optional row cap; never above the configured limit")
                }),
                vec!["query"],
            ),
            Tool::DescribeTable => (
                json!({
                    "table_name": string("Table name"),
                    "schema": string("Schema (default dbo)")
                }),
                vec!["table_name"],
            ),
            Tool::ProfileTable => (
                json!({ "table": string("Table as schema.table") }),
                vec!["table"],
            ),
            Tool::SampleTable => (
                json!({
                    "table": string("Table as schema.table"),
                    "n": rows("Number of rows; never above the configured sample size")
                }),
                vec!["table"],
            ),
        };
        let mut schema = json!({ "type": "object", "properties": properties });
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        schema
    }
}

pub fn catalog(mode: ConnectionMode) -> Vec<Tool> {
    Tool::ALL.into_iter().filter(|t| t.available_in(mode)).collect()
}

/// `tools/list` payload for `mode`.
pub fn tool_list(mode: ConnectionMode) -> Value {
    let tools: Vec<Value> = catalog(mode)
        .into_iter()
        .map(|t| {
            json!({
                "name": t.name(),
                "description": t.description(),
                "inputSchema": t.input_schema(),
            })
        })
        .collect();
    json!({ "tools": tools })
}

/// Check `args` against the tool's declared schema. Missing required fields are
/// reported one at a time as `<field> required`.
pub fn validate_arguments(tool: Tool, args: &Value) -> Result<(), ToolError> {
    if !args.is_object() {
        return Err(ToolError::invalid("invalid arguments: expected an object"));
    }
    let schema = tool.input_schema();
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            let present = args
                .get(field)
                .is_some_and(|v| !v.is_null() && v.as_str().map_or(true, |s| !s.trim().is_empty()));
            if !present {
                return Err(ToolError::Required(field.to_string()));
            }
        }
    }

    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| ToolError::invalid(format!("invalid tool schema: {e}")))?;
    let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolError::invalid(format!("invalid arguments: {}", errors.join("; "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(mode: ConnectionMode) -> Vec<&'static str> {
        catalog(mode).into_iter().map(Tool::name).collect()
    }

    #[test]
    fn catalogs_are_mode_specific() {
        let semantic = names(ConnectionMode::SemanticModel);
        assert!(semantic.contains(&"execute_dax"));
        assert!(semantic.contains(&"create_relationship"));
        assert!(!semantic.contains(&"execute_sql"));

        let warehouse = names(ConnectionMode::DataWarehouse);
        assert!(warehouse.contains(&"execute_sql"));
        assert!(warehouse.contains(&"describe_table"));
        assert!(!warehouse.contains(&"execute_dax"));

        let none = names(ConnectionMode::None);
        assert!(none.contains(&"connect_dataset"));
        assert!(none.contains(&"connect_warehouse"));
        assert!(!none.contains(&"execute_dax") && !none.contains(&"execute_sql"));
    }

    #[test]
    fn semantic_catalog_has_all_thirteen_semantic_tools() {
        let semantic = names(ConnectionMode::SemanticModel);
        for required in [
            "list_workspaces", "list_datasets", "connect_dataset", "get_tables", "get_columns",
            "get_measures", "get_relationships", "execute_dax", "get_dataset_info",
            "refresh_dataset", "create_measure", "delete_measure", "create_relationship",
        ] {
            assert!(semantic.contains(&required), "missing {required}");
        }
    }

    #[test]
    fn names_round_trip() {
        for tool in Tool::ALL {
            assert_eq!(Tool::from_name(tool.name()), Some(tool));
        }
        assert_eq!(Tool::from_name("drop_everything"), None);
    }

    #[test]
    fn missing_required_field_is_named() {
        let err = validate_arguments(Tool::ConnectDataset, &json!({ "workspace_id": "ws" })).unwrap_err();
        assert_eq!(err.to_string(), "dataset_id required");
        let err = validate_arguments(Tool::ExecuteSql, &json!({ "query": "   " })).unwrap_err();
        assert_eq!(err.to_string(), "query required");
    }

    #[test]
    fn type_mismatch_is_invalid() {
        let err = validate_arguments(Tool::ExecuteDax, &json!({ "query": "EVALUATE T", "max_rows": "ten" })).unwrap_err();
        assert!(err.to_string().starts_with("invalid arguments"));
        assert!(validate_arguments(Tool::ExecuteDax, &json!({ "query": "EVALUATE T", "max_rows": 10 })).is_ok());
        assert!(validate_arguments(Tool::GetTables, &json!([])).is_err());
    }

    #[test]
    fn profile_table_is_a_warehouse_tool() {
        assert_eq!(Tool::ProfileTable.group(), ToolGroup::Warehouse);
        assert!(names(ConnectionMode::DataWarehouse).contains(&"profile_table"));
        assert!(!names(ConnectionMode::SemanticModel).contains(&"profile_table"));
        assert_eq!(
            validate_arguments(Tool::ProfileTable, &json!({})).unwrap_err().to_string(),
            "table required"
        );
    }

    #[test]
    fn table_refresh_advertises_dry_run() {
        let schema = Tool::RefreshDataset.input_schema();
        assert_eq!(schema["properties"]["dry_run"]["type"], "boolean");
        assert!(validate_arguments(Tool::RefreshDataset, &json!({ "table": "Sales", "dry_run": true })).is_ok());
    }

    #[test]
    fn tool_list_shape() {
        let list = tool_list(ConnectionMode::DataWarehouse);
        let first = &list["tools"][0];
        assert!(first["name"].is_string());
        assert!(first["description"].is_string());
        assert_eq!(first["inputSchema"]["type"], "object");
    }
}
