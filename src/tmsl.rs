//! Structured write commands for a tabular model, rendered as TMSL.
//!
//! Pure functions: nothing here touches the network or the session. The target
//! database is left as [`DATABASE_PLACEHOLDER`] until the caller resolves it right
//! before execution.

use serde::Serialize;
use serde_json::{json, Map, Value};

pub const DATABASE_PLACEHOLDER: &str = "<database>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    UpsertMeasure,
    DeleteMeasure,
    CreateRelationship,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseRef {
    Placeholder,
    Named(String),
}

impl DatabaseRef {
    pub fn as_str(&self) -> &str {
        match self {
            DatabaseRef::Placeholder => DATABASE_PLACEHOLDER,
            DatabaseRef::Named(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTarget {
    pub database: DatabaseRef,
    pub table: Option<String>,
    pub measure: Option<String>,
    pub relationship: Option<String>,
}

impl CommandTarget {
    fn new() -> Self {
        Self {
            database: DatabaseRef::Placeholder,
            table: None,
            measure: None,
            relationship: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    Measure {
        expression: String,
        description: Option<String>,
        format_string: Option<String>,
        display_folder: Option<String>,
    },
    Relationship {
        from_table: String,
        from_column: String,
        to_table: String,
        to_column: String,
        is_active: bool,
    },
    Refresh {
        refresh_type: String,
    },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredCommand {
    pub operation: Operation,
    pub target: CommandTarget,
    pub payload: CommandPayload,
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

pub fn generate_upsert_measure(
    name: &str,
    formula: &str,
    table: Option<&str>,
    description: Option<&str>,
    format_string: Option<&str>,
    display_folder: Option<&str>,
) -> StructuredCommand {
    let mut target = CommandTarget::new();
    target.table = non_empty(table);
    target.measure = Some(name.to_string());
    StructuredCommand {
        operation: Operation::UpsertMeasure,
        target,
        payload: CommandPayload::Measure {
            expression: formula.to_string(),
            description: non_empty(description),
            format_string: non_empty(format_string),
            display_folder: non_empty(display_folder),
        },
    }
}

pub fn generate_delete_measure(name: &str, table: Option<&str>) -> StructuredCommand {
    let mut target = CommandTarget::new();
    target.table = non_empty(table);
    target.measure = Some(name.to_string());
    StructuredCommand {
        operation: Operation::DeleteMeasure,
        target,
        payload: CommandPayload::Empty,
    }
}

pub fn relationship_name(from_table: &str, from_column: &str, to_table: &str, to_column: &str) -> String {
    format!("{from_table}_{from_column}_{to_table}_{to_column}")
}

pub fn generate_create_relationship(
    from_table: &str,
    from_column: &str,
    to_table: &str,
    to_column: &str,
    is_active: bool,
) -> StructuredCommand {
    let mut target = CommandTarget::new();
    target.relationship = Some(relationship_name(from_table, from_column, to_table, to_column));
    StructuredCommand {
        operation: Operation::CreateRelationship,
        target,
        payload: CommandPayload::Relationship {
            from_table: from_table.to_string(),
            from_column: from_column.to_string(),
            to_table: to_table.to_string(),
            to_column: to_column.to_string(),
            is_active,
        },
    }
}

/// `refresh_type` is one of full, automatic, calculate, dataOnly, clearValues, defragment.
pub fn generate_refresh(table: Option<&str>, refresh_type: Option<&str>) -> StructuredCommand {
    let mut target = CommandTarget::new();
    target.table = non_empty(table);
    StructuredCommand {
        operation: Operation::Refresh,
        target,
        payload: CommandPayload::Refresh {
            refresh_type: non_empty(refresh_type).unwrap_or_else(|| "full".to_string()),
        },
    }
}

impl StructuredCommand {
    pub fn is_resolved(&self) -> bool {
        self.target.database != DatabaseRef::Placeholder
    }

    /// Bind the command to `database`. A blank name leaves the placeholder in place.
    pub fn resolve_database(mut self, database: &str) -> Self {
        let database = database.trim();
        if !database.is_empty() {
            self.target.database = DatabaseRef::Named(database.to_string());
        }
        self
    }

    fn object_ref(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("database".into(), json!(self.target.database.as_str()));
        if let Some(t) = &self.target.table {
            obj.insert("table".into(), json!(t));
        }
        if let Some(m) = &self.target.measure {
            obj.insert("measure".into(), json!(m));
        }
        if let Some(r) = &self.target.relationship {
            obj.insert("relationship".into(), json!(r));
        }
        obj
    }

    pub fn to_tmsl(&self) -> Value {
        match (&self.operation, &self.payload) {
            (
                Operation::UpsertMeasure,
                CommandPayload::Measure {
                    expression,
                    description,
                    format_string,
                    display_folder,
                },
            ) => {
                let mut measure = Map::new();
                measure.insert("name".into(), json!(self.target.measure));
                measure.insert("expression".into(), json!(expression));
                if let Some(d) = description {
                    measure.insert("description".into(), json!(d));
                }
                if let Some(f) = format_string {
                    measure.insert("formatString".into(), json!(f));
                }
                if let Some(f) = display_folder {
                    measure.insert("displayFolder".into(), json!(f));
                }
                json!({ "createOrReplace": { "object": self.object_ref(), "measure": measure } })
            }
            (
                Operation::CreateRelationship,
                CommandPayload::Relationship {
                    from_table,
                    from_column,
                    to_table,
                    to_column,
                    is_active,
                },
            ) => json!({
                "createOrReplace": {
                    "object": self.object_ref(),
                    "relationship": {
                        "name": self.target.relationship,
                        "fromTable": from_table,
                        "fromColumn": from_column,
                        "toTable": to_table,
                        "toColumn": to_column,
                        "isActive": is_active,
                    }
                }
            }),
            (Operation::Refresh, CommandPayload::Refresh { refresh_type }) => json!({
                "refresh": { "type": refresh_type, "objects": [self.object_ref()] }
            }),
            _ => json!({ "delete": { "object": self.object_ref() } }),
        }
    }
}

/// Cheap structural checks on a DAX expression. Passing does not mean the
/// formula is valid DAX; only the engine can say that.
pub fn validate_dax(formula: &str) -> Result<(), String> {
    let formula = formula.trim();
    if formula.is_empty() {
        return Err("Formula cannot be empty".to_string());
    }

    let open = formula.matches('(').count();
    let close = formula.matches(')').count();
    if open != close {
        return Err(format!("Unbalanced parentheses: {open} opening, {close} closing"));
    }

    let open = formula.matches('[').count();
    let close = formula.matches(']').count();
    if open != close {
        return Err(format!("Unbalanced brackets: {open} opening, {close} closing"));
    }

    if formula.ends_with(',') {
        return Err("Formula ends with trailing comma".to_string());
    }
    if formula.ends_with('(') {
        return Err("Formula ends with unclosed function call".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_targets_table_and_measure_with_placeholder_database() {
        let cmd = generate_upsert_measure("Total Sales", "SUM(Sales[Amount])", Some("Sales"), None, None, None);
        assert_eq!(cmd.operation, Operation::UpsertMeasure);
        assert_eq!(cmd.target.table.as_deref(), Some("Sales"));
        assert_eq!(cmd.target.measure.as_deref(), Some("Total Sales"));
        assert_eq!(cmd.target.database, DatabaseRef::Placeholder);
        assert!(!cmd.is_resolved());

        let tmsl = cmd.to_tmsl();
        assert_eq!(tmsl["createOrReplace"]["object"]["database"], DATABASE_PLACEHOLDER);
        assert_eq!(tmsl["createOrReplace"]["measure"]["expression"], "SUM(Sales[Amount])");
    }

    #[test]
    fn upsert_carries_optional_fields_only_when_set() {
        let cmd = generate_upsert_measure(
            "Sales %",
            "DIVIDE([Total Sales], [Total Revenue])",
            Some("Metrics"),
            Some("Percentage of sales vs revenue"),
            Some("0.00%"),
            Some("KPIs"),
        );
        let measure = &cmd.to_tmsl()["createOrReplace"]["measure"];
        assert_eq!(measure["description"], "Percentage of sales vs revenue");
        assert_eq!(measure["formatString"], "0.00%");
        assert_eq!(measure["displayFolder"], "KPIs");

        let bare = generate_upsert_measure("M", "1", Some("T"), Some("  "), None, None).to_tmsl();
        assert!(bare["createOrReplace"]["measure"].get("description").is_none());
        assert!(bare["createOrReplace"]["measure"].get("formatString").is_none());
    }

    #[test]
    fn resolve_replaces_placeholder_only() {
        let cmd = generate_delete_measure("Old Measure", Some("Sales")).resolve_database("Contoso");
        assert!(cmd.is_resolved());
        let tmsl = cmd.to_tmsl();
        assert_eq!(tmsl["delete"]["object"]["database"], "Contoso");
        assert_eq!(tmsl["delete"]["object"]["measure"], "Old Measure");
        assert_eq!(tmsl["delete"]["object"]["table"], "Sales");

        let unbound = generate_delete_measure("Old Measure", Some("Sales")).resolve_database("  ");
        assert!(!unbound.is_resolved());
        assert_eq!(unbound.to_tmsl()["delete"]["object"]["database"], DATABASE_PLACEHOLDER);
    }

    #[test]
    fn relationship_is_named_from_its_endpoints() {
        let cmd = generate_create_relationship("Sales", "ProductKey", "Product", "ProductKey", false);
        assert_eq!(cmd.target.relationship.as_deref(), Some("Sales_ProductKey_Product_ProductKey"));
        let rel = &cmd.to_tmsl()["createOrReplace"]["relationship"];
        assert_eq!(rel["fromTable"], "Sales");
        assert_eq!(rel["toColumn"], "ProductKey");
        assert_eq!(rel["isActive"], false);
    }

    #[test]
    fn refresh_defaults_to_full_and_scopes_to_table() {
        let all = generate_refresh(None, None).resolve_database("DB").to_tmsl();
        assert_eq!(all["refresh"]["type"], "full");
        assert_eq!(all["refresh"]["objects"][0], json!({ "database": "DB" }));

        let one = generate_refresh(Some("Sales"), Some("dataOnly")).to_tmsl();
        assert_eq!(one["refresh"]["type"], "dataOnly");
        assert_eq!(one["refresh"]["objects"][0]["table"], "Sales");
    }

    #[test]
    fn validate_dax_flags_unbalanced_parentheses() {
        let err = validate_dax("SUM(Sales[Amount]").unwrap_err();
        assert!(err.to_lowercase().contains("parentheses"));
        assert!(validate_dax("SUM(Sales[Amount])").is_ok());
    }

    #[test]
    fn validate_dax_flags_brackets_and_trailing_tokens() {
        assert!(validate_dax("[Total Sales]").is_ok());
        assert!(validate_dax("[Total Sales").unwrap_err().contains("brackets"));
        assert!(validate_dax("   ").unwrap_err().contains("empty"));
        assert!(validate_dax("SUM(1,2),").unwrap_err().contains("trailing comma"));
        // Balanced counts but ends on an opening paren.
        assert!(validate_dax(")CALCULATE(").unwrap_err().contains("unclosed"));
    }
}
