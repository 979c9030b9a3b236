//! Semantic-model backend: Power BI REST for discovery and DAX, XMLA for writes.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::credentials::{CredentialProvider, TokenScope};
use crate::error::TransportError;
use crate::xmla::{workspace_endpoint, ExecutionResult, XmlaClient};

/// Everything the dispatcher needs from the semantic side.
pub trait SemanticApi {
    fn list_workspaces(&self) -> Result<Vec<Value>, TransportError>;
    fn list_datasets(&self, workspace_id: &str) -> Result<Vec<Value>, TransportError>;
    fn dataset_info(&self, workspace_id: &str, dataset_id: &str) -> Result<Value, TransportError>;
    fn trigger_refresh(&self, workspace_id: &str, dataset_id: &str) -> Result<(), TransportError>;
    /// Rows of the first result table of a DAX query.
    fn execute_queries(&self, workspace_id: &str, dataset_id: &str, dax: &str) -> Result<Vec<Value>, TransportError>;
    /// Whether [`SemanticApi::execute_command`] can reach the engine at all.
    fn can_execute_commands(&self) -> bool;
    fn execute_command(&self, workspace_name: &str, catalog: &str, tmsl: &Value) -> Result<ExecutionResult, TransportError>;
    /// Read query (DAX or DMV) over XMLA; only meaningful when commands can be executed.
    fn xmla_query(&self, workspace_name: &str, catalog: &str, statement: &str, max_rows: usize) -> Result<Vec<Value>, TransportError>;
}

pub fn http_agent(timeout_secs: u64) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
}

pub struct PowerBiClient {
    agent: ureq::Agent,
    credentials: Arc<dyn CredentialProvider + Send + Sync>,
    base: String,
    xmla_enabled: bool,
}

impl PowerBiClient {
    pub fn new(cfg: &Config, credentials: Arc<dyn CredentialProvider + Send + Sync>) -> Self {
        Self {
            agent: http_agent(cfg.network.timeout_secs),
            credentials,
            base: cfg.network.powerbi_api_base.trim_end_matches('/').to_string(),
            xmla_enabled: cfg.xmla.enabled,
        }
    }

    fn bearer(&self) -> Result<String, TransportError> {
        self.credentials
            .token(TokenScope::SemanticQuery)
            .map(|t| format!("Bearer {t}"))
            .ok_or(TransportError::Auth(TokenScope::SemanticQuery.as_str()))
    }

    fn get(&self, path: &str) -> Result<Value, TransportError> {
        let url = format!("{}{}", self.base, path);
        tracing::debug!(%url, "GET");
        let response = self.agent.get(&url).set("Authorization", &self.bearer()?).call()?;
        Ok(response.into_json()?)
    }

    fn post(&self, path: &str, body: &Value) -> Result<ureq::Response, TransportError> {
        let url = format!("{}{}", self.base, path);
        tracing::debug!(%url, "POST");
        Ok(self
            .agent
            .post(&url)
            .set("Authorization", &self.bearer()?)
            .send_json(body)?)
    }
}

/// `{value: [...]}` projected to `{id, name}` records.
fn id_name_list(res: &Value) -> Vec<Value> {
    res.get("value")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| json!({ "id": item.get("id"), "name": item.get("name") }))
                .collect()
        })
        .unwrap_or_default()
}

/// `results[0].tables[0].rows` from an executeQueries response.
pub fn extract_query_rows(res: &Value) -> Result<Vec<Value>, TransportError> {
    if let Some(err) = res.get("error") {
        return Err(TransportError::Protocol(err.to_string()));
    }
    let Some(result) = res.get("results").and_then(|r| r.get(0)) else {
        return Err(TransportError::Protocol("executeQueries response has no results".into()));
    };
    if let Some(err) = result.get("error") {
        return Err(TransportError::Protocol(err.to_string()));
    }
    Ok(result
        .get("tables")
        .and_then(|t| t.get(0))
        .and_then(|t| t.get("rows"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

impl SemanticApi for PowerBiClient {
    fn list_workspaces(&self) -> Result<Vec<Value>, TransportError> {
        Ok(id_name_list(&self.get("/groups")?))
    }

    fn list_datasets(&self, workspace_id: &str) -> Result<Vec<Value>, TransportError> {
        Ok(id_name_list(&self.get(&format!("/groups/{workspace_id}/datasets"))?))
    }

    fn dataset_info(&self, workspace_id: &str, dataset_id: &str) -> Result<Value, TransportError> {
        self.get(&format!("/groups/{workspace_id}/datasets/{dataset_id}"))
    }

    fn trigger_refresh(&self, workspace_id: &str, dataset_id: &str) -> Result<(), TransportError> {
        // 202 Accepted with an empty body; nothing to read.
        self.post(&format!("/groups/{workspace_id}/datasets/{dataset_id}/refreshes"), &json!({}))?;
        Ok(())
    }

    fn execute_queries(&self, workspace_id: &str, dataset_id: &str, dax: &str) -> Result<Vec<Value>, TransportError> {
        let body = json!({
            "queries": [{ "query": dax }],
            "serializerSettings": { "includeNulls": true }
        });
        let response = self.post(
            &format!("/groups/{workspace_id}/datasets/{dataset_id}/executeQueries"),
            &body,
        )?;
        let res: Value = response.into_json()?;
        extract_query_rows(&res)
    }

    fn can_execute_commands(&self) -> bool {
        self.xmla_enabled
    }

    fn execute_command(&self, workspace_name: &str, catalog: &str, tmsl: &Value) -> Result<ExecutionResult, TransportError> {
        XmlaClient::new(
            &self.agent,
            self.credentials.as_ref(),
            &workspace_endpoint(workspace_name),
            catalog,
        )
        .execute_command(tmsl)
    }

    fn xmla_query(&self, workspace_name: &str, catalog: &str, statement: &str, max_rows: usize) -> Result<Vec<Value>, TransportError> {
        let rows = XmlaClient::new(
            &self.agent,
            self.credentials.as_ref(),
            &workspace_endpoint(workspace_name),
            catalog,
        )
        .query(statement, max_rows)?;
        Ok(rows.into_iter().map(Value::Object).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_rows_are_read_from_first_table() {
        let res = json!({
            "results": [{ "tables": [{ "rows": [{ "[Table Name]": "Sales" }, { "[Table Name]": "Date" }] }] }]
        });
        let rows = extract_query_rows(&res).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["[Table Name]"], "Date");
    }

    #[test]
    fn query_without_tables_yields_no_rows() {
        let res = json!({ "results": [{}] });
        assert!(extract_query_rows(&res).unwrap().is_empty());
    }

    #[test]
    fn embedded_error_and_missing_results_are_protocol_errors() {
        let res = json!({ "results": [{ "error": { "code": "DAXQueryFailure" } }] });
        assert!(matches!(extract_query_rows(&res), Err(TransportError::Protocol(m)) if m.contains("DAXQueryFailure")));
        assert!(matches!(extract_query_rows(&json!({})), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn listings_project_id_and_name() {
        let res = json!({ "value": [{ "id": "1", "name": "WS", "type": "Workspace", "isReadOnly": false }] });
        assert_eq!(id_name_list(&res), vec![json!({ "id": "1", "name": "WS" })]);
        assert!(id_name_list(&json!({})).is_empty());
    }
}
