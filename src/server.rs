use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::sync::Arc;

use crate::config::{load_config, state_dir};
use crate::credentials::{provider_from_config, CredentialProvider};
use crate::dispatcher::{is_error_result, Dispatcher};
use crate::powerbi::PowerBiClient;
use crate::session::{ContextStore, Session};
use crate::warehouse::TdsWarehouse;

const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

pub struct ServerState {
    dispatcher: Dispatcher,
}

impl ServerState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    fn tool_list(&self, id: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": self.dispatcher.tool_list()
        })
    }

    fn tool_call(&mut self, id: Value, params: &Value) -> Value {
        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        tracing::debug!(tool = name, "tools/call");
        let result = self.dispatcher.handle(name, &args);
        let is_error = is_error_result(&result);
        let text = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "content": [{ "type": "text", "text": text }], "isError": is_error }
        })
    }

    /// Reply for one parsed message, or `None` for notifications.
    pub fn handle_message(&mut self, msg: &Value) -> Option<Value> {
        // JSON-RPC notifications have no "id" field; they never get a reply.
        let id = msg.get("id").cloned()?;
        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

        let reply = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": msg
                        .get("params")
                        .and_then(|p| p.get("protocolVersion"))
                        .cloned()
                        .unwrap_or(json!(DEFAULT_PROTOCOL_VERSION)),
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "fabric-gateway", "version": env!("CARGO_PKG_VERSION") }
                }
            }),
            "ping" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {}
            }),
            "tools/list" => self.tool_list(id),
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or(json!({}));
                self.tool_call(id, &params)
            }
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }),
        };
        Some(reply)
    }
}

/// Drive the protocol over any line source and sink. Returns when input ends;
/// fails only when the output side breaks.
pub fn serve<R: BufRead, W: Write>(input: R, output: &mut W, state: &mut ServerState) -> Result<()> {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable input line");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed line");
                continue;
            }
        };

        let Some(reply) = state.handle_message(&msg) else {
            continue;
        };
        writeln!(output, "{}", reply).context("writing reply")?;
        output.flush().context("flushing reply")?;
    }
    Ok(())
}

/// Build the production dispatcher from config and persisted context.
pub fn build_dispatcher() -> Result<Dispatcher> {
    let cwd = std::env::current_dir().context("resolving working directory")?;
    let state_dir = state_dir();
    let cfg = load_config(&cwd, &state_dir);

    let store = ContextStore::new(&state_dir);
    let session = Session::restore(cfg.limits, store.load().as_ref());
    tracing::info!(mode = ?session.mode(), state_dir = %state_dir.display(), "session restored");

    let credentials: Arc<dyn CredentialProvider + Send + Sync> = Arc::from(provider_from_config(&cfg.auth));
    let semantic = PowerBiClient::new(&cfg, credentials.clone());
    let warehouse = TdsWarehouse::new(&cfg, credentials)?;
    Ok(Dispatcher::new(
        session,
        Some(store),
        Box::new(semantic),
        Box::new(warehouse),
    ))
}

pub fn run_stdio_server() -> Result<()> {
    let mut state = ServerState::new(build_dispatcher()?);
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    tracing::info!("serving MCP on stdio");
    serve(stdin.lock(), &mut stdout, &mut state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::error::TransportError;
    use crate::powerbi::SemanticApi;
    use crate::warehouse::{SqlTarget, TabularResult, WarehouseApi};
    use crate::xmla::ExecutionResult;
    use std::collections::HashMap;
    use std::io::Cursor;

    struct Offline;

    impl SemanticApi for Offline {
        fn list_workspaces(&self) -> Result<Vec<Value>, TransportError> {
            Err(TransportError::Auth("semantic-query"))
        }
        fn list_datasets(&self, _ws: &str) -> Result<Vec<Value>, TransportError> {
            Err(TransportError::Auth("semantic-query"))
        }
        fn dataset_info(&self, _ws: &str, _ds: &str) -> Result<Value, TransportError> {
            Err(TransportError::Auth("semantic-query"))
        }
        fn trigger_refresh(&self, _ws: &str, _ds: &str) -> Result<(), TransportError> {
            Err(TransportError::Auth("semantic-query"))
        }
        fn execute_queries(&self, _ws: &str, _ds: &str, _dax: &str) -> Result<Vec<Value>, TransportError> {
            Err(TransportError::Auth("semantic-query"))
        }
        fn can_execute_commands(&self) -> bool {
            false
        }
        fn execute_command(&self, _ws: &str, _c: &str, _t: &Value) -> Result<ExecutionResult, TransportError> {
            Err(TransportError::Auth("semantic-query"))
        }
        fn xmla_query(&self, _ws: &str, _c: &str, _s: &str, _n: usize) -> Result<Vec<Value>, TransportError> {
            Err(TransportError::Auth("semantic-query"))
        }
    }

    impl WarehouseApi for Offline {
        fn query(&mut self, _t: &SqlTarget, _sql: &str, _p: &[&str], _n: usize) -> Result<TabularResult, TransportError> {
            Err(TransportError::Timeout)
        }
    }

    fn state() -> ServerState {
        ServerState::new(Dispatcher::new(
            Session::new(Limits::default()),
            None,
            Box::new(Offline),
            Box::new(Offline),
        ))
    }

    fn run(lines: &[&str]) -> HashMap<i64, Value> {
        let input = lines.join("\n");
        let mut out = Vec::new();
        serve(Cursor::new(input), &mut out, &mut state()).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap())
            .map(|v| (v["id"].as_i64().unwrap(), v))
            .collect()
    }

    #[test]
    fn malformed_line_is_skipped_and_next_request_answered() {
        let replies = run(&[
            "{not json",
            "",
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        ]);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[&1]["result"], json!({}));
    }

    #[test]
    fn initialize_echoes_protocol_version() {
        let replies = run(&[
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26"}}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"initialize"}"#,
        ]);
        assert_eq!(replies[&1]["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(replies[&2]["result"]["protocolVersion"], DEFAULT_PROTOCOL_VERSION);
        assert_eq!(replies[&1]["result"]["serverInfo"]["name"], "fabric-gateway");
    }

    #[test]
    fn notifications_and_unknown_methods() {
        let replies = run(&[
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            r#"{"jsonrpc":"2.0","method":"no/such"}"#,
            r#"{"jsonrpc":"2.0","id":7,"method":"no/such"}"#,
        ]);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[&7]["error"]["code"], -32601);
        assert_eq!(replies[&7]["error"]["message"], "Method not found: no/such");
    }

    #[test]
    fn tools_list_follows_mode_changes() {
        let replies = run(&[
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"connect_warehouse","arguments":{"sql_endpoint":"x.datawarehouse.fabric.microsoft.com"}}}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#,
        ]);
        let names = |id: i64| -> Vec<String> {
            replies[&id]["result"]["tools"]
                .as_array()
                .unwrap()
                .iter()
                .map(|t| t["name"].as_str().unwrap().to_string())
                .collect()
        };
        assert!(!names(1).contains(&"execute_sql".to_string()));
        assert!(names(3).contains(&"execute_sql".to_string()));
        assert_eq!(replies[&2]["result"]["isError"], false);
    }

    #[test]
    fn tool_failures_are_flagged_in_result() {
        let replies = run(&[
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"execute_dax","arguments":{"query":"EVALUATE T"}}}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"connect_warehouse","arguments":{"sql_endpoint":"e"}}}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"execute_sql","arguments":{"query":"SELECT 1"}}}"#,
        ]);
        let text = |id: i64| -> Value {
            serde_json::from_str(replies[&id]["result"]["content"][0]["text"].as_str().unwrap()).unwrap()
        };
        assert_eq!(replies[&1]["result"]["isError"], true);
        assert_eq!(text(1)["error"], "Unknown tool: execute_dax");
        assert_eq!(replies[&3]["result"]["isError"], true);
        assert_eq!(text(3), json!({ "error": "timeout" }));
    }
}
