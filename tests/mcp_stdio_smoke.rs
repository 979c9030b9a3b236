use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};

fn gateway(home: &Path) -> Command {
    // `cargo test` sets this for integration tests.
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_fabric-gateway"));
    cmd.current_dir(home)
        .env("FABRIC_GATEWAY_HOME", home)
        .env_remove("FABRIC_GATEWAY_CONFIG")
        .env_remove("FABRIC_GATEWAY_SEMANTIC_TOKEN")
        .env_remove("FABRIC_GATEWAY_SQL_TOKEN");
    cmd
}

fn call(id: i64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    })
}

fn tool_text(reply: &Value) -> Value {
    let text = reply["result"]["content"][0]["text"]
        .as_str()
        .expect("tools/call text");
    serde_json::from_str(text).expect("tool text is json")
}

fn tool_names(reply: &Value) -> Vec<String> {
    reply["result"]["tools"]
        .as_array()
        .expect("tools array")
        .iter()
        .filter_map(|t| t["name"].as_str().map(str::to_string))
        .collect()
}

#[test]
fn mcp_stdio_smoke() {
    let home = tempfile::tempdir().expect("tempdir");

    let mut child = gateway(home.path())
        .arg("mcp")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn fabric-gateway mcp");

    let messages = vec![
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": { "protocolVersion": "2024-11-05" } }),
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        json!({ "jsonrpc": "2.0", "id": 3, "method": "resources/list" }),
        call(4, "execute_dax", json!({ "query": "EVALUATE Sales" })),
        call(5, "get_context", json!({})),
        call(6, "connect_warehouse", json!({ "sql_endpoint": "abc.datawarehouse.fabric.microsoft.com", "database": "WH" })),
        call(7, "execute_sql", json!({ "query": "SELECT * FROM t; DROP TABLE t;" })),
        json!({ "jsonrpc": "2.0", "id": 8, "method": "tools/list" }),
        call(9, "sample_table", json!({ "table": "nodot" })),
    ];

    {
        let stdin = child.stdin.as_mut().expect("child stdin");
        writeln!(stdin, "this is not json").unwrap();
        for msg in &messages {
            // Keep each JSON-RPC message on one line (server reads by lines()).
            writeln!(stdin, "{}", msg).unwrap();
        }
    }

    // Close stdin so the server loop can exit.
    drop(child.stdin.take());

    let stdout = child.stdout.take().expect("child stdout");
    let mut replies: HashMap<i64, Value> = HashMap::new();
    for line in BufReader::new(stdout).lines() {
        let line = line.expect("read stdout line");
        if line.trim().is_empty() {
            continue;
        }
        let v: Value = serde_json::from_str(&line).expect("stdout is json");
        let id = v["id"].as_i64().expect("json-rpc response id");
        replies.insert(id, v);
    }

    let status = child.wait().expect("wait child");
    assert!(status.success(), "mcp process should exit cleanly");
    assert_eq!(replies.len(), 9, "one reply per request, none for notifications");

    // initialize
    let init = &replies[&1]["result"];
    assert_eq!(init["protocolVersion"], "2024-11-05");
    assert_eq!(init["serverInfo"]["name"], "fabric-gateway");
    assert!(init["capabilities"]["tools"].is_object());

    // tools/list with no connection
    let names = tool_names(&replies[&2]);
    for required in ["get_context", "connect_dataset", "connect_warehouse", "list_workspaces"] {
        assert!(names.iter().any(|n| n == required), "missing tool: {required}");
    }
    assert!(!names.iter().any(|n| n == "execute_sql" || n == "execute_dax"));

    // unsupported method
    assert_eq!(replies[&3]["error"]["code"], -32601);

    // semantic tool while disconnected
    assert_eq!(replies[&4]["result"]["isError"], true);
    assert_eq!(tool_text(&replies[&4])["error"], "Unknown tool: execute_dax");

    assert_eq!(tool_text(&replies[&5])["mode"], "none");

    assert_eq!(replies[&6]["result"]["isError"], false);
    assert_eq!(tool_text(&replies[&6])["context"]["mode"], "data_warehouse");

    // denylisted SQL is refused before any connection is attempted
    assert_eq!(replies[&7]["result"]["isError"], true);
    assert_eq!(
        tool_text(&replies[&7])["error"],
        "Query contains forbidden keyword: DROP"
    );

    // catalog follows the mode switch
    let names = tool_names(&replies[&8]);
    assert!(names.iter().any(|n| n == "execute_sql"));
    assert!(!names.iter().any(|n| n == "execute_dax"));

    assert_eq!(
        tool_text(&replies[&9])["error"],
        "Table must be in format schema.table"
    );

    // The warehouse connection was persisted for the next start.
    let saved: Value = serde_json::from_str(
        &std::fs::read_to_string(home.path().join("context.json")).expect("context.json"),
    )
    .expect("context.json is json");
    assert_eq!(saved["mode"], "warehouse");
    assert_eq!(saved["sql_endpoint"], "abc.datawarehouse.fabric.microsoft.com");
}

#[test]
fn context_command_reads_persisted_state() {
    let home = tempfile::tempdir().expect("tempdir");

    let status = gateway(home.path())
        .args(["connect-warehouse", "--sql-endpoint", "xyz.datawarehouse.fabric.microsoft.com"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("run connect-warehouse");
    assert!(status.success());

    let output = gateway(home.path())
        .arg("context")
        .stderr(Stdio::null())
        .output()
        .expect("run context");
    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).expect("context prints json");
    assert_eq!(summary["mode"], "data_warehouse");
    assert_eq!(summary["warehouse"]["endpoint"], "xyz.datawarehouse.fabric.microsoft.com");

    let status = gateway(home.path())
        .arg("clear")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("run clear");
    assert!(status.success());

    let output = gateway(home.path()).arg("context").output().expect("run context");
    let summary: Value = serde_json::from_slice(&output.stdout).expect("context prints json");
    assert_eq!(summary["mode"], "none");
}
