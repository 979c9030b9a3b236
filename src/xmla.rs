//! XMLA over HTTPS: statements and TMSL commands wrapped in SOAP `Execute`.
//!
//! The engine's response schema is not something we can rely on, so parsing is
//! deliberately forgiving: rows are any `<row>` elements found anywhere, and
//! write outcomes go through a [`ResponseClassifier`] that only scans text.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::credentials::{CredentialProvider, TokenScope};
use crate::error::TransportError;
use crate::xml_builder::{build_execute_envelope, Statement};

const SOAP_ACTION: &str = "urn:schemas-microsoft-com:xml-analysis:Execute";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    /// Generated, not sent: the caller asked for a dry run.
    Preview,
    /// Generated, not sent: no execution transport is available.
    TmslGenerated,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl ExecutionResult {
    pub fn new(status: ExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
            raw: None,
        }
    }
}

/// Turns an unstructured response body into an outcome.
pub trait ResponseClassifier {
    fn classify(&self, body: &str) -> ExecutionResult;
}

/// Substring scan over the body: success markers first, then error markers.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerClassifier;

impl ResponseClassifier for MarkerClassifier {
    fn classify(&self, body: &str) -> ExecutionResult {
        let lower = body.to_ascii_lowercase();
        if lower.contains("success") || lower.contains("xml-analysis:empty") {
            ExecutionResult::new(ExecutionStatus::Success, "TMSL command executed successfully")
        } else if lower.contains("error") {
            let mut out = ExecutionResult::new(ExecutionStatus::Error, "TMSL command failed");
            out.details = Some(body.to_string());
            out
        } else {
            let mut out = ExecutionResult::new(ExecutionStatus::Unknown, "Unrecognized XMLA response");
            out.raw = Some(body.to_string());
            out
        }
    }
}

/// `powerbi://api.powerbi.com/v1.0/myorg/WS` → `https://api.powerbi.com/v1.0/myorg/WS/xmla`.
pub fn normalize_endpoint(endpoint: &str) -> String {
    match endpoint.strip_prefix("powerbi://") {
        Some(rest) => {
            let https = format!("https://{}", rest.trim_end_matches('/'));
            if https.ends_with("/xmla") {
                https
            } else {
                format!("{https}/xmla")
            }
        }
        None => endpoint.to_string(),
    }
}

pub fn workspace_endpoint(workspace_name: &str) -> String {
    format!("powerbi://api.powerbi.com/v1.0/myorg/{workspace_name}")
}

/// Decode XML-name escapes such as `_x005B_` used for rowset column names.
fn decode_xml_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find("_x") {
        out.push_str(&rest[..pos]);
        let candidate = &rest[pos..];
        let decoded = candidate
            .get(2..6)
            .filter(|_| candidate.as_bytes().get(6) == Some(&b'_'))
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32);
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &candidate[7..];
            }
            None => {
                out.push_str("_x");
                rest = &candidate[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Collect `<row>` records (at most `max_rows`). Also surfaces SOAP faults and
/// XMLA `<Error Description=...>` elements as protocol errors.
pub fn parse_rows(body: &str, max_rows: usize) -> Result<Vec<Map<String, Value>>, TransportError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut rows = Vec::new();
    let mut current: Option<Map<String, Value>> = None;
    let mut column: Option<String> = None;
    let mut in_fault = false;
    let mut fault: Option<String> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| TransportError::Protocol(format!("malformed XMLA response: {e}")))?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "row" {
                    current = Some(Map::new());
                } else if current.is_some() {
                    column = Some(decode_xml_name(&name));
                } else if name == "faultstring" {
                    in_fault = true;
                } else if name == "Error" {
                    fault = fault.or_else(|| error_description(&e));
                }
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if let Some(row) = current.as_mut() {
                    row.insert(decode_xml_name(&name), Value::Null);
                } else if name == "Error" {
                    fault = fault.or_else(|| error_description(&e));
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                if let (Some(row), Some(col)) = (current.as_mut(), column.as_ref()) {
                    row.insert(col.clone(), Value::String(text));
                } else if in_fault {
                    fault = Some(text);
                }
            }
            Event::CData(c) => {
                if let (Some(row), Some(col)) = (current.as_mut(), column.as_ref()) {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    row.insert(col.clone(), Value::String(text));
                }
            }
            Event::End(e) => {
                let name = e.local_name();
                if name.as_ref() == b"row" {
                    if let Some(row) = current.take() {
                        rows.push(row);
                        if rows.len() >= max_rows {
                            break;
                        }
                    }
                } else if name.as_ref() == b"faultstring" {
                    in_fault = false;
                } else if current.is_some() {
                    if let (Some(row), Some(col)) = (current.as_mut(), column.take()) {
                        row.entry(col).or_insert(Value::Null);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if rows.is_empty() {
        if let Some(msg) = fault {
            return Err(TransportError::Protocol(msg));
        }
    }
    Ok(rows)
}

fn error_description(e: &quick_xml::events::BytesStart<'_>) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        (a.key.local_name().as_ref() == b"Description")
            .then(|| String::from_utf8_lossy(&a.value).into_owned())
    })
}

pub struct XmlaClient<'a> {
    agent: &'a ureq::Agent,
    credentials: &'a dyn CredentialProvider,
    endpoint: String,
    catalog: String,
    classifier: Box<dyn ResponseClassifier + 'a>,
}

impl<'a> XmlaClient<'a> {
    pub fn new(
        agent: &'a ureq::Agent,
        credentials: &'a dyn CredentialProvider,
        endpoint: &str,
        catalog: &str,
    ) -> Self {
        Self {
            agent,
            credentials,
            endpoint: normalize_endpoint(endpoint),
            catalog: catalog.to_string(),
            classifier: Box::new(MarkerClassifier),
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn ResponseClassifier + 'a>) -> Self {
        self.classifier = classifier;
        self
    }

    fn post(&self, statement: Statement<'_>) -> Result<String, TransportError> {
        let token = self
            .credentials
            .token(TokenScope::SemanticQuery)
            .ok_or(TransportError::Auth(TokenScope::SemanticQuery.as_str()))?;
        let envelope = build_execute_envelope(statement, &self.catalog)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        tracing::debug!(endpoint = %self.endpoint, catalog = %self.catalog, "xmla execute");
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {token}"))
            .set("Content-Type", "text/xml; charset=utf-8")
            .set("SOAPAction", SOAP_ACTION)
            .send_string(&envelope)?;
        Ok(response.into_string()?)
    }

    /// Run a DAX or DMV statement and return up to `max_rows` records.
    pub fn query(&self, statement: &str, max_rows: usize) -> Result<Vec<Map<String, Value>>, TransportError> {
        let body = self.post(Statement::Query(statement))?;
        parse_rows(&body, max_rows)
    }

    /// Send a TMSL document and classify the response body.
    pub fn execute_command(&self, tmsl: &Value) -> Result<ExecutionResult, TransportError> {
        let json = serde_json::to_string(tmsl).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let body = self.post(Statement::Command(&json))?;
        Ok(self.classifier.classify(&body))
    }
}
