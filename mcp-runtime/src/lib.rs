//! MCP runtime and tool surface for Folio.
//!
//! Serves the staged mutation tools (duplicate, bulk apply, chain export,
//! rate, bootstrap) plus a thin read surface over stdio using JSON-RPC 2.0
//! with `Content-Length` framing. Every staged tool takes a `stage`
//! parameter; `prepare` returns a single-use session token, the other
//! stages consume or inspect it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use folio_core::content::{ContentId, ContentKind, ContentRecord};
use folio_core::error::ErrorBody;
use folio_engine::access::AccessOracle;
use folio_engine::batch::BatchOptions;
use folio_engine::duplicate::DuplicateOptions;
use folio_engine::error::EngineError;
use folio_engine::limits::RuntimeLimits;
use folio_engine::session::{BulkAction, MemorySessionStore, OperationKind};
use folio_engine::stage::{CommitOutcome, PreparedStage, StageOrchestrator};
use folio_engine::store::{ContentStore, ListFilter};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "folio-mcp";
/// Serialized tool envelopes above this size get their export document
/// dropped rather than flooding the client.
const TOOL_ENVELOPE_MAX_BYTES: usize = 48_000;
const LIST_DEFAULT_LIMIT: usize = 20;
const LIST_MAX_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// The actor this connection acts as. Sessions prepared here can only
    /// be committed by the same actor.
    pub actor_id: Uuid,
    pub limits: RuntimeLimits,
}

pub struct McpServer {
    config: RuntimeConfig,
    store: Arc<dyn ContentStore>,
    access: Arc<dyn AccessOracle>,
    orchestrator: StageOrchestrator,
    connection_id: String,
    started_at: DateTime<Utc>,
}

/// Run the MCP server over stdio until EOF. Returns a process exit code.
pub async fn run(
    config: RuntimeConfig,
    store: Arc<dyn ContentStore>,
    access: Arc<dyn AccessOracle>,
) -> i32 {
    let server = McpServer::new(config, store, access);
    match server.serve_stdio().await {
        Ok(()) => 0,
        Err(message) => {
            tracing::error!("MCP server terminated: {message}");
            eprintln!("folio-mcp: {message}");
            1
        }
    }
}

impl McpServer {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn ContentStore>,
        access: Arc<dyn AccessOracle>,
    ) -> Self {
        let sessions = Arc::new(MemorySessionStore::new());
        let orchestrator =
            StageOrchestrator::new(store.clone(), access.clone(), sessions, config.limits);
        Self {
            config,
            store,
            access,
            orchestrator,
            connection_id: format!("stdio-{}", Uuid::now_v7()),
            started_at: Utc::now(),
        }
    }

    async fn serve_stdio(&self) -> Result<(), String> {
        tracing::info!(
            connection_id = %self.connection_id,
            actor_id = %self.config.actor_id,
            "serving MCP over stdio"
        );
        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        match incoming {
            Value::Array(batch) => {
                let mut responses = Vec::new();
                for message in batch {
                    if let Some(response) = self.handle_single_message(message).await {
                        responses.push(response);
                    }
                }
                responses
            }
            single => self
                .handle_single_message(single)
                .await
                .into_iter()
                .collect(),
        }
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let id = incoming.get("id").cloned();
        let method = incoming
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = incoming.get("params").cloned().unwrap_or(Value::Null);

        let Some(method) = method else {
            return Some(rpc_error_response(
                id,
                RpcError::invalid_request("Missing 'method'"),
            ));
        };

        // Notifications carry no id and never get a response.
        if id.is_none() {
            self.handle_notification(&method).await;
            return None;
        }

        match self.handle_request(&method, params).await {
            Ok(result) => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result
            })),
            Err(error) => Some(rpc_error_response(id, error)),
        }
    }

    async fn handle_notification(&self, method: &str) {
        tracing::debug!(method = %method, "notification ignored");
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": format!(
                "Folio staged mutation surface. Mutating tools are two-phase: call with \
                 stage=prepare to receive a preview and a single-use session_id (valid for {}s), \
                 then repeat the call with stage=commit and that session_id to execute. \
                 folio_bootstrap additionally supports stage=collect (override one auto-selected \
                 slot) and stage=validate (readiness check). Sessions cannot be reused, shared \
                 across connections, or committed after expiry.",
                self.config.limits.session_ttl_secs
            ),
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = tool_definitions()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        match self.execute_tool(name, &args).await {
            Ok(envelope) => {
                let envelope = enforce_tool_payload_limit(envelope);
                Ok(build_tool_call_response(envelope, false))
            }
            Err(error) => {
                tracing::debug!(tool = %name, code = %error.code, "tool call failed");
                Ok(build_tool_call_response(
                    json!({ "status": "error", "tool": name, "error": error.to_value() }),
                    true,
                ))
            }
        }
    }

    async fn execute_tool(&self, name: &str, args: &Map<String, Value>) -> Result<Value, ToolError> {
        match name {
            "folio_status" => self.tool_status(args),
            "folio_get" => self.tool_get(args),
            "folio_list" => self.tool_list(args),
            "folio_duplicate" => self.tool_duplicate(args),
            "folio_bulk_apply" => self.tool_bulk_apply(args).await,
            "folio_chain_export" => self.tool_chain_export(args),
            "folio_rate" => self.tool_rate(args),
            "folio_bootstrap" => self.tool_bootstrap(args),
            other => Err(ToolError::new(
                "validation_failed",
                format!("Unknown tool: {other}"),
            )),
        }
    }

    // ---- read surface ---------------------------------------------------

    fn tool_status(&self, _args: &Map<String, Value>) -> Result<Value, ToolError> {
        let limits = self.orchestrator.limits();
        Ok(json!({
            "status": "ok",
            "server": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "protocol_version": MCP_PROTOCOL_VERSION,
            "connection_id": self.connection_id,
            "actor_id": self.config.actor_id,
            "started_at": self.started_at,
            "limits": {
                "session_ttl_secs": limits.session_ttl_secs,
                "max_chain_depth": limits.max_chain_depth,
                "bulk_ceiling": limits.bulk_ceiling,
                "batch_delay_ms": limits.batch_delay_ms,
            },
        }))
    }

    fn tool_get(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let id = required_uuid(args, "id")?;
        let include_body = arg_bool(args, "include_body", false)?;
        let record = self.visible_record(id)?;

        let mut item = record_view(&record);
        if include_body {
            item["body"] = json!(record.body);
        }
        Ok(json!({ "status": "ok", "record": item }))
    }

    fn tool_list(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let kind = match arg_optional_string(args, "kind")? {
            None => None,
            Some(raw) => Some(ContentKind::parse(&raw).ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    "'kind' must be one of publication, style, fragment, template, space",
                )
                .with_field("kind")
            })?),
        };
        let space_id = arg_optional_uuid(args, "space_id")?;
        let limit = arg_optional_u64(args, "limit")?
            .map(|raw| (raw as usize).min(LIST_MAX_LIMIT))
            .unwrap_or(LIST_DEFAULT_LIMIT);

        let records = self.store.list(&ListFilter {
            kind,
            space_id,
            limit: None,
        });
        let items: Vec<Value> = records
            .into_iter()
            .filter(|record| self.access.can_see(self.config.actor_id, record))
            .take(limit)
            .map(|record| record_view(&record))
            .collect();
        Ok(json!({ "status": "ok", "count": items.len(), "records": items }))
    }

    fn visible_record(&self, id: ContentId) -> Result<ContentRecord, ToolError> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| ToolError::from(EngineError::AccessDenied))?;
        if !self.access.can_see(self.config.actor_id, &record) {
            return Err(ToolError::from(EngineError::AccessDenied));
        }
        Ok(record)
    }

    // ---- staged tools -----------------------------------------------------

    fn tool_duplicate(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let actor = self.config.actor_id;
        let source_id = required_uuid(args, "source_id")?;
        match parse_stage(args, &["prepare", "commit"])?.as_str() {
            "prepare" => {
                let options: DuplicateOptions = parse_options(args)?;
                let prepared = self
                    .orchestrator
                    .prepare_duplicate(actor, source_id, options)?;
                Ok(prepared_envelope(OperationKind::Duplicate, prepared))
            }
            _ => {
                let session_id = required_string(args, "session_id")?;
                let outcome = self
                    .orchestrator
                    .commit_duplicate(actor, &session_id, source_id)?;
                Ok(committed_envelope(OperationKind::Duplicate, outcome))
            }
        }
    }

    async fn tool_bulk_apply(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let actor = self.config.actor_id;
        match parse_stage(args, &["prepare", "commit"])?.as_str() {
            "prepare" => {
                let target_ids = required_uuid_array(args, "target_ids")?;
                let action_value = args.get("action").cloned().ok_or_else(|| {
                    ToolError::new("validation_failed", "Missing required field 'action'")
                        .with_field("action")
                })?;
                let action: BulkAction = serde_json::from_value(action_value).map_err(|e| {
                    ToolError::new("validation_failed", format!("Invalid 'action': {e}"))
                        .with_field("action")
                })?;
                let mut options: BatchOptions = parse_options(args)?;
                // Pacing falls back to the configured default when the
                // caller does not set one.
                let delay_given = args
                    .get("options")
                    .and_then(Value::as_object)
                    .is_some_and(|map| map.contains_key("inter_item_delay_ms"));
                if !delay_given {
                    options.inter_item_delay_ms = self.orchestrator.limits().batch_delay_ms;
                }
                let prepared = self
                    .orchestrator
                    .prepare_bulk(actor, target_ids, action, options)?;
                Ok(prepared_envelope(OperationKind::BulkApply, prepared))
            }
            _ => {
                let session_id = required_string(args, "session_id")?;
                let outcome = self.orchestrator.commit_bulk(actor, &session_id).await?;
                Ok(committed_envelope(OperationKind::BulkApply, outcome))
            }
        }
    }

    fn tool_chain_export(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let actor = self.config.actor_id;
        let root_id = required_uuid(args, "root_id")?;
        match parse_stage(args, &["prepare", "commit"])?.as_str() {
            "prepare" => {
                let max_depth = arg_optional_u64(args, "max_depth")?.map(|raw| raw as u32);
                let include_content = arg_bool(args, "include_content", false)?;
                let format = arg_string(args, "format", "tree")?;
                let flat = match format.as_str() {
                    "tree" => false,
                    "flat" => true,
                    _ => {
                        return Err(ToolError::new(
                            "validation_failed",
                            "'format' must be 'tree' or 'flat'",
                        )
                        .with_field("format"));
                    }
                };
                let prepared = self.orchestrator.prepare_chain_export(
                    actor,
                    root_id,
                    max_depth,
                    include_content,
                    flat,
                )?;
                Ok(prepared_envelope(OperationKind::ChainExport, prepared))
            }
            _ => {
                let session_id = required_string(args, "session_id")?;
                let outcome = self
                    .orchestrator
                    .commit_chain_export(actor, &session_id, root_id)?;
                Ok(committed_envelope(OperationKind::ChainExport, outcome))
            }
        }
    }

    fn tool_rate(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let actor = self.config.actor_id;
        let target_id = required_uuid(args, "target_id")?;
        match parse_stage(args, &["prepare", "commit"])?.as_str() {
            "prepare" => {
                let score = args
                    .get("score")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        ToolError::new(
                            "validation_failed",
                            "'score' must be an integer between 1 and 5",
                        )
                        .with_field("score")
                    })?;
                let score = u8::try_from(score).map_err(|_| {
                    ToolError::new(
                        "validation_failed",
                        "'score' must be an integer between 1 and 5",
                    )
                    .with_field("score")
                })?;
                let comment = arg_optional_string(args, "comment")?;
                let prepared = self
                    .orchestrator
                    .prepare_rating(actor, target_id, score, comment)?;
                Ok(prepared_envelope(OperationKind::Rating, prepared))
            }
            _ => {
                let session_id = required_string(args, "session_id")?;
                let outcome = self
                    .orchestrator
                    .commit_rating(actor, &session_id, target_id)?;
                Ok(committed_envelope(OperationKind::Rating, outcome))
            }
        }
    }

    fn tool_bootstrap(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let actor = self.config.actor_id;
        match parse_stage(args, &["prepare", "collect", "validate", "commit"])?.as_str() {
            "prepare" => {
                let space_id = required_uuid(args, "space_id")?;
                let title = required_string(args, "title")?;
                let prepared = self.orchestrator.prepare_bootstrap(actor, space_id, &title)?;
                Ok(prepared_envelope(OperationKind::Bootstrap, prepared))
            }
            "collect" => {
                let session_id = required_string(args, "session_id")?;
                let slot = required_string(args, "slot")?;
                let item_id = required_uuid(args, "item_id")?;
                let renewed =
                    self.orchestrator
                        .collect_bootstrap(actor, &session_id, &slot, item_id)?;
                Ok(json!({
                    "status": "collected",
                    "operation": OperationKind::Bootstrap.as_str(),
                    "session_id": renewed.session_id,
                    "expires_in_seconds": renewed.expires_in_seconds,
                    "preview": renewed.preview,
                }))
            }
            "validate" => {
                let session_id = required_string(args, "session_id")?;
                let readiness = self.orchestrator.validate_bootstrap(actor, &session_id)?;
                Ok(json!({
                    "status": "validated",
                    "operation": OperationKind::Bootstrap.as_str(),
                    "session_id": session_id,
                    "readiness": readiness,
                }))
            }
            _ => {
                let session_id = required_string(args, "session_id")?;
                let outcome = self.orchestrator.commit_bootstrap(actor, &session_id)?;
                Ok(committed_envelope(OperationKind::Bootstrap, outcome))
            }
        }
    }
}

fn record_view(record: &ContentRecord) -> Value {
    json!({
        "id": record.id,
        "kind": record.kind.as_str(),
        "title": record.title,
        "workflow_step": record.workflow_step.as_str(),
        "space_id": record.space_id,
        "excerpt": record.excerpt(),
        "links": record.links,
        "terms": record.terms,
        "meta": record.meta,
        "created_at": record.created_at,
        "updated_at": record.updated_at,
    })
}

fn prepared_envelope(kind: OperationKind, prepared: PreparedStage) -> Value {
    json!({
        "status": "prepared",
        "operation": kind.as_str(),
        "session_id": prepared.session_id,
        "expires_in_seconds": prepared.expires_in_seconds,
        "preview": prepared.preview,
    })
}

fn committed_envelope(kind: OperationKind, outcome: CommitOutcome) -> Value {
    let mut envelope = json!({
        "status": "committed",
        "operation": kind.as_str(),
        "success": outcome.success,
        "summary": outcome.summary,
    });
    if let Some(batch) = outcome.batch {
        if !batch.failed.is_empty() {
            envelope["failed_ids"] = json!(batch.failed_ids());
        }
        envelope["results"] = json!({
            "success": batch.success,
            "failed": batch.failed,
            "skipped": batch.skipped,
        });
    }
    envelope
}

/// Drop oversized export documents instead of flooding the client.
fn enforce_tool_payload_limit(mut envelope: Value) -> Value {
    let serialized_len = serde_json::to_vec(&envelope).map(|v| v.len()).unwrap_or(0);
    if serialized_len <= TOOL_ENVELOPE_MAX_BYTES {
        return envelope;
    }
    if let Some(summary) = envelope
        .get_mut("summary")
        .and_then(Value::as_object_mut)
    {
        if summary.contains_key("document") {
            summary.insert("document".to_string(), Value::Null);
            summary.insert("document_truncated".to_string(), json!(true));
            summary.insert("document_bytes".to_string(), json!(serialized_len));
            return envelope;
        }
    }
    envelope
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": to_pretty_json(&envelope)
        }],
        "isError": is_error
    })
}

fn rpc_error_response(id: Option<Value>, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "error": {
            "code": error.code,
            "message": error.message,
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

// ---- tool argument helpers -------------------------------------------------

fn parse_stage(args: &Map<String, Value>, allowed: &[&str]) -> Result<String, ToolError> {
    let stage = arg_string(args, "stage", "prepare")?;
    if allowed.contains(&stage.as_str()) {
        Ok(stage)
    } else {
        Err(ToolError::new(
            "validation_failed",
            format!("'stage' must be one of: {}", allowed.join(", ")),
        )
        .with_field("stage"))
    }
}

/// Deserialize the optional `options` object into a typed options struct.
fn parse_options<T: serde::de::DeserializeOwned + Default>(
    args: &Map<String, Value>,
) -> Result<T, ToolError> {
    match args.get("options") {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value @ Value::Object(_)) => serde_json::from_value(value.clone()).map_err(|e| {
            ToolError::new("validation_failed", format!("Invalid 'options': {e}"))
                .with_field("options")
        }),
        Some(_) => Err(
            ToolError::new("validation_failed", "'options' must be an object")
                .with_field("options"),
        ),
    }
}

fn arg_bool(args: &Map<String, Value>, key: &str, default: bool) -> Result<bool, ToolError> {
    match args.get(key) {
        None => Ok(default),
        Some(Value::Bool(v)) => Ok(*v),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a boolean"))
                .with_field(key),
        ),
    }
}

fn arg_string(args: &Map<String, Value>, key: &str, default: &str) -> Result<String, ToolError> {
    match args.get(key) {
        None => Ok(default.to_string()),
        Some(Value::String(v)) => Ok(v.clone()),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.clone()),
        Value::String(_) => Err(ToolError::new(
            "validation_failed",
            format!("'{key}' must not be empty"),
        )
        .with_field(key)),
        _ => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(
            ToolError::new("validation_failed", format!("'{key}' must be a string"))
                .with_field(key),
        ),
    }
}

fn arg_optional_u64(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| {
                ToolError::new(
                    "validation_failed",
                    format!("'{key}' must be an unsigned integer"),
                )
                .with_field(key)
            })
            .map(Some),
        Some(_) => Err(ToolError::new(
            "validation_failed",
            format!("'{key}' must be an unsigned integer"),
        )
        .with_field(key)),
    }
}

fn required_uuid(args: &Map<String, Value>, key: &str) -> Result<Uuid, ToolError> {
    let raw = required_string(args, key)?;
    Uuid::parse_str(raw.trim()).map_err(|_| {
        ToolError::new("validation_failed", format!("'{key}' must be a UUID")).with_field(key)
    })
}

fn arg_optional_uuid(args: &Map<String, Value>, key: &str) -> Result<Option<Uuid>, ToolError> {
    match arg_optional_string(args, key)? {
        None => Ok(None),
        Some(raw) => Uuid::parse_str(raw.trim()).map(Some).map_err(|_| {
            ToolError::new("validation_failed", format!("'{key}' must be a UUID")).with_field(key)
        }),
    }
}

fn required_uuid_array(args: &Map<String, Value>, key: &str) -> Result<Vec<Uuid>, ToolError> {
    let value = args.get(key).ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("Missing required field '{key}'"),
        )
        .with_field(key)
    })?;
    let items = value.as_array().ok_or_else(|| {
        ToolError::new(
            "validation_failed",
            format!("'{key}' must be an array of UUIDs"),
        )
        .with_field(key)
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let text = item.as_str().ok_or_else(|| {
            ToolError::new(
                "validation_failed",
                format!("'{key}' must be an array of UUIDs"),
            )
            .with_field(key)
        })?;
        let id = Uuid::parse_str(text.trim()).map_err(|_| {
            ToolError::new(
                "validation_failed",
                format!("'{key}' contains an invalid UUID: {text}"),
            )
            .with_field(key)
        })?;
        out.push(id);
    }
    Ok(out)
}

// ---- errors -----------------------------------------------------------------

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
    docs_hint: Option<String>,
    details: Option<Value>,
}

impl ToolError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn to_value(&self) -> Value {
        let body = ErrorBody {
            error: self.code.clone(),
            message: self.message.clone(),
            field: self.field.clone(),
            docs_hint: self.docs_hint.clone(),
            details: self.details.clone(),
        };
        serde_json::to_value(&body)
            .unwrap_or_else(|_| json!({ "error": self.code, "message": self.message }))
    }
}

impl From<EngineError> for ToolError {
    fn from(err: EngineError) -> Self {
        let base = ToolError::new(err.code(), err.to_string());
        let base = match err.field() {
            Some(field) => base.with_field(field.to_string()),
            None => base,
        };
        match err {
            EngineError::SessionExpired => base.with_docs_hint(
                "Sessions are single-use and expire after a few minutes. \
                 Run the tool with stage=prepare again to get a fresh session_id.",
            ),
            EngineError::SessionMismatch { .. } => base.with_docs_hint(
                "Pass the same target ids at commit that the session was prepared with. \
                 The session has been consumed; prepare again.",
            ),
            EngineError::BulkLimitExceeded { requested, ceiling } => base.with_details(json!({
                "requested": requested,
                "ceiling": ceiling,
            })),
            _ => base,
        }
    }
}

// ---- tool definitions ---------------------------------------------------------

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "folio_status",
            description: "Show server status, connection identity, and active runtime limits.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "folio_get",
            description: "Fetch one record: summary, links, terms, and metadata. Optionally the full body.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "Record UUID" },
                    "include_body": { "type": "boolean", "default": false }
                },
                "required": ["id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "folio_list",
            description: "List visible records, most recently updated first.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string", "enum": ["publication", "style", "fragment", "template", "space"] },
                    "space_id": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 100, "default": 20 }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "folio_duplicate",
            description: "Duplicate a record. Two-phase: stage=prepare previews the copy and returns a session_id; stage=commit executes it.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "stage": { "type": "string", "enum": ["prepare", "commit"], "default": "prepare" },
                    "source_id": { "type": "string", "description": "Record to copy" },
                    "session_id": { "type": "string", "description": "Required for stage=commit" },
                    "options": {
                        "type": "object",
                        "properties": {
                            "include_dependencies": { "type": "boolean", "default": false, "description": "Copy direct dependencies (one level) and relink to the copies. Ignored while preserve_links is true." },
                            "preserve_links": { "type": "boolean", "default": true, "description": "Keep links pointing at the original dependency ids." },
                            "copy_meta": { "type": "boolean", "default": true },
                            "reset_step": { "type": "boolean", "default": true, "description": "Force the copy back to draft." }
                        },
                        "additionalProperties": false
                    }
                },
                "required": ["source_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "folio_bulk_apply",
            description: "Apply one action to many records with partial-failure semantics. stage=prepare validates and stages the plan; stage=commit executes it in strict order.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "stage": { "type": "string", "enum": ["prepare", "commit"], "default": "prepare" },
                    "target_ids": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                    "action": {
                        "type": "object",
                        "description": "Tagged action, e.g. {\"action\":\"set_workflow_step\",\"step\":\"review\"} or {\"action\":\"attach_term\",\"term\":\"howto\"}",
                        "properties": {
                            "action": { "type": "string", "enum": ["set_workflow_step", "attach_term", "detach_term", "set_meta"] },
                            "step": { "type": "string", "enum": ["draft", "review", "published", "archived"] },
                            "term": { "type": "string" },
                            "key": { "type": "string" },
                            "value": {}
                        },
                        "required": ["action"]
                    },
                    "session_id": { "type": "string", "description": "Required for stage=commit" },
                    "options": {
                        "type": "object",
                        "properties": {
                            "stop_on_error": { "type": "boolean", "default": false, "description": "Skip everything after the first failure." },
                            "dry_run": { "type": "boolean", "default": false, "description": "Report simulated successes without touching anything." },
                            "inter_item_delay_ms": { "type": "integer", "minimum": 0 }
                        },
                        "additionalProperties": false
                    }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "folio_chain_export",
            description: "Export the dependency chain under a record: bounded depth, cycle-safe, permission-filtered. stage=prepare previews counts; stage=commit returns the document.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "stage": { "type": "string", "enum": ["prepare", "commit"], "default": "prepare" },
                    "root_id": { "type": "string" },
                    "max_depth": { "type": "integer", "minimum": 0, "description": "Clamped to the server ceiling." },
                    "include_content": { "type": "boolean", "default": false, "description": "Include full bodies in the export." },
                    "format": { "type": "string", "enum": ["tree", "flat"], "default": "tree" },
                    "session_id": { "type": "string", "description": "Required for stage=commit" }
                },
                "required": ["root_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "folio_rate",
            description: "Rate a record 1-5 with an optional comment. stage=prepare shows the current aggregate; stage=commit records the rating and recomputes it.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "stage": { "type": "string", "enum": ["prepare", "commit"], "default": "prepare" },
                    "target_id": { "type": "string" },
                    "score": { "type": "integer", "minimum": 1, "maximum": 5 },
                    "comment": { "type": "string" },
                    "session_id": { "type": "string", "description": "Required for stage=commit" }
                },
                "required": ["target_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "folio_bootstrap",
            description: "Bootstrap a publication in a space from auto-selected components. Stages: prepare (auto-select), collect (override one slot, renews the session), validate (readiness), commit (create).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "stage": { "type": "string", "enum": ["prepare", "collect", "validate", "commit"], "default": "prepare" },
                    "space_id": { "type": "string", "description": "Required for stage=prepare" },
                    "title": { "type": "string", "description": "Required for stage=prepare" },
                    "session_id": { "type": "string", "description": "Required for collect/validate/commit" },
                    "slot": { "type": "string", "enum": ["style", "template", "landing"], "description": "Required for stage=collect" },
                    "item_id": { "type": "string", "description": "Required for stage=collect" }
                },
                "additionalProperties": false
            }),
        },
    ]
}

// ---- stdio framing -----------------------------------------------------------

async fn read_framed_json(
    reader: &mut BufReader<tokio::io::Stdin>,
) -> Result<Option<Value>, std::io::Error> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json(
    writer: &mut tokio::io::Stdout,
    value: &Value,
) -> Result<(), std::io::Error> {
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use folio_engine::access::OwnerAccess;
    use folio_engine::store::{MemoryContentStore, NewRecord};

    fn test_server() -> (McpServer, Arc<MemoryContentStore>, Uuid) {
        let actor = Uuid::now_v7();
        let store = Arc::new(MemoryContentStore::new());
        let access = Arc::new(OwnerAccess::new(store.clone()));
        let server = McpServer::new(
            RuntimeConfig {
                actor_id: actor,
                limits: RuntimeLimits::default(),
            },
            store.clone(),
            access,
        );
        (server, store, actor)
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("test args are objects")
    }

    #[test]
    fn tool_definitions_are_unique_and_staged() {
        let definitions = tool_definitions();
        let names: HashSet<&str> = definitions.iter().map(|tool| tool.name).collect();
        assert_eq!(names.len(), definitions.len());
        for staged in [
            "folio_duplicate",
            "folio_bulk_apply",
            "folio_chain_export",
            "folio_rate",
            "folio_bootstrap",
        ] {
            let tool = definitions
                .iter()
                .find(|tool| tool.name == staged)
                .unwrap_or_else(|| panic!("missing tool {staged}"));
            let stage = &tool.input_schema["properties"]["stage"];
            assert_eq!(stage["default"], json!("prepare"), "{staged}");
        }
    }

    #[tokio::test]
    async fn initialize_and_tools_list_respond() {
        let (server, _, _) = test_server();
        let response = server
            .handle_single_message(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {}
            }))
            .await
            .expect("requests get responses");
        assert_eq!(response["result"]["protocolVersion"], json!(MCP_PROTOCOL_VERSION));
        assert_eq!(response["result"]["serverInfo"]["name"], json!(MCP_SERVER_NAME));

        let listed = server
            .handle_single_message(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/list"
            }))
            .await
            .unwrap();
        let tools = listed["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), tool_definitions().len());

        let unknown = server
            .handle_single_message(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "no/such"
            }))
            .await
            .unwrap();
        assert_eq!(unknown["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (server, _, _) = test_server();
        let response = server
            .handle_single_message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized"
            }))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn duplicate_prepare_commit_round_trip() {
        let (server, store, actor) = test_server();
        let source = store.insert(NewRecord::draft(
            ContentKind::Publication,
            "Guide",
            actor,
        ));

        let prepared = server
            .execute_tool(
                "folio_duplicate",
                &args(json!({ "source_id": source.to_string() })),
            )
            .await
            .expect("prepare succeeds");
        assert_eq!(prepared["status"], json!("prepared"));
        let session_id = prepared["session_id"].as_str().unwrap().to_string();
        assert!(session_id.starts_with("dup_"));
        assert!(prepared["expires_in_seconds"].as_i64().unwrap() > 0);

        let committed = server
            .execute_tool(
                "folio_duplicate",
                &args(json!({
                    "stage": "commit",
                    "source_id": source.to_string(),
                    "session_id": session_id,
                })),
            )
            .await
            .expect("commit succeeds");
        assert_eq!(committed["status"], json!("committed"));
        assert_eq!(committed["success"], json!(true));

        // Single use: the same session cannot commit twice.
        let replay = server
            .execute_tool(
                "folio_duplicate",
                &args(json!({
                    "stage": "commit",
                    "source_id": source.to_string(),
                    "session_id": committed["summary"]["new_id"], // wrong on purpose
                })),
            )
            .await;
        assert!(replay.is_err());
    }

    #[tokio::test]
    async fn bogus_session_reports_session_expired_envelope() {
        let (server, store, actor) = test_server();
        let source = store.insert(NewRecord::draft(
            ContentKind::Publication,
            "Guide",
            actor,
        ));

        let response = server
            .handle_tools_call(json!({
                "name": "folio_duplicate",
                "arguments": {
                    "stage": "commit",
                    "source_id": source.to_string(),
                    "session_id": "dup_0000",
                }
            }))
            .await
            .expect("tool errors become envelopes, not RPC errors");
        assert_eq!(response["isError"], json!(true));
        let text = response["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("session_expired"));
    }

    #[tokio::test]
    async fn bulk_apply_round_trip_reports_results() {
        let (server, store, actor) = test_server();
        let a = store.insert(NewRecord::draft(ContentKind::Publication, "A", actor));
        let b = store.insert(NewRecord::draft(ContentKind::Publication, "B", actor));

        let prepared = server
            .execute_tool(
                "folio_bulk_apply",
                &args(json!({
                    "target_ids": [a.to_string(), b.to_string()],
                    "action": { "action": "attach_term", "term": "howto" },
                })),
            )
            .await
            .expect("prepare succeeds");
        let session_id = prepared["session_id"].as_str().unwrap();
        assert!(session_id.starts_with("bulk_"));
        assert_eq!(prepared["preview"]["target_count"], json!(2));

        let committed = server
            .execute_tool(
                "folio_bulk_apply",
                &args(json!({ "stage": "commit", "session_id": session_id })),
            )
            .await
            .expect("commit succeeds");
        assert_eq!(committed["success"], json!(true));
        assert_eq!(committed["results"]["success"].as_array().unwrap().len(), 2);
        assert!(committed.get("failed_ids").is_none());
        assert_eq!(store.get(a).unwrap().terms, vec!["howto".to_string()]);
    }

    #[tokio::test]
    async fn chain_export_commit_returns_document() {
        let (server, store, actor) = test_server();
        let root = store.insert(NewRecord::draft(ContentKind::Publication, "Root", actor));

        let prepared = server
            .execute_tool(
                "folio_chain_export",
                &args(json!({ "root_id": root.to_string(), "format": "flat" })),
            )
            .await
            .unwrap();
        let session_id = prepared["session_id"].as_str().unwrap();
        assert!(session_id.starts_with("chain_"));

        let committed = server
            .execute_tool(
                "folio_chain_export",
                &args(json!({
                    "stage": "commit",
                    "root_id": root.to_string(),
                    "session_id": session_id,
                })),
            )
            .await
            .unwrap();
        assert_eq!(committed["summary"]["format"], json!("flat"));
        assert_eq!(committed["summary"]["node_count"], json!(1));
        assert!(committed["summary"]["document"].is_array());
    }

    #[tokio::test]
    async fn get_hides_foreign_drafts_uniformly() {
        let (server, store, _) = test_server();
        let stranger = Uuid::now_v7();
        let hidden = store.insert(NewRecord::draft(
            ContentKind::Publication,
            "Private",
            stranger,
        ));

        let forbidden = server
            .execute_tool("folio_get", &args(json!({ "id": hidden.to_string() })))
            .await
            .expect_err("hidden record");
        let missing = server
            .execute_tool(
                "folio_get",
                &args(json!({ "id": Uuid::now_v7().to_string() })),
            )
            .await
            .expect_err("missing record");
        assert_eq!(forbidden.to_value()["error"], missing.to_value()["error"]);
        assert_eq!(forbidden.to_value()["error"], json!("access_denied"));
    }

    #[tokio::test]
    async fn list_respects_kind_filter_and_limit() {
        let (server, store, actor) = test_server();
        for index in 0..3 {
            store.insert(NewRecord::draft(
                ContentKind::Style,
                format!("Style {index}"),
                actor,
            ));
        }
        store.insert(NewRecord::draft(ContentKind::Publication, "Pub", actor));

        let listed = server
            .execute_tool(
                "folio_list",
                &args(json!({ "kind": "style", "limit": 2 })),
            )
            .await
            .unwrap();
        assert_eq!(listed["count"], json!(2));
        let bad_kind = server
            .execute_tool("folio_list", &args(json!({ "kind": "post" })))
            .await;
        assert!(bad_kind.is_err());
    }

    #[tokio::test]
    async fn unknown_tool_is_a_validation_failure() {
        let (server, _, _) = test_server();
        let error = server
            .execute_tool("folio_nope", &Map::new())
            .await
            .expect_err("unknown tool");
        assert_eq!(error.to_value()["error"], json!("validation_failed"));
    }

    #[test]
    fn oversized_documents_are_truncated() {
        let big = "x".repeat(TOOL_ENVELOPE_MAX_BYTES);
        let envelope = json!({
            "status": "committed",
            "summary": { "document": big, "node_count": 1 }
        });
        let bounded = enforce_tool_payload_limit(envelope);
        assert_eq!(bounded["summary"]["document"], Value::Null);
        assert_eq!(bounded["summary"]["document_truncated"], json!(true));

        let small = json!({ "status": "ok" });
        assert_eq!(enforce_tool_payload_limit(small.clone()), small);
    }
}
