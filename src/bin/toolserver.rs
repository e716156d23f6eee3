//! Reference remote toolset: a tool server on stdio built on rmcp's
//! server side.
//!
//! Stdout carries protocol frames only; logs go to stderr.

use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, ErrorData, JsonObject, ListToolsResult,
    PaginatedRequestParams, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ServerHandler, ServiceExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Reference stdio tool server for turnloop.
#[derive(Parser, Debug)]
#[command(name = "turnloop-toolserver", version, about)]
struct Args {
    /// Handle one request at a time, in arrival order.
    #[arg(long)]
    sequential: bool,

    /// Answer the handshake and discovery, never `tools/call`.
    #[arg(long)]
    mute: bool,

    /// Never answer anything.
    #[arg(long)]
    silent: bool,

    /// Tools per `tools/list` page; 0 puts all on one page.
    #[arg(long, default_value_t = 0)]
    page_size: usize,

    /// Directory `list_files` may read.
    sandbox_root: Option<PathBuf>,
}

struct Server {
    mute: bool,
    page_size: usize,
    sandbox_root: Option<PathBuf>,
    /// Held across each request in sequential mode.
    gate: Option<Mutex<()>>,
    tools: Vec<Tool>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Some(root) = &args.sandbox_root {
        if !root.is_absolute() {
            eprintln!("sandbox root must be absolute: {}", root.display());
            return ExitCode::from(2);
        }
    }
    info!(sequential = args.sequential, mute = args.mute, silent = args.silent, "tool server starting");

    if args.silent {
        // Swallow input until the client hangs up.
        if let Err(err) = tokio::io::copy(&mut tokio::io::stdin(), &mut tokio::io::sink()).await {
            warn!(error = %err, "stdin read failed");
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    let server = Server {
        mute: args.mute,
        page_size: args.page_size,
        sandbox_root: args.sandbox_root,
        gate: args.sequential.then(|| Mutex::new(())),
        tools: catalogue(),
    };
    let service = match server.serve(rmcp::transport::stdio()).await {
        Ok(service) => service,
        Err(err) => {
            warn!(error = %err, "handshake failed");
            return ExitCode::FAILURE;
        }
    };
    match service.waiting().await {
        Ok(reason) => {
            info!(?reason, "stdin closed; exiting");
            ExitCode::SUCCESS
        }
        Err(err) => {
            warn!(error = %err, "server task failed");
            ExitCode::FAILURE
        }
    }
}

impl ServerHandler for Server {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        };
        info.server_info.name = "turnloop-toolserver".into();
        info.server_info.version = env!("CARGO_PKG_VERSION").into();
        info
    }

    /// Cursor is the index of the first tool on the page.
    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let _turn = self.queue().await;
        let start = request
            .and_then(|params| params.cursor)
            .and_then(|cursor| cursor.parse::<usize>().ok())
            .unwrap_or(0)
            .min(self.tools.len());
        let end = match self.page_size {
            0 => self.tools.len(),
            size => (start + size).min(self.tools.len()),
        };
        let mut page = ListToolsResult::with_all_items(self.tools[start..end].to_vec());
        page.next_cursor = (end < self.tools.len()).then(|| end.to_string());
        Ok(page)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        if self.mute {
            debug!(tool = %request.name, "staying quiet");
            return std::future::pending().await;
        }
        let _turn = self.queue().await;
        let args = Value::Object(request.arguments.unwrap_or_default());

        let result = match &*request.name {
            "calculate_percentage" => calculate_percentage(&args),
            "echo" => text(args.get("text").and_then(Value::as_str).unwrap_or_default()),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                CallToolResult::structured(json!({ "slept_ms": ms }))
            }
            "hang" => {
                context.ct.cancelled().await;
                debug!("hang released by client cancellation");
                error("cancelled by client")
            }
            "fail" => error(
                args.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure"),
            ),
            "crash" => {
                warn!("crash requested; exiting");
                std::process::exit(3);
            }
            "list_files" => self.list_files(&args).await,
            other => {
                return Err(ErrorData::invalid_params(format!("unknown tool '{other}'"), None));
            }
        };
        Ok(result)
    }
}

impl Server {
    async fn queue(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        }
    }

    async fn list_files(&self, args: &Value) -> CallToolResult {
        let Some(root) = &self.sandbox_root else {
            return error("no sandbox root configured");
        };
        let relative = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let target = match resolve_in_sandbox(root, relative) {
            Ok(target) => target,
            Err(message) => return error(message),
        };

        let mut read_dir = match tokio::fs::read_dir(&target).await {
            Ok(read_dir) => read_dir,
            Err(err) => return error(format!("{relative}: {err}")),
        };
        let mut entries = Vec::new();
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let kind = match entry.file_type().await {
                        Ok(t) if t.is_dir() => "dir",
                        Ok(t) if t.is_file() => "file",
                        _ => "other",
                    };
                    entries.push(json!({
                        "name": entry.file_name().to_string_lossy(),
                        "type": kind,
                    }));
                }
                Ok(None) => break,
                Err(err) => return error(err.to_string()),
            }
        }
        entries.sort_by(|a, b| {
            a["name"]
                .as_str()
                .unwrap_or_default()
                .cmp(b["name"].as_str().unwrap_or_default())
        });
        CallToolResult::structured(json!({ "path": relative, "entries": entries }))
    }
}

fn text(text: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text.into())])
}

fn error(message: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message.into())])
}

/// Join `relative` onto `root`, refusing anything that leaves it.
fn resolve_in_sandbox(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(format!("path '{}' is outside the sandbox", relative.display()));
    }
    let root = root
        .canonicalize()
        .map_err(|err| format!("sandbox root unavailable: {err}"))?;
    let target = root
        .join(relative)
        .canonicalize()
        .map_err(|err| format!("{}: {err}", relative.display()))?;
    if !target.starts_with(&root) {
        return Err(format!("path '{}' is outside the sandbox", relative.display()));
    }
    Ok(target)
}

fn calculate_percentage(args: &Value) -> CallToolResult {
    let (Some(number), Some(percentage)) = (
        args.get("number").and_then(Value::as_f64),
        args.get("percentage").and_then(Value::as_f64),
    ) else {
        return error("number and percentage are required");
    };
    let result = number * percentage / 100.0;
    let result = if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        json!(result as i64)
    } else {
        json!(result)
    };
    CallToolResult::structured(json!({ "result": result }))
}

fn tool(name: &'static str, description: &'static str, input: Value) -> Tool {
    let schema: JsonObject = match input {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    };
    Tool::new(name, description, schema)
}

fn catalogue() -> Vec<Tool> {
    vec![
        tool(
            "calculate_percentage",
            "Compute percentage% of number",
            json!({
                "type": "object",
                "properties": {
                    "number": { "type": "number" },
                    "percentage": { "type": "number" },
                },
                "required": ["number", "percentage"],
            }),
        ),
        tool(
            "echo",
            "Return the given text",
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            }),
        ),
        tool(
            "sleep",
            "Wait for ms milliseconds",
            json!({
                "type": "object",
                "properties": { "ms": { "type": "integer" } },
                "required": ["ms"],
            }),
        ),
        tool("hang", "Never return", json!({ "type": "object" })),
        tool(
            "fail",
            "Report a tool error",
            json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
            }),
        ),
        tool("crash", "Exit the server process", json!({ "type": "object" })),
        tool(
            "list_files",
            "List a directory inside the sandbox root",
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
            }),
        ),
    ]
}
