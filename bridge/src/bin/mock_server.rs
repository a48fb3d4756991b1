//! Line-delimited JSON-RPC capability server used by the integration tests.
//!
//! Tools: `echo`, `slow_echo` (streams progress notifications, then echoes),
//! `fail` (tool-level error) and `crash` (exits mid-call). Also serves the
//! `memo://greeting` resource, a `memo://notes/{id}` template and a `greet`
//! prompt.
//!
//! Flags:
//! - `--stubborn`: keep running after stdin closes, so the client must kill it
//! - `--tools-only`: answer "method not found" for resources and prompts

use std::{
    io::{self, BufRead, Write},
    thread,
    time::Duration,
};

use serde_json::{json, Value};

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

struct Options {
    stubborn: bool,
    tools_only: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = Options {
        stubborn: args.iter().any(|a| a == "--stubborn"),
        tools_only: args.iter().any(|a| a == "--tools-only"),
    };

    eprintln!("mock server started");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("ignoring malformed line");
            continue;
        };
        handle(&message, &options);
    }

    if options.stubborn {
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
}

fn handle(message: &Value, options: &Options) {
    let Some(method) = message.get("method").and_then(Value::as_str) else {
        return;
    };
    // Notifications carry no id and get no reply.
    let Some(id) = message.get("id").cloned() else {
        return;
    };
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let outcome = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
            "serverInfo": {"name": "toolbridge-mock-server", "version": "0.1.0"}
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(list_tools(&params)),
        "tools/call" => call_tool(&params),
        "resources/list" if !options.tools_only => Ok(json!({
            "resources": [{"uri": "memo://greeting", "name": "greeting", "mimeType": "text/plain"}]
        })),
        "resources/templates/list" if !options.tools_only => Ok(json!({
            "resourceTemplates": [{"uriTemplate": "memo://notes/{id}", "name": "note"}]
        })),
        "resources/read" if !options.tools_only => read_resource(&params),
        "prompts/list" if !options.tools_only => Ok(json!({
            "prompts": [{
                "name": "greet",
                "description": "Greet someone",
                "arguments": [{"name": "name", "required": true}]
            }]
        })),
        "prompts/get" if !options.tools_only => get_prompt(&params),
        other => Err((METHOD_NOT_FOUND, format!("Method not found: {}", other))),
    };

    let reply = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }),
    };
    send(&reply);
}

/// Two pages, to exercise cursor pagination.
fn list_tools(params: &Value) -> Value {
    let schema = json!({"type": "object", "properties": {"text": {"type": "string"}}});
    match params.get("cursor").and_then(Value::as_str) {
        Some("page-2") => json!({
            "tools": [
                {"name": "fail", "description": "Always reports a tool error"},
                {"name": "crash", "description": "Exits without answering"}
            ]
        }),
        _ => json!({
            "tools": [
                {"name": "echo", "description": "Echo the arguments", "inputSchema": schema},
                {"name": "slow_echo", "description": "Echo after streaming progress", "inputSchema": schema}
            ],
            "nextCursor": "page-2"
        }),
    }
}

fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let token = params
        .get("_meta")
        .and_then(|m| m.get("progressToken"))
        .cloned()
        .unwrap_or(Value::Null);

    match name {
        "echo" => Ok(echo_result(arguments)),
        "slow_echo" => {
            let chunks = arguments.get("chunks").and_then(Value::as_u64).unwrap_or(2);
            let delay = arguments.get("delay_ms").and_then(Value::as_u64).unwrap_or(100);
            for progress in 1..=chunks {
                send(&json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/progress",
                    "params": {"progressToken": token, "progress": progress, "total": chunks}
                }));
                thread::sleep(Duration::from_millis(delay));
            }
            Ok(echo_result(arguments))
        }
        "fail" => Ok(json!({
            "content": [{"type": "text", "text": "tool failed"}],
            "isError": true
        })),
        "crash" => std::process::exit(3),
        other => Err((INVALID_PARAMS, format!("Unknown tool: {}", other))),
    }
}

fn echo_result(arguments: Value) -> Value {
    json!({
        "content": [{"type": "text", "text": arguments.to_string()}],
        "structuredContent": arguments,
        "isError": false
    })
}

fn read_resource(params: &Value) -> Result<Value, (i64, String)> {
    let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
    let text = if uri == "memo://greeting" {
        "hello from the mock server".to_string()
    } else if let Some(id) = uri.strip_prefix("memo://notes/") {
        format!("note {}", id)
    } else {
        return Err((INVALID_PARAMS, format!("Unknown resource: {}", uri)));
    };
    Ok(json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": text}]}))
}

fn get_prompt(params: &Value) -> Result<Value, (i64, String)> {
    if params.get("name").and_then(Value::as_str) != Some("greet") {
        return Err((INVALID_PARAMS, "Unknown prompt".to_string()));
    }
    let who = params
        .get("arguments")
        .and_then(|a| a.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("stranger");
    Ok(json!({
        "messages": [{"role": "user", "content": {"type": "text", "text": format!("Hello, {}!", who)}}]
    }))
}

fn send(message: &Value) {
    let mut stdout = io::stdout().lock();
    if writeln!(stdout, "{}", message).and_then(|_| stdout.flush()).is_err() {
        std::process::exit(0);
    }
}
