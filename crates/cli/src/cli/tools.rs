//! `mcpbridge list` / `mcpbridge call`: drive the blocking client once.

use std::time::Duration;

use anyhow::{anyhow, Context};
use mb_domain::config::Config;
use mb_domain::ToolDescriptor;
use mb_mcp_client::McpClient;
use serde_json::Value;

/// Build a client for the selected server entry.
pub fn client_for(config: &Config, server: Option<&str>) -> anyhow::Result<McpClient> {
    let entry = config.mcp.select(server).ok_or_else(|| match server {
        Some(id) => anyhow!("no MCP server with id '{id}' in config"),
        None => anyhow!("no MCP servers configured"),
    })?;
    Ok(McpClient::from_server_config(entry, &config.client))
}

/// Print the tools the server offers.
pub fn list(config: &Config, server: Option<&str>, json: bool) -> anyhow::Result<()> {
    let client = client_for(config, server)?;
    let scope = client.enter().context("starting MCP client")?;
    let tools = scope.list_tools().context("listing tools")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        print!("{}", format_tool_list(&tools));
    }
    Ok(())
}

/// Call one tool and print the `CallResult` as JSON.
///
/// Returns `false` when the call came back with an error status.
pub fn call(
    config: &Config,
    server: Option<&str>,
    tool: &str,
    args: &str,
    tool_use_id: &str,
    timeout_secs: Option<u64>,
) -> anyhow::Result<bool> {
    let arguments = parse_arguments(args)?;
    let client = client_for(config, server)?;
    let scope = client.enter().context("starting MCP client")?;

    tracing::debug!(server = %scope.label(), tool, tool_use_id, "calling tool");
    let result = scope.call_tool(
        tool_use_id,
        tool,
        arguments,
        timeout_secs.map(Duration::from_secs),
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(!result.is_error())
}

/// Parse `--args`, which must be a JSON object.
pub fn parse_arguments(raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw).context("parsing --args as JSON")?;
    if !value.is_object() {
        anyhow::bail!("--args must be a JSON object, got {value}");
    }
    Ok(value)
}

/// One line per tool: name, padded, then the first line of its description.
pub fn format_tool_list(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return "(no tools)\n".into();
    }
    let width = tools.iter().map(|t| t.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for tool in tools {
        let summary = tool.description.lines().next().unwrap_or("");
        out.push_str(format!("{:<width$}  {summary}", tool.name).trim_end());
        out.push('\n');
    }
    out
}
