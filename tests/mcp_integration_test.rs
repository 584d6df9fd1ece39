//! MCP 集成测试：用 sh 脚本扮演按行收发 JSON-RPC 的服务端

use std::io::Write;
use std::sync::Arc;

use helm::config::AppConfig;
use helm::llm::MockLlmClient;
use helm::mcp::{register_mcp_tools, McpClient};
use helm::tools::ToolRegistry;
use helm::{AgentBuilder, AgentError};
use serde_json::json;
use tempfile::NamedTempFile;

const SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0.1"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"greet","description":"Say hello","inputSchema":{"type":"object","properties":{"name":{"type":"string"}},"required":["name"]}},{"name":"explode","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"name":"greet"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hello"}],"isError":false}}\n' "$id" ;;
    *'"name":"slow"'*)
      sleep 3
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"late"}]}}\n' "$id" ;;
    *'"name":"explode"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"kaboom"}],"isError":true}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id" ;;
  esac
done
"#;

fn server_script() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(SERVER.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn test_connect_discover_and_call() {
    let script = server_script();
    let client = Arc::new(McpClient::stdio(format!("sh {}", script.path().display())));
    assert!(client.connect().await);

    let names: Vec<_> = client.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["greet", "explode"]);

    let ok = client.call_tool("greet", json!({"name": "helm"})).await.unwrap();
    assert!(!ok.is_error);
    assert_eq!(ok.text(), Some("hello"));

    let failed = client.call_tool("explode", json!({})).await.unwrap();
    assert!(failed.is_error);

    let unknown = client.call_tool("missing", json!({})).await.unwrap();
    assert!(unknown.is_error);

    client.disconnect().await;
    assert!(!client.is_connected());
    assert!(client.call_tool("greet", json!({"name": "x"})).await.is_err());
}

#[tokio::test]
async fn test_registered_tools_go_through_registry() {
    let script = server_script();
    let client = Arc::new(McpClient::stdio(format!("sh {}", script.path().display())));
    assert!(client.connect().await);

    let registry = ToolRegistry::new();
    assert_eq!(register_mcp_tools(&registry, &client), 2);
    assert!(registry.has("mcp_greet"));

    let outcome = registry.execute("mcp_greet", json!({"name": "helm"})).await;
    assert!(outcome.success);
    assert_eq!(outcome.data, Some(json!("hello")));

    let rejected = registry.execute("mcp_greet", json!({"name": 3})).await;
    assert!(!rejected.success);

    let failed = registry.execute("mcp_explode", json!({})).await;
    assert!(!failed.success);
    assert_eq!(failed.error.as_deref(), Some("kaboom"));
    client.disconnect().await;
}

#[tokio::test]
async fn test_builder_attaches_mcp_tools() {
    let script = server_script();
    let mut cfg = AppConfig::default();
    cfg.memory.backend = "memory".into();
    cfg.mcp.enabled = true;
    cfg.mcp.server_command = Some(format!("sh {}", script.path().display()));

    let runtime = AgentBuilder::new(cfg)
        .with_llm(Arc::new(MockLlmClient::new()))
        .build()
        .await
        .unwrap();
    assert!(runtime.registry.has("mcp_greet"));
    assert!(runtime.registry.has("navigate"));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_timeout_drops_session() {
    let script = server_script();
    let client = Arc::new(McpClient::stdio(format!("sh {}", script.path().display())).with_timeout(1));
    assert!(client.connect().await);

    let err = client.call_tool("slow", json!({})).await.unwrap_err();
    assert!(matches!(err, AgentError::Timeout(_)));
    assert!(!client.is_connected());

    // 迟到的响应不会被下一次调用误读
    assert!(client.call_tool("greet", json!({"name": "x"})).await.is_err());
    assert!(client.connect().await);
    let ok = client.call_tool("greet", json!({"name": "x"})).await.unwrap();
    assert_eq!(ok.text(), Some("hello"));
    client.disconnect().await;
}
