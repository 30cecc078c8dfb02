// src/sandbox/stubs.rs
// Generated per-tool stub sources for the sandbox

/// Stub body. `__SERVER__` and `__TOOL__` are replaced with JSON string
/// literals, so arbitrary downstream tool names stay intact on the wire.
const TEMPLATE: &str = r#"// Generated stub: calls tool __TOOL__ on server __SERVER__.
const serversInfo = require('serversInfo');
const toolOutputCache = require('toolOutputCache');

module.exports = async function (args) {
  const server = serversInfo[__SERVER__];
  if (!server) {
    throw new Error('Server ' + __SERVER__ + ' is not available in this sandbox');
  }
  if (!server.callTool) {
    throw new Error('Server ' + __SERVER__ + ' has no connected client');
  }
  const rawResponse = JSON.parse(
    await server.callTool(__TOOL__, JSON.stringify(args == null ? {} : args))
  );
  toolOutputCache[__SERVER__].push({ toolName: __TOOL__, rawResponse: rawResponse });
  return {
    content: rawResponse.content == null ? [] : rawResponse.content,
    isError: rawResponse.isError == null ? false : rawResponse.isError,
    _meta: { serverName: __SERVER__, toolName: __TOOL__ },
  };
};
"#;

/// Render the stub that calls `tool_name` on `server_name`.
pub fn stub_source(server_name: &str, tool_name: &str) -> String {
    let server_literal = serde_json::Value::String(server_name.to_string()).to_string();
    let tool_literal = serde_json::Value::String(tool_name.to_string()).to_string();
    TEMPLATE
        .replace("__SERVER__", &server_literal)
        .replace("__TOOL__", &tool_literal)
}
