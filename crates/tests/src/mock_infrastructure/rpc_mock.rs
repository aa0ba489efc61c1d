//! RPC mock builder for EVM JSON-RPC testing.
//!
//! Wraps mockito so tests can stand up a node for [`HttpJsonRpcTransport`].
//!
//! [`HttpJsonRpcTransport`]: conduit_core::upstream::HttpJsonRpcTransport

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};

/// Builder for mock EVM node responses, matched by method name.
pub struct RpcMockBuilder {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

fn method_matcher(method: &str) -> Matcher {
    Matcher::Regex(format!(r#""method"\s*:\s*"{method}""#))
}

impl RpcMockBuilder {
    /// Creates a new RPC mock builder with a fresh mockito server.
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    /// Mocks `method` with a successful result.
    pub fn mock_method(&mut self, method: &str, result: &Value) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string())
            .create();

        self.mocks.push(mock);
        self
    }

    pub fn mock_chain_id(&mut self, chain_id: u64) -> &mut Self {
        self.mock_method("eth_chainId", &json!(format!("0x{chain_id:x}")))
    }

    pub fn mock_block_number(&mut self, block_number: u64) -> &mut Self {
        self.mock_method("eth_blockNumber", &json!(format!("0x{block_number:x}")))
    }

    /// Mocks a JSON-RPC error object for `method`.
    pub fn mock_rpc_error(&mut self, method: &str, code: i32, message: &str) -> &mut Self {
        self.mock_rpc_error_object(method, json!({ "code": code, "message": message }))
    }

    /// Mocks a JSON-RPC error carrying a `data` member, e.g. a revert payload.
    pub fn mock_rpc_error_with_data(
        &mut self,
        method: &str,
        code: i32,
        message: &str,
        data: Value,
    ) -> &mut Self {
        self.mock_rpc_error_object(method, json!({ "code": code, "message": message, "data": data }))
    }

    fn mock_rpc_error_object(&mut self, method: &str, error: Value) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": error
                })
                .to_string(),
            )
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks a provider throttling `method` with HTTP 429.
    pub fn mock_rate_limited(&mut self, method: &str, retry_after_secs: u64) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(429)
            .with_header("retry-after", &retry_after_secs.to_string())
            .with_body("Too Many Requests")
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks a server error (500) for `method`.
    pub fn mock_server_error(&mut self, method: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(500)
            .with_body("Internal Server Error")
            .create();

        self.mocks.push(mock);
        self
    }

    /// Verifies all mocks were called.
    #[must_use]
    pub fn verify_all_called(&self) -> bool {
        self.mocks.iter().all(Mock::matched)
    }
}
