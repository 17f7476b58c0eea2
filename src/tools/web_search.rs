//! # 网络搜索工具（Google Custom Search JSON API）

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Tool, ToolError, required_str};
use crate::config::ToolConfig;
use crate::llm_api::utils::client::{BaseClient, ClientConfig, ClientError, TimeoutConfig};
use crate::llm_api::utils::tool_structure::ToolDefinition;

pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

/// `search_information`
pub struct SearchTool {
    base_client: BaseClient,
    endpoint: String,
    api_key: Option<String>,
    cse_id: Option<String>,
    num_results: u8,
}

impl SearchTool {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        cse_id: Option<String>,
        num_results: u8,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            base_client: BaseClient::new(config)?,
            endpoint,
            api_key,
            cse_id,
            // 免费额度下单次最多 10 条
            num_results: num_results.clamp(1, 10),
        })
    }

    pub fn from_config(config: &ToolConfig) -> Result<Self, ClientError> {
        Self::new(
            DEFAULT_SEARCH_ENDPOINT.to_string(),
            config.search_api_key.clone(),
            config.search_cse_id.clone(),
            config.search_results,
            ClientConfig::new().with_timeout(TimeoutConfig::new().with_request_timeout(config.request_timeout)),
        )
    }

    async fn search(&self, query: &str) -> Result<Value, ToolError> {
        let (Some(api_key), Some(cse_id)) = (self.api_key.as_deref(), self.cse_id.as_deref()) else {
            return Err(ToolError::NotConfigured(
                "SEARCH_ENGINE_API_KEY and SEARCH_ENGINE_CSE_ID are required".to_string(),
            ));
        };

        let num = self.num_results.to_string();
        let body = self
            .base_client
            .get_json(&self.endpoint, &[("q", query), ("key", api_key), ("cx", cse_id), ("num", num.as_str())])
            .await?;

        let results: Vec<Value> = body
            .get("items")
            .and_then(|items| items.as_array())
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        json!({
                            "title": item.get("title").and_then(|v| v.as_str()).unwrap_or_default(),
                            "url": item.get("link").and_then(|v| v.as_str()).unwrap_or_default(),
                            "snippet": item.get("snippet").and_then(|v| v.as_str()).unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        if results.is_empty() {
            return Ok(Value::String("No results found for the given query.".to_string()));
        }
        Ok(json!({ "query": query, "results": results }))
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &'static str {
        "search_information"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.name(),
            "Search the web for recent news or information not covered by the other tools.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"]
            }),
        )
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, ToolError> {
        let query = required_str(arguments, "query")?;
        self.search(&query).await
    }
}
