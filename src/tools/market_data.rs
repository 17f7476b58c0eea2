//! # 行情与公司数据工具
//!
//! 基于 TCBS 公开接口：
//! - `/stock-insight/v1/stock/bars-long-term` 日 K 线，取最后一根的收盘价
//! - `/tcanalysis/v1/ticker/{symbol}/overview` 公司概况
//! - `/tcanalysis/v1/finance/{symbol}/{statement}` 年度财务报表

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Tool, ToolError, required_str};
use crate::llm_api::utils::client::{BaseClient, ClientConfig, ClientError, TimeoutConfig};
use crate::llm_api::utils::tool_structure::ToolDefinition;

/// 公司概况中保留给模型的字段
const OVERVIEW_FIELDS: &[&str] = &[
    "exchange",
    "shortName",
    "industry",
    "industryEn",
    "establishedYear",
    "noEmployees",
    "outstandingShare",
    "issueShare",
    "website",
];

/// 财务报表类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    BalanceSheet,
    IncomeStatement,
    CashFlow,
}

impl StatementKind {
    pub fn parse(raw: &str) -> Result<Self, ToolError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "balance_sheet" => Ok(StatementKind::BalanceSheet),
            "income_statement" => Ok(StatementKind::IncomeStatement),
            "cash_flow" => Ok(StatementKind::CashFlow),
            other => Err(ToolError::InvalidArguments(format!(
                "unknown statement '{}', expected balance_sheet|income_statement|cash_flow",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::BalanceSheet => "balance_sheet",
            StatementKind::IncomeStatement => "income_statement",
            StatementKind::CashFlow => "cash_flow",
        }
    }

    fn path_segment(&self) -> &'static str {
        match self {
            StatementKind::BalanceSheet => "balancesheet",
            StatementKind::IncomeStatement => "incomestatement",
            StatementKind::CashFlow => "cashflow",
        }
    }
}

/// 股票代码：1 到 10 位字母数字，统一转大写
pub fn normalize_symbol(raw: &str) -> Result<String, ToolError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() || symbol.len() > 10 || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ToolError::InvalidArguments(format!("invalid stock symbol '{}'", raw)));
    }
    Ok(symbol)
}

/// 行情数据 HTTP 客户端
#[derive(Debug)]
pub struct MarketDataClient {
    base_client: BaseClient,
    base_url: String,
}

impl MarketDataClient {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self, ClientError> {
        let config = ClientConfig::new().with_timeout(TimeoutConfig::new().with_request_timeout(request_timeout));
        Ok(Self {
            base_client: BaseClient::new(config)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// 最近一个交易日的收盘价
    pub async fn latest_price(&self, symbol: &str) -> Result<Value, ToolError> {
        let url = format!("{}/stock-insight/v1/stock/bars-long-term", self.base_url);
        let to = chrono::Utc::now().timestamp().to_string();
        let body = self
            .base_client
            .get_json(
                &url,
                &[
                    ("ticker", symbol),
                    ("type", "stock"),
                    ("resolution", "D"),
                    ("countBack", "5"),
                    ("to", to.as_str()),
                ],
            )
            .await?;

        let bar = body
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|bars| bars.last())
            .ok_or_else(|| ToolError::Backend(format!("no price data for {}", symbol)))?;
        let close = bar
            .get("close")
            .and_then(|c| c.as_f64())
            .ok_or_else(|| ToolError::Backend(format!("price bar for {} has no close", symbol)))?;

        debug!(symbol, close, "Fetched latest price");
        Ok(json!({
            "symbol": symbol,
            "price": close,
            "currency": "VND",
            "trading_date": bar.get("tradingDate").cloned().unwrap_or(Value::Null),
        }))
    }

    /// 公司概况（只保留常用字段）
    pub async fn overview(&self, symbol: &str) -> Result<Value, ToolError> {
        let url = format!("{}/tcanalysis/v1/ticker/{}/overview", self.base_url, symbol);
        let body = self.base_client.get_json(&url, &[]).await?;
        let object = body
            .as_object()
            .ok_or_else(|| ToolError::Backend(format!("unexpected overview payload for {}", symbol)))?;

        let mut overview = Map::new();
        overview.insert("symbol".to_string(), Value::String(symbol.to_string()));
        for field in OVERVIEW_FIELDS {
            if let Some(value) = object.get(*field).filter(|v| !v.is_null()) {
                overview.insert((*field).to_string(), value.clone());
            }
        }
        Ok(Value::Object(overview))
    }

    /// 年度财务报表；指定年份不存在时退回最近一年
    pub async fn statement(&self, symbol: &str, kind: StatementKind, year: Option<i64>) -> Result<Value, ToolError> {
        let url = format!(
            "{}/tcanalysis/v1/finance/{}/{}",
            self.base_url,
            symbol,
            kind.path_segment()
        );
        let body = self
            .base_client
            .get_json(&url, &[("yearly", "1"), ("isAll", "true")])
            .await?;
        let rows = body
            .as_array()
            .filter(|rows| !rows.is_empty())
            .ok_or_else(|| ToolError::Backend(format!("no {} data for {}", kind.as_str(), symbol)))?;

        let available_years: Vec<i64> = rows.iter().filter_map(|r| r.get("year").and_then(|y| y.as_i64())).collect();
        let row = year
            .and_then(|wanted| rows.iter().find(|r| r.get("year").and_then(|y| y.as_i64()) == Some(wanted)))
            .unwrap_or(&rows[0]);

        Ok(json!({
            "symbol": symbol,
            "statement": kind.as_str(),
            "year": row.get("year").cloned().unwrap_or(Value::Null),
            "available_years": available_years,
            "data": row,
        }))
    }
}

fn symbol_schema() -> Value {
    json!({
        "type": "string",
        "description": "Stock ticker symbol listed in Vietnam, e.g. FPT, VNM, HPG"
    })
}

/// `get_current_stock_price`
pub struct StockPriceTool {
    client: Arc<MarketDataClient>,
}

impl StockPriceTool {
    pub fn new(client: Arc<MarketDataClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for StockPriceTool {
    fn name(&self) -> &'static str {
        "get_current_stock_price"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.name(),
            "Get the latest closing price of a stock.",
            json!({
                "type": "object",
                "properties": { "symbol": symbol_schema() },
                "required": ["symbol"]
            }),
        )
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, ToolError> {
        let symbol = normalize_symbol(&required_str(arguments, "symbol")?)?;
        self.client.latest_price(&symbol).await
    }
}

/// `get_company_overview`
pub struct CompanyOverviewTool {
    client: Arc<MarketDataClient>,
}

impl CompanyOverviewTool {
    pub fn new(client: Arc<MarketDataClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for CompanyOverviewTool {
    fn name(&self) -> &'static str {
        "get_company_overview"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.name(),
            "Get an overview of a listed company: exchange, industry, employees, shares outstanding.",
            json!({
                "type": "object",
                "properties": { "symbol": symbol_schema() },
                "required": ["symbol"]
            }),
        )
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, ToolError> {
        let symbol = normalize_symbol(&required_str(arguments, "symbol")?)?;
        self.client.overview(&symbol).await
    }
}

/// `get_company_financial_statement`
pub struct FinancialStatementTool {
    client: Arc<MarketDataClient>,
}

impl FinancialStatementTool {
    pub fn new(client: Arc<MarketDataClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for FinancialStatementTool {
    fn name(&self) -> &'static str {
        "get_company_financial_statement"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            self.name(),
            "Get an annual financial statement of a listed company. Defaults to the latest year.",
            json!({
                "type": "object",
                "properties": {
                    "symbol": symbol_schema(),
                    "statement": {
                        "type": "string",
                        "enum": ["balance_sheet", "income_statement", "cash_flow"]
                    },
                    "year": { "type": "integer", "description": "Fiscal year, e.g. 2023" }
                },
                "required": ["symbol", "statement"]
            }),
        )
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, ToolError> {
        let symbol = normalize_symbol(&required_str(arguments, "symbol")?)?;
        let kind = StatementKind::parse(&required_str(arguments, "statement")?)?;
        let year = match arguments.get("year") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => Some(
                s.trim()
                    .parse::<i64>()
                    .map_err(|_| ToolError::InvalidArguments(format!("invalid year '{}'", s)))?,
            ),
            Some(other) => return Err(ToolError::InvalidArguments(format!("invalid year {}", other))),
        };
        self.client.statement(&symbol, kind, year).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_normalization() {
        assert_eq!(normalize_symbol(" fpt ").unwrap(), "FPT");
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("FPT; DROP").is_err());
    }

    #[test]
    fn test_statement_kind_parsing() {
        assert_eq!(StatementKind::parse("Cash_Flow").unwrap(), StatementKind::CashFlow);
        assert!(StatementKind::parse("ratio").is_err());
    }
}
