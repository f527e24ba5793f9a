use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use reqwest::{Client, ClientBuilder, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::{Frequency, PricePoint};
use crate::filters::{ExportPayload, ScreeningPayload};
use crate::normalize::MarketCapEntry;
use crate::tracker::{JobStatusResponse, StatusSource};

const PRICE_RANGE_PATH: &str = "/data/price_range";
const SYNC_DAILY_PATH: &str = "/data/sync/daily";
const SYNC_STOCKS_PATH: &str = "/data/sync/stocks";
const SYNC_PROGRESS_PATH: &str = "/data/sync/progress";
const SCREENING_RUN_PATH: &str = "/screening/run";
const SCREENING_EXPORT_PATH: &str = "/screening/export";
const STOCK_QUERY_PATH: &str = "/stocks/query";
const MARKET_CAP_PATH: &str = "/dashboard/market_cap";
const DASHBOARD_STATS_PATH: &str = "/dashboard/stats";
pub const LISTING_PAGE_SIZE: usize = 18;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceRangeRequest {
    pub symbol: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub frequency: Frequency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    #[default]
    Incremental,
    Full,
}

impl std::str::FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" => Ok(SyncType::Incremental),
            "full" => Ok(SyncType::Full),
            other => Err(format!("unsupported sync type `{other}` (use incremental or full)")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySyncRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    pub sync_type: SyncType,
}

/// Server answer to a sync request. A rejection means a job is already
/// running server-side; the caller must not start tracking a second one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStart {
    Accepted { count: Option<u64> },
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct SyncStartResponse {
    #[serde(default)]
    count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreeningRow {
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub pe_ratio: Option<f64>,
    #[serde(default)]
    pub pb_ratio: Option<f64>,
    #[serde(default)]
    pub momentum: Option<f64>,
    #[serde(default)]
    pub rsi: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScreeningResponse {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub items: Vec<ScreeningRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StockItem {
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub market: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StockPage {
    pub total: usize,
    pub items: Vec<StockItem>,
}

/// Coverage counters shown above the market-cap distribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardStats {
    #[serde(default)]
    pub stock_count: u64,
    #[serde(default)]
    pub backtest_count: u64,
    #[serde(default)]
    pub screening_count: u64,
    #[serde(default)]
    pub data_status: String,
}

/// Price row as the backend sends it; volume arrives as a float.
#[derive(Debug, Deserialize)]
struct PriceRow {
    trade_date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl PriceRow {
    fn into_point(self) -> Option<PricePoint> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|value| !value.is_finite() || *value < 0.0) {
            return None;
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return None;
        }
        Some(PricePoint::new(
            self.trade_date,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume.round() as u64,
        ))
    }
}

pub struct DashboardClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl DashboardClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Ok(DashboardClient {
            http: build_http_client()?,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            token: config
                .token
                .as_ref()
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        debug!(method = method.as_str(), path, "dashboard request");
        let builder = self.http.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn price_range(&self, request: &PriceRangeRequest) -> Result<Vec<PricePoint>> {
        let rows: Vec<PriceRow> = self
            .request(Method::POST, PRICE_RANGE_PATH)
            .json(request)
            .send()
            .await
            .with_context(|| format!("请求 {} K 线失败", request.symbol))
            .and_then(ensure_success)?
            .json()
            .await
            .with_context(|| format!("解析 {} K 线数据失败", request.symbol))?;
        let total = rows.len();
        let mut points: Vec<PricePoint> = rows.into_iter().filter_map(PriceRow::into_point).collect();
        if points.len() < total {
            warn!(
                symbol = %request.symbol,
                skipped = total - points.len(),
                "skipped malformed price rows"
            );
        }
        points.sort_by_key(|point| point.trade_date);
        Ok(points)
    }

    pub async fn start_daily_sync(&self, request: &DailySyncRequest) -> Result<SyncStart> {
        let response = self
            .request(Method::POST, SYNC_DAILY_PATH)
            .json(request)
            .send()
            .await
            .context("请求行情同步失败")?;
        read_sync_start(response).await
    }

    pub async fn start_stock_sync(&self) -> Result<SyncStart> {
        let response = self
            .request(Method::POST, SYNC_STOCKS_PATH)
            .send()
            .await
            .context("请求股票清单同步失败")?;
        read_sync_start(response).await
    }

    pub async fn sync_progress(&self) -> Result<JobStatusResponse> {
        self.request(Method::GET, SYNC_PROGRESS_PATH)
            .send()
            .await
            .context("请求同步进度失败")
            .and_then(ensure_success)?
            .json()
            .await
            .context("解析同步进度失败")
    }

    pub async fn run_screening(&self, payload: &ScreeningPayload) -> Result<ScreeningResponse> {
        self.request(Method::POST, SCREENING_RUN_PATH)
            .json(payload)
            .send()
            .await
            .context("选股筛选请求失败")
            .and_then(ensure_success)?
            .json()
            .await
            .context("解析选股结果失败")
    }

    /// Returns the export file exactly as the server produced it.
    pub async fn export(&self, payload: &ExportPayload) -> Result<Vec<u8>> {
        let bytes = self
            .request(Method::POST, SCREENING_EXPORT_PATH)
            .json(payload)
            .send()
            .await
            .context("导出请求失败")
            .and_then(ensure_success)?
            .bytes()
            .await
            .context("读取导出文件失败")?;
        Ok(bytes.to_vec())
    }

    pub async fn query_stocks(&self, keyword: &str, limit: usize, offset: usize) -> Result<StockPage> {
        let limit = limit.to_string();
        let offset = offset.to_string();
        self.request(Method::GET, STOCK_QUERY_PATH)
            .query(&[
                ("keyword", keyword),
                ("limit", limit.as_str()),
                ("offset", offset.as_str()),
            ])
            .send()
            .await
            .context("股票列表请求失败")
            .and_then(ensure_success)?
            .json()
            .await
            .context("解析股票列表失败")
    }

    pub async fn market_cap_distribution(&self) -> Result<Vec<MarketCapEntry>> {
        self.request(Method::GET, MARKET_CAP_PATH)
            .send()
            .await
            .context("市值分布请求失败")
            .and_then(ensure_success)?
            .json()
            .await
            .context("解析市值分布失败")
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats> {
        self.request(Method::GET, DASHBOARD_STATS_PATH)
            .send()
            .await
            .context("看板统计请求失败")
            .and_then(ensure_success)?
            .json()
            .await
            .context("解析看板统计失败")
    }
}

impl StatusSource for DashboardClient {
    async fn fetch_status(&self) -> Result<JobStatusResponse> {
        self.sync_progress().await
    }
}

fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        warn!(%status, url = %response.url(), "dashboard request failed");
        Err(anyhow!("服务端返回错误状态 {status}"))
    }
}

async fn read_sync_start(response: Response) -> Result<SyncStart> {
    let status = response.status();
    if status == StatusCode::BAD_REQUEST {
        let detail = response
            .json::<ErrorDetail>()
            .await
            .map(|body| body.detail)
            .unwrap_or_else(|_| "Task already running".to_string());
        return Ok(SyncStart::Rejected(detail));
    }
    let body: SyncStartResponse = ensure_success(response)?
        .json()
        .await
        .context("解析同步响应失败")?;
    Ok(SyncStart::Accepted { count: body.count })
}

fn build_http_client() -> Result<Client> {
    Ok(ClientBuilder::new()
        .connect_timeout(Duration::from_secs(5))
        .read_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(20))
        .build()?)
}
