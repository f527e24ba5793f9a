mod api;
mod chart;
mod command;
mod config;
mod event_log;
mod filters;
mod indicators;
mod normalize;
#[cfg(test)]
mod test_indicators;
mod tracker;
mod view;

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{DashboardClient, LISTING_PAGE_SIZE, ScreeningRow, SyncStart};
use crate::chart::build_chart_spec;
use crate::command::Command;
use crate::config::{ChartArgs, CliCommand, ExportArgs, FilterArgs, ScreenArgs, SyncCommand};
use crate::event_log::{SyncEventEntry, SyncEventStore};
use crate::filters::{
    CanonicalFilterBounds, ExportPayload, FilterBounds, FilterKey, format_display,
    format_display_value, from_canonical, to_canonical,
};
use crate::indicators::validate_window;
use crate::normalize::{ScalePolicy, normalize_magnitude, normalize_market_caps, shares};
use crate::tracker::{PollToken, SyncTracker, TokioClock, TrackerOutcome};
use crate::view::{ChartView, SyncProgressView};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    let params = config::CliParams::parse();
    init_tracing(&params.log_file)?;
    color_eyre::install().map_err(|err| anyhow!(err.to_string()))?;
    let client = DashboardClient::new(&params.api_config())?;
    match &params.command {
        CliCommand::Chart(args) => run_chart(&client, args).await,
        CliCommand::Screen(args) => run_screen(&client, args).await,
        CliCommand::Export(args) => run_export(&client, args).await,
        CliCommand::Sync(command) => run_sync(&client, command).await,
        CliCommand::History { limit } => show_history(*limit),
        CliCommand::MarketCap { json } => show_market_cap(&client, *json).await,
    }
}

fn init_tracing(path: &Path) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("无法打开日志文件 {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

async fn run_chart(client: &DashboardClient, args: &ChartArgs) -> anyhow::Result<()> {
    let indicators = args.indicator_set();
    for window in [indicators.ma_short, indicators.ma_long].into_iter().flatten() {
        validate_window(window)?;
    }
    if args.start > args.end {
        bail!("开始日期 {} 晚于结束日期 {}", args.start, args.end);
    }
    let prices = client.price_range(&args.price_request()).await?;
    info!(symbol = %args.symbol, points = prices.len(), "loaded price range");
    let spec = build_chart_spec(&prices, indicators, args.zoom.window());
    if !spec.is_aligned() {
        bail!("{} 的指标序列与日期轴长度不一致", args.symbol);
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&spec)?);
        return Ok(());
    }
    if prices.is_empty() {
        println!("{} 在所选区间没有行情数据", args.symbol);
        return Ok(());
    }
    let title = format!("{} {}", args.symbol, args.frequency.label());
    ChartView::new(spec, title)
        .run()
        .await
        .map_err(|err| anyhow!(err.to_string()))
}

/// Validated filters in both forms: what the user typed and what goes on
/// the wire.
fn prepare_filters(args: &FilterArgs) -> anyhow::Result<(FilterBounds, CanonicalFilterBounds)> {
    let bounds = args.filter_bounds()?;
    bounds.validate()?;
    if let Some(path) = args.persist(&bounds)? {
        info!(path = %path.display(), "saved filter preset");
    }
    let canonical = to_canonical(&bounds);
    Ok((bounds, canonical))
}

/// Echoes the bounds as the server will apply them, read back in display
/// units.
fn describe_filters(bounds: &FilterBounds, canonical: &CanonicalFilterBounds) {
    if bounds.is_empty() {
        println!("未设置筛选条件");
        return;
    }
    if let Some(section) = bounds.primary_section() {
        println!("筛选条件 ({})", section.title());
    }
    for (key, bound) in from_canonical(canonical).iter() {
        let min = bound
            .min
            .map(|v| format_display_value(key, v))
            .unwrap_or_else(|| "-".to_string());
        let max = bound
            .max
            .map(|v| format_display_value(key, v))
            .unwrap_or_else(|| "-".to_string());
        println!("  {key:<12} {min} ~ {max}");
    }
    if canonical.flags.macd_golden_cross {
        println!("  MACD 金叉");
    }
    if canonical.flags.kdj_golden_cross {
        println!("  KDJ 金叉");
    }
}

async fn run_screen(client: &DashboardClient, args: &ScreenArgs) -> anyhow::Result<()> {
    let (bounds, canonical) = prepare_filters(&args.filters)?;
    let response = client.run_screening(&canonical.to_payload()).await?;
    info!(
        total = response.total,
        section = ?bounds.primary_section(),
        "screening finished"
    );
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response.items)?);
        return Ok(());
    }
    describe_filters(&bounds, &canonical);
    println!("共 {} 只股票", response.total);
    for row in &response.items {
        println!("{}", format_row(row));
    }
    Ok(())
}

fn format_row(row: &ScreeningRow) -> String {
    let dash = || "-".to_string();
    let market_cap = row
        .market_cap
        .and_then(normalize_magnitude)
        .map(|v| format!("{v:.2} 亿"))
        .unwrap_or_else(dash);
    let pe = row
        .pe_ratio
        .map(|v| format_display(FilterKey::Pe, v))
        .unwrap_or_else(dash);
    let pb = row
        .pb_ratio
        .map(|v| format_display(FilterKey::Pb, v))
        .unwrap_or_else(dash);
    let momentum = row
        .momentum
        .map(|v| format_display(FilterKey::Momentum, v))
        .unwrap_or_else(dash);
    let rsi = row
        .rsi
        .map(|v| format_display(FilterKey::Rsi, v))
        .unwrap_or_else(dash);
    format!(
        "{:<8} {:<10} {:<8} {:>14} PE {:>8} PB {:>8} 动量 {:>9} RSI {:>6} {}",
        row.symbol,
        row.name,
        row.market,
        market_cap,
        pe,
        pb,
        momentum,
        rsi,
        row.industry.as_deref().unwrap_or("")
    )
}

async fn run_export(client: &DashboardClient, args: &ExportArgs) -> anyhow::Result<()> {
    let (bounds, canonical) = prepare_filters(&args.filters)?;
    describe_filters(&bounds, &canonical);
    let payload = ExportPayload::new(args.file_type, &canonical);
    let bytes = client.export(&payload).await?;
    let path = args.output_path();
    fs::write(&path, &bytes).with_context(|| format!("无法写入 {}", path.display()))?;
    info!(path = %path.display(), bytes = bytes.len(), "exported screening result");
    println!("已导出 {} 字节到 {}", bytes.len(), path.display());
    Ok(())
}

async fn run_sync(client: &DashboardClient, command: &SyncCommand) -> anyhow::Result<()> {
    let started = match command.daily_request() {
        Some(request) => client.start_daily_sync(&request).await?,
        None => client.start_stock_sync().await?,
    };
    let count = match started {
        SyncStart::Accepted { count } => count,
        SyncStart::Rejected(detail) => bail!("同步任务未启动: {detail}"),
    };
    info!(job = command.job_name(), ?count, "sync job started");

    let tracking = command.tracking();
    let (tx, mut rx) = broadcast::channel::<Command>(64);
    let token = PollToken::new();
    let mut tracker = SyncTracker::new(
        client,
        TokioClock::new(),
        tracking.tracker_config(),
        tx.clone(),
    )
    .with_token(token.clone());
    let track = async {
        let outcome = tracker.run().await;
        let _ = tx.send(Command::Exit);
        outcome
    };
    let (outcome, view_result) = if tracking.headless {
        let follow = async {
            follow_headless(&mut rx, &token).await;
            Ok::<(), color_eyre::Report>(())
        };
        tokio::join!(track, follow)
    } else {
        let mut view = SyncProgressView::new(command.job_name(), token.clone());
        tokio::join!(track, view.run(&mut rx))
    };

    let store = SyncEventStore::new(SyncEventStore::default_path());
    if let Err(err) = store.append(&SyncEventEntry::from_outcome(command.job_name(), &outcome)) {
        warn!("failed to record sync outcome: {err:#}");
    }
    view_result.map_err(|err| anyhow!(err.to_string()))?;

    match outcome {
        TrackerOutcome::Finished {
            message,
            refresh_listing,
        } => {
            println!("同步完成: {message}");
            if refresh_listing {
                let page = client.query_stocks("", LISTING_PAGE_SIZE, 0).await?;
                println!("股票列表已刷新, 共 {} 只", page.total);
                for item in &page.items {
                    println!("  {:<8} {:<10} {}", item.symbol, item.name, item.market);
                }
            }
            Ok(())
        }
        TrackerOutcome::Failed(message) => bail!("同步失败: {message}"),
        TrackerOutcome::TimedOut => bail!("同步超时, 任务可能仍在服务器端运行"),
        TrackerOutcome::Cancelled => {
            println!("已停止跟踪, 任务仍在服务器端运行");
            Ok(())
        }
    }
}

async fn follow_headless(rx: &mut broadcast::Receiver<Command>, token: &PollToken) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                token.invalidate();
                return;
            }
            result = rx.recv() => match result {
                Ok(Command::SyncProgress(job)) => {
                    if job.state.is_terminal() {
                        info!(state = ?job.state, "sync job reached a terminal state");
                    }
                    println!(
                        "[{:>3}%] {}/{} {}",
                        job.percent(),
                        job.current,
                        job.total,
                        job.message
                    );
                }
                Ok(Command::Error(message)) => println!("{message}"),
                Ok(Command::Exit) | Err(broadcast::error::RecvError::Closed) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    }
}

fn show_history(limit: usize) -> anyhow::Result<()> {
    let entries = SyncEventStore::new(SyncEventStore::default_path()).load()?;
    if entries.is_empty() {
        println!("暂无同步记录");
        return Ok(());
    }
    let skip = entries.len().saturating_sub(limit);
    for entry in entries.iter().skip(skip) {
        println!(
            "{} {:<7} {:<10} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.job,
            entry.outcome,
            entry.message
        );
    }
    Ok(())
}

async fn show_market_cap(client: &DashboardClient, json: bool) -> anyhow::Result<()> {
    let (stats, entries) =
        tokio::try_join!(client.dashboard_stats(), client.market_cap_distribution())?;
    let raw_count = entries.len();
    let slices = normalize_market_caps(entries, ScalePolicy::MARKET_CAP);
    info!(raw_count, kept = slices.len(), "normalized market caps");
    if json {
        let body = serde_json::json!({ "stats": stats, "market_cap": slices });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }
    println!(
        "股票 {} 只  回测 {} 次  选股方案 {} 个  数据状态 {}",
        stats.stock_count, stats.backtest_count, stats.screening_count, stats.data_status
    );
    for (slice, share) in slices.iter().zip(shares(&slices)) {
        println!(
            "{:<8} {:<10} {:>12.2} 亿 {:>6.2}%",
            slice.symbol, slice.name, slice.value, share
        );
    }
    Ok(())
}
