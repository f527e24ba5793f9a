use std::ops::Range;
use std::time::{Duration, Instant};

use color_eyre::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Chart, Dataset, Gauge, GraphType, Paragraph, Wrap};
use ratatui::{DefaultTerminal, Frame};
use tokio::sync::broadcast;

use crate::chart::{AxisGroup, ChartSpec, SeriesData, ZoomWindow};
use crate::command::Command;
use crate::indicators::{VolumeDirection, latest_defined};
use crate::tracker::{PollToken, SyncJob};

const PAN_STEP: f64 = 5.0;
const ZOOM_IN_FACTOR: f64 = 0.8;
const ZOOM_OUT_FACTOR: f64 = 1.25;
const MA_COLORS: [Color; 4] = [Color::Yellow, Color::Magenta, Color::Cyan, Color::Blue];
// A-share convention: red rises, green falls.
const UP_COLOR: Color = Color::Red;
const DOWN_COLOR: Color = Color::Green;

fn is_exit_key(key: &KeyEvent) -> bool {
    matches!(
        key.code,
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc
    ) || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
}

/// Dual-pane price/volume chart. Both panes always show the same slice of
/// the category axis.
pub struct ChartView {
    spec: ChartSpec,
    title: String,
    initial_zoom: ZoomWindow,
    min_redraw_gap: Duration,
}

impl ChartView {
    pub fn new(spec: ChartSpec, title: impl Into<String>) -> Self {
        let initial_zoom = spec.zoom;
        ChartView {
            spec,
            title: title.into(),
            initial_zoom,
            min_redraw_gap: Duration::from_millis(100),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut terminal = ratatui::init();
        let result = self.event_loop(&mut terminal).await;
        ratatui::restore();
        result
    }

    async fn event_loop(&mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        let mut input_tick = tokio::time::interval(self.min_redraw_gap);
        terminal.draw(|frame| self.render(frame))?;
        loop {
            input_tick.tick().await;
            match self.poll_input()? {
                InputOutcome::Exit => return Ok(()),
                InputOutcome::Redraw => {
                    terminal.draw(|frame| self.render(frame))?;
                }
                InputOutcome::Idle => {}
            }
        }
    }

    fn poll_input(&mut self) -> Result<InputOutcome> {
        let mut outcome = InputOutcome::Idle;
        while event::poll(Duration::from_millis(0))? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if self.handle_key_event(key) {
                        return Ok(InputOutcome::Exit);
                    }
                    outcome = InputOutcome::Redraw;
                }
                Event::Resize(_, _) => outcome = InputOutcome::Redraw,
                _ => {}
            }
        }
        Ok(outcome)
    }

    /// Returns `true` when the view should close.
    fn handle_key_event(&mut self, key: KeyEvent) -> bool {
        if is_exit_key(&key) {
            return true;
        }
        let mut zoom = self.spec.zoom;
        match key.code {
            KeyCode::Left | KeyCode::Char('h') => zoom.pan(-PAN_STEP),
            KeyCode::Right | KeyCode::Char('l') => zoom.pan(PAN_STEP),
            KeyCode::Char('+') | KeyCode::Char('=') => zoom.zoom(ZOOM_IN_FACTOR),
            KeyCode::Char('-') | KeyCode::Char('_') => zoom.zoom(ZOOM_OUT_FACTOR),
            KeyCode::Char('0') => zoom = self.initial_zoom,
            KeyCode::Char('a') => zoom = ZoomWindow::full(),
            _ => return false,
        }
        self.spec.set_zoom(zoom);
        false
    }

    fn visible_range(&self) -> Range<usize> {
        self.spec.zoom.visible_range(self.spec.categories.len())
    }

    fn render(&self, frame: &mut Frame) {
        let range = self.visible_range();
        let constraints = if self.spec.has_volume_pane() {
            vec![
                Constraint::Percentage(68),
                Constraint::Min(6),
                Constraint::Length(1),
            ]
        } else {
            vec![Constraint::Min(6), Constraint::Length(1)]
        };
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(frame.area());
        self.render_price_pane(frame, chunks[0], range.clone());
        if self.spec.has_volume_pane() {
            self.render_volume_pane(frame, chunks[1], range);
        }
        let footer = chunks[chunks.len() - 1];
        self.render_footer(frame, footer);
    }

    fn render_price_pane(&self, frame: &mut Frame, area: Rect, range: Range<usize>) {
        let mut views: Vec<(String, Vec<(f64, f64)>, Color)> = Vec::new();
        let mut title_spans = vec![Span::styled(
            self.title.clone(),
            Style::default().add_modifier(Modifier::BOLD),
        )];
        let mut ma_idx = 0;
        for series in self.spec.series_in(AxisGroup::Price) {
            match &series.data {
                SeriesData::Candles(candles) => {
                    let closes: Vec<Option<f64>> =
                        candles.iter().map(|candle| Some(candle.close)).collect();
                    if let Some(last) = latest_defined(&closes[range.clone()]) {
                        title_spans.push(Span::raw(format!("  收 {last:.2}")));
                    }
                    views.push((
                        "收盘".to_string(),
                        line_points(&closes, range.clone()),
                        Color::White,
                    ));
                }
                SeriesData::Line(values) => {
                    let color = MA_COLORS[ma_idx % MA_COLORS.len()];
                    ma_idx += 1;
                    let latest = latest_defined(&values[range.clone()])
                        .map(|v| format!("{v:.2}"))
                        .unwrap_or_else(|| "--".to_string());
                    title_spans.push(Span::styled(
                        format!("  {} {latest}", series.name),
                        Style::default().fg(color),
                    ));
                    views.push((series.name.clone(), line_points(values, range.clone()), color));
                }
                SeriesData::Bars(_) => {}
            }
        }
        let (min_y, max_y) = value_bounds(views.iter().flat_map(|(_, points, _)| points.iter()));
        let datasets: Vec<Dataset> = views
            .iter()
            .map(|(name, points, color)| {
                Dataset::default()
                    .name(name.clone())
                    .marker(symbols::Marker::Braille)
                    .graph_type(GraphType::Line)
                    .style(Style::default().fg(*color))
                    .data(points)
            })
            .collect();
        let chart = Chart::new(datasets)
            .block(Block::bordered().title(Line::from(title_spans)))
            .x_axis(self.category_axis(range))
            .y_axis(
                Axis::default()
                    .title("价格")
                    .style(Style::default().fg(Color::Gray))
                    .labels(value_labels(min_y, max_y, |v| format!("{v:.2}")))
                    .bounds(padded(min_y, max_y)),
            );
        frame.render_widget(chart, area);
    }

    fn render_volume_pane(&self, frame: &mut Frame, area: Rect, range: Range<usize>) {
        let mut up = Vec::new();
        let mut down = Vec::new();
        let mut name = String::new();
        for series in self.spec.series_in(AxisGroup::Volume) {
            if let SeriesData::Bars(bars) = &series.data {
                name = series.name.clone();
                for bar in &bars[range.clone()] {
                    let point = (bar.index as f64, bar.volume as f64);
                    match bar.direction {
                        VolumeDirection::Up => up.push(point),
                        VolumeDirection::Down => down.push(point),
                    }
                }
            }
        }
        let max_volume = up
            .iter()
            .chain(down.iter())
            .map(|(_, v)| *v)
            .fold(0.0_f64, f64::max)
            .max(1.0);
        let datasets = vec![
            Dataset::default()
                .marker(symbols::Marker::HalfBlock)
                .graph_type(GraphType::Bar)
                .style(Style::default().fg(UP_COLOR))
                .data(&up),
            Dataset::default()
                .marker(symbols::Marker::HalfBlock)
                .graph_type(GraphType::Bar)
                .style(Style::default().fg(DOWN_COLOR))
                .data(&down),
        ];
        let chart = Chart::new(datasets)
            .block(Block::bordered().title(name))
            .x_axis(self.category_axis(range))
            .y_axis(
                Axis::default()
                    .style(Style::default().fg(Color::Gray))
                    .labels(value_labels(0.0, max_volume, format_volume))
                    .bounds([0.0, max_volume * 1.05]),
            );
        frame.render_widget(chart, area);
    }

    fn category_axis(&self, range: Range<usize>) -> Axis<'static> {
        let label = |idx: usize| {
            self.spec
                .categories
                .get(idx)
                .map(|date| date.format("%Y-%m-%d").to_string())
                .unwrap_or_default()
        };
        let (first, last) = if range.is_empty() {
            (0, 0)
        } else {
            (range.start, range.end - 1)
        };
        let mid = (first + last) / 2;
        Axis::default()
            .style(Style::default().fg(Color::Gray))
            .labels(vec![
                Span::styled(label(first), Style::default().add_modifier(Modifier::BOLD)),
                Span::raw(label(mid)),
                Span::styled(label(last), Style::default().add_modifier(Modifier::BOLD)),
            ])
            .labels_alignment(Alignment::Left)
            .bounds([first as f64 - 0.5, last as f64 + 0.5])
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let zoom = self.spec.zoom;
        let text = Line::from(vec![
            Span::styled(
                format!("区间 {:.0}%-{:.0}%", zoom.start(), zoom.end()),
                Style::default().fg(Color::Cyan),
            ),
            Span::raw("  ←/→ 平移  +/- 缩放  0 复位  a 全部  q 退出"),
        ]);
        frame.render_widget(Paragraph::new(text), area);
    }
}

enum InputOutcome {
    Idle,
    Redraw,
    Exit,
}

fn line_points(values: &[Option<f64>], range: Range<usize>) -> Vec<(f64, f64)> {
    values[range.clone()]
        .iter()
        .zip(range)
        .filter_map(|(value, idx)| value.map(|v| (idx as f64, v)))
        .collect()
}

fn value_bounds<'a>(points: impl Iterator<Item = &'a (f64, f64)>) -> (f64, f64) {
    let (min, max) = points
        .map(|(_, y)| *y)
        .filter(|y| y.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), y| {
            (lo.min(y), hi.max(y))
        });
    if min.is_finite() && max.is_finite() {
        (min, max)
    } else {
        (0.0, 1.0)
    }
}

fn padded(min: f64, max: f64) -> [f64; 2] {
    if (max - min).abs() < f64::EPSILON {
        let padding = (max.abs() * 0.05).max(1.0);
        [min - padding, max + padding]
    } else {
        let padding = (max - min) * 0.05;
        [min - padding, max + padding]
    }
}

fn value_labels(min: f64, max: f64, fmt: impl Fn(f64) -> String) -> Vec<Span<'static>> {
    vec![
        Span::styled(fmt(min), Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(fmt(f64::midpoint(min, max))),
        Span::styled(fmt(max), Style::default().add_modifier(Modifier::BOLD)),
    ]
}

fn format_volume(value: f64) -> String {
    if value >= 1e8 {
        format!("{:.2}亿", value / 1e8)
    } else if value >= 1e4 {
        format!("{:.1}万", value / 1e4)
    } else {
        format!("{value:.0}")
    }
}

/// Progress gauge for one tracked sync job. Closes on the terminal report
/// or when the user quits; quitting invalidates the tracker's poll token.
pub struct SyncProgressView {
    job_name: String,
    token: PollToken,
    job: SyncJob,
    status_message: Option<String>,
    status_is_error: bool,
    min_redraw_gap: Duration,
    last_draw: Instant,
}

impl SyncProgressView {
    pub fn new(job_name: impl Into<String>, token: PollToken) -> Self {
        let min_redraw_gap = Duration::from_millis(100);
        SyncProgressView {
            job_name: job_name.into(),
            token,
            job: SyncJob::default(),
            status_message: None,
            status_is_error: false,
            min_redraw_gap,
            last_draw: Instant::now() - min_redraw_gap,
        }
    }

    pub async fn run(&mut self, rx: &mut broadcast::Receiver<Command>) -> Result<()> {
        let mut terminal = ratatui::init();
        let result = self.event_loop(&mut terminal, rx).await;
        ratatui::restore();
        result
    }

    async fn event_loop(
        &mut self,
        terminal: &mut DefaultTerminal,
        rx: &mut broadcast::Receiver<Command>,
    ) -> Result<()> {
        let mut input_tick = tokio::time::interval(self.min_redraw_gap);
        terminal.draw(|frame| self.render(frame))?;
        loop {
            tokio::select! {
                biased;
                _ = input_tick.tick() => {
                    while event::poll(Duration::from_millis(0))? {
                        if let Event::Key(key) = event::read()? {
                            if key.kind == KeyEventKind::Press && is_exit_key(&key) {
                                self.token.invalidate();
                                return Ok(());
                            }
                        }
                    }
                }
                result = rx.recv() => {
                    match result {
                        Ok(command) => {
                            if self.apply(command) {
                                terminal.draw(|frame| self.render(frame))?;
                                return Ok(());
                            }
                            if self.last_draw.elapsed() >= self.min_redraw_gap {
                                terminal.draw(|frame| self.render(frame))?;
                                self.last_draw = Instant::now();
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Folds one bus message into the view. Returns `true` on the terminal
    /// report.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::SyncProgress(job) => {
                self.job = job;
                if self.status_is_error {
                    self.status_message = None;
                    self.status_is_error = false;
                }
                false
            }
            Command::Error(message) => {
                self.status_message = Some(message);
                self.status_is_error = true;
                false
            }
            Command::SyncFinished {
                message,
                refresh_listing,
            } => {
                self.status_message = Some(if refresh_listing {
                    format!("{message} 正在刷新股票列表...")
                } else {
                    message
                });
                self.status_is_error = false;
                true
            }
            Command::SyncFailed(message) => {
                self.status_message = Some(message);
                self.status_is_error = true;
                true
            }
            Command::SyncTimedOut => {
                self.status_message = Some("同步超时".to_string());
                self.status_is_error = true;
                true
            }
            Command::Exit => true,
        }
    }

    fn gauge_label(&self) -> String {
        let mut label = format!(
            "{}% ({}/{})",
            self.job.percent(),
            self.job.current,
            self.job.total
        );
        if self.job.state.is_terminal() {
            label.push_str(" 收尾中");
        }
        label
    }

    fn render(&self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(2),
                Constraint::Length(1),
            ])
            .split(frame.area());
        let gauge = Gauge::default()
            .block(Block::bordered().title(format!("同步 {}", self.job_name)))
            .gauge_style(Style::default().fg(Color::Green))
            .ratio(self.job.ratio())
            .label(self.gauge_label());
        frame.render_widget(gauge, chunks[0]);

        let (text, style) = match &self.status_message {
            Some(message) if self.status_is_error => {
                (message.clone(), Style::default().fg(Color::Red))
            }
            Some(message) => (message.clone(), Style::default().fg(Color::Green)),
            None => (self.job.message.clone(), Style::default()),
        };
        frame.render_widget(
            Paragraph::new(text).style(style).wrap(Wrap { trim: true }),
            chunks[1],
        );
        frame.render_widget(Paragraph::new("q 停止跟踪"), chunks[2]);
    }
}
