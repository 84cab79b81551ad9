use std::{
    collections::{BTreeMap, HashSet},
    env,
    future::Future,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::logscope_core::{LogEntry, Observer, QueryValidationError, Status, TransportError, Viewport};
use crate::logscope_fetch::{CoordinatorSettings, DEFAULT_PAGE_SIZE};
use crate::logscope_http::HttpLogSource;
use crate::logscope_session::{LogSource, Session, StatusBoard};
use crate::logscope_store::MAX_ENTRIES;
use crate::logscope_tui::{LogView, StatusLine, TuiError, ViewAction};
use crate::logscope_window::{Pinned, ScrollState, DEFAULT_BUFFER_ROWS};
use crate::sanitize::sanitize_message;
use clap::{Parser, Subcommand};
use crossterm::{
    event::{self, Event, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use reqwest::Url;
use serde::Deserialize;
use smol_str::SmolStr;
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDRESS: &str = "http://127.0.0.1:3337";
const DEFAULT_BATCH_DELAY_MS: u64 = 100;
const DEFAULT_SEARCH_COUNT: usize = 100;
const CONFIG_FILE: &str = "logscope.json";
const ADDRESS_FILE: &str = ".logscope/address";
const TUI_TICK_MS: u64 = 50;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "logscope", version, about = "Search and follow a remote log backend")]
struct Cli {
    #[arg(long, global = true)]
    address: Option<String>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    token: Option<String>,
    #[arg(long, global = true)]
    page_size: Option<usize>,
    #[arg(long, global = true)]
    max_entries: Option<usize>,
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    stream: bool,
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    no_stream: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Print the newest entries matching a query.
    Search {
        query: Option<String>,
        #[arg(long, default_value_t = DEFAULT_SEARCH_COUNT)]
        count: usize,
    },
    /// Follow new entries as they arrive.
    Tail {
        query: Option<String>,
        #[arg(long, default_value_t = 0)]
        backfill: usize,
    },
    /// Browse entries interactively.
    View { query: Option<String> },
}

#[derive(Debug, Clone)]
struct Config {
    address: Url,
    token: Option<String>,
    page_size: usize,
    max_entries: usize,
    batch_delay_ms: u64,
    buffer_rows: usize,
    stream: bool,
}

#[derive(Debug, Default, Clone)]
struct PartialConfig {
    address: Option<String>,
    token: Option<String>,
    page_size: Option<usize>,
    max_entries: Option<usize>,
    batch_delay_ms: Option<u64>,
    buffer_rows: Option<usize>,
    stream: Option<bool>,
}

impl PartialConfig {
    fn merge(&mut self, other: PartialConfig) {
        if other.address.is_some() {
            self.address = other.address;
        }
        if other.token.is_some() {
            self.token = other.token;
        }
        if other.page_size.is_some() {
            self.page_size = other.page_size;
        }
        if other.max_entries.is_some() {
            self.max_entries = other.max_entries;
        }
        if other.batch_delay_ms.is_some() {
            self.batch_delay_ms = other.batch_delay_ms;
        }
        if other.buffer_rows.is_some() {
            self.buffer_rows = other.buffer_rows;
        }
        if other.stream.is_some() {
            self.stream = other.stream;
        }
    }
}

impl Config {
    fn from_partial(partial: PartialConfig) -> Result<Self, ConfigError> {
        let address = partial.address.unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        Ok(Self {
            address: parse_address(&address)?,
            token: partial.token.filter(|token| !token.trim().is_empty()),
            page_size: partial.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
            max_entries: partial.max_entries.unwrap_or(MAX_ENTRIES).max(1),
            batch_delay_ms: partial.batch_delay_ms.unwrap_or(DEFAULT_BATCH_DELAY_MS),
            buffer_rows: partial.buffer_rows.unwrap_or(DEFAULT_BUFFER_ROWS),
            stream: partial.stream.unwrap_or(false),
        })
    }

    fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            page_size: self.page_size,
            max_entries: self.max_entries,
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            streaming: self.stream,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    address: Option<String>,
    token: Option<String>,
    #[serde(alias = "pageSize")]
    page_size: Option<usize>,
    #[serde(alias = "maxEntries")]
    max_entries: Option<usize>,
    #[serde(alias = "batchDelayMs")]
    batch_delay_ms: Option<u64>,
    #[serde(alias = "bufferRows")]
    buffer_rows: Option<usize>,
    stream: Option<bool>,
}

impl FileConfig {
    fn into_partial(self) -> PartialConfig {
        PartialConfig {
            address: self.address,
            token: self.token,
            page_size: self.page_size,
            max_entries: self.max_entries,
            batch_delay_ms: self.batch_delay_ms,
            buffer_rows: self.buffer_rows,
            stream: self.stream,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: PathBuf, source: serde_json::Error },
    #[error("config file not found: {path}")]
    MissingConfig { path: PathBuf },
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid backend address {value}: {reason}")]
    InvalidAddress { value: String, reason: String },
}

fn cli_overrides(cli: &Cli) -> PartialConfig {
    let stream = if cli.no_stream {
        Some(false)
    } else if cli.stream {
        Some(true)
    } else {
        None
    };
    PartialConfig {
        address: cli.address.clone(),
        token: cli.token.clone(),
        page_size: cli.page_size,
        max_entries: cli.max_entries,
        stream,
        ..PartialConfig::default()
    }
}

fn env_overrides(env: &BTreeMap<String, String>) -> Result<PartialConfig, ConfigError> {
    let mut partial = PartialConfig::default();
    if let Some(address) = env.get("LOGSCOPE_ADDRESS") {
        partial.address = Some(address.clone());
    }
    if let Some(value) = env.get("LOGSCOPE_TOKEN") {
        if !value.trim().is_empty() {
            partial.token = Some(value.clone());
        }
    }
    if let Some(value) = env.get("LOGSCOPE_PAGE_SIZE") {
        partial.page_size = Some(parse_usize("LOGSCOPE_PAGE_SIZE", value)?);
    }
    if let Some(value) = env.get("LOGSCOPE_MAX_ENTRIES") {
        partial.max_entries = Some(parse_usize("LOGSCOPE_MAX_ENTRIES", value)?);
    }
    if let Some(value) = env.get("LOGSCOPE_BATCH_DELAY_MS") {
        partial.batch_delay_ms = Some(parse_u64("LOGSCOPE_BATCH_DELAY_MS", value)?);
    }
    if let Some(value) = env.get("LOGSCOPE_BUFFER_ROWS") {
        partial.buffer_rows = Some(parse_usize("LOGSCOPE_BUFFER_ROWS", value)?);
    }
    if let Some(value) = env.get("LOGSCOPE_STREAM") {
        partial.stream = Some(parse_bool("LOGSCOPE_STREAM", value)?);
    }
    Ok(partial)
}

fn parse_usize(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

fn parse_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() }),
    }
}

/// Accepts `host:port` shorthand by assuming plain http.
fn parse_address(value: &str) -> Result<Url, ConfigError> {
    let trimmed = value.trim();
    let candidate =
        if trimmed.contains("://") { trimmed.to_string() } else { format!("http://{trimmed}") };
    let url = Url::parse(&candidate).map_err(|error| ConfigError::InvalidAddress {
        value: value.to_string(),
        reason: error.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidAddress {
            value: value.to_string(),
            reason: format!("unsupported scheme `{other}`"),
        }),
    }
}

fn load_config_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let parsed: FileConfig = serde_json::from_str(&contents)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })?;
    Ok(parsed.into_partial())
}

fn find_config_path(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    None
}

/// Address written by a local backend install, if any.
fn address_file(env: &BTreeMap<String, String>) -> Option<String> {
    let home = env.get("HOME")?;
    let contents = std::fs::read_to_string(Path::new(home).join(ADDRESS_FILE)).ok()?;
    let address = contents.trim();
    (!address.is_empty()).then(|| address.to_string())
}

fn resolve_config(
    cli: &Cli,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(Config, Option<PathBuf>), ConfigError> {
    let mut partial = PartialConfig::default();

    let config_path = if let Some(path) = &cli.config {
        if !path.is_file() {
            return Err(ConfigError::MissingConfig { path: path.clone() });
        }
        Some(path.clone())
    } else {
        find_config_path(cwd)
    };

    if let Some(path) = config_path.as_ref() {
        let file_partial = load_config_file(path)?;
        partial.merge(file_partial);
    }

    let env_partial = env_overrides(env)?;
    partial.merge(env_partial);

    let cli_partial = cli_overrides(cli);
    partial.merge(cli_partial);

    if partial.address.is_none() {
        partial.address = address_file(env);
    }
    let config = Config::from_partial(partial)?;
    Ok((config, config_path))
}

fn init_tracing(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init();
}

fn write_entry<W: Write>(out: &mut W, entry: &LogEntry) -> io::Result<()> {
    write!(out, "{} {:<5}", entry.timestamp, entry.level.as_str())?;
    for prop in &entry.props {
        write!(out, " {}={}", prop.key, sanitize_message(&prop.value))?;
    }
    writeln!(out, " {}", sanitize_message(&entry.msg))
}

async fn drive_until_settled<S, O, V>(session: &mut Session<S, O, V>)
where
    S: LogSource,
    O: Observer,
    V: Viewport,
{
    while !session.is_settled() {
        match session.next_event().await {
            Some(event) => session.dispatch(event),
            None => break,
        }
    }
}

/// Pages backwards until `count` entries are loaded or the query runs dry,
/// then writes them newest first. Returns how many were written.
async fn search<S, W>(
    source: S,
    mut settings: CoordinatorSettings,
    query: String,
    count: usize,
    out: &mut W,
) -> Result<usize, DynError>
where
    S: LogSource,
    W: Write,
{
    let count = count.max(1);
    settings.streaming = false;
    settings.max_entries = settings.max_entries.max(count);
    let mut session =
        Session::new(Handle::current(), source, StatusBoard::default(), Pinned::new(count), settings);
    session.submit_query(query);
    drive_until_settled(&mut session).await;

    let coordinator = session.coordinator();
    if let Some(rejected) = coordinator.observer().rejected() {
        return Err(rejected.clone().into());
    }
    if let Status::Error(message) = coordinator.status() {
        return Err(format!("search failed: {message}").into());
    }
    if coordinator.malformed_dropped() > 0 {
        warn!(dropped = coordinator.malformed_dropped(), "skipped malformed entries");
    }

    let entries = coordinator.store().entries();
    let shown = entries.len().min(count);
    for entry in &entries[..shown] {
        write_entry(out, entry)?;
    }
    out.flush()?;
    Ok(shown)
}

/// Observer for `tail`: writes entries it has not printed yet, oldest first.
struct TailPrinter<W> {
    out: W,
    printing: bool,
    seen: HashSet<SmolStr>,
    status: Status,
    rejected: Option<QueryValidationError>,
    stream_ended: bool,
    stream_error: Option<String>,
    write_error: Option<io::Error>,
}

impl<W: Write> TailPrinter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            printing: false,
            seen: HashSet::new(),
            status: Status::Idle,
            rejected: None,
            stream_ended: false,
            stream_error: None,
            write_error: None,
        }
    }

    /// Prints the newest `backfill` entries of `snapshot` and marks all of
    /// it as seen. Later notifications print only new arrivals.
    fn start(&mut self, snapshot: &[LogEntry], backfill: usize) -> io::Result<()> {
        let shown = snapshot.len().min(backfill);
        for entry in snapshot[..shown].iter().rev() {
            write_entry(&mut self.out, entry)?;
        }
        self.out.flush()?;
        self.seen = snapshot.iter().map(|entry| entry.id.clone()).collect();
        self.printing = true;
        Ok(())
    }

    fn print_fresh(&mut self, snapshot: &[LogEntry]) -> io::Result<()> {
        for entry in snapshot.iter().rev().filter(|entry| !self.seen.contains(&entry.id)) {
            write_entry(&mut self.out, entry)?;
        }
        self.out.flush()
    }
}

impl<W: Write> Observer for TailPrinter<W> {
    fn entries_changed(&mut self, snapshot: &[LogEntry], inserted: usize) {
        if !self.printing || inserted == 0 || self.write_error.is_some() {
            return;
        }
        if let Err(error) = self.print_fresh(snapshot) {
            self.write_error = Some(error);
        }
        self.seen = snapshot.iter().map(|entry| entry.id.clone()).collect();
    }

    fn status_changed(&mut self, status: &Status) {
        self.status = status.clone();
    }

    fn stream_ended(&mut self, error: Option<&TransportError>) {
        self.stream_ended = true;
        self.stream_error = error.map(ToString::to_string);
    }

    fn query_rejected(&mut self, error: &QueryValidationError) {
        self.rejected = Some(error.clone());
    }
}

/// Prints an optional backfill, then follows the live stream until
/// `shutdown` resolves or the server ends the stream.
async fn tail<S, W, F>(
    source: S,
    mut settings: CoordinatorSettings,
    query: String,
    backfill: usize,
    out: W,
    shutdown: F,
) -> Result<(), DynError>
where
    S: LogSource,
    W: Write,
    F: Future<Output = ()>,
{
    settings.streaming = false;
    settings.page_size = settings.page_size.min(backfill).max(1);
    let mut session =
        Session::new(Handle::current(), source, TailPrinter::new(out), Pinned::new(backfill), settings);
    session.submit_query(query);
    drive_until_settled(&mut session).await;

    let printer = session.coordinator().observer();
    if let Some(rejected) = &printer.rejected {
        return Err(rejected.clone().into());
    }
    if let Status::Error(message) = &printer.status {
        return Err(format!("backfill failed: {message}").into());
    }

    let backlog = session.coordinator().store().entries().to_vec();
    session.coordinator_mut().observer_mut().start(&backlog, backfill)?;
    session.set_streaming(true);
    info!(backfill = backlog.len().min(backfill), "following live stream");

    tokio::pin!(shutdown);
    let outcome: Result<(), DynError> = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            event = session.next_event() => match event {
                Some(event) => session.dispatch(event),
                None => break Ok(()),
            },
        }
        let pending = session.coordinator().pending_batch();
        let printer = session.coordinator_mut().observer_mut();
        if let Some(error) = printer.write_error.take() {
            break Err(error.into());
        }
        // Entries received before the stream ended are still printed.
        if printer.stream_ended && pending == 0 {
            break match printer.stream_error.take() {
                Some(error) => Err(format!("live stream failed: {error}").into()),
                None => Ok(()),
            };
        }
    };
    session.teardown();
    outcome
}

async fn run_view<S: LogSource>(source: S, config: Config, query: String) -> Result<(), DynError> {
    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || run_view_loop(runtime, source, config, query)).await??;
    Ok(())
}

fn request_more_if_near_end<S, O>(session: &mut Session<S, O, ScrollState>)
where
    S: LogSource,
    O: Observer,
{
    let coordinator = session.coordinator();
    if coordinator.viewport().near_end(coordinator.store().len()) {
        session.notify_near_end_of_data();
    }
}

fn run_view_loop<S: LogSource>(
    runtime: Handle,
    source: S,
    config: Config,
    query: String,
) -> Result<(), DynError> {
    let _guard = TerminalGuard::enter()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
    terminal.clear()?;

    let mut session = Session::new(
        runtime,
        source,
        StatusBoard::default(),
        ScrollState::new(config.buffer_rows),
        config.coordinator_settings(),
    );
    let mut view = LogView::new(&query);
    session.submit_query(query);
    let mut generation = session.coordinator().generation();

    loop {
        if session.pump() > 0 {
            let fresh_query = session.coordinator().generation() != generation;
            generation = session.coordinator().generation();
            let (store, scroll) = session.coordinator_mut().split_view();
            if fresh_query {
                view.reset(scroll);
            }
            view.reanchor(scroll, store.entries());
        }

        let footer = {
            let coordinator = session.coordinator();
            StatusLine {
                status: coordinator.status().clone(),
                streaming: coordinator.is_streaming(),
                malformed: coordinator.malformed_dropped(),
                notice: coordinator.observer().notice().map(str::to_string),
            }
        };
        let height_before = session.coordinator().viewport().viewport_height;
        {
            let (store, scroll) = session.coordinator_mut().split_view();
            terminal.draw(|frame| view.render(frame, store.entries(), scroll, &footer))?;
        }
        if session.coordinator().viewport().viewport_height != height_before {
            request_more_if_near_end(&mut session);
        }

        if !event::poll(Duration::from_millis(TUI_TICK_MS))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let action = {
            let (store, scroll) = session.coordinator_mut().split_view();
            view.handle_key(key, scroll, store.entries())
        };
        match action {
            ViewAction::None => {}
            ViewAction::Quit => break,
            ViewAction::Scrolled => {
                if session.coordinator().viewport().at_top() {
                    session.notify_scrolled_to_top();
                }
                request_more_if_near_end(&mut session);
            }
            ViewAction::SubmitQuery(query) => {
                session.coordinator_mut().observer_mut().clear_notice();
                session.submit_query(query);
            }
            ViewAction::ToggleStream => {
                let enabled = !session.coordinator().is_streaming();
                session.coordinator_mut().observer_mut().clear_notice();
                session.set_streaming(enabled);
            }
        }
    }

    session.teardown();
    terminal.show_cursor()?;
    Ok(())
}

struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> Result<Self, TuiError> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
    }
}

pub async fn run() -> Result<(), DynError> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Command::View { query: None });
    init_tracing(if matches!(command, Command::View { .. }) { "off" } else { "info" });

    let cwd = env::current_dir()?;
    let env_map: BTreeMap<String, String> = env::vars().collect();
    let (config, config_path) = resolve_config(&cli, &cwd, &env_map)?;

    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded config file");
    }
    info!(
        address = %config.address,
        page_size = config.page_size,
        max_entries = config.max_entries,
        batch_delay_ms = config.batch_delay_ms,
        buffer_rows = config.buffer_rows,
        stream = config.stream,
        auth_enabled = config.token.is_some(),
        "resolved config"
    );

    let source = HttpLogSource::new(&config.address, config.token.clone())?;
    match command {
        Command::Search { query, count } => {
            let mut out = io::stdout();
            let settings = config.coordinator_settings();
            let shown = search(source, settings, query.unwrap_or_default(), count, &mut out).await?;
            info!(shown, "search finished");
            Ok(())
        }
        Command::Tail { query, backfill } => {
            let shutdown = async {
                if let Err(error) = tokio::signal::ctrl_c().await {
                    warn!(%error, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            };
            let settings = config.coordinator_settings();
            tail(source, settings, query.unwrap_or_default(), backfill, io::stdout(), shutdown).await
        }
        Command::View { query } => run_view(source, config, query.unwrap_or_default()).await,
    }
}
