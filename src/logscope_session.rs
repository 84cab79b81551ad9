//! Tokio runtime adapter: runs network calls and timers as tasks and
//! funnels their results into a single event loop that owns the coordinator.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::logscope_core::{
    LogEntry, Observer, Page, PageRequest, QueryValidationError, Scheduler, Status, StreamHandle,
    StreamItem, StreamRequest, TimerId, Transport, TransportError, Viewport,
};
use crate::logscope_fetch::{CoordinatorSettings, FetchCoordinator, Phase};

const STREAM_BUFFER: usize = 256;

/// Asynchronous access to a log backend.
pub trait LogSource: Send + Sync + 'static {
    fn fetch_page(&self, request: PageRequest) -> impl Future<Output = Result<Page, TransportError>> + Send;

    /// Pushes live entries into `sink` until the server closes the stream,
    /// the request fails, or the receiver is dropped.
    fn stream(
        &self,
        query: String,
        sink: mpsc::Sender<StreamItem>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// `Ok(Some(message))` when the backend rejects the query.
    fn validate_query(
        &self,
        query: String,
    ) -> impl Future<Output = Result<Option<String>, TransportError>> + Send;
}

#[derive(Debug)]
pub enum SessionEvent {
    PageLoaded { generation: u64, result: Result<Page, TransportError> },
    StreamEntry { generation: u64, stream: u64, entry: LogEntry },
    StreamMalformed { generation: u64, stream: u64 },
    StreamEnded { generation: u64, stream: u64, error: Option<TransportError> },
    TimerFired(TimerId),
    QueryChecked { ticket: u64, query: String, verdict: Result<Option<String>, TransportError> },
}

type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Live subscription backed by a spawned task.
#[derive(Debug)]
pub struct TaskStream {
    handle: JoinHandle<()>,
}

impl StreamHandle for TaskStream {
    fn cancel(&mut self) {
        self.handle.abort();
    }
}

pub struct TokioTransport<S> {
    source: Arc<S>,
    runtime: Handle,
    events: EventSender,
}

impl<S: LogSource> Transport for TokioTransport<S> {
    type Stream = TaskStream;

    fn fetch_older_page(&mut self, request: PageRequest) {
        let source = self.source.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let generation = request.generation;
            let result = source.fetch_page(request).await;
            let _ = events.send(SessionEvent::PageLoaded { generation, result });
        });
    }

    fn open_stream(&mut self, request: StreamRequest) -> Self::Stream {
        let source = self.source.clone();
        let events = self.events.clone();
        let handle = self.runtime.spawn(async move {
            let StreamRequest { generation, stream, query } = request;
            let (sink, mut items) = mpsc::channel(STREAM_BUFFER);
            let relay = events.clone();
            let forward = async move {
                while let Some(item) = items.recv().await {
                    let event = match item {
                        StreamItem::Entry(entry) => {
                            SessionEvent::StreamEntry { generation, stream, entry }
                        }
                        StreamItem::Malformed => SessionEvent::StreamMalformed { generation, stream },
                    };
                    if relay.send(event).is_err() {
                        break;
                    }
                }
            };
            let (result, ()) = tokio::join!(source.stream(query, sink), forward);
            let _ = events.send(SessionEvent::StreamEnded { generation, stream, error: result.err() });
        });
        TaskStream { handle }
    }
}

pub struct TokioScheduler {
    runtime: Handle,
    events: EventSender,
    next_id: u64,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    fn new(runtime: Handle, events: EventSender) -> Self {
        Self { runtime, events, next_id: 0, timers: HashMap::new() }
    }

    pub fn pending(&self) -> usize {
        self.timers.values().filter(|handle| !handle.is_finished()).count()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&mut self, delay: Duration) -> TimerId {
        self.timers.retain(|_, handle| !handle.is_finished());
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let events = self.events.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::TimerFired(id));
        });
        self.timers.insert(id, handle);
        id
    }

    fn cancel(&mut self, timer: TimerId) {
        if let Some(handle) = self.timers.remove(&timer) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

pub type SessionCoordinator<S, O, V> = FetchCoordinator<TokioTransport<S>, TokioScheduler, O, V>;

/// One query session: the coordinator plus the channel its tasks report on.
pub struct Session<S, O, V>
where
    S: LogSource,
    O: Observer,
    V: Viewport,
{
    coordinator: SessionCoordinator<S, O, V>,
    source: Arc<S>,
    runtime: Handle,
    events: EventSender,
    inbox: mpsc::UnboundedReceiver<SessionEvent>,
    ticket: u64,
    validating: bool,
}

impl<S, O, V> Session<S, O, V>
where
    S: LogSource,
    O: Observer,
    V: Viewport,
{
    pub fn new(runtime: Handle, source: S, observer: O, viewport: V, settings: CoordinatorSettings) -> Self {
        let source = Arc::new(source);
        let (events, inbox) = mpsc::unbounded_channel();
        let transport = TokioTransport {
            source: source.clone(),
            runtime: runtime.clone(),
            events: events.clone(),
        };
        let scheduler = TokioScheduler::new(runtime.clone(), events.clone());
        let coordinator = FetchCoordinator::new(transport, scheduler, observer, viewport, settings);
        Self { coordinator, source, runtime, events, inbox, ticket: 0, validating: false }
    }

    /// Checks `query` with the backend, then starts it. A rejected query
    /// leaves the current results untouched.
    pub fn submit_query(&mut self, query: impl Into<String>) {
        let query = query.into();
        self.ticket = self.ticket.wrapping_add(1);
        self.validating = true;
        let ticket = self.ticket;
        let source = self.source.clone();
        let events = self.events.clone();
        debug!(ticket, query = %query, "validating query");
        self.runtime.spawn(async move {
            let verdict = source.validate_query(query.clone()).await;
            let _ = events.send(SessionEvent::QueryChecked { ticket, query, verdict });
        });
    }

    /// Starts `query` without asking the backend first.
    pub fn set_query(&mut self, query: impl Into<String>) {
        self.ticket = self.ticket.wrapping_add(1);
        self.validating = false;
        self.coordinator.set_query(query);
    }

    pub fn notify_near_end_of_data(&mut self) -> bool {
        self.coordinator.notify_near_end_of_data()
    }

    pub fn notify_scrolled_to_top(&mut self) {
        self.coordinator.notify_scrolled_to_top();
    }

    pub fn set_streaming(&mut self, enabled: bool) {
        self.coordinator.set_streaming(enabled);
    }

    pub fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::PageLoaded { generation, result } => {
                self.coordinator.on_page_loaded(generation, result);
            }
            SessionEvent::StreamEntry { generation, stream, entry } => {
                self.coordinator.on_stream_entry(generation, stream, entry);
            }
            SessionEvent::StreamMalformed { generation, stream } => {
                self.coordinator.on_stream_malformed(generation, stream);
            }
            SessionEvent::StreamEnded { generation, stream, error } => {
                self.coordinator.on_stream_ended(generation, stream, error);
            }
            SessionEvent::TimerFired(timer) => self.coordinator.on_timer(timer),
            SessionEvent::QueryChecked { ticket, query, verdict } => {
                self.on_query_checked(ticket, query, verdict);
            }
        }
    }

    /// Dispatches every event that is already waiting. Returns how many ran.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0usize;
        while let Ok(event) = self.inbox.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.inbox.recv().await
    }

    /// No validation or page request is outstanding.
    pub fn is_settled(&self) -> bool {
        !self.validating && self.coordinator.phase() != Phase::Fetching
    }

    pub fn teardown(&mut self) {
        self.ticket = self.ticket.wrapping_add(1);
        self.validating = false;
        self.coordinator.teardown();
    }

    pub fn coordinator(&self) -> &SessionCoordinator<S, O, V> {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut SessionCoordinator<S, O, V> {
        &mut self.coordinator
    }

    fn on_query_checked(
        &mut self,
        ticket: u64,
        query: String,
        verdict: Result<Option<String>, TransportError>,
    ) {
        if ticket != self.ticket || self.coordinator.is_torn_down() {
            debug!(ticket, current = self.ticket, "discarding stale query validation");
            return;
        }
        self.validating = false;
        match verdict {
            Ok(None) => self.coordinator.set_query(query),
            Ok(Some(message)) => {
                info!(query = %query, %message, "query rejected");
                let error = QueryValidationError { query, message };
                self.coordinator.observer_mut().query_rejected(&error);
            }
            Err(error) => {
                warn!(%error, "query validation unavailable, running query unchecked");
                self.coordinator.set_query(query);
            }
        }
    }
}

/// Observer that keeps what a status line needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBoard {
    status: Status,
    revision: u64,
    inserted_total: u64,
    notice: Option<String>,
    rejected: Option<QueryValidationError>,
    stream_error: Option<String>,
    stream_ended: bool,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            revision: 0,
            inserted_total: 0,
            notice: None,
            rejected: None,
            stream_error: None,
            stream_ended: false,
        }
    }
}

impl StatusBoard {
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Bumped on every entries notification.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn inserted_total(&self) -> u64 {
        self.inserted_total
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn rejected(&self) -> Option<&QueryValidationError> {
        self.rejected.as_ref()
    }

    pub fn stream_ended(&self) -> bool {
        self.stream_ended
    }

    pub fn stream_error(&self) -> Option<&str> {
        self.stream_error.as_deref()
    }

    pub fn clear_notice(&mut self) {
        self.notice = None;
    }
}

impl Observer for StatusBoard {
    fn entries_changed(&mut self, _snapshot: &[LogEntry], inserted: usize) {
        self.revision = self.revision.wrapping_add(1);
        self.inserted_total = self.inserted_total.saturating_add(inserted as u64);
    }

    fn status_changed(&mut self, status: &Status) {
        self.status = status.clone();
    }

    fn stream_ended(&mut self, error: Option<&TransportError>) {
        self.stream_ended = true;
        self.stream_error = error.map(ToString::to_string);
        self.notice = Some(match error {
            Some(error) => format!("live stream failed: {error}"),
            None => "live stream closed".to_string(),
        });
    }

    fn query_rejected(&mut self, error: &QueryValidationError) {
        self.notice = Some(error.to_string());
        self.rejected = Some(error.clone());
    }
}
