//! Fetch coordinator: decides when to page backwards, owns the live stream,
//! and feeds both paths into one entry store.

use tracing::{debug, info, warn};

use crate::logscope_batch::Batcher;
use crate::logscope_core::{
    LogEntry, Observer, Page, PageRequest, Scheduler, Status, StreamHandle, StreamRequest,
    TimerId, Timestamp, Transport, TransportError, Viewport,
};
use crate::logscope_store::{EntryStore, MergeReport};

pub const DEFAULT_PAGE_SIZE: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Exhausted,
}

#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    pub page_size: usize,
    pub max_entries: usize,
    pub batch_delay: std::time::Duration,
    pub streaming: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_entries: crate::logscope_store::MAX_ENTRIES,
            batch_delay: crate::logscope_batch::DEFAULT_BATCH_DELAY,
            streaming: false,
        }
    }
}

pub struct FetchCoordinator<T, S, O, V>
where
    T: Transport,
{
    transport: T,
    scheduler: S,
    observer: O,
    viewport: V,
    store: EntryStore,
    batcher: Batcher,
    page_size: usize,
    generation: u64,
    query: Option<String>,
    phase: Phase,
    status: Status,
    cursor: Option<Timestamp>,
    /// `before` of the outstanding page request.
    in_flight: Option<Option<Timestamp>>,
    /// `before` of the last page request that completed successfully.
    last_completed: Option<Option<Timestamp>>,
    stream: Option<T::Stream>,
    /// Id of the most recently opened stream; events from older ones are stale.
    stream_seq: u64,
    streaming: bool,
    malformed_dropped: u64,
    torn_down: bool,
}

impl<T, S, O, V> FetchCoordinator<T, S, O, V>
where
    T: Transport,
    S: Scheduler,
    O: Observer,
    V: Viewport,
{
    pub fn new(transport: T, scheduler: S, observer: O, viewport: V, settings: CoordinatorSettings) -> Self {
        Self {
            transport,
            scheduler,
            observer,
            viewport,
            store: EntryStore::new(settings.max_entries),
            batcher: Batcher::new(settings.batch_delay),
            page_size: settings.page_size.max(1),
            generation: 0,
            query: None,
            phase: Phase::Idle,
            status: Status::Idle,
            cursor: None,
            in_flight: None,
            last_completed: None,
            stream: None,
            stream_seq: 0,
            streaming: settings.streaming,
            malformed_dropped: 0,
            torn_down: false,
        }
    }

    /// Starts a new query session: drops everything tied to the previous
    /// query and requests the newest page.
    pub fn set_query(&mut self, query: impl Into<String>) {
        if self.torn_down {
            return;
        }
        let query = query.into();
        self.generation = self.generation.wrapping_add(1);
        info!(generation = self.generation, query = %query, "query changed");

        self.close_stream();
        let dropped = self.batcher.discard(&mut self.scheduler);
        if dropped > 0 {
            debug!(dropped, "discarded pending stream entries of previous query");
        }
        self.store.clear();
        self.cursor = None;
        self.in_flight = None;
        self.last_completed = None;
        self.phase = Phase::Idle;
        self.query = Some(query);
        self.observer.entries_changed(self.store.entries(), 0);

        self.issue_page();
        if self.streaming {
            self.open_stream();
        }
    }

    /// The consumer is close to the last loaded row. Returns `true` when an
    /// older page was requested.
    pub fn notify_near_end_of_data(&mut self) -> bool {
        if self.torn_down || self.query.is_none() {
            return false;
        }
        match self.phase {
            Phase::Fetching => {
                debug!("page request already in flight");
                return false;
            }
            Phase::Exhausted => return false,
            Phase::Idle => {}
        }
        if self.last_completed.as_ref() == Some(&self.cursor) {
            debug!(cursor = ?self.cursor, "cursor did not advance, suppressing page request");
            return false;
        }
        self.issue_page();
        true
    }

    pub fn on_page_loaded(&mut self, generation: u64, result: Result<Page, TransportError>) {
        if generation != self.generation || self.phase != Phase::Fetching {
            debug!(generation, current = self.generation, "discarding stale page response");
            return;
        }
        let requested = self.in_flight.take().unwrap_or_default();

        let page = match result {
            Ok(page) => page,
            Err(error) => {
                warn!(%error, cursor = ?requested, "page request failed");
                self.phase = Phase::Idle;
                self.set_status(Status::Error(error.to_string()));
                return;
            }
        };

        self.record_malformed(page.malformed);
        let report = self.store.merge(page.entries, self.viewport.at_top());
        self.last_completed = Some(requested);

        if report.inserted == 0 {
            debug!(generation, "page brought nothing new, query exhausted");
            self.phase = Phase::Exhausted;
        } else {
            self.cursor = report.oldest_inserted.clone();
            self.phase = Phase::Idle;
        }
        self.publish(&report);
        self.set_status(match self.phase {
            Phase::Exhausted => Status::Exhausted,
            _ => Status::Idle,
        });

        if self.phase == Phase::Idle && self.viewport.near_end(self.store.len()) {
            self.notify_near_end_of_data();
        }
    }

    pub fn on_stream_entry(&mut self, generation: u64, stream: u64, entry: LogEntry) {
        if !self.is_current_stream(generation, stream) {
            return;
        }
        self.batcher.push(entry, &mut self.scheduler);
    }

    pub fn on_stream_malformed(&mut self, generation: u64, stream: u64) {
        if self.is_current_stream(generation, stream) {
            self.record_malformed(1);
        }
    }

    pub fn on_stream_ended(&mut self, generation: u64, stream: u64, error: Option<TransportError>) {
        if !self.is_current_stream(generation, stream) {
            debug!(generation, stream, "ignoring end of a replaced stream");
            return;
        }
        self.close_stream();
        match &error {
            Some(error) => warn!(%error, "live stream failed"),
            None => info!("live stream closed by server"),
        }
        self.observer.stream_ended(error.as_ref());
    }

    pub fn on_timer(&mut self, timer: TimerId) {
        if !self.batcher.owns(timer) {
            return;
        }
        let at_top = self.viewport.at_top();
        if let Some(report) = self.batcher.flush(timer, &mut self.store, at_top) {
            self.publish(&report);
        }
    }

    /// Turns the live subscription on or off for the current query.
    pub fn set_streaming(&mut self, enabled: bool) {
        if self.torn_down {
            return;
        }
        self.streaming = enabled;
        if enabled {
            if self.stream.is_none() && self.query.is_some() {
                self.open_stream();
            }
        } else {
            self.close_stream();
            self.batcher.discard(&mut self.scheduler);
        }
    }

    /// Applies eviction deferred while the consumer was reading history.
    pub fn notify_scrolled_to_top(&mut self) {
        let evicted = self.store.evict_overflow();
        if evicted > 0 {
            debug!(evicted, "applied deferred eviction");
            self.rewind_after_eviction();
            self.observer.entries_changed(self.store.entries(), 0);
        }
    }

    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.generation = self.generation.wrapping_add(1);
        self.close_stream();
        self.batcher.discard(&mut self.scheduler);
        self.in_flight = None;
        self.phase = Phase::Idle;
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cursor(&self) -> Option<&Timestamp> {
        self.cursor.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn streaming_enabled(&self) -> bool {
        self.streaming
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn malformed_dropped(&self) -> u64 {
        self.malformed_dropped
    }

    /// Stream entries waiting for the batch timer.
    pub fn pending_batch(&self) -> usize {
        self.batcher.pending_len()
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn viewport(&self) -> &V {
        &self.viewport
    }

    pub fn viewport_mut(&mut self) -> &mut V {
        &mut self.viewport
    }

    /// Entries and viewport at once, for a renderer that lays out the
    /// viewport while reading the rows.
    pub fn split_view(&mut self) -> (&EntryStore, &mut V) {
        (&self.store, &mut self.viewport)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    fn issue_page(&mut self) {
        let Some(query) = self.query.clone() else {
            return;
        };
        let request = PageRequest {
            generation: self.generation,
            query,
            before: self.cursor.clone(),
            limit: self.page_size,
        };
        debug!(generation = request.generation, before = ?request.before, "requesting page");
        self.in_flight = Some(request.before.clone());
        self.phase = Phase::Fetching;
        self.set_status(Status::Fetching);
        self.transport.fetch_older_page(request);
    }

    fn open_stream(&mut self) {
        let Some(query) = self.query.clone() else {
            return;
        };
        self.stream_seq = self.stream_seq.wrapping_add(1);
        let request = StreamRequest { generation: self.generation, stream: self.stream_seq, query };
        debug!(generation = request.generation, stream = request.stream, "opening live stream");
        self.stream = Some(self.transport.open_stream(request));
    }

    fn is_current_stream(&self, generation: u64, stream: u64) -> bool {
        generation == self.generation && stream == self.stream_seq && self.stream.is_some()
    }

    fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.cancel();
        }
    }

    /// Points the cursor at the new tail so the evicted range can be paged
    /// in again.
    fn rewind_after_eviction(&mut self) {
        self.cursor = self.store.oldest_timestamp().cloned();
        if self.phase == Phase::Exhausted {
            self.phase = Phase::Idle;
            self.set_status(Status::Idle);
        }
    }

    fn publish(&mut self, report: &MergeReport) {
        if report.evicted > 0 {
            debug!(evicted = report.evicted, "evicted oldest entries");
            self.rewind_after_eviction();
        }
        self.observer.entries_changed(self.store.entries(), report.inserted);
    }

    fn record_malformed(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.malformed_dropped = self.malformed_dropped.saturating_add(count as u64);
        warn!(count, total = self.malformed_dropped, "dropped malformed entries");
    }

    fn set_status(&mut self, status: Status) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.observer.status_changed(&self.status);
    }
}

impl<T, S, O, V> Drop for FetchCoordinator<T, S, O, V>
where
    T: Transport,
{
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.cancel();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::logscope_core::{
        LogEntry, LogLevel, Observer, PageRequest, Status, StreamHandle, StreamRequest, Timestamp,
        Transport, TransportError, Viewport,
    };

    pub(crate) fn entry(id: &str, second: u32) -> LogEntry {
        LogEntry::new(id, Timestamp::new(format!("2024-01-01T00:00:{second:02}Z")), LogLevel::Info, id)
    }

    #[derive(Debug, Default)]
    pub(crate) struct TransportLog {
        pub(crate) pages: Vec<PageRequest>,
        pub(crate) streams: Vec<StreamRequest>,
        pub(crate) cancelled: Vec<u64>,
    }

    #[derive(Clone, Debug, Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) log: Rc<RefCell<TransportLog>>,
    }

    pub(crate) struct RecordedStream {
        stream: u64,
        log: Rc<RefCell<TransportLog>>,
    }

    impl StreamHandle for RecordedStream {
        fn cancel(&mut self) {
            self.log.borrow_mut().cancelled.push(self.stream);
        }
    }

    impl Transport for RecordingTransport {
        type Stream = RecordedStream;

        fn fetch_older_page(&mut self, request: PageRequest) {
            self.log.borrow_mut().pages.push(request);
        }

        fn open_stream(&mut self, request: StreamRequest) -> Self::Stream {
            let stream = request.stream;
            self.log.borrow_mut().streams.push(request);
            RecordedStream { stream, log: self.log.clone() }
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingObserver {
        pub(crate) snapshots: Vec<(Vec<String>, usize)>,
        pub(crate) statuses: Vec<Status>,
        pub(crate) stream_ends: Vec<Option<String>>,
    }

    impl Observer for RecordingObserver {
        fn entries_changed(&mut self, snapshot: &[LogEntry], inserted: usize) {
            let ids = snapshot.iter().map(|entry| entry.id.to_string()).collect();
            self.snapshots.push((ids, inserted));
        }

        fn status_changed(&mut self, status: &Status) {
            self.statuses.push(status.clone());
        }

        fn stream_ended(&mut self, error: Option<&TransportError>) {
            self.stream_ends.push(error.map(ToString::to_string));
        }
    }

    /// Viewport whose answers the test sets directly.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct FixedView {
        pub(crate) at_top: bool,
        pub(crate) near_end: bool,
    }

    impl Default for FixedView {
        fn default() -> Self {
            Self { at_top: true, near_end: false }
        }
    }

    impl Viewport for FixedView {
        fn at_top(&self) -> bool {
            self.at_top
        }

        fn near_end(&self, _loaded: usize) -> bool {
            self.near_end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{entry, FixedView, RecordingObserver, RecordingTransport};
    use super::*;
    use crate::logscope_batch::testing::ManualScheduler;
    use crate::logscope_window::Pinned;
    use rstest::{fixture, rstest};
    use std::time::Duration;

    type TestCoordinator<V = FixedView> =
        FetchCoordinator<RecordingTransport, ManualScheduler, RecordingObserver, V>;

    fn settings(page_size: usize, max_entries: usize) -> CoordinatorSettings {
        CoordinatorSettings { page_size, max_entries, ..CoordinatorSettings::default() }
    }

    #[fixture]
    fn coordinator() -> TestCoordinator {
        FetchCoordinator::new(
            RecordingTransport::default(),
            ManualScheduler::default(),
            RecordingObserver::default(),
            FixedView::default(),
            settings(2, 100),
        )
    }

    fn page_count<V: Viewport>(coordinator: &TestCoordinator<V>) -> usize {
        coordinator.transport().log.borrow().pages.len()
    }

    fn last_page<V: Viewport>(coordinator: &TestCoordinator<V>) -> PageRequest {
        coordinator.transport().log.borrow().pages.last().cloned().expect("page request")
    }

    fn open_stream_id<V: Viewport>(coordinator: &TestCoordinator<V>) -> u64 {
        coordinator.transport().log.borrow().streams.last().map(|request| request.stream).expect("stream")
    }

    fn ids<V: Viewport>(coordinator: &TestCoordinator<V>) -> Vec<&str> {
        coordinator.store().entries().iter().map(|entry| entry.id.as_str()).collect()
    }

    #[rstest]
    fn set_query_requests_first_page_anchored_at_now(mut coordinator: TestCoordinator) {
        coordinator.set_query("level = error");

        let request = last_page(&coordinator);
        assert_eq!(request.query, "level = error");
        assert_eq!(request.before, None);
        assert_eq!(request.limit, 2);
        assert_eq!(request.generation, coordinator.generation());
        assert_eq!(coordinator.phase(), Phase::Fetching);
        assert_eq!(coordinator.status(), &Status::Fetching);
    }

    #[rstest]
    fn page_response_advances_cursor_to_oldest_inserted(mut coordinator: TestCoordinator) {
        coordinator.set_query("");
        let generation = coordinator.generation();
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("a", 9), entry("b", 7)])));

        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(coordinator.cursor().map(Timestamp::as_str), Some("2024-01-01T00:00:07Z"));
        assert_eq!(ids(&coordinator), vec!["a", "b"]);
        let expected = (vec!["a".to_string(), "b".to_string()], 2);
        assert_eq!(coordinator.observer().snapshots.last(), Some(&expected));

        assert!(coordinator.notify_near_end_of_data());
        assert_eq!(last_page(&coordinator).before, Some(Timestamp::new("2024-01-01T00:00:07Z")));
    }

    #[rstest]
    fn at_most_one_page_request_in_flight(mut coordinator: TestCoordinator) {
        coordinator.set_query("");
        let generation = coordinator.generation();
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("a", 9)])));

        assert!(coordinator.notify_near_end_of_data());
        assert!(!coordinator.notify_near_end_of_data());
        assert!(!coordinator.notify_near_end_of_data());
        assert_eq!(page_count(&coordinator), 2);
    }

    #[rstest]
    fn empty_page_exhausts_until_query_changes(mut coordinator: TestCoordinator) {
        coordinator.set_query("");
        let generation = coordinator.generation();
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("a", 9)])));
        coordinator.notify_near_end_of_data();
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("a", 9)])));

        assert_eq!(coordinator.phase(), Phase::Exhausted);
        assert_eq!(coordinator.status(), &Status::Exhausted);
        assert!(!coordinator.notify_near_end_of_data());
        assert_eq!(page_count(&coordinator), 2);

        coordinator.set_query("other");
        assert_eq!(page_count(&coordinator), 3);
        assert_eq!(coordinator.phase(), Phase::Fetching);
    }

    #[rstest]
    fn stale_response_after_query_change_is_discarded(mut coordinator: TestCoordinator) {
        coordinator.set_query("old");
        let stale = coordinator.generation();
        coordinator.set_query("new");
        let current = coordinator.generation();

        coordinator.on_page_loaded(stale, Ok(Page::new(vec![entry("old-1", 5)])));
        assert!(coordinator.store().is_empty());
        assert_eq!(coordinator.phase(), Phase::Fetching);

        coordinator.on_page_loaded(current, Ok(Page::new(vec![entry("new-1", 4)])));
        assert_eq!(ids(&coordinator), vec!["new-1"]);
    }

    #[rstest]
    fn failure_keeps_entries_and_cursor_for_retry(mut coordinator: TestCoordinator) {
        coordinator.set_query("");
        let generation = coordinator.generation();
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("a", 9), entry("b", 8)])));
        coordinator.notify_near_end_of_data();
        let error = TransportError::Status { status: 502, body: "bad gateway".into() };
        coordinator.on_page_loaded(generation, Err(error));

        assert_eq!(coordinator.phase(), Phase::Idle);
        assert!(matches!(coordinator.status(), Status::Error(message) if message.contains("502")));
        assert_eq!(ids(&coordinator), vec!["a", "b"]);

        assert!(coordinator.notify_near_end_of_data());
        assert_eq!(last_page(&coordinator).before, Some(Timestamp::new("2024-01-01T00:00:08Z")));
    }

    #[rstest]
    fn cursor_that_did_not_move_is_not_requested_again(mut coordinator: TestCoordinator) {
        coordinator.set_query("");
        let generation = coordinator.generation();
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("a", 9), entry("b", 8)])));
        coordinator.notify_near_end_of_data();
        // The only new entry shares the cursor's timestamp.
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("b", 8), entry("c", 8)])));
        assert_eq!(coordinator.cursor().map(Timestamp::as_str), Some("2024-01-01T00:00:08Z"));

        assert!(!coordinator.notify_near_end_of_data());
        assert_eq!(page_count(&coordinator), 2);
    }

    #[test]
    fn pagination_chains_until_viewport_is_satisfied() {
        let mut coordinator: TestCoordinator<Pinned> = FetchCoordinator::new(
            RecordingTransport::default(),
            ManualScheduler::default(),
            RecordingObserver::default(),
            Pinned::new(5),
            settings(2, 100),
        );
        coordinator.set_query("");
        let generation = coordinator.generation();

        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("a", 9), entry("b", 8)])));
        assert_eq!(page_count(&coordinator), 2);
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("c", 7), entry("d", 6)])));
        assert_eq!(page_count(&coordinator), 3);
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("e", 5), entry("f", 4)])));

        assert_eq!(page_count(&coordinator), 3);
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(coordinator.store().len(), 6);
    }

    #[test]
    fn pagination_chain_stops_when_exhausted() {
        let mut coordinator: TestCoordinator<Pinned> = FetchCoordinator::new(
            RecordingTransport::default(),
            ManualScheduler::default(),
            RecordingObserver::default(),
            Pinned::new(100),
            settings(2, 100),
        );
        coordinator.set_query("");
        let generation = coordinator.generation();
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("a", 9)])));
        coordinator.on_page_loaded(generation, Ok(Page::default()));

        assert_eq!(page_count(&coordinator), 2);
        assert_eq!(coordinator.status(), &Status::Exhausted);
    }

    #[rstest]
    fn stream_entries_are_batched_and_never_move_cursor(mut coordinator: TestCoordinator) {
        coordinator.set_streaming(true);
        coordinator.set_query("");
        let generation = coordinator.generation();
        let stream = open_stream_id(&coordinator);
        assert!(coordinator.is_streaming());
        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("a", 5)])));
        let notifications = coordinator.observer().snapshots.len();

        coordinator.on_stream_entry(generation, stream, entry("live-1", 20));
        coordinator.on_stream_entry(generation, stream, entry("live-2", 21));
        coordinator.on_stream_entry(generation, stream, entry("old", 1));
        assert_eq!(coordinator.observer().snapshots.len(), notifications);

        let fired = coordinator.scheduler_mut().advance(Duration::from_millis(100));
        assert_eq!(fired.len(), 1);
        coordinator.on_timer(fired[0]);

        assert_eq!(coordinator.observer().snapshots.len(), notifications + 1);
        assert_eq!(coordinator.observer().snapshots.last().map(|(_, inserted)| *inserted), Some(3));
        assert_eq!(ids(&coordinator), vec!["live-2", "live-1", "a", "old"]);
        assert_eq!(coordinator.cursor().map(Timestamp::as_str), Some("2024-01-01T00:00:05Z"));
    }

    #[rstest]
    fn query_change_cancels_stream_and_pending_batch(mut coordinator: TestCoordinator) {
        coordinator.set_streaming(true);
        coordinator.set_query("first");
        let first = coordinator.generation();
        let first_stream = open_stream_id(&coordinator);
        coordinator.on_stream_entry(first, first_stream, entry("x", 3));

        coordinator.set_query("second");
        let second = coordinator.generation();
        let second_stream = open_stream_id(&coordinator);
        {
            let log = coordinator.transport().log.borrow();
            assert_eq!(log.cancelled, vec![first_stream]);
            assert_eq!(log.streams.len(), 2);
            assert_eq!(log.streams[1].query, "second");
        }
        assert_eq!(coordinator.scheduler().armed(), 0);

        coordinator.on_stream_entry(first, first_stream, entry("late", 4));
        assert_eq!(coordinator.scheduler().armed(), 0);
        coordinator.on_stream_entry(second, second_stream, entry("fresh", 4));
        assert_eq!(coordinator.scheduler().armed(), 1);
    }

    #[rstest]
    fn stream_end_is_reported_without_reconnect(mut coordinator: TestCoordinator) {
        coordinator.set_streaming(true);
        coordinator.set_query("");
        let generation = coordinator.generation();
        let stream = open_stream_id(&coordinator);

        coordinator.on_stream_ended(generation, stream, Some(TransportError::Closed));
        assert!(!coordinator.is_streaming());
        assert_eq!(coordinator.observer().stream_ends, vec![Some("connection closed".to_string())]);
        assert_eq!(coordinator.transport().log.borrow().streams.len(), 1);

        coordinator.on_stream_ended(generation, stream, None);
        assert_eq!(coordinator.observer().stream_ends.len(), 1);
    }

    #[rstest]
    fn end_of_replaced_stream_leaves_reopened_stream_alone(mut coordinator: TestCoordinator) {
        coordinator.set_streaming(true);
        coordinator.set_query("");
        let generation = coordinator.generation();
        let replaced = open_stream_id(&coordinator);

        coordinator.set_streaming(false);
        coordinator.set_streaming(true);
        let current = open_stream_id(&coordinator);
        assert_ne!(replaced, current);

        coordinator.on_stream_ended(generation, replaced, None);
        coordinator.on_stream_entry(generation, replaced, entry("ghost", 30));
        assert!(coordinator.is_streaming());
        assert!(coordinator.observer().stream_ends.is_empty());
        assert_eq!(coordinator.pending_batch(), 0);

        coordinator.on_stream_entry(generation, current, entry("live", 31));
        assert_eq!(coordinator.pending_batch(), 1);

        coordinator.teardown();
        let log = coordinator.transport().log.borrow();
        assert_eq!(log.streams.len(), 2);
        assert_eq!(log.cancelled, vec![replaced, current]);
    }

    #[test]
    fn eviction_waits_for_top_and_applies_on_return() {
        let mut coordinator: TestCoordinator = FetchCoordinator::new(
            RecordingTransport::default(),
            ManualScheduler::default(),
            RecordingObserver::default(),
            FixedView { at_top: false, near_end: false },
            settings(10, 2),
        );
        coordinator.set_query("");
        let generation = coordinator.generation();
        let page = Page::new(vec![entry("a", 3), entry("b", 2), entry("c", 1)]);
        coordinator.on_page_loaded(generation, Ok(page));
        assert_eq!(coordinator.store().len(), 3);

        coordinator.viewport_mut().at_top = true;
        coordinator.notify_scrolled_to_top();
        assert_eq!(ids(&coordinator), vec!["a", "b"]);
    }

    #[test]
    fn eviction_rewinds_cursor_so_the_dropped_range_is_fetched_again() {
        let mut coordinator: TestCoordinator = FetchCoordinator::new(
            RecordingTransport::default(),
            ManualScheduler::default(),
            RecordingObserver::default(),
            FixedView { at_top: false, near_end: false },
            settings(10, 2),
        );
        coordinator.set_query("");
        let generation = coordinator.generation();
        let page = Page::new(vec![entry("a", 3), entry("b", 2), entry("c", 1)]);
        coordinator.on_page_loaded(generation, Ok(page));
        coordinator.notify_near_end_of_data();
        coordinator.on_page_loaded(generation, Ok(Page::default()));
        assert_eq!(coordinator.phase(), Phase::Exhausted);

        coordinator.viewport_mut().at_top = true;
        coordinator.notify_scrolled_to_top();
        assert_eq!(coordinator.cursor().map(Timestamp::as_str), Some("2024-01-01T00:00:02Z"));
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(coordinator.status(), &Status::Idle);

        assert!(coordinator.notify_near_end_of_data());
        assert_eq!(last_page(&coordinator).before, Some(Timestamp::new("2024-01-01T00:00:02Z")));
    }

    #[rstest]
    fn malformed_counts_accumulate(mut coordinator: TestCoordinator) {
        coordinator.set_streaming(true);
        coordinator.set_query("");
        let generation = coordinator.generation();
        let stream = open_stream_id(&coordinator);
        coordinator.on_page_loaded(generation, Ok(Page { entries: vec![entry("a", 1)], malformed: 2 }));
        coordinator.on_stream_malformed(generation, stream);
        coordinator.on_stream_malformed(generation.wrapping_add(7), stream);
        assert_eq!(coordinator.malformed_dropped(), 3);
    }

    #[rstest]
    fn teardown_releases_stream_and_ignores_late_work(mut coordinator: TestCoordinator) {
        coordinator.set_streaming(true);
        coordinator.set_query("");
        let generation = coordinator.generation();
        let stream = open_stream_id(&coordinator);
        coordinator.on_stream_entry(generation, stream, entry("pending", 2));

        coordinator.teardown();
        assert_eq!(coordinator.transport().log.borrow().cancelled, vec![stream]);
        assert_eq!(coordinator.scheduler().armed(), 0);

        coordinator.on_page_loaded(generation, Ok(Page::new(vec![entry("late", 1)])));
        assert!(coordinator.store().is_empty());
        assert!(!coordinator.notify_near_end_of_data());
        coordinator.set_query("ignored");
        assert_eq!(page_count(&coordinator), 1);
    }

    #[rstest]
    fn notify_without_query_does_nothing(mut coordinator: TestCoordinator) {
        assert!(!coordinator.notify_near_end_of_data());
        assert_eq!(page_count(&coordinator), 0);
    }
}
