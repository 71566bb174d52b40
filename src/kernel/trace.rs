//! Instrumentation and Tracing System
//!
//! Provides tracing and statistics for the scheduler and the engine-task
//! lifecycle.
//!
//! Design:
//! - Lightweight event tracing with timestamps
//! - Counters for lifecycle outcomes (searches, ponder hits, lock denials)
//! - Ring buffer for recent events (bounded memory)
//! - Disabled by default; recording is a cheap no-op until enabled
//!
//! The tracer is thread-local: everything in this crate runs on one thread.

use std::cell::RefCell;
use std::collections::VecDeque;

/// Maximum number of events to keep in the trace buffer
const TRACE_BUFFER_SIZE: usize = 1000;

/// Trace event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TraceCategory {
    /// Task create/kill/reap
    Scheduler,
    /// Activity transitions
    Lifecycle,
    /// Engine lock acquire/release/denial
    Lock,
    /// Clock start/stop, flag fall
    Clock,
    /// Engine message dispatch
    Message,
    /// Automated play and matches
    AutoPlay,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCategory::Scheduler => write!(f, "SCHED"),
            TraceCategory::Lifecycle => write!(f, "LIFE"),
            TraceCategory::Lock => write!(f, "LOCK"),
            TraceCategory::Clock => write!(f, "CLOCK"),
            TraceCategory::Message => write!(f, "MSG"),
            TraceCategory::AutoPlay => write!(f, "AUTO"),
        }
    }
}

/// A single trace event
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// Timestamp in milliseconds (last time reported to the tracer)
    pub timestamp: f64,
    /// Event category
    pub category: TraceCategory,
    /// Event name/type
    pub name: String,
    /// Optional details
    pub detail: Option<String>,
    /// Associated session (if any)
    pub session: Option<usize>,
}

impl TraceEvent {
    /// Create a new instant event
    pub fn instant(timestamp: f64, category: TraceCategory, name: impl Into<String>) -> Self {
        Self {
            timestamp,
            category,
            name: name.into(),
            detail: None,
            session: None,
        }
    }

    /// Add details
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Add session ID
    pub fn with_session(mut self, session: usize) -> Self {
        self.session = Some(session);
        self
    }
}

/// Performance counters for timed operations
#[derive(Debug, Clone, Default)]
pub struct PerfCounters {
    /// Total call count
    pub count: u64,
    /// Total time spent (ms)
    pub total_time: f64,
    /// Minimum call time (ms)
    pub min_time: f64,
    /// Maximum call time (ms)
    pub max_time: f64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            count: 0,
            total_time: 0.0,
            min_time: f64::MAX,
            max_time: 0.0,
        }
    }

    /// Record a completed operation
    pub fn record(&mut self, duration: f64) {
        self.count += 1;
        self.total_time += duration;
        if duration < self.min_time {
            self.min_time = duration;
        }
        if duration > self.max_time {
            self.max_time = duration;
        }
    }

    /// Average time per call
    pub fn avg_time(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_time / self.count as f64
        }
    }
}

/// Scheduler statistics (kept per scheduler)
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Task turns resumed by the run loop
    pub turns: u64,
    /// Switches that actually handed the thread to another task
    pub switches: u64,
    /// Tasks created (the main task included)
    pub tasks_created: u64,
    /// Tasks that ended by returning
    pub tasks_completed: u64,
    /// Tasks removed by kill or by shutdown
    pub tasks_killed: u64,
    /// Create calls refused for lack of a free slot
    pub create_failures: u64,
    /// Most tasks active at once
    pub peak_active: usize,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lifecycle statistics
#[derive(Debug, Clone, Default)]
pub struct LifecycleStats {
    pub searches_started: u64,
    pub searches_completed: u64,
    pub searches_aborted: u64,
    pub ponder_hits: u64,
    pub ponder_misses: u64,
    pub lock_denials: u64,
    pub time_forfeits: u64,
    /// Wall time of completed searches
    pub search_time: PerfCounters,
}

impl LifecycleStats {
    pub fn new() -> Self {
        Self {
            search_time: PerfCounters::new(),
            ..Self::default()
        }
    }

    /// Fraction of finished ponder searches that were hits
    pub fn ponder_hit_rate(&self) -> f64 {
        let total = self.ponder_hits + self.ponder_misses;
        if total == 0 {
            0.0
        } else {
            self.ponder_hits as f64 / total as f64
        }
    }
}

/// The main tracer/instrumentation system
#[derive(Debug)]
pub struct Tracer {
    /// Whether tracing is enabled
    enabled: bool,
    /// Category filter (None = all)
    filter: Option<Vec<TraceCategory>>,
    /// Ring buffer of recent events
    events: VecDeque<TraceEvent>,
    /// Lifecycle statistics (always counted)
    pub lifecycle: LifecycleStats,
    /// Latest time reported by a time source
    now: f64,
}

impl Tracer {
    /// Create a new tracer
    pub fn new() -> Self {
        Self {
            enabled: false,
            filter: None,
            events: VecDeque::with_capacity(TRACE_BUFFER_SIZE),
            lifecycle: LifecycleStats::new(),
            now: 0.0,
        }
    }

    /// Enable tracing
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Disable tracing
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Check if tracing is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Set category filter (None = trace all)
    pub fn set_filter(&mut self, categories: Option<Vec<TraceCategory>>) {
        self.filter = categories;
    }

    /// Report the current time; later events are stamped with it
    pub fn set_time(&mut self, now: f64) {
        self.now = now;
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    /// Check if category should be traced
    fn should_trace(&self, category: TraceCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.filter {
            None => true,
            Some(cats) => cats.contains(&category),
        }
    }

    /// Record a trace event
    pub fn trace(&mut self, event: TraceEvent) {
        if !self.should_trace(event.category) {
            return;
        }

        // Maintain ring buffer size
        if self.events.len() >= TRACE_BUFFER_SIZE {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Get recent events
    pub fn events(&self) -> &VecDeque<TraceEvent> {
        &self.events
    }

    /// Get events of a specific category
    pub fn events_by_category(&self, category: TraceCategory) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| e.category == category)
            .collect()
    }

    /// Get events for a specific session
    pub fn events_by_session(&self, session: usize) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| e.session == Some(session))
            .collect()
    }

    /// Reset everything (events and stats)
    pub fn reset(&mut self) {
        self.events.clear();
        self.lifecycle = LifecycleStats::new();
    }

    /// Get a summary report
    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            enabled: self.enabled,
            event_count: self.events.len(),
            searches_started: self.lifecycle.searches_started,
            searches_completed: self.lifecycle.searches_completed,
            searches_aborted: self.lifecycle.searches_aborted,
            ponder_hit_rate: self.lifecycle.ponder_hit_rate(),
            lock_denials: self.lifecycle.lock_denials,
            time_forfeits: self.lifecycle.time_forfeits,
            avg_search_time: self.lifecycle.search_time.avg_time(),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of trace/stats data
#[derive(Debug, Clone)]
pub struct TraceSummary {
    pub enabled: bool,
    pub event_count: usize,
    pub searches_started: u64,
    pub searches_completed: u64,
    pub searches_aborted: u64,
    pub ponder_hit_rate: f64,
    pub lock_denials: u64,
    pub time_forfeits: u64,
    pub avg_search_time: f64,
}

impl std::fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Engine Statistics ===")?;
        writeln!(f, "Tracing: {}", if self.enabled { "ON" } else { "OFF" })?;
        writeln!(f, "Events buffered: {}", self.event_count)?;
        writeln!(f)?;
        writeln!(f, "--- Searches ---")?;
        writeln!(f, "Started: {}", self.searches_started)?;
        writeln!(f, "Completed: {}", self.searches_completed)?;
        writeln!(f, "Aborted: {}", self.searches_aborted)?;
        writeln!(f, "Avg time: {:.1}ms", self.avg_search_time)?;
        writeln!(f, "Ponder hit rate: {:.0}%", self.ponder_hit_rate * 100.0)?;
        writeln!(f)?;
        writeln!(f, "--- Contention ---")?;
        writeln!(f, "Lock denials: {}", self.lock_denials)?;
        writeln!(f, "Time forfeits: {}", self.time_forfeits)?;
        Ok(())
    }
}

thread_local! {
    static TRACER: RefCell<Tracer> = RefCell::new(Tracer::new());
}

/// Run `f` with the thread's tracer
pub fn with_tracer<R>(f: impl FnOnce(&mut Tracer) -> R) -> R {
    TRACER.with(|t| f(&mut t.borrow_mut()))
}

/// Record an event stamped with the tracer's current time
pub fn record(category: TraceCategory, name: &str, detail: Option<String>) {
    with_tracer(|t| {
        if t.should_trace(category) {
            let mut event = TraceEvent::instant(t.now, category, name);
            event.detail = detail;
            t.trace(event);
        }
    });
}

/// Record an event that belongs to a session
pub fn record_session(category: TraceCategory, session: usize, name: &str, detail: Option<String>) {
    with_tracer(|t| {
        if t.should_trace(category) {
            let mut event = TraceEvent::instant(t.now, category, name).with_session(session);
            event.detail = detail;
            t.trace(event);
        }
    });
}

/// Update lifecycle counters
pub fn count(f: impl FnOnce(&mut LifecycleStats)) {
    with_tracer(|t| f(&mut t.lifecycle));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_disabled_by_default() {
        let tracer = Tracer::new();
        assert!(!tracer.is_enabled());
    }

    #[test]
    fn test_trace_event_builders() {
        let event = TraceEvent::instant(100.0, TraceCategory::Lock, "acquire")
            .with_detail("engine=1")
            .with_session(3);
        assert_eq!(event.timestamp, 100.0);
        assert_eq!(event.detail.as_deref(), Some("engine=1"));
        assert_eq!(event.session, Some(3));
    }

    #[test]
    fn test_tracer_filter() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.set_filter(Some(vec![TraceCategory::Lifecycle]));

        tracer.trace(TraceEvent::instant(1.0, TraceCategory::Lifecycle, "think"));
        tracer.trace(TraceEvent::instant(2.0, TraceCategory::Scheduler, "create"));
        tracer.trace(TraceEvent::instant(3.0, TraceCategory::Lifecycle, "idle"));

        assert_eq!(tracer.events().len(), 2);
    }

    #[test]
    fn test_tracer_ring_buffer() {
        let mut tracer = Tracer::new();
        tracer.enable();

        for i in 0..TRACE_BUFFER_SIZE + 100 {
            tracer.trace(TraceEvent::instant(i as f64, TraceCategory::Message, "drain"));
        }

        assert_eq!(tracer.events().len(), TRACE_BUFFER_SIZE);
        assert_eq!(tracer.events().front().unwrap().timestamp, 100.0);
    }

    #[test]
    fn test_global_record_uses_reported_time() {
        with_tracer(|t| {
            t.reset();
            t.enable();
            t.set_filter(None);
            t.set_time(250.0);
        });

        record_session(TraceCategory::Clock, 2, "start", Some("white".into()));
        record(TraceCategory::Scheduler, "create", None);

        let (by_session, stamp) = with_tracer(|t| {
            let stamp = t.events().back().map(|e| e.timestamp);
            (t.events_by_session(2).len(), stamp)
        });
        assert_eq!(by_session, 1);
        assert_eq!(stamp, Some(250.0));

        with_tracer(|t| {
            t.disable();
            t.reset();
        });
    }

    #[test]
    fn test_ponder_hit_rate() {
        let mut stats = LifecycleStats::new();
        assert_eq!(stats.ponder_hit_rate(), 0.0);
        stats.ponder_hits = 3;
        stats.ponder_misses = 1;
        assert_eq!(stats.ponder_hit_rate(), 0.75);
    }

    #[test]
    fn test_summary_display() {
        let mut tracer = Tracer::new();
        tracer.lifecycle.searches_started = 4;
        tracer.lifecycle.lock_denials = 1;
        let text = tracer.summary().to_string();
        assert!(text.contains("Started: 4"));
        assert!(text.contains("Lock denials: 1"));
    }
}
