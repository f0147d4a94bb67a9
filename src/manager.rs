//! The `RequestManager`: owns the set of active/inactive/disabled sources
//! for one logical file, dispatches reads to them, and drives the
//! eviction/replacement loop that keeps the active set healthy.
//!
//! Mirrors the `Inner` + free-function idiom `protocols::posix::peer` uses
//! for its background task: the mutable source-list state lives behind one
//! `Mutex` inside an `Arc<ManagerState<W>>`, and the replacement-open
//! completion handler is a free function taking that `Arc` explicitly,
//! since `self: &Arc<Self>` is not an available receiver and the callback
//! must be able to outlive the `RequestManager` handle the caller holds.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::fail::Fail;
use crate::quality::{DecayingQualityMetric, QualityMetric};
use crate::request::{completion_pair, AnyReadFuture, RequestKind};
use crate::source::{dispatch_split, Source};
use crate::wire::{AccessMode, IoSize, IoVec, OpenFlags, Wire};

/// A source's construction-time quality metric, producible fresh for each
/// new `Source` (including replacements) so no state leaks between one
/// source's lifetime and the next.
pub type QualityFactory = Arc<dyn Fn() -> Arc<dyn QualityMetric> + Send + Sync>;

/// Construction-time configuration: open parameters passed through to the
/// wire layer, the quality watermarks and ratio threshold driving eviction,
/// check cadence, and the wire library's maximum chunk size used by the
/// vector splitter.
///
/// Named constants rather than magic numbers, following the pattern
/// `protocols::posix::peer::SLEEP_LENGTH` and `congestion_ctrl::cubic`'s
/// associated consts set: every number here is overridable, but the
/// `Default` impl reproduces the reference implementation's values.
#[derive(Debug, Clone)]
pub struct RequestManagerConfig {
    pub open_flags: OpenFlags,
    pub access_mode: AccessMode,
    /// Quality above which a source is unconditionally eviction-worthy.
    pub high_watermark: i64,
    /// Quality below which a source is never evicted purely on the ratio
    /// rule, regardless of how much worse its peer looks.
    pub low_watermark: i64,
    /// A source is also eviction-worthy if `quality * ratio_threshold <
    /// peer_quality` (not the more intuitive opposite comparison: this
    /// reproduces `XrdRequestManager::checkSources` literally).
    pub ratio_threshold: i64,
    /// Minimum wall-clock spacing between source reconsiderations.
    pub min_check_interval: Duration,
    /// Cadence at which reconsideration is scheduled absent a failure.
    pub recheck_period: Duration,
    /// Back-off applied to `next_check` after a failed replacement open.
    pub open_failure_backoff: Duration,
    /// The wire library's maximum chunk size, used to size each side's
    /// share of a split vector read.
    pub max_chunk_size: IoSize,
}

impl Default for RequestManagerConfig {
    fn default() -> Self {
        Self {
            open_flags: OpenFlags::default(),
            access_mode: AccessMode::default(),
            high_watermark: 5130,
            low_watermark: 260,
            ratio_threshold: 4,
            min_check_interval: Duration::from_secs(1),
            recheck_period: Duration::from_secs(5),
            open_failure_backoff: Duration::from_secs(120),
            max_chunk_size: 512 * 1024,
        }
    }
}

struct SourceLists<W: Wire> {
    active: Vec<Arc<Source<W>>>,
    inactive: Vec<Arc<Source<W>>>,
    disabled: Vec<String>,
    file_opening: bool,
    last_check: Instant,
    next_check: Instant,
    initial_toggle: bool,
}

struct ManagerState<W: Wire> {
    name: String,
    wire: W,
    config: RequestManagerConfig,
    quality_factory: QualityFactory,
    lists: Mutex<SourceLists<W>>,
}

enum SourcePick<W: Wire> {
    Single(Arc<Source<W>>),
    Split(Arc<Source<W>>, Arc<Source<W>>),
}

/// Owns every active/inactive/disabled `Source` for one logical file and
/// serves reads against them.
pub struct RequestManager<W: Wire> {
    state: Arc<ManagerState<W>>,
}

impl<W: Wire> Clone for RequestManager<W> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

fn default_quality_factory() -> QualityFactory {
    Arc::new(|| Arc::new(DecayingQualityMetric::new(0.2)) as Arc<dyn QualityMetric>)
}

impl<W: Wire> RequestManager<W> {
    /// Synchronously opens `name` and constructs a manager with one active
    /// source and the default configuration/quality metric.
    pub fn new(name: impl Into<String>, wire: W) -> Result<Self, Fail> {
        Self::with_config(name, wire, RequestManagerConfig::default(), default_quality_factory())
    }

    /// As [`RequestManager::new`], but with an explicit configuration and
    /// quality-metric factory — the hook `tests` use to swap in a
    /// [`crate::quality::FixedQualityMetric`] so eviction and split-ratio
    /// assertions don't depend on wall-clock timing.
    pub fn with_config(
        name: impl Into<String>,
        wire: W,
        config: RequestManagerConfig,
        quality_factory: QualityFactory,
    ) -> Result<Self, Fail> {
        let name = name.into();
        let handle = wire
            .open_sync(&name, config.open_flags, config.access_mode)
            .map_err(|status| Fail::FileOpen {
                name: name.clone(),
                flags: config.open_flags.0,
                mode: config.access_mode.0,
                status: status.message,
                errno: status.errno,
                code: status.code,
                active_sources: Vec::new(),
            })?;

        let server_id = handle.server_id().to_owned();
        let quality = quality_factory();
        let source = Source::new(server_id.clone(), handle, wire.clone(), quality);
        info!("request manager for '{}': opened initial source '{}'", name, server_id);

        let now = Instant::now();
        let lists = SourceLists {
            active: vec![source],
            inactive: Vec::new(),
            disabled: Vec::new(),
            file_opening: false,
            last_check: now,
            next_check: now + config.recheck_period,
            initial_toggle: false,
        };

        Ok(Self {
            state: Arc::new(ManagerState {
                name,
                wire,
                config,
                quality_factory,
                lists: Mutex::new(lists),
            }),
        })
    }

    /// Names of every currently active source, for diagnostics.
    pub fn active_source_names(&self) -> Vec<String> {
        let lists = self.state.lists.lock().expect("source lock poisoned");
        lists.active.iter().map(|s| s.name().to_owned()).collect()
    }

    /// A shared handle to one active source, for metadata/stat operations
    /// that must be expected to run concurrently with I/O.
    pub fn active_file_handle(&self) -> Option<Arc<Source<W>>> {
        let lists = self.state.lists.lock().expect("source lock poisoned");
        lists.active.first().cloned()
    }

    /// Dispatches a single scalar read.
    pub fn handle_scalar(&self, into: IoVec) -> AnyReadFuture {
        let now = Instant::now();
        maybe_check_sources(&self.state, now);

        let (pick, active_sources) = {
            let mut lists = self.state.lists.lock().expect("source lock poisoned");
            let pick = pick_source(&mut lists, &RequestKind::Scalar(into));
            let active_sources = lists.active.iter().map(|s| s.name().to_owned()).collect();
            (pick, active_sources)
        };
        match pick {
            SourcePick::Single(source) => AnyReadFuture::Single(source.dispatch_read(into, active_sources)),
            SourcePick::Split(..) => unreachable!("a scalar read is never split across sources"),
        }
    }

    /// Dispatches a vector read, splitting it across both active sources
    /// when two are active.
    pub fn handle_vector(&self, chunks: Vec<IoVec>) -> AnyReadFuture {
        if chunks.is_empty() {
            let (tx, fut) = completion_pair();
            let _ = tx.send(Ok(0));
            return AnyReadFuture::Single(fut);
        }

        let now = Instant::now();
        maybe_check_sources(&self.state, now);

        let (pick, active_sources) = {
            let mut lists = self.state.lists.lock().expect("source lock poisoned");
            let pick = pick_source(&mut lists, &RequestKind::Vector(chunks.clone()));
            let active_sources = lists.active.iter().map(|s| s.name().to_owned()).collect::<Vec<_>>();
            (pick, active_sources)
        };

        match pick {
            SourcePick::Single(source) => AnyReadFuture::Single(source.dispatch_read_vector(chunks, active_sources)),
            SourcePick::Split(front, back) => {
                let q_front = front.quality().0;
                let q_back = back.quality().0;
                let (front_chunks, back_chunks) =
                    split_chunks(chunks, q_front, q_back, self.state.config.max_chunk_size);

                match (front_chunks.is_empty(), back_chunks.is_empty()) {
                    (true, true) => {
                        let (tx, fut) = completion_pair();
                        let _ = tx.send(Ok(0));
                        AnyReadFuture::Single(fut)
                    }
                    (true, false) => AnyReadFuture::Single(back.dispatch_read_vector(back_chunks, active_sources)),
                    (false, true) => AnyReadFuture::Single(front.dispatch_read_vector(front_chunks, active_sources)),
                    (false, false) => dispatch_split(&front, &back, front_chunks, back_chunks, active_sources),
                }
            }
        }
    }

    /// Dispatches either shape of request through the shared `handle`
    /// entry point.
    pub fn handle(&self, kind: RequestKind) -> AnyReadFuture {
        match kind {
            RequestKind::Scalar(v) => self.handle_scalar(v),
            RequestKind::Vector(vs) => self.handle_vector(vs),
        }
    }

    /// Admits `source` into the active set directly, bypassing the real
    /// check cadence. Lets integration tests exercise two-source behavior
    /// (splitting, toggling) without waiting on wall-clock eviction to grow
    /// the active set.
    #[cfg(feature = "test-util")]
    pub fn admit_for_test(&self, source: Arc<Source<W>>) {
        let mut lists = self.state.lists.lock().expect("source lock poisoned");
        assert!(lists.active.len() < 2, "active set already full");
        lists.active.push(source);
    }
}

/// Picks which source(s) a new request goes to. Called with the source
/// lock already held; the caller releases it before dispatching.
fn pick_source<W: Wire>(lists: &mut SourceLists<W>, kind: &RequestKind) -> SourcePick<W> {
    match lists.active.len() {
        1 => SourcePick::Single(Arc::clone(&lists.active[0])),
        2 => match kind {
            RequestKind::Scalar(_) => {
                let index = if lists.initial_toggle { 1 } else { 0 };
                lists.initial_toggle = !lists.initial_toggle;
                SourcePick::Single(Arc::clone(&lists.active[index]))
            }
            RequestKind::Vector(_) => {
                SourcePick::Split(Arc::clone(&lists.active[0]), Arc::clone(&lists.active[1]))
            }
        },
        0 => panic!("request manager has no active source"),
        n => panic!("invariant violated: {} active sources", n),
    }
}

/// Reconsiders the active set and, if warranted, kicks off a replacement
/// open — but only if enough wall-clock time has passed since the last
/// check.
fn maybe_check_sources<W: Wire>(state: &Arc<ManagerState<W>>, now: Instant) {
    let mut lists = state.lists.lock().expect("source lock poisoned");
    if now.duration_since(lists.last_check) < state.config.min_check_interval || now < lists.next_check {
        return;
    }
    lists.last_check = now;
    check_sources_impl(state, &mut lists, now);
}

/// The reconsideration pass itself: evict at most one source, then kick
/// off a replacement open if anything was evicted (or if only one source
/// was active to begin with).
fn check_sources_impl<W: Wire>(state: &Arc<ManagerState<W>>, lists: &mut SourceLists<W>, now: Instant) {
    let find_new = reconsider_active(lists, &state.config);

    if find_new && !lists.file_opening {
        let opaque = build_opaque_string(lists);
        lists.file_opening = true;
        let full_name = format!("{}{}", state.name, opaque);
        debug!("request manager for '{}': opening replacement '{}'", state.name, full_name);

        let callback_state = Arc::clone(state);
        state.wire.open_async(
            &full_name,
            state.config.open_flags,
            state.config.access_mode,
            Box::new(move |result| on_replacement_open(callback_state, result)),
        );
    }

    lists.next_check = now + state.config.recheck_period;
}

/// Demotes at most one active source to `inactive`, returning whether a
/// replacement should now be sought.
fn reconsider_active<W: Wire>(lists: &mut SourceLists<W>, config: &RequestManagerConfig) -> bool {
    match lists.active.len() {
        0 => false,
        1 => true,
        2 => {
            for source in &lists.active {
                source.idle_tick();
            }
            let q = [lists.active[0].quality().0, lists.active[1].quality().0];
            let should_demote = |i: usize, j: usize| {
                q[i] > config.high_watermark || (q[i] > config.low_watermark && q[i] * config.ratio_threshold < q[j])
            };

            if should_demote(0, 1) {
                let demoted = lists.active.remove(0);
                warn!("demoting source '{}' (quality {})", demoted.name(), q[0]);
                lists.inactive.push(demoted);
                true
            } else if should_demote(1, 0) {
                let demoted = lists.active.remove(1);
                warn!("demoting source '{}' (quality {})", demoted.name(), q[1]);
                lists.inactive.push(demoted);
                true
            } else {
                false
            }
        }
        n => panic!("invariant violated: {} active sources", n),
    }
}

/// Handles a replacement open's completion, wherever the wire layer's
/// thread calls it from. A free function taking the manager's shared state
/// explicitly, since `self: &Arc<Self>` is not available as a receiver and
/// this must be callable without any `RequestManager` handle still alive.
fn on_replacement_open<W: Wire>(state: Arc<ManagerState<W>>, result: Result<W::Handle, crate::wire::WireStatus>) {
    let mut lists = state.lists.lock().expect("source lock poisoned");
    lists.file_opening = false;

    match result {
        Ok(handle) => {
            let server_id = handle.server_id().to_owned();
            let quality = (state.quality_factory)();
            let source = Source::new(server_id.clone(), handle, state.wire.clone(), quality);
            info!("request manager for '{}': admitted replacement source '{}'", state.name, server_id);
            lists.active.push(source);
        }
        Err(status) => {
            warn!(
                "request manager for '{}': replacement open failed: {}; backing off {:?}",
                state.name, status, state.config.open_failure_backoff
            );
            lists.next_check = Instant::now() + state.config.open_failure_backoff;
        }
    }
}

/// Builds the `?tried=` opaque string: active, then inactive, then
/// disabled ids, each truncated at its first `:`, comma-joined.
fn build_opaque_string<W: Wire>(lists: &SourceLists<W>) -> String {
    let mut ids: Vec<String> = Vec::new();
    for source in lists.active.iter().chain(lists.inactive.iter()) {
        ids.push(truncate_at_colon(source.server_id()));
    }
    for disabled in &lists.disabled {
        ids.push(truncate_at_colon(disabled));
    }
    format!("?tried={}", ids.join(","))
}

fn truncate_at_colon(id: impl AsRef<str>) -> String {
    id.as_ref().split(':').next().unwrap_or("").to_owned()
}

/// Splits `chunks` between a front share (bound for `front`, weighted by
/// `q_back` since a lower quality value is better) and a back share, via
/// the front/back consumption algorithm described alongside
/// `RequestManager::handle_vector`.
///
/// Exposed at `pub` visibility (rather than crate-private) so it can be
/// exercised directly by the `split_read` benchmark without paying for a
/// full `RequestManager` + mock wire round trip.
pub fn split_chunks(chunks: Vec<IoVec>, q_front: i64, q_back: i64, max_chunk: IoSize) -> (Vec<IoVec>, Vec<IoVec>) {
    // Quality scores are clamped to at least 1 before weighting the split:
    // a real score is never zero in practice, but a time-based metric can
    // integer-truncate a fast-enough read down to zero, which would zero
    // out both budgets below and spin the loop forever on a nonempty input.
    let q_front = q_front.max(1);
    let q_back = q_back.max(1);
    let total_q = (q_front + q_back) as f64;
    let front_budget = ((max_chunk as f64) * (q_back as f64) / total_q) as IoSize;
    let back_budget = ((max_chunk as f64) * (q_front as f64) / total_q) as IoSize;

    let mut remaining: VecDeque<IoVec> = chunks.into();
    let mut front_out = Vec::new();
    let mut back_out = Vec::new();

    while !remaining.is_empty() {
        consume_front(&mut remaining, &mut front_out, front_budget);
        if remaining.is_empty() {
            break;
        }
        consume_back(&mut remaining, &mut back_out, back_budget);
    }

    (front_out, back_out)
}

/// Transfers up to `budget` bytes from the front of `remaining` into `out`,
/// splitting the leading entry in place if it straddles the budget.
fn consume_front(remaining: &mut VecDeque<IoVec>, out: &mut Vec<IoVec>, mut budget: IoSize) {
    while budget > 0 {
        let Some(front) = remaining.front().copied() else {
            return;
        };
        if front.size <= budget {
            remaining.pop_front();
            budget -= front.size;
            out.push(front);
        } else {
            let (head, tail) = front.split_at(budget);
            out.push(head);
            *remaining.front_mut().expect("checked non-empty above") = tail;
            return;
        }
    }
}

/// Symmetric to [`consume_front`], transferring from the back of
/// `remaining`.
fn consume_back(remaining: &mut VecDeque<IoVec>, out: &mut Vec<IoVec>, mut budget: IoSize) {
    while budget > 0 {
        let Some(back) = remaining.back().copied() else {
            return;
        };
        if back.size <= budget {
            remaining.pop_back();
            budget -= back.size;
            out.push(back);
        } else {
            let (head, tail) = back.split_at(back.size - budget);
            out.push(tail);
            *remaining.back_mut().expect("checked non-empty above") = head;
            return;
        }
    }
}
