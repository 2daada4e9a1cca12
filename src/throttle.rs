use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Roughly one update per frame at 60Hz.
pub const DEFAULT_THROTTLE_DELAY: Duration = Duration::from_millis(16);

/// Receives forwarded text. Called with the buffer's lock held, so a sink
/// must not call back into the buffer that drives it.
pub type RenderSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Coalesces high-frequency updates into at most one forward per `delay`.
///
/// The first window opens when the buffer is created. Only the latest text
/// is ever forwarded, and at most one delayed forward is scheduled at a time.
pub struct ThrottledRenderBuffer {
    shared: Arc<Shared>,
}

struct Shared {
    delay: Duration,
    sink: RenderSink,
    state: Mutex<BufferState>,
}

struct BufferState {
    latest: Option<String>,
    window_start: Instant,
    pending: Option<JoinHandle<()>>,
    // Bumped whenever the pending forward is discarded, so a timer that
    // already woke up cannot forward on behalf of a newer window.
    epoch: u64,
}

impl BufferState {
    fn discard_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        self.epoch = self.epoch.wrapping_add(1);
    }
}

impl Shared {
    fn forward(&self, state: &mut BufferState, now: Instant) {
        if let Some(text) = state.latest.take() {
            (self.sink)(&text);
            state.window_start = now;
        }
    }
}

impl ThrottledRenderBuffer {
    pub fn new(delay: Duration, sink: RenderSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                delay,
                sink,
                state: Mutex::new(BufferState {
                    latest: None,
                    window_start: Instant::now(),
                    pending: None,
                    epoch: 0,
                }),
            }),
        }
    }

    /// Record the latest accumulated text.
    ///
    /// Forwards immediately when the current window has elapsed, otherwise
    /// makes sure one delayed forward is scheduled.
    /// Must be called from within a tokio runtime.
    pub fn update(&self, text: impl Into<String>) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.latest = Some(text.into());

        let now = Instant::now();
        let wait = shared
            .delay
            .saturating_sub(now.duration_since(state.window_start));

        if wait.is_zero() {
            state.discard_pending();
            shared.forward(&mut state, now);
            return;
        }

        if state.pending.is_some() {
            return;
        }

        let epoch = state.epoch;
        let timer = Arc::clone(shared);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let mut state = timer.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.pending = None;
            timer.forward(&mut state, Instant::now());
        }));
    }

    /// Forward the latest text now, if any, and drop the pending forward.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        state.discard_pending();
        self.shared.forward(&mut state, Instant::now());
    }

    /// Drop buffered text and the pending forward without forwarding.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        state.discard_pending();
        state.latest = None;
    }

    pub fn is_pending(&self) -> bool {
        self.shared.state.lock().pending.is_some()
    }
}

impl Drop for ThrottledRenderBuffer {
    fn drop(&mut self) {
        self.cancel();
    }
}
