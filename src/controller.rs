use crate::client::Fields;
use crate::context::AppContext;
use crate::error::StreamError;
use crate::session::{SessionObserver, SessionPhase, StreamSession};
use crate::summary;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const RATE_LIMIT_MESSAGE: &str =
    "Too many requests right now. Please try again in about 1 minute.";
pub const CONFIGURATION_MESSAGE: &str =
    "The AI service rejected the request. Please check your API configuration.";
pub const GENERIC_FAILURE_MESSAGE: &str =
    "The reading could not be completed. Please try again later.";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    pub result_text: String,
    pub is_loading: bool,
    pub is_streaming: bool,
    pub error: Option<String>,
}

pub fn user_facing_message(error: &StreamError) -> String {
    if error.is_rate_limited() {
        return RATE_LIMIT_MESSAGE.to_string();
    }
    if error.is_configuration_problem() {
        return CONFIGURATION_MESSAGE.to_string();
    }

    match error {
        StreamError::Server { message, .. } if !message.trim().is_empty() => message.clone(),
        StreamError::Http { .. } => error.to_string(),
        _ => GENERIC_FAILURE_MESSAGE.to_string(),
    }
}

pub struct DivinationController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    kind: String,
    context: AppContext,
    view: watch::Sender<ViewState>,
    active: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
}

impl DivinationController {
    pub fn new(kind: impl Into<String>, context: AppContext) -> Self {
        let (view, _) = watch::channel(ViewState::default());
        Self {
            inner: Arc::new(ControllerInner {
                kind: kind.into(),
                context,
                view,
                active: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.inner.view.subscribe()
    }

    pub fn view(&self) -> ViewState {
        self.inner.view.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// Start a request, cancelling any session still in flight.
    ///
    /// Must be called from within a tokio runtime. The returned handle
    /// resolves to the session's terminal phase.
    pub fn submit(&self, fields: Fields) -> JoinHandle<SessionPhase> {
        let inner = &self.inner;
        inner.cancel_active();

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        *inner.active.lock() = Some(ActiveSession {
            id,
            cancel: cancel.clone(),
        });
        inner.view.send_modify(|view| {
            *view = ViewState {
                is_loading: true,
                ..ViewState::default()
            };
        });

        let request = inner.context.client.build_request(&inner.kind, &fields);
        let mut session = StreamSession::new(
            inner.context.client.http().clone(),
            inner.context.session.clone(),
            cancel,
        );
        let observer: Arc<dyn SessionObserver> = Arc::new(ControllerObserver {
            inner: Arc::downgrade(inner),
            id,
            fields,
        });
        let owner = Arc::downgrade(inner);

        tokio::spawn(async move {
            let phase = session.start(&request, observer).await;
            if let Some(inner) = owner.upgrade() {
                inner.release(id);
            }
            phase
        })
    }

    pub fn cancel(&self) {
        self.inner.cancel_active();
    }
}

impl Drop for DivinationController {
    fn drop(&mut self) {
        self.inner.cancel_active();
    }
}

impl ControllerInner {
    fn cancel_active(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        active.cancel.cancel();
        debug!(kind = %self.kind, session = active.id, "cancelled divination request");
        self.view.send_modify(|view| {
            view.is_loading = false;
            view.is_streaming = false;
        });
    }

    fn is_current(&self, id: u64) -> bool {
        is_live(&self.active.lock(), id)
    }

    fn release(&self, id: u64) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|active| active.id == id) {
            *active = None;
        }
    }
}

fn is_live(active: &Option<ActiveSession>, id: u64) -> bool {
    active
        .as_ref()
        .is_some_and(|active| active.id == id && !active.cancel.is_cancelled())
}

/// Routes one session's callbacks into its controller. Callbacks from a
/// session that has been superseded or cancelled, or whose controller is
/// gone, are dropped.
struct ControllerObserver {
    inner: Weak<ControllerInner>,
    id: u64,
    fields: Fields,
}

impl ControllerObserver {
    fn current(&self) -> Option<Arc<ControllerInner>> {
        let inner = self.inner.upgrade()?;
        inner.is_current(self.id).then_some(inner)
    }
}

impl SessionObserver for ControllerObserver {
    fn on_first_chunk(&self) {
        let Some(inner) = self.current() else { return };
        inner.view.send_modify(|view| {
            view.is_loading = false;
            view.is_streaming = true;
        });
    }

    fn on_content_update(&self, text: &str) {
        let Some(inner) = self.current() else { return };
        inner.view.send_modify(|view| {
            view.result_text.clear();
            view.result_text.push_str(text);
        });
    }

    fn on_error(&self, err: &StreamError) {
        let Some(inner) = self.current() else { return };
        error!(
            kind = %inner.kind,
            code = err.code().unwrap_or("-"),
            error = %err,
            "divination request failed"
        );

        let message = user_facing_message(err);
        inner.view.send_modify(|view| {
            view.result_text = message.clone();
            view.error = Some(message);
            view.is_loading = false;
            view.is_streaming = false;
        });
    }

    fn on_done(&self) {
        let Some(inner) = self.inner.upgrade() else { return };
        // Held through the save so a concurrent cancel cannot land in between.
        let active = inner.active.lock();
        if !is_live(&active, self.id) {
            return;
        }

        let mut result_text = String::new();
        inner.view.send_modify(|view| {
            view.is_loading = false;
            view.is_streaming = false;
            result_text = view.result_text.clone();
        });

        if result_text.is_empty() {
            debug!(kind = %inner.kind, "empty reading not saved to history");
            return;
        }

        let record = summary::record_for(&inner.kind, &self.fields, &result_text);
        if let Err(err) = inner.context.history.save(&inner.kind, record) {
            warn!(kind = %inner.kind, error = %err, "failed to save reading to history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, DivinationClient};
    use crate::error::StorageError;
    use crate::history::{HistoryStore, KeyValueStore, MemoryStore};
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn context_for(base_url: String) -> AppContext {
        let client = DivinationClient::new(ClientConfig {
            base_url,
            ..ClientConfig::default()
        })
        .expect("client");
        AppContext::new(client, HistoryStore::in_memory())
    }

    fn context() -> AppContext {
        context_for(crate::client::DEFAULT_BASE_URL.to_string())
    }

    // Base URL of a port nothing listens on.
    async fn closed_base_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        format!("http://{addr}")
    }

    #[test]
    fn rate_limit_message_wins() {
        let err = StreamError::Http {
            status: 429,
            message: "Too Many Requests".to_string(),
        };
        assert_eq!(user_facing_message(&err), RATE_LIMIT_MESSAGE);
    }

    #[test]
    fn configuration_message_for_auth_failures() {
        let err = StreamError::Server {
            code: "AUTH_ERROR".to_string(),
            message: "invalid key".to_string(),
        };
        assert_eq!(user_facing_message(&err), CONFIGURATION_MESSAGE);
    }

    #[test]
    fn server_message_is_shown_verbatim() {
        let err = StreamError::Server {
            code: "LEGACY_ERROR".to_string(),
            message: "模型繁忙".to_string(),
        };
        assert_eq!(user_facing_message(&err), "模型繁忙");
    }

    #[test]
    fn transport_failures_get_generic_message() {
        let err = StreamError::transport("connection refused");
        assert_eq!(user_facing_message(&err), GENERIC_FAILURE_MESSAGE);
        let blank = StreamError::Server {
            code: "UNKNOWN".to_string(),
            message: " ".to_string(),
        };
        assert_eq!(user_facing_message(&blank), GENERIC_FAILURE_MESSAGE);
    }

    #[test]
    fn cancel_without_session_is_noop() {
        let controller = DivinationController::new("tarot", context());
        controller.cancel();
        controller.cancel();
        assert!(!controller.is_active());
        assert_eq!(controller.view(), ViewState::default());
    }

    #[tokio::test]
    async fn stale_observer_is_ignored() {
        let controller = DivinationController::new("tarot", context());
        let stale = ControllerObserver {
            inner: Arc::downgrade(&controller.inner),
            id: 42,
            fields: Fields::new(),
        };

        stale.on_first_chunk();
        stale.on_content_update("stale");
        stale.on_done();

        assert_eq!(controller.view(), ViewState::default());
        assert!(controller.inner.context.history.list_by_kind("tarot").is_empty());
    }

    #[tokio::test]
    async fn observer_outliving_controller_is_harmless() {
        let controller = DivinationController::new("tarot", context());
        let orphan = ControllerObserver {
            inner: Arc::downgrade(&controller.inner),
            id: 1,
            fields: Fields::new(),
        };
        drop(controller);

        orphan.on_content_update("late");
        orphan.on_error(&StreamError::transport("late"));
        orphan.on_done();
    }

    // Pauses inside `set` until released, reporting when a write begins.
    struct GatedStore {
        inner: MemoryStore,
        entered: mpsc::SyncSender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl KeyValueStore for GatedStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            let _ = self.entered.try_send(());
            let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }

        fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.inner.keys()
        }
    }

    #[test]
    fn cancel_waits_for_history_save_in_progress() {
        let (entered_tx, entered_rx) = mpsc::sync_channel(1);
        let (release_tx, release_rx) = mpsc::channel();
        let history = HistoryStore::new(GatedStore {
            inner: MemoryStore::new(),
            entered: entered_tx,
            release: Mutex::new(release_rx),
        });
        let client = DivinationClient::new(ClientConfig::default()).expect("client");
        let controller = Arc::new(DivinationController::new(
            "tarot",
            AppContext::new(client, history),
        ));
        *controller.inner.active.lock() = Some(ActiveSession {
            id: 1,
            cancel: CancellationToken::new(),
        });
        controller
            .inner
            .view
            .send_modify(|view| view.result_text = "reading".to_string());

        let observer = ControllerObserver {
            inner: Arc::downgrade(&controller.inner),
            id: 1,
            fields: Fields::new(),
        };
        let done = thread::spawn(move || observer.on_done());
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("save started");

        let cancelled = Arc::new(AtomicBool::new(false));
        let canceller = {
            let controller = Arc::clone(&controller);
            let cancelled = Arc::clone(&cancelled);
            thread::spawn(move || {
                controller.cancel();
                cancelled.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!cancelled.load(Ordering::SeqCst));

        release_tx.send(()).expect("release save");
        done.join().expect("on_done thread");
        canceller.join().expect("cancel thread");

        assert!(cancelled.load(Ordering::SeqCst));
        assert!(!controller.is_active());
        let saved = controller.inner.context.history.list_by_kind("tarot");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].result_text, "reading");
    }

    #[test]
    fn done_after_cancel_saves_nothing() {
        let controller = DivinationController::new("tarot", context());
        *controller.inner.active.lock() = Some(ActiveSession {
            id: 7,
            cancel: CancellationToken::new(),
        });
        controller
            .inner
            .view
            .send_modify(|view| view.result_text = "reading".to_string());
        let observer = ControllerObserver {
            inner: Arc::downgrade(&controller.inner),
            id: 7,
            fields: Fields::new(),
        };

        controller.cancel();
        observer.on_done();

        assert!(controller.inner.context.history.list_all().is_empty());
    }

    #[tokio::test]
    async fn submit_marks_loading_and_failure_clears_it() {
        let controller = DivinationController::new("tarot", context_for(closed_base_url().await));
        let handle = controller.submit(Fields::new());
        assert!(controller.view().is_loading);
        assert!(controller.is_active());

        assert_eq!(handle.await.expect("session task"), SessionPhase::Failed);
        let view = controller.view();
        assert!(!view.is_loading);
        assert!(!view.is_streaming);
        assert_eq!(view.error.as_deref(), Some(GENERIC_FAILURE_MESSAGE));
        assert_eq!(view.result_text, GENERIC_FAILURE_MESSAGE);
        assert!(!controller.is_active());
    }
}
