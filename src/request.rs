use crate::cache::{Fingerprint, ResultCache, DEFAULT_CACHE_TTL};
use crate::error::ServerError;
use crate::networking::api_message::{FunctionCall, RpcEnvelope};
use crate::util::lock;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{event, Level};

pub type CallbackFn = Box<dyn FnOnce(Option<Value>, Option<ServerError>) + Send>;
pub type BoundCallbackFn =
    Box<dyn FnOnce(Arc<dyn Any + Send + Sync>, Option<Value>, Option<ServerError>) + Send>;

///
/// What to run once a request resolves: either a plain function or a
/// function bound to a receiver object, which is handed back at call time.
///
pub enum Callback {
    Plain(CallbackFn),
    Bound(Arc<dyn Any + Send + Sync>, BoundCallbackFn),
}

impl Callback {
    pub fn plain<F>(f: F) -> Self
    where
        F: FnOnce(Option<Value>, Option<ServerError>) + Send + 'static,
    {
        Callback::Plain(Box::new(f))
    }

    /// Bind `f` to `context`. The context is kept alive until the request
    /// resolves.
    pub fn bound<C, F>(context: Arc<C>, f: F) -> Self
    where
        C: Send + Sync + 'static,
        F: FnOnce(&C, Option<Value>, Option<ServerError>) + Send + 'static,
    {
        Callback::Bound(
            context,
            Box::new(move |context, data, error| match context.downcast::<C>() {
                Ok(context) => f(&context, data, error),
                Err(_) => event!(Level::ERROR, "bound callback context has the wrong type"),
            }),
        )
    }

    fn invoke(self, data: Option<Value>, error: Option<ServerError>) {
        match self {
            Callback::Plain(f) => f(data, error),
            Callback::Bound(context, f) => f(context, data, error),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Plain(_) => f.write_str("Callback::Plain"),
            Callback::Bound(_, _) => f.write_str("Callback::Bound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memoize {
    Off,
    /// cache for the configured default time to live
    Default,
    For(Duration),
}

impl Memoize {
    pub fn is_on(&self) -> bool {
        !matches!(self, Memoize::Off)
    }
}

impl Default for Memoize {
    fn default() -> Self {
        Memoize::Off
    }
}

#[derive(Debug)]
struct MemoSlot {
    fingerprint: Fingerprint,
    ttl: Duration,
    cache: Arc<Mutex<ResultCache>>,
}

///
/// One RPC call. A request is created by `RequestTracker`, handed to a
/// `Connection` which keeps it by id until a reply arrives, and resolved at
/// most once.
///
#[derive(Debug)]
pub struct Request {
    id: u64,
    func_name: Option<String>,
    payload: Vec<FunctionCall>,
    memo: Option<MemoSlot>,
    called: AtomicBool,
    callback: Mutex<Option<Callback>>,
    envelope: Mutex<Option<RpcEnvelope>>,
}

impl Request {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Set on the single function path, where the reply is a batch and the
    /// matching entry is picked by name.
    pub fn func_name(&self) -> Option<&str> {
        self.func_name.as_deref()
    }

    pub fn payload(&self) -> &[FunctionCall] {
        &self.payload
    }

    pub fn is_memoized(&self) -> bool {
        self.memo.is_some()
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.memo.as_ref().map(|memo| memo.fingerprint)
    }

    pub fn is_called(&self) -> bool {
        self.called.load(Ordering::SeqCst)
    }

    /// Marks the request as dispatched. Returns false if it already was.
    pub fn mark_called(&self) -> bool {
        !self.called.swap(true, Ordering::SeqCst)
    }

    pub fn envelope(&self) -> Option<RpcEnvelope> {
        lock(&self.envelope).clone()
    }

    pub fn set_envelope(&self, envelope: RpcEnvelope) {
        *lock(&self.envelope) = Some(envelope);
    }

    /// Run the callback with the server's answer and, for memoized
    /// requests, store that answer in the result cache.
    pub fn resolve(&self, data: Option<Value>, error: Option<ServerError>) {
        self.finish(data, error, true);
    }

    fn finish(&self, data: Option<Value>, error: Option<ServerError>, store: bool) {
        let callback = lock(&self.callback).take();
        let cached = match (&self.memo, store) {
            (Some(_), true) => Some((data.clone(), error.clone())),
            _ => None,
        };
        match callback {
            Some(callback) => callback.invoke(data, error),
            None => event!(Level::TRACE, "request {} resolved without a callback", self.id),
        }
        if let (Some(memo), Some(value)) = (&self.memo, cached) {
            lock(&memo.cache).set(memo.fingerprint, value, memo.ttl);
        }
        self.called.store(true, Ordering::SeqCst);
    }
}

///
/// Builds requests: allocates ids and short-circuits memoized calls whose
/// answer is still cached.
///
#[derive(Debug)]
pub struct RequestTracker {
    next_id: AtomicU64,
    cache: Arc<Mutex<ResultCache>>,
    default_ttl: Duration,
}

impl RequestTracker {
    pub fn new(cache: ResultCache, default_ttl: Duration) -> Self {
        RequestTracker {
            next_id: AtomicU64::new(0),
            cache: Arc::new(Mutex::new(cache)),
            default_ttl,
        }
    }

    /// Ids are shared by requests and control messages, strictly increasing
    /// and never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn cache(&self) -> &Arc<Mutex<ResultCache>> {
        &self.cache
    }

    /// Build a request for a single function call. A memoized call with a
    /// cached answer is resolved before this returns and comes back already
    /// marked as called.
    pub fn prepare(
        &self,
        call: FunctionCall,
        callback: Option<Callback>,
        memoize: Memoize,
    ) -> Arc<Request> {
        let memo = match memoize {
            Memoize::Off => None,
            Memoize::Default => Some(self.default_ttl),
            Memoize::For(ttl) => Some(ttl),
        }
        .map(|ttl| MemoSlot {
            fingerprint: Fingerprint::of(&call.to_value()),
            ttl,
            cache: self.cache.clone(),
        });
        let request = Arc::new(Request {
            id: self.next_id(),
            func_name: Some(call.fname.clone()),
            payload: vec![call],
            memo,
            called: AtomicBool::new(false),
            callback: Mutex::new(callback),
            envelope: Mutex::new(None),
        });

        if let Some(memo) = &request.memo {
            let hit = lock(&memo.cache).get(&memo.fingerprint);
            if let Some((data, error)) = hit {
                event!(Level::DEBUG, "memoized answer for request {}", request.id);
                request.finish(data, error, false);
            }
        }
        request
    }

    /// Build a request for a raw batch. The callback receives the whole
    /// reply body.
    pub fn prepare_raw(&self, payload: Vec<FunctionCall>, callback: Option<Callback>) -> Arc<Request> {
        Arc::new(Request {
            id: self.next_id(),
            func_name: None,
            payload,
            memo: None,
            called: AtomicBool::new(false),
            callback: Mutex::new(callback),
            envelope: Mutex::new(None),
        })
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(ResultCache::default(), DEFAULT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<(Option<Value>, Option<ServerError>)>>>, Callback) {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        (
            seen,
            Callback::plain(move |data, error| sink.lock().unwrap().push((data, error))),
        )
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let tracker = RequestTracker::default();
        let ids: Vec<u64> = (0..50)
            .map(|i| {
                tracker
                    .prepare(FunctionCall::new("get_item").arg("item_id", i), None, Memoize::Off)
                    .id()
            })
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn ids_stay_unique_across_threads() {
        let tracker = Arc::new(RequestTracker::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || (0..100).map(|_| tracker.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }

    #[tokio::test]
    async fn resolve_runs_the_callback_once() {
        let tracker = RequestTracker::default();
        let (seen, callback) = recorder();
        let request = tracker.prepare(FunctionCall::new("get_item"), Some(callback), Memoize::Off);
        assert!(!request.is_called());

        request.resolve(Some(json!(1)), None);
        request.resolve(Some(json!(2)), None);
        assert!(request.is_called());
        assert_eq!(*seen.lock().unwrap(), vec![(Some(json!(1)), None)]);
    }

    #[tokio::test]
    async fn bound_callbacks_receive_their_context() {
        struct Page {
            title: String,
        }
        let tracker = RequestTracker::default();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let page = Arc::new(Page {
            title: "gallery".to_string(),
        });
        let callback = Callback::bound(page, move |page: &Page, data, _| {
            *sink.lock().unwrap() = Some((page.title.clone(), data));
        });
        let request = tracker.prepare(FunctionCall::new("get_gallery"), Some(callback), Memoize::Off);
        request.resolve(Some(json!([1, 2])), None);
        assert_eq!(
            *seen.lock().unwrap(),
            Some(("gallery".to_string(), Some(json!([1, 2]))))
        );
    }

    #[tokio::test]
    async fn memoized_requests_resolve_from_cache() {
        let tracker = RequestTracker::default();
        let call = || FunctionCall::new("get_config").arg("cfg", json!({"core.debug": false}));

        let first = tracker.prepare(call(), None, Memoize::For(Duration::from_secs(3)));
        assert!(!first.is_called());
        first.resolve(Some(json!({"core.debug": true})), None);

        let (seen, callback) = recorder();
        let second = tracker.prepare(call(), Some(callback), Memoize::For(Duration::from_secs(3)));
        assert!(second.is_called());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Some(json!({"core.debug": true})), None)]
        );
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(lock(tracker.cache()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn memoized_answers_expire() {
        let tracker = RequestTracker::default();
        let first = tracker.prepare(FunctionCall::new("get_tags"), None, Memoize::For(Duration::from_secs(3)));
        first.resolve(Some(json!([])), None);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = tracker.prepare(FunctionCall::new("get_tags"), None, Memoize::For(Duration::from_secs(3)));
        assert!(!second.is_called());
    }

    #[tokio::test]
    async fn unmemoized_requests_do_not_touch_the_cache() {
        let tracker = RequestTracker::default();
        let request = tracker.prepare(FunctionCall::new("get_tags"), None, Memoize::Off);
        request.resolve(Some(json!([])), None);
        assert!(lock(tracker.cache()).is_empty());

        let raw = tracker.prepare_raw(vec![FunctionCall::new("a"), FunctionCall::new("b")], None);
        assert_eq!(raw.func_name(), None);
        assert_eq!(raw.payload().len(), 2);
    }
}
