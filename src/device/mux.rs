//! Subscription multiplexer
//!
//! One [`Multiplexer`] shares a single conversation link among many logical subscribers.
//! It owns three things:
//!
//! - a setup memo: [`Multiplexer::once`] runs the link setup at most once at a time, hands
//!   the single outcome to every concurrent caller and is only sticky on success
//! - a close latch: the first [`Multiplexer::close`] error is delivered to every subscriber
//!   and returned by every later subscribe attempt
//! - a dispatch strategy: [`FanOut`] for events and twin updates, [`Registry`] for direct
//!   methods

use crate::error::{HubError, HubResult};
use crate::protocol::{Event, Mapping, Value};
use crate::transport::{EventDispatcher, MethodDispatcher, TwinDispatcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::twin::TwinState;

/// Handler invoked for a direct method call
pub type DirectMethodHandler = Arc<dyn Fn(Mapping) -> Result<Mapping, HubError> + Send + Sync>;

/// Dispatch strategy plugged into a [`Multiplexer`]
pub trait Dispatch: Send {
    /// Deliver `err` to every current subscriber and drop them
    fn close(&mut self, err: &HubError);
}

type SetupOutcome = Option<HubResult<()>>;

enum SetupState {
    Idle,
    Running(watch::Receiver<SetupOutcome>),
    Done,
}

struct Inner<D> {
    closed: Option<HubError>,
    dispatch: D,
}

pub struct Multiplexer<D> {
    setup: Mutex<SetupState>,
    inner: Mutex<Inner<D>>,
}

/// Resets an interrupted setup so the next caller can retry it
struct SetupGuard<'a> {
    state: &'a Mutex<SetupState>,
    finished: bool,
}

impl SetupGuard<'_> {
    fn finish(mut self, succeeded: bool) {
        *self.state.lock() = if succeeded {
            SetupState::Done
        } else {
            SetupState::Idle
        };
        self.finished = true;
    }
}

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.state.lock() = SetupState::Idle;
        }
    }
}

impl<D: Dispatch> Multiplexer<D> {
    pub fn new(dispatch: D) -> Self {
        Self {
            setup: Mutex::new(SetupState::Idle),
            inner: Mutex::new(Inner {
                closed: None,
                dispatch,
            }),
        }
    }

    /// Run `setup` unless it already succeeded.
    ///
    /// Callers arriving while a setup is in flight wait for it and receive its outcome. A
    /// failed or interrupted setup leaves the memo empty so a later call retries.
    pub async fn once<F, Fut>(&self, setup: F) -> HubResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HubResult<()>>,
    {
        let outcome_tx = loop {
            if let Some(err) = self.closed_error() {
                return Err(err);
            }

            let mut running = {
                let mut state = self.setup.lock();
                match &*state {
                    SetupState::Done => return Ok(()),
                    SetupState::Running(rx) => rx.clone(),
                    SetupState::Idle => {
                        let (tx, rx) = watch::channel(None);
                        *state = SetupState::Running(rx);
                        break tx;
                    }
                }
            };

            let outcome = running
                .wait_for(Option::is_some)
                .await
                .map(|outcome| (*outcome).clone())
                .ok()
                .flatten();
            match outcome {
                Some(result) => return result,
                // runner was cancelled before finishing; compete to run it again
                None => continue,
            }
        };

        let guard = SetupGuard {
            state: &self.setup,
            finished: false,
        };
        let result = setup().await;
        guard.finish(result.is_ok());
        outcome_tx.send_replace(Some(result.clone()));
        result
    }

    /// Close with `err`; only the first call has any effect. Returns whether this call closed.
    pub fn close(&self, err: HubError) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed.is_some() {
            return false;
        }
        debug!(error = %err, "closing multiplexer");
        inner.dispatch.close(&err);
        inner.closed = Some(err);
        true
    }

    pub fn closed_error(&self) -> Option<HubError> {
        self.inner.lock().closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

/// Fan-out dispatch: every subscriber receives every item
pub struct FanOut<T> {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<HubResult<T>>>,
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            subscribers: HashMap::new(),
        }
    }
}

impl<T: Send> Dispatch for FanOut<T> {
    fn close(&mut self, err: &HubError) {
        for (_, tx) in self.subscribers.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// Pull handle of one fan-out subscriber
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<HubResult<T>>,
    terminal: Option<HubError>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next item. Once the multiplexer closed, every call returns the close error.
    pub async fn recv(&mut self) -> HubResult<T> {
        if let Some(err) = &self.terminal {
            return Err(err.clone());
        }
        let next = self.rx.recv().await;
        self.settle(next)
    }

    /// Non-blocking variant of [`Subscription::recv`]; `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<HubResult<T>> {
        if let Some(err) = &self.terminal {
            return Some(Err(err.clone()));
        }
        match self.rx.try_recv() {
            Ok(item) => Some(self.settle(Some(item))),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(self.settle(None)),
        }
    }

    fn settle(&mut self, next: Option<HubResult<T>>) -> HubResult<T> {
        match next {
            Some(Ok(item)) => Ok(item),
            Some(Err(err)) => {
                self.terminal = Some(err.clone());
                Err(err)
            }
            // unsubscribed: the sender was dropped without a close error
            None => {
                self.terminal = Some(HubError::Closed);
                Err(HubError::Closed)
            }
        }
    }
}

impl<T: Clone + Send> Multiplexer<FanOut<T>> {
    /// Register a new subscriber; fails with the close error once closed
    pub fn sub(&self) -> HubResult<Subscription<T>> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let fan_out = &mut inner.dispatch;
        let id = fan_out.next_id;
        fan_out.next_id += 1;
        fan_out.subscribers.insert(id, tx);
        Ok(Subscription {
            id,
            rx,
            terminal: None,
        })
    }

    /// Remove a subscriber; unknown subscriptions are ignored
    pub fn unsub(&self, subscription: &Subscription<T>) {
        self.inner.lock().dispatch.subscribers.remove(&subscription.id);
    }

    /// Deliver `item` to every subscriber, forgetting those whose handle was dropped
    pub fn publish(&self, item: T) {
        let mut inner = self.inner.lock();
        inner
            .dispatch
            .subscribers
            .retain(|_, tx| tx.send(Ok(item.clone())).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().dispatch.subscribers.len()
    }
}

/// Registry dispatch: one handler per method name
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, DirectMethodHandler>,
}

impl Dispatch for Registry {
    fn close(&mut self, _err: &HubError) {
        self.handlers.clear();
    }
}

/// Status of a successful method call
pub const METHOD_OK: i32 = 200;
/// Status when the payload is not a JSON object
pub const METHOD_BAD_REQUEST: i32 = 400;
/// Status when no handler is registered under the name
pub const METHOD_NOT_FOUND: i32 = 404;
/// Status when the handler returned an error
pub const METHOD_FAILED: i32 = 500;

impl Multiplexer<Registry> {
    /// Register `handler` under `name`; a name can only be registered once
    pub fn handle(&self, name: &str, handler: DirectMethodHandler) -> HubResult<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        if inner.dispatch.handlers.contains_key(name) {
            return Err(HubError::DuplicateMethod {
                name: name.to_string(),
            });
        }
        inner.dispatch.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn remove(&self, name: &str) {
        self.inner.lock().dispatch.handlers.remove(name);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.lock().dispatch.handlers.contains_key(name)
    }

    /// Invoke the handler for `method` and encode its outcome as a status and JSON body
    pub fn invoke(&self, method: &str, payload: &[u8]) -> (i32, Vec<u8>) {
        let handler = self.inner.lock().dispatch.handlers.get(method).cloned();
        let Some(handler) = handler else {
            debug!(method, "no handler registered");
            return error_body(METHOD_NOT_FOUND, "method not found");
        };

        let request = match decode_request(payload) {
            Ok(request) => request,
            Err(e) => return error_body(METHOD_BAD_REQUEST, &e.to_string()),
        };

        match handler(request) {
            Ok(response) => match Value::Mapping(response).to_json_vec() {
                Ok(body) => (METHOD_OK, body),
                Err(e) => error_body(METHOD_FAILED, &e.to_string()),
            },
            Err(e) => {
                warn!(method, error = %e, "direct method handler failed");
                error_body(METHOD_FAILED, &e.to_string())
            }
        }
    }
}

/// Empty and `null` payloads become an empty request mapping
fn decode_request(payload: &[u8]) -> HubResult<Mapping> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Mapping::new());
    }
    match Value::from_json_slice(payload)? {
        Value::Null => Ok(Mapping::new()),
        other => other.into_mapping(),
    }
}

fn error_body(status: i32, message: &str) -> (i32, Vec<u8>) {
    let body = serde_json::json!({ "error": message });
    (status, body.to_string().into_bytes())
}

impl EventDispatcher for Multiplexer<FanOut<Event>> {
    fn dispatch(&self, event: Event) {
        self.publish(event);
    }
}

impl TwinDispatcher for Multiplexer<FanOut<TwinState>> {
    fn dispatch(&self, payload: &[u8]) {
        match TwinState::from_json(payload) {
            Ok(state) => self.publish(state),
            Err(e) => warn!(error = %e, "dropping undecodable twin update"),
        }
    }
}

impl MethodDispatcher for Multiplexer<Registry> {
    fn dispatch(&self, method: &str, payload: &[u8]) -> (i32, Vec<u8>) {
        self.invoke(method, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fan_out() -> Multiplexer<FanOut<u32>> {
        Multiplexer::new(FanOut::default())
    }

    fn echo() -> DirectMethodHandler {
        Arc::new(|request: Mapping| Ok(request))
    }

    #[tokio::test]
    async fn test_once_runs_setup_a_single_time() {
        let mux = Arc::new(fan_out());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mux = mux.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                mux.once(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        mux.once(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_shares_failure_and_allows_retry() {
        let mux = Arc::new(fan_out());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mux = mux.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                mux.once(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(HubError::transport("link refused"))
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(HubError::transport("link refused")));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(mux.once(|| async { Ok(()) }).await, Ok(()));
    }

    #[tokio::test]
    async fn test_cancelled_setup_can_be_retried() {
        let mux = fan_out();
        let interrupted = tokio::time::timeout(
            Duration::from_millis(10),
            mux.once(|| std::future::pending::<HubResult<()>>()),
        )
        .await;
        assert!(interrupted.is_err());

        assert_eq!(mux.once(|| async { Ok(()) }).await, Ok(()));
    }

    #[tokio::test]
    async fn test_fan_out_delivers_to_every_subscriber() {
        let mux = fan_out();
        let mut a = mux.sub().unwrap();
        let mut b = mux.sub().unwrap();

        mux.publish(7);

        assert_eq!(a.recv().await, Ok(7));
        assert_eq!(b.recv().await, Ok(7));
    }

    #[tokio::test]
    async fn test_unsubscribe_leaves_others_alone() {
        let mux = fan_out();
        let a = mux.sub().unwrap();
        let mut b = mux.sub().unwrap();

        mux.unsub(&a);
        mux.unsub(&a);
        mux.publish(1);

        assert_eq!(mux.subscriber_count(), 1);
        assert_eq!(b.recv().await, Ok(1));
    }

    #[tokio::test]
    async fn test_close_reaches_blocked_subscribers_once() {
        let mux = Arc::new(fan_out());
        let mut sub = mux.sub().unwrap();

        let waiter = tokio::spawn(async move {
            let first = sub.recv().await;
            let second = sub.recv().await;
            (first, second)
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(mux.close(HubError::Closed));
        assert!(!mux.close(HubError::transport("later")));

        let (first, second) = waiter.await.unwrap();
        assert_eq!(first, Err(HubError::Closed));
        assert_eq!(second, Err(HubError::Closed));
        assert_eq!(mux.sub().err(), Some(HubError::Closed));
        assert_eq!(mux.once(|| async { Ok(()) }).await, Err(HubError::Closed));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mux = Multiplexer::new(Registry::default());
        let first: DirectMethodHandler = Arc::new(|_: Mapping| {
            let mut out = Mapping::new();
            out.insert("from".into(), "first".into());
            Ok(out)
        });
        let second: DirectMethodHandler = Arc::new(|_: Mapping| Ok(Mapping::new()));

        mux.handle("ping", first).unwrap();
        assert_eq!(
            mux.handle("ping", second),
            Err(HubError::DuplicateMethod {
                name: "ping".into()
            })
        );

        let (status, body) = mux.invoke("ping", b"{}");
        assert_eq!(status, METHOD_OK);
        assert_eq!(body, br#"{"from":"first"}"#);
    }

    #[test]
    fn test_registry_status_codes() {
        let mux = Multiplexer::new(Registry::default());
        let fail: DirectMethodHandler =
            Arc::new(|_: Mapping| Err(HubError::invalid_input("bad reading")));
        mux.handle("fail", fail).unwrap();
        mux.handle("echo", echo()).unwrap();

        let (status, body) = mux.invoke("missing", b"{}");
        assert_eq!(status, METHOD_NOT_FOUND);
        assert_eq!(body, br#"{"error":"method not found"}"#);

        let (status, body) = mux.invoke("fail", b"");
        assert_eq!(status, METHOD_FAILED);
        assert!(String::from_utf8(body).unwrap().contains("bad reading"));

        let (status, _) = mux.invoke("echo", b"[1,2]");
        assert_eq!(status, METHOD_BAD_REQUEST);

        let (status, body) = mux.invoke("echo", br#"{"delay":5}"#);
        assert_eq!(status, METHOD_OK);
        assert_eq!(body, br#"{"delay":5}"#);

        let (status, body) = mux.invoke("echo", b"null");
        assert_eq!(status, METHOD_OK);
        assert_eq!(body, b"{}");
    }

    #[test]
    fn test_registry_remove_and_close() {
        let mux = Multiplexer::new(Registry::default());
        mux.handle("a", echo()).unwrap();
        mux.remove("a");
        mux.remove("a");
        assert!(!mux.is_registered("a"));

        mux.handle("b", echo()).unwrap();
        mux.close(HubError::Closed);
        assert!(!mux.is_registered("b"));
        assert_eq!(mux.handle("c", echo()), Err(HubError::Closed));
    }
}
