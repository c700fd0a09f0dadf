//! The synchronization stream: a single authoritative mutable cell with
//! broadcast-on-change and strictly serialized updates.
//!
//! Each stream spawns one tokio task that owns the current
//! [`ChangeItem`] and the subscriber registry. Handles are cheap clones
//! sharing a command channel; the actor processes commands in
//! submission order, which is the entire concurrency story: no locks
//! around the current value, no interleaved update functions.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use statesync_core::{Address, ChangeItem, StreamReference};

use crate::error::{Result, StreamError};
use crate::reduce::ReduceManager;

/// How a stream obtains its first value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializationMode {
    /// The first accepted update seeds the stream as a full revision.
    Automatic,
    /// An explicit `initialize` call is required before any update.
    Manual,
}

/// Result of one update submission, observable via
/// [`SynchronizationStream::request_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update produced a new revision.
    Applied {
        /// The revision number assigned by the stream.
        version: u64,
    },
    /// The update function declined (returned no item) or produced a
    /// `NoUpdate`; nothing was broadcast.
    NoChange,
    /// The update function failed; the stream remains at its last good
    /// revision.
    Failed {
        /// Human-readable reason, forwarded to `DeliveryFailure` by the
        /// wire layer.
        reason: String,
    },
}

type UpdateFn<T> =
    Box<dyn FnOnce(Option<&ChangeItem<T>>) -> std::result::Result<Option<ChangeItem<T>>, String> + Send>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Write-back hook installed on reduced streams: routes a candidate
/// change through the reducer's backfeed into the parent stream.
type WriteBack<T> = Arc<dyn Fn(ChangeItem<T>) -> BoxFuture<Result<UpdateOutcome>> + Send + Sync>;

enum Command<T> {
    Initialize(ChangeItem<T>, oneshot::Sender<Result<()>>),
    Update(UpdateFn<T>, Option<oneshot::Sender<Result<UpdateOutcome>>>),
    Subscribe(u64, mpsc::UnboundedSender<ChangeItem<T>>),
    Unsubscribe(u64),
    AttachDisposable(Box<dyn FnOnce() + Send>),
    Dispose,
}

struct Shared<T> {
    owner: Address,
    reference: StreamReference,
    mode: InitializationMode,
    commands: mpsc::UnboundedSender<Command<T>>,
    disposed: AtomicBool,
    initialized: watch::Receiver<bool>,
    next_subscriber: AtomicU64,
    manager: Arc<ReduceManager<T>>,
    reduced: Mutex<HashMap<StreamReference, Box<dyn Any + Send + Sync>>>,
}

/// A handle to one synchronization stream. Clones share the stream.
pub struct SynchronizationStream<T> {
    shared: Arc<Shared<T>>,
    writeback: Option<WriteBack<T>>,
}

impl<T> Clone for SynchronizationStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            writeback: self.writeback.clone(),
        }
    }
}

impl<T> std::fmt::Debug for SynchronizationStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizationStream")
            .field("owner", &self.shared.owner)
            .field("reference", &self.shared.reference)
            .field("mode", &self.shared.mode)
            .field("disposed", &self.shared.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T> SynchronizationStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a stream and spawn its actor task.
    pub fn new(
        owner: Address,
        reference: StreamReference,
        mode: InitializationMode,
        manager: Arc<ReduceManager<T>>,
    ) -> Self {
        Self::spawn(owner, reference, mode, manager, None)
    }

    fn spawn(
        owner: Address,
        reference: StreamReference,
        mode: InitializationMode,
        manager: Arc<ReduceManager<T>>,
        writeback: Option<WriteBack<T>>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (initialized_tx, initialized_rx) = watch::channel(false);

        let actor = Actor {
            owner: owner.clone(),
            reference: reference.clone(),
            mode,
            current: None,
            subscribers: Vec::new(),
            disposables: Vec::new(),
            initialized: initialized_tx,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            shared: Arc::new(Shared {
                owner,
                reference,
                mode,
                commands: command_tx,
                disposed: AtomicBool::new(false),
                initialized: initialized_rx,
                next_subscriber: AtomicU64::new(0),
                manager,
                reduced: Mutex::new(HashMap::new()),
            }),
            writeback,
        }
    }

    /// The authoritative address for this stream.
    pub fn owner(&self) -> &Address {
        &self.shared.owner
    }

    /// Which slice of state this stream tracks.
    pub fn reference(&self) -> &StreamReference {
        &self.shared.reference
    }

    /// The stream's initialization mode.
    pub fn mode(&self) -> InitializationMode {
        self.shared.mode
    }

    /// The reducer registry backing [`reduce`](Self::reduce).
    pub fn manager(&self) -> &Arc<ReduceManager<T>> {
        &self.shared.manager
    }

    /// Whether the stream has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command<T>) -> Result<()> {
        if self.is_disposed() {
            return Err(StreamError::Disposed);
        }
        self.shared
            .commands
            .send(command)
            .map_err(|_| StreamError::Disposed)
    }

    /// Set the stream's first value. Fails with `AlreadyInitialized` on
    /// a second call.
    pub async fn initialize(&self, item: ChangeItem<T>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Initialize(item, tx))?;
        rx.await.map_err(|_| StreamError::Disposed)?
    }

    /// Suspend until the stream has a value (its first `initialize` or,
    /// in automatic mode, its first accepted update).
    pub async fn wait_initialized(&self) -> Result<()> {
        let mut initialized = self.shared.initialized.clone();
        while !*initialized.borrow() {
            if initialized.changed().await.is_err() {
                return Err(StreamError::Disposed);
            }
        }
        Ok(())
    }

    /// Submit an update function. Submission never blocks; the function
    /// runs against the then-current value inside the stream's actor.
    /// Returning `Ok(None)` (or a `NoUpdate` item) suppresses the
    /// broadcast. A failure here is logged and dropped; use
    /// [`request_update`](Self::request_update) when the outcome
    /// matters.
    pub fn update(
        &self,
        f: impl FnOnce(Option<&ChangeItem<T>>) -> std::result::Result<Option<ChangeItem<T>>, String>
            + Send
            + 'static,
    ) -> Result<()> {
        self.send(Command::Update(Box::new(f), None))
    }

    /// Submit an update function and await its outcome. Updates are
    /// still strictly serialized with every other submission; only the
    /// observation is different.
    pub async fn request_update(
        &self,
        f: impl FnOnce(Option<&ChangeItem<T>>) -> std::result::Result<Option<ChangeItem<T>>, String>
            + Send
            + 'static,
    ) -> Result<UpdateOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Update(Box::new(f), Some(tx)))?;
        rx.await.map_err(|_| StreamError::Disposed)?
    }

    /// Attach an observer. It immediately receives the most recent
    /// revision (if any) and every subsequent one, in strictly
    /// increasing version order, until it is dropped or the stream is
    /// disposed.
    pub fn subscribe(&self) -> Result<Subscription<T>> {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(Command::Subscribe(id, tx))?;
        Ok(Subscription {
            id,
            rx,
            commands: self.shared.commands.clone(),
        })
    }

    /// Attach a teardown callback, released exactly once at disposal.
    pub fn register_disposable(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.send(Command::AttachDisposable(Box::new(f)))
    }

    /// Dispose the stream. Idempotent: the first call releases all
    /// attached disposables and completes every subscription; later
    /// calls are no-ops. In-flight update functions complete but their
    /// results are discarded.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Reduced children share their parent's lifetime.
        let reduced = self.shared.reduced.lock().unwrap();
        for child in reduced.values() {
            if let Some(disposable) = child.downcast_ref::<Box<dyn ChildHandle>>() {
                disposable.dispose_child();
            }
        }
        let _ = self.shared.commands.send(Command::Dispose);
    }
}

/// Type-erased view of a reduced child stream, enough to dispose it and
/// to recover the typed handle.
trait ChildHandle: Send + Sync {
    fn dispose_child(&self);
    fn as_any(&self) -> &dyn Any;
}

struct TypedChild<R>(SynchronizationStream<R>);

impl<R: Clone + Send + Sync + 'static> ChildHandle for TypedChild<R> {
    fn dispose_child(&self) {
        self.0.dispose();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T> SynchronizationStream<T>
where
    T: Clone + PartialEq + Serialize + Send + Sync + 'static,
{
    /// Route a candidate change into this stream.
    ///
    /// On a root stream this is an ordinary update computed against the
    /// current value. On a reduced stream the change is folded into the
    /// parent through the reducer's backfeed; the reduced value then
    /// refreshes through the normal projection path, so the parent
    /// stays authoritative.
    pub async fn request_change(&self, item: ChangeItem<T>) -> Result<UpdateOutcome> {
        if let Some(writeback) = &self.writeback {
            return writeback(item).await;
        }
        self.request_update(move |current| match current {
            None => Ok(Some(item)),
            Some(current) => {
                let changed_by = item.changed_by().clone();
                Ok(Some(ChangeItem::compute(current, item.into_value(), changed_by)))
            }
        })
        .await
    }

    /// Spawn (or return the cached) derived stream for a sub-reference.
    ///
    /// The reducer is looked up by the reference's shape at this call,
    /// failing with a configuration error if none is registered. The
    /// derived stream re-projects on every parent change and feeds
    /// writes back through the reducer; it is cached per structurally
    /// equal reference and disposed with its parent.
    pub fn reduce<R>(&self, reference: StreamReference) -> Result<SynchronizationStream<R>>
    where
        R: Clone + PartialEq + Serialize + Send + Sync + 'static,
    {
        if self.is_disposed() {
            return Err(StreamError::Disposed);
        }

        let mut reduced = self.shared.reduced.lock().unwrap();
        if let Some(entry) = reduced.get(&reference) {
            let child = entry
                .downcast_ref::<Box<dyn ChildHandle>>()
                .and_then(|c| c.as_any().downcast_ref::<TypedChild<R>>())
                .ok_or(StreamError::Reduce(crate::error::ReduceError::MissingReducer {
                    shape: reference.shape(),
                }))?;
            return Ok(child.0.clone());
        }

        let reducer = self.shared.manager.resolve::<R>(reference.shape())?;

        // Write-back: reduced-side change -> backfeed -> parent update.
        let parent = self.clone();
        let backfeed_reducer = Arc::clone(&reducer);
        let backfeed_reference = reference.clone();
        let writeback: WriteBack<R> = Arc::new(move |change: ChangeItem<R>| {
            let parent = parent.clone();
            let reducer = Arc::clone(&backfeed_reducer);
            let reference = backfeed_reference.clone();
            Box::pin(async move {
                parent
                    .request_update(move |current| {
                        let current = current.ok_or_else(|| "stream has no value".to_string())?;
                        let state = current
                            .value()
                            .ok_or_else(|| "stream value is absent".to_string())?;
                        let next = reducer
                            .backfeed(state, &reference, &change)
                            .map_err(|e| e.to_string())?;
                        let changed_by = change.changed_by().clone();
                        Ok(Some(ChangeItem::compute(current, Some(next), changed_by)))
                    })
                    .await
            })
        });

        let child = SynchronizationStream::<R>::spawn(
            self.shared.owner.clone(),
            reference.clone(),
            InitializationMode::Automatic,
            Arc::new(ReduceManager::new()),
            Some(writeback),
        );

        // Projection pump: parent change -> reducer -> child update.
        let mut subscription = self.subscribe()?;
        let pump_child = child.clone();
        let pump_reducer = Arc::clone(&reducer);
        let pump_reference = reference.clone();
        let pump_owner = self.shared.owner.clone();
        tokio::spawn(async move {
            while let Some(parent_item) = subscription.recv().await {
                let projected = parent_item
                    .value()
                    .and_then(|state| pump_reducer.reduce(state, &pump_reference));
                let changed_by = parent_item.changed_by().clone();
                let owner = pump_owner.clone();
                let child_reference = pump_reference.clone();
                let submit = pump_child.update(move |current| match current {
                    None => Ok(projected.map(|value| {
                        ChangeItem::full(owner, child_reference, Some(value), changed_by, 1)
                    })),
                    Some(current) => {
                        Ok(Some(ChangeItem::compute(current, projected, changed_by)))
                    }
                });
                if submit.is_err() {
                    break;
                }
            }
            pump_child.dispose();
        });

        let handle: Box<dyn ChildHandle> = Box::new(TypedChild(child.clone()));
        reduced.insert(reference, Box::new(handle));
        Ok(child)
    }
}

/// One observer's attachment to a stream. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChangeItem<T>>,
    commands: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Subscription<T> {
    /// Receive the next revision. `None` means the stream was disposed.
    pub async fn recv(&mut self) -> Option<ChangeItem<T>> {
        self.rx.recv().await
    }

    /// Non-blocking receive for tests and polling consumers.
    pub fn try_recv(&mut self) -> Option<ChangeItem<T>> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unsubscribe(self.id));
    }
}

struct Actor<T> {
    owner: Address,
    reference: StreamReference,
    mode: InitializationMode,
    current: Option<ChangeItem<T>>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<ChangeItem<T>>)>,
    disposables: Vec<Box<dyn FnOnce() + Send>>,
    initialized: watch::Sender<bool>,
}

impl<T: Clone + Send + 'static> Actor<T> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<T>>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Initialize(item, reply) => {
                    let result = if self.current.is_some() {
                        Err(StreamError::AlreadyInitialized)
                    } else {
                        self.accept(item);
                        Ok(())
                    };
                    let _ = reply.send(result);
                }
                Command::Update(f, reply) => {
                    let outcome = self.apply_update(f);
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    } else if let Err(error) = &outcome {
                        tracing::warn!(reference = %self.reference, %error, "update rejected");
                    } else if let Ok(UpdateOutcome::Failed { reason }) = &outcome {
                        tracing::warn!(reference = %self.reference, %reason, "update failed");
                    }
                }
                Command::Subscribe(id, tx) => {
                    if let Some(current) = &self.current {
                        let _ = tx.send(current.clone());
                    }
                    self.subscribers.push((id, tx));
                }
                Command::Unsubscribe(id) => {
                    self.subscribers.retain(|(sid, _)| *sid != id);
                }
                Command::AttachDisposable(f) => {
                    self.disposables.push(f);
                }
                Command::Dispose => break,
            }
        }
        // Reached on Dispose or when every handle is gone; either way
        // teardown runs exactly once.
        for disposable in self.disposables.drain(..) {
            disposable();
        }
        self.subscribers.clear();
    }

    fn apply_update(&mut self, f: UpdateFn<T>) -> Result<UpdateOutcome> {
        if self.current.is_none() && self.mode == InitializationMode::Manual {
            return Err(StreamError::NotInitialized);
        }
        match f(self.current.as_ref()) {
            Err(reason) => Ok(UpdateOutcome::Failed { reason }),
            Ok(None) => Ok(UpdateOutcome::NoChange),
            Ok(Some(item)) if !item.requires_broadcast() => Ok(UpdateOutcome::NoChange),
            Ok(Some(item)) => {
                let item = match &self.current {
                    // The stream owns version assignment; remote-driven
                    // items may carry a larger version (a resync jump)
                    // which is respected, anything else is renumbered.
                    Some(current) => {
                        let version = item.version().max(current.version() + 1);
                        item.with_version(version)
                    }
                    None => {
                        // Automatic-mode seeding: the first accepted
                        // update is a full revision by definition.
                        let version = item.version().max(1);
                        let changed_by = item.changed_by().clone();
                        ChangeItem::full(
                            self.owner.clone(),
                            self.reference.clone(),
                            item.into_value(),
                            changed_by,
                            version,
                        )
                    }
                };
                let version = item.version();
                self.accept(item);
                Ok(UpdateOutcome::Applied { version })
            }
        }
    }

    fn accept(&mut self, item: ChangeItem<T>) {
        self.current = Some(item.clone());
        self.initialized.send_replace(true);
        self.subscribers.retain(|(_, tx)| tx.send(item.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use statesync_core::{ChangeType, EntityStore};

    fn owner() -> Address {
        Address::new("owner")
    }

    fn seed_item(store: EntityStore) -> ChangeItem<EntityStore> {
        ChangeItem::full(owner(), StreamReference::Store, Some(store), owner(), 1)
    }

    fn store_stream(mode: InitializationMode) -> SynchronizationStream<EntityStore> {
        SynchronizationStream::new(
            owner(),
            StreamReference::Store,
            mode,
            Arc::new(crate::reduce::store_reducers()),
        )
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let stream = store_stream(InitializationMode::Manual);
        stream.initialize(seed_item(EntityStore::new())).await.unwrap();
        let err = stream
            .initialize(seed_item(EntityStore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn test_manual_mode_rejects_update_before_initialize() {
        let stream = store_stream(InitializationMode::Manual);
        let err = stream
            .request_update(|current| {
                let store = EntityStore::new().with_instance("people", "1", json!({}));
                match current {
                    None => Ok(Some(seed_item(store))),
                    Some(c) => Ok(Some(ChangeItem::compute(c, Some(store), Address::new("owner")))),
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::NotInitialized));

        // After initialize the same update succeeds.
        stream.initialize(seed_item(EntityStore::new())).await.unwrap();
        let outcome = stream
            .request_update(|current| {
                let store = EntityStore::new().with_instance("people", "1", json!({}));
                Ok(Some(ChangeItem::compute(
                    current.unwrap(),
                    Some(store),
                    Address::new("owner"),
                )))
            })
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied { version: 2 }));
    }

    #[tokio::test]
    async fn test_automatic_mode_first_update_seeds_full() {
        let stream = store_stream(InitializationMode::Automatic);
        let mut sub = stream.subscribe().unwrap();

        let outcome = stream
            .request_update(|_| Ok(Some(seed_item(EntityStore::new()))))
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied { version: 1 }));

        let item = sub.recv().await.unwrap();
        assert_eq!(item.change_type(), ChangeType::Full);
        assert_eq!(item.version(), 1);
    }

    #[tokio::test]
    async fn test_replay_of_one_on_subscribe() {
        let stream = store_stream(InitializationMode::Manual);
        stream.initialize(seed_item(EntityStore::new())).await.unwrap();

        let mut sub = stream.subscribe().unwrap();
        let replayed = sub.recv().await.unwrap();
        assert_eq!(replayed.version(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialize_without_loss() {
        let stream = store_stream(InitializationMode::Manual);
        stream.initialize(seed_item(EntityStore::new())).await.unwrap();
        let mut sub = stream.subscribe().unwrap();
        let _ = sub.recv().await.unwrap(); // replay

        let add = |id: &'static str| {
            let stream = stream.clone();
            async move {
                stream
                    .request_update(move |current| {
                        let current = current.unwrap();
                        let store = current
                            .value()
                            .unwrap()
                            .with_instance("people", id, json!({"id": id}));
                        Ok(Some(ChangeItem::compute(current, Some(store), owner())))
                    })
                    .await
            }
        };

        let (a, b) = tokio::join!(add("3"), add("4"));
        assert!(matches!(a.unwrap(), UpdateOutcome::Applied { .. }));
        assert!(matches!(b.unwrap(), UpdateOutcome::Applied { .. }));

        // Exactly two broadcast revisions, versions 2 and 3, and the
        // final store holds both entities.
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.version(), 2);
        assert_eq!(second.version(), 3);
        let store = second.value().unwrap();
        assert!(store.instance("people", "3").is_some());
        assert!(store.instance("people", "4").is_some());
    }

    #[tokio::test]
    async fn test_no_update_suppresses_broadcast() {
        let stream = store_stream(InitializationMode::Manual);
        let store = EntityStore::new().with_instance("people", "1", json!({"name": "Ann"}));
        stream.initialize(seed_item(store.clone())).await.unwrap();
        let mut sub = stream.subscribe().unwrap();
        let _ = sub.recv().await.unwrap(); // replay

        let outcome = stream
            .request_update(move |current| {
                Ok(Some(ChangeItem::compute(
                    current.unwrap(),
                    Some(store),
                    owner(),
                )))
            })
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NoChange);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_fails_fast() {
        let stream = store_stream(InitializationMode::Manual);
        let disposed = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&disposed);
        stream
            .register_disposable(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        stream.dispose();
        stream.dispose();
        tokio::task::yield_now().await;

        assert!(stream.is_disposed());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            stream.update(|_| Ok(None)),
            Err(StreamError::Disposed)
        ));
        assert!(matches!(
            stream.subscribe(),
            Err(StreamError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_dispose_completes_subscriptions() {
        let stream = store_stream(InitializationMode::Manual);
        stream.initialize(seed_item(EntityStore::new())).await.unwrap();
        let mut sub = stream.subscribe().unwrap();
        let _ = sub.recv().await.unwrap();

        stream.dispose();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reduce_projects_and_caches() {
        let stream = store_stream(InitializationMode::Manual);
        let store = EntityStore::new().with_instance("people", "1", json!({"name": "Ann"}));
        stream.initialize(seed_item(store)).await.unwrap();

        let reference = StreamReference::collection("people");
        let reduced: SynchronizationStream<Value> = stream.reduce(reference.clone()).unwrap();
        reduced.wait_initialized().await.unwrap();

        let mut sub = reduced.subscribe().unwrap();
        let item = sub.recv().await.unwrap();
        assert_eq!(item.value().unwrap(), &json!({"1": {"name": "Ann"}}));

        // Same reference -> same stream.
        let again: SynchronizationStream<Value> = stream.reduce(reference).unwrap();
        let mut sub2 = again.subscribe().unwrap();
        assert_eq!(
            sub2.recv().await.unwrap().value(),
            Some(&json!({"1": {"name": "Ann"}}))
        );
    }

    #[tokio::test]
    async fn test_reduce_missing_reducer_fails_at_first_use() {
        let stream: SynchronizationStream<EntityStore> = SynchronizationStream::new(
            owner(),
            StreamReference::Store,
            InitializationMode::Manual,
            Arc::new(ReduceManager::new()),
        );
        let err = stream
            .reduce::<Value>(StreamReference::collection("people"))
            .unwrap_err();
        assert!(matches!(err, StreamError::Reduce(_)));
    }

    #[tokio::test]
    async fn test_reduced_write_back_feeds_parent() {
        let stream = store_stream(InitializationMode::Manual);
        let store = EntityStore::new().with_instance("people", "1", json!({"name": "Ann"}));
        stream.initialize(seed_item(store)).await.unwrap();

        let reference = StreamReference::instance("people", "1");
        let reduced: SynchronizationStream<Value> = stream.reduce(reference.clone()).unwrap();
        reduced.wait_initialized().await.unwrap();

        let change = ChangeItem::full(
            owner(),
            reference,
            Some(json!({"name": "Anna"})),
            Address::new("client"),
            1,
        );
        let outcome = reduced.request_change(change).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied { .. }));

        // Parent saw the backfed change.
        let mut parent_sub = stream.subscribe().unwrap();
        let parent_item = parent_sub.recv().await.unwrap();
        assert_eq!(
            parent_item.value().unwrap().instance("people", "1"),
            Some(&json!({"name": "Anna"}))
        );
        assert_eq!(parent_item.changed_by(), &Address::new("client"));
    }

    #[tokio::test]
    async fn test_reduced_stream_follows_parent_updates() {
        let stream = store_stream(InitializationMode::Manual);
        let store = EntityStore::new().with_instance("people", "1", json!({"name": "Ann"}));
        stream.initialize(seed_item(store)).await.unwrap();

        let reduced: SynchronizationStream<Value> = stream
            .reduce(StreamReference::instance("people", "1"))
            .unwrap();
        reduced.wait_initialized().await.unwrap();
        let mut sub = reduced.subscribe().unwrap();
        assert_eq!(sub.recv().await.unwrap().value(), Some(&json!({"name": "Ann"})));

        stream
            .request_update(|current| {
                let current = current.unwrap();
                let store = current
                    .value()
                    .unwrap()
                    .with_instance("people", "1", json!({"name": "Anna"}));
                Ok(Some(ChangeItem::compute(current, Some(store), owner())))
            })
            .await
            .unwrap();

        let item = sub.recv().await.unwrap();
        assert_eq!(item.value(), Some(&json!({"name": "Anna"})));
        assert_eq!(item.change_type(), ChangeType::Patch);
    }
}
