//! Per-call ambient state that follows a request across retries and requeues.
//!
//! An [`AmbientContext`] is an immutable keyed snapshot. Code that wants to add a value derives a
//! new snapshot with [`AmbientContext::with`] and runs the rest of the call inside
//! [`AmbientContext::scope`]. The snapshot is only visible inside that scope; once the scope's
//! future completes the previous context is back in effect.
//!
//! The dispatch stack captures the active snapshot when a call enters the client and installs
//! it around every attempt, so an attempt that runs long after the caller's own scope unwound
//! (for example, a retry on a spawned task) still sees the caller's values.
//!
//! ```rust
//! use dispatchline::context::{AmbientContext, ContextKey};
//!
//! static TRACE_ID: ContextKey<u64> = ContextKey::new("trace_id");
//!
//! # #[tokio::main]
//! # async fn main() {
//! let ctx = AmbientContext::current().with(&TRACE_ID, 42);
//! ctx.scope(async {
//!     assert_eq!(AmbientContext::current().get(&TRACE_ID).as_deref(), Some(&42));
//! })
//! .await;
//! assert!(AmbientContext::current().get(&TRACE_ID).is_none());
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT: AmbientContext;
}

/// Typed key into an [`AmbientContext`]. Keys are compared by name.
pub struct ContextKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextKey").field(&self.name).finish()
    }
}

type Value = Arc<dyn Any + Send + Sync>;

/// Immutable snapshot of ambient values. Cloning is cheap.
#[derive(Clone, Default)]
pub struct AmbientContext {
    entries: Arc<HashMap<&'static str, Value>>,
}

impl AmbientContext {
    /// The snapshot installed for the running task, or an empty one.
    pub fn current() -> Self {
        CURRENT.try_with(Clone::clone).unwrap_or_default()
    }

    pub fn get<T>(&self, key: &ContextKey<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.entries.get(key.name).and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    /// A new snapshot with `key` bound to `value`. `self` is left untouched.
    pub fn with<T>(&self, key: &ContextKey<T>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        let mut entries = (*self.entries).clone();
        entries.insert(key.name, Arc::new(value));
        Self { entries: Arc::new(entries) }
    }

    /// A new snapshot without `key`.
    pub fn without<T>(&self, key: &ContextKey<T>) -> Self {
        if !self.entries.contains_key(key.name) {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.remove(key.name);
        Self { entries: Arc::new(entries) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `fut` with this snapshot installed. The previous snapshot is restored when `fut`
    /// completes or is dropped.
    pub fn scope<F: Future>(self, fut: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(self, fut)
    }

    /// Run `f` with this snapshot installed.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self, f)
    }
}

impl fmt::Debug for AmbientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("AmbientContext").field("keys", &keys).finish()
    }
}

/// Snapshot of the current context.
pub fn capture() -> AmbientContext {
    AmbientContext::current()
}

/// Run `body` with `snapshot` installed.
pub fn install<F: Future>(snapshot: AmbientContext, body: F) -> impl Future<Output = F::Output> {
    snapshot.scope(body)
}
