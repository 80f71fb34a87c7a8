//! Shadow scope used by `light` isolation.
//!
//! Scripts of a `light` instance see the host's global object through a
//! `ShadowScope`: reads fall through to the host, writes land in a private
//! map. A small dispatch table redirects the document title and cookie to
//! private state, and every timer registered through the scope is tracked so
//! destroying the instance cancels them together.

use mosaic_core::traits::{GlobalScope, ScopeAccess, TimerHandle, TimerHost, TimerKind};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// An accessor served from private state instead of the host.
struct Intercepted {
    name: &'static str,
    get: fn(&ShadowScope) -> Option<Value>,
    set: fn(&ShadowScope, Value),
}

const INTERCEPTED: &[Intercepted] = &[
    Intercepted {
        name: "document.title",
        get: ShadowScope::read_title,
        set: ShadowScope::write_title,
    },
    Intercepted {
        name: "document.cookie",
        get: ShadowScope::read_cookie,
        set: ShadowScope::write_cookie,
    },
];

/// Private global scope of one `light` instance.
pub struct ShadowScope {
    delegate: Arc<dyn GlobalScope>,
    timers: Arc<dyn TimerHost>,
    locals: Mutex<HashMap<String, Value>>,
    title: Mutex<String>,
    cookies: Mutex<BTreeMap<String, String>>,
    tracked: Mutex<HashSet<TimerHandle>>,
    disposed: AtomicBool,
}

impl ShadowScope {
    /// Create a scope reading through to `delegate`.
    pub fn new(delegate: Arc<dyn GlobalScope>, timers: Arc<dyn TimerHost>) -> Self {
        Self {
            delegate,
            timers,
            locals: Mutex::new(HashMap::new()),
            title: Mutex::new(String::new()),
            cookies: Mutex::new(BTreeMap::new()),
            tracked: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
        }
    }

    fn intercepted(name: &str) -> Option<&'static Intercepted> {
        INTERCEPTED.iter().find(|accessor| accessor.name == name)
    }

    fn read_title(&self) -> Option<Value> {
        Some(Value::String(self.title.lock().clone()))
    }

    fn write_title(&self, value: Value) {
        *self.title.lock() = match value {
            Value::String(title) => title,
            other => other.to_string(),
        };
    }

    fn read_cookie(&self) -> Option<Value> {
        let cookies = self.cookies.lock();
        let joined = cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        Some(Value::String(joined))
    }

    /// Cookie writes set one `name=value` pair; attributes after `;` are ignored.
    fn write_cookie(&self, value: Value) {
        let raw = match value {
            Value::String(raw) => raw,
            other => other.to_string(),
        };
        let pair = raw.split(';').next().unwrap_or("");
        if let Some((name, value)) = pair.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                self.cookies
                    .lock()
                    .insert(name.to_string(), value.trim().to_string());
            }
        }
    }

    /// A value written into the private scope.
    pub fn local(&self, name: &str) -> Option<Value> {
        self.locals.lock().get(name).cloned()
    }

    /// Names written into the private scope.
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.locals.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Private document title.
    pub fn title(&self) -> String {
        self.title.lock().clone()
    }

    /// Private cookie string.
    pub fn cookie(&self) -> String {
        match self.read_cookie() {
            Some(Value::String(cookie)) => cookie,
            _ => String::new(),
        }
    }

    /// Timers registered through this scope and not yet cancelled.
    pub fn tracked_timers(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Cancel every tracked timer. Timers registered afterwards are cancelled
    /// immediately.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let handles: Vec<TimerHandle> = self.tracked.lock().drain().collect();
        debug!("Cancelling {} timers of a shadow scope", handles.len());
        for handle in handles {
            self.timers.cancel(handle);
        }
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl ScopeAccess for ShadowScope {
    fn get(&self, name: &str) -> Option<Value> {
        if let Some(accessor) = Self::intercepted(name) {
            return (accessor.get)(self);
        }
        if let Some(value) = self.locals.lock().get(name) {
            return Some(value.clone());
        }
        self.delegate.get(name)
    }

    fn set(&self, name: &str, value: Value) {
        if let Some(accessor) = Self::intercepted(name) {
            (accessor.set)(self, value);
            return;
        }
        trace!("Shadowing global '{}'", name);
        self.locals.lock().insert(name.to_string(), value);
    }

    fn schedule(&self, kind: TimerKind, delay: Duration) -> TimerHandle {
        let handle = self.timers.schedule(kind, delay);
        if self.is_disposed() {
            self.timers.cancel(handle);
        } else {
            self.tracked.lock().insert(handle);
        }
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        self.tracked.lock().remove(&handle);
        self.timers.cancel(handle);
    }
}

impl std::fmt::Debug for ShadowScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowScope")
            .field("locals", &self.local_names())
            .field("tracked_timers", &self.tracked_timers())
            .finish()
    }
}
