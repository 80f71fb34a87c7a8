//! In-memory host doubles.
//!
//! These implement every host-environment trait with recording fakes so the
//! isolation strategies and the runtime can be exercised without a rendering
//! engine. Enabled with the `testing` feature.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{IsolationError, LoadError, Result, ScriptError};
use crate::id::{ContextId, InstanceId};
use crate::traits::{
    ContentContainer, ContentFetcher, ContextFactory, ExecutionContext, GlobalScope, OverlayHooks,
    ScriptHost, ScriptScope, TimerHandle, TimerHost, TimerKind,
};
use crate::types::{ContentNode, Presentation, SandboxPolicy, ScriptBlock};

/// Hook invoked with every message posted into a fake context.
pub type PostHook = Arc<dyn Fn(ContextId, Value, String) + Send + Sync>;

/// How `FakeContext::load` behaves.
#[derive(Debug, Clone)]
pub enum LoadBehavior {
    /// Resolve immediately.
    Succeed,

    /// Resolve after a delay.
    Delay(Duration),

    /// Fail with the given error.
    Fail(LoadError),

    /// Never resolve.
    Hang,
}

#[derive(Debug)]
struct FakeContextState {
    loads: Vec<Url>,
    resets: u32,
    injected: Vec<String>,
    posted: Vec<(Value, String)>,
    sandbox: Option<SandboxPolicy>,
    presentation: Presentation,
    reachable: bool,
    destroyed: bool,
    fail_reset: bool,
    load_behavior: LoadBehavior,
}

/// A recording execution context.
pub struct FakeContext {
    id: ContextId,
    state: Mutex<FakeContextState>,
    post_hook: Mutex<Option<PostHook>>,
}

impl std::fmt::Debug for FakeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeContext").field("id", &self.id).finish()
    }
}

impl FakeContext {
    /// Create a fake context with the given load behavior.
    pub fn new(load_behavior: LoadBehavior) -> Self {
        Self {
            id: ContextId::new(),
            state: Mutex::new(FakeContextState {
                loads: Vec::new(),
                resets: 0,
                injected: Vec::new(),
                posted: Vec::new(),
                sandbox: None,
                presentation: Presentation::Inline,
                reachable: true,
                destroyed: false,
                fail_reset: false,
                load_behavior,
            }),
            post_hook: Mutex::new(None),
        }
    }

    /// Sources this context was navigated to.
    pub fn loads(&self) -> Vec<Url> {
        self.state.lock().loads.clone()
    }

    /// Number of resets.
    pub fn resets(&self) -> u32 {
        self.state.lock().resets
    }

    /// Scripts injected into this context.
    pub fn injected(&self) -> Vec<String> {
        self.state.lock().injected.clone()
    }

    /// Messages posted into this context with their target origins.
    pub fn posted(&self) -> Vec<(Value, String)> {
        self.state.lock().posted.clone()
    }

    /// Last sandbox policy applied.
    pub fn sandbox(&self) -> Option<SandboxPolicy> {
        self.state.lock().sandbox.clone()
    }

    /// Current presentation.
    pub fn presentation(&self) -> Presentation {
        self.state.lock().presentation
    }

    /// Whether `destroy` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Make the context unreachable; resets will then fail.
    pub fn set_unreachable(&self) {
        let mut state = self.state.lock();
        state.reachable = false;
        state.fail_reset = true;
    }

    /// Make the next resets fail while staying reachable.
    pub fn set_fail_reset(&self, fail: bool) {
        self.state.lock().fail_reset = fail;
    }

    /// Change the load behavior.
    pub fn set_load_behavior(&self, behavior: LoadBehavior) {
        self.state.lock().load_behavior = behavior;
    }

    /// Install a hook that sees every posted message.
    pub fn set_post_hook(&self, hook: Option<PostHook>) {
        *self.post_hook.lock() = hook;
    }
}

#[async_trait]
impl ExecutionContext for FakeContext {
    fn id(&self) -> ContextId {
        self.id
    }

    async fn load(&self, source: &Url) -> Result<(), LoadError> {
        let behavior = {
            let mut state = self.state.lock();
            state.loads.push(source.clone());
            state.load_behavior.clone()
        };

        match behavior {
            LoadBehavior::Succeed => Ok(()),
            LoadBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            LoadBehavior::Fail(err) => Err(err),
            LoadBehavior::Hang => std::future::pending().await,
        }
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_reset {
            return Err(IsolationError::ContextUnreachable(self.id).into());
        }
        state.resets += 1;
        state.injected.clear();
        state.presentation = Presentation::Inline;
        Ok(())
    }

    fn apply_sandbox(&self, policy: &SandboxPolicy) {
        self.state.lock().sandbox = Some(policy.clone());
    }

    fn inject_script(&self, script: &str) -> Result<()> {
        self.state.lock().injected.push(script.to_string());
        Ok(())
    }

    fn post_message(&self, data: Value, target_origin: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(IsolationError::ContextUnreachable(self.id).into());
            }
            state.posted.push((data.clone(), target_origin.to_string()));
        }

        let hook = self.post_hook.lock().clone();
        if let Some(hook) = hook {
            hook(self.id, data, target_origin.to_string());
        }
        Ok(())
    }

    fn set_presentation(&self, presentation: Presentation) {
        self.state.lock().presentation = presentation;
    }

    fn is_reachable(&self) -> bool {
        let state = self.state.lock();
        state.reachable && !state.destroyed
    }

    fn destroy(&self) {
        self.state.lock().destroyed = true;
    }
}

/// A context factory that records every context it creates.
pub struct FakeContextFactory {
    created: Mutex<Vec<Arc<FakeContext>>>,
    load_behavior: Mutex<LoadBehavior>,
    post_hook: Mutex<Option<PostHook>>,
    fail_next: AtomicBool,
}

impl Default for FakeContextFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeContextFactory {
    /// Create a factory whose contexts load successfully.
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            load_behavior: Mutex::new(LoadBehavior::Succeed),
            post_hook: Mutex::new(None),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Load behavior for contexts created from now on.
    pub fn set_load_behavior(&self, behavior: LoadBehavior) {
        *self.load_behavior.lock() = behavior;
    }

    /// Post hook for contexts created from now on.
    pub fn set_post_hook(&self, hook: PostHook) {
        *self.post_hook.lock() = Some(hook);
    }

    /// Make the next `create_context` fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every context created so far, in creation order.
    pub fn contexts(&self) -> Vec<Arc<FakeContext>> {
        self.created.lock().clone()
    }

    /// Look up a created context.
    pub fn context(&self, id: ContextId) -> Option<Arc<FakeContext>> {
        self.created.lock().iter().find(|c| c.id == id).cloned()
    }

    /// Number of contexts created so far.
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl ContextFactory for FakeContextFactory {
    fn create_context(&self) -> Result<Arc<dyn ExecutionContext>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(IsolationError::ContextCreationFailed("simulated failure".into()).into());
        }

        let context = Arc::new(FakeContext::new(self.load_behavior.lock().clone()));
        context.set_post_hook(self.post_hook.lock().clone());
        self.created.lock().push(context.clone());
        Ok(context)
    }
}

#[derive(Debug, Default)]
struct FakeContainerState {
    nodes: Vec<ContentNode>,
    boundaries: Vec<Arc<FakeContainer>>,
    contexts: Vec<ContextId>,
    height: Option<u32>,
    clears: u32,
}

/// A recording content container.
#[derive(Debug, Default)]
pub struct FakeContainer {
    state: Mutex<FakeContainerState>,
}

impl FakeContainer {
    /// Create an empty container.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Nodes currently appended.
    pub fn nodes(&self) -> Vec<ContentNode> {
        self.state.lock().nodes.clone()
    }

    /// Boundaries attached so far.
    pub fn boundaries(&self) -> Vec<Arc<FakeContainer>> {
        self.state.lock().boundaries.clone()
    }

    /// Contexts currently attached, including those inside boundaries.
    pub fn attached_contexts(&self) -> Vec<ContextId> {
        let state = self.state.lock();
        let mut contexts = state.contexts.clone();
        for boundary in &state.boundaries {
            contexts.extend(boundary.attached_contexts());
        }
        contexts
    }

    /// Last height set on this container or any of its boundaries.
    pub fn height(&self) -> Option<u32> {
        let state = self.state.lock();
        state
            .boundaries
            .iter()
            .rev()
            .find_map(|boundary| boundary.height())
            .or(state.height)
    }

    /// Number of `clear` calls.
    pub fn clears(&self) -> u32 {
        self.state.lock().clears
    }
}

impl ContentContainer for FakeContainer {
    fn append(&self, node: ContentNode) {
        self.state.lock().nodes.push(node);
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.nodes.clear();
        state.contexts.clear();
        state.boundaries.clear();
        state.clears += 1;
    }

    fn attach_boundary(&self) -> Arc<dyn ContentContainer> {
        let boundary = FakeContainer::new();
        self.state.lock().boundaries.push(boundary.clone());
        boundary
    }

    fn attach_context(&self, context: &Arc<dyn ExecutionContext>) {
        self.state.lock().contexts.push(context.id());
    }

    fn detach_context(&self, context: ContextId) {
        self.state.lock().contexts.retain(|id| *id != context);
    }

    fn set_height(&self, height: u32) {
        self.state.lock().height = Some(height);
    }
}

/// A fetcher serving canned documents.
#[derive(Default)]
pub struct FakeFetcher {
    documents: Mutex<HashMap<String, Result<String, LoadError>>>,
    fetches: Mutex<Vec<Url>>,
}

impl FakeFetcher {
    /// Create an empty fetcher; every fetch fails as unreachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` at `url`.
    pub fn serve(&self, url: &str, body: &str) {
        self.documents
            .lock()
            .insert(url.to_string(), Ok(body.to_string()));
    }

    /// Fail fetches of `url` with `error`.
    pub fn fail(&self, url: &str, error: LoadError) {
        self.documents.lock().insert(url.to_string(), Err(error));
    }

    /// URLs fetched so far.
    pub fn fetches(&self) -> Vec<Url> {
        self.fetches.lock().clone()
    }
}

#[async_trait]
impl ContentFetcher for FakeFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, LoadError> {
        self.fetches.lock().push(url.clone());
        self.documents
            .lock()
            .get(url.as_str())
            .cloned()
            .unwrap_or_else(|| Err(LoadError::Unreachable(url.to_string())))
    }
}

/// A global object backed by a map.
#[derive(Default)]
pub struct FakeGlobals {
    values: Mutex<HashMap<String, Value>>,
}

impl FakeGlobals {
    /// Create an empty global object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a property.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.values.lock().get(name).cloned()
    }
}

impl GlobalScope for FakeGlobals {
    fn get(&self, name: &str) -> Option<Value> {
        self.value(name)
    }

    fn set(&self, name: &str, value: Value) {
        self.values.lock().insert(name.to_string(), value);
    }
}

/// A timer facility that only tracks registrations.
#[derive(Default)]
pub struct FakeTimers {
    next: AtomicU64,
    active: Mutex<HashSet<TimerHandle>>,
}

impl FakeTimers {
    /// Create an empty timer facility.
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers scheduled and not cancelled.
    pub fn active(&self) -> usize {
        self.active.lock().len()
    }
}

impl TimerHost for FakeTimers {
    fn schedule(&self, _kind: TimerKind, _delay: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.active.lock().insert(handle);
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        self.active.lock().remove(&handle);
    }
}

/// A script engine interpreting a tiny line-based language.
///
/// Each line is one statement:
/// - `set NAME JSON` writes a global property
/// - `timer MS` schedules a timeout
/// - `frame` requests an animation frame
/// - `throw MESSAGE` fails the script
///
/// Anything else is ignored. `ScriptScope::Host` writes go to `globals`.
pub struct FakeScriptHost {
    globals: Arc<FakeGlobals>,
    timers: Arc<FakeTimers>,
    executed: Mutex<Vec<(String, bool)>>,
}

impl FakeScriptHost {
    /// Create a script host writing host-scope globals into `globals`.
    pub fn new(globals: Arc<FakeGlobals>, timers: Arc<FakeTimers>) -> Self {
        Self {
            globals,
            timers,
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Scripts executed so far, with whether they ran in an intercepted scope.
    pub fn executed(&self) -> Vec<(String, bool)> {
        self.executed.lock().clone()
    }
}

impl ScriptHost for FakeScriptHost {
    fn execute(&self, script: &ScriptBlock, scope: ScriptScope<'_>) -> Result<(), ScriptError> {
        self.executed
            .lock()
            .push((script.code.clone(), matches!(scope, ScriptScope::Scoped(_))));

        for line in script.code.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("set ") {
                let (name, raw) = rest.split_once(' ').unwrap_or((rest, "null"));
                let value = serde_json::from_str(raw).unwrap_or(Value::String(raw.to_string()));
                match scope {
                    ScriptScope::Host => self.globals.set(name, value),
                    ScriptScope::Scoped(access) => access.set(name, value),
                }
            } else if let Some(ms) = line.strip_prefix("timer ") {
                let delay = Duration::from_millis(ms.parse().unwrap_or(0));
                match scope {
                    ScriptScope::Host => {
                        self.timers.schedule(TimerKind::Timeout, delay);
                    }
                    ScriptScope::Scoped(access) => {
                        access.schedule(TimerKind::Timeout, delay);
                    }
                }
            } else if line == "frame" {
                match scope {
                    ScriptScope::Host => {
                        self.timers.schedule(TimerKind::AnimationFrame, Duration::ZERO);
                    }
                    ScriptScope::Scoped(access) => {
                        access.schedule(TimerKind::AnimationFrame, Duration::ZERO);
                    }
                }
            } else if let Some(message) = line.strip_prefix("throw ") {
                return Err(ScriptError::new(message));
            }
        }
        Ok(())
    }
}

/// Overlay hooks that record promotions.
#[derive(Default)]
pub struct FakeOverlayHooks {
    events: Mutex<Vec<(InstanceId, bool)>>,
}

impl FakeOverlayHooks {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(instance, entered)` pairs.
    pub fn events(&self) -> Vec<(InstanceId, bool)> {
        self.events.lock().clone()
    }
}

impl OverlayHooks for FakeOverlayHooks {
    fn promotion_entered(&self, instance: InstanceId) {
        self.events.lock().push((instance, true));
    }

    fn promotion_exited(&self, instance: InstanceId) {
        self.events.lock().push((instance, false));
    }
}
