//! Interception of named capabilities
//!
//! A [`Capabilities`] table maps names to callable targets. An [`Aspect`]
//! replaces selected targets with wrappers that run its [`Advice`] around
//! the original, and records itself in each target's interceptor chain.

use crate::events::EventBus;
use crate::{next_uid, ModuleError, Result};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A callable capability
pub type Target = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// One piece of advice
pub type AdviceFn = Arc<dyn Fn(&mut JoinPoint) -> anyhow::Result<()> + Send + Sync>;

/// Per-call context handed to advice
pub struct JoinPoint {
    /// Name of the capability table
    pub context_name: String,
    /// Name of the intercepted target
    pub target_name: String,
    target: Target,
    /// Call arguments
    pub arguments: Vec<Value>,
    /// Value returned to the caller
    pub result: Value,
    /// Rendered error, if advice or target failed
    pub error: Option<String>,
    /// Set by advice to skip the rest of the call
    pub stop: bool,
    /// Latest data published per event name
    pub event_datas: BTreeMap<String, Value>,
}

impl JoinPoint {
    fn new(context_name: String, target_name: String, target: Target, arguments: Vec<Value>) -> Self {
        Self {
            context_name,
            target_name,
            target,
            arguments,
            result: Value::Null,
            error: None,
            stop: false,
            event_datas: BTreeMap::new(),
        }
    }

    /// Invoke the original target with the current arguments and store the
    /// result
    pub fn proceed(&mut self) -> anyhow::Result<Value> {
        let result = (self.target)(&self.arguments)?;
        self.result = result.clone();
        Ok(result)
    }
}

impl fmt::Debug for JoinPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinPoint")
            .field("context_name", &self.context_name)
            .field("target_name", &self.target_name)
            .field("arguments", &self.arguments)
            .field("result", &self.result)
            .field("error", &self.error)
            .field("stop", &self.stop)
            .field("event_datas", &self.event_datas)
            .finish()
    }
}

/// Behaviour injected around a target
#[derive(Clone, Default)]
pub struct Advice {
    before: Option<AdviceFn>,
    around: Option<AdviceFn>,
    after: Option<AdviceFn>,
    throwing: Option<AdviceFn>,
    events: BTreeMap<String, AdviceFn>,
}

impl Advice {
    /// Advice that does nothing until phases are added
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs first; setting `stop` in any advice makes the call return `Null`
    pub fn before<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut JoinPoint) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(f));
        self
    }

    /// Runs instead of the target; call [`JoinPoint::proceed`] to reach it
    pub fn around<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut JoinPoint) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.around = Some(Arc::new(f));
        self
    }

    /// Runs after the target unless `around` stopped the call
    pub fn after<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut JoinPoint) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.after = Some(Arc::new(f));
        self
    }

    /// Receives the join point of a failed call; the error is suppressed
    pub fn throwing<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut JoinPoint) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.throwing = Some(Arc::new(f));
        self
    }

    /// Re-run `f` whenever `name` is published on an intercepted target
    pub fn on_event<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut JoinPoint) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Returns `true` when any advice set `stop`
    fn run(&self, join_point: &mut JoinPoint) -> anyhow::Result<bool> {
        if let Some(before) = &self.before {
            before(join_point)?;
            if join_point.stop {
                return Ok(true);
            }
        }
        match &self.around {
            Some(around) => around(join_point)?,
            None => {
                join_point.proceed()?;
            }
        }
        if join_point.stop {
            return Ok(true);
        }
        if let Some(after) = &self.after {
            after(join_point)?;
        }
        Ok(join_point.stop)
    }
}

struct Slot {
    target: Target,
    interceptors: Vec<String>,
    events: EventBus<Value>,
}

struct CapabilitiesInner {
    name: String,
    order: RwLock<Vec<String>>,
    slots: RwLock<FxHashMap<String, Slot>>,
}

/// Named table of interceptable functions
#[derive(Clone)]
pub struct Capabilities {
    inner: Arc<CapabilitiesInner>,
}

impl Capabilities {
    /// Create an empty table called `name`
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(CapabilitiesInner {
                name: name.to_string(),
                order: RwLock::new(Vec::new()),
                slots: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    /// Name used as the join point context
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register or replace `name`; replacing drops existing interceptors
    pub fn register<F>(&self, name: &str, target: F) -> &Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let slot = Slot {
            target: Arc::new(target),
            interceptors: Vec::new(),
            events: EventBus::new(),
        };
        if self.inner.slots.write().insert(name.to_string(), slot).is_none() {
            self.inner.order.write().push(name.to_string());
        }
        self
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<String> {
        self.inner.order.read().clone()
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.inner.slots.read().contains_key(name)
    }

    /// Aspect ids wrapped around `name`, innermost first
    pub fn interceptors(&self, name: &str) -> Vec<String> {
        self.inner
            .slots
            .read()
            .get(name)
            .map(|slot| slot.interceptors.clone())
            .unwrap_or_default()
    }

    fn not_found(&self, name: &str) -> ModuleError {
        ModuleError::TargetNotFound {
            context: self.inner.name.clone(),
            name: name.to_string(),
        }
    }

    /// Current callable of `name`
    pub fn target(&self, name: &str) -> Result<Target> {
        self.inner
            .slots
            .read()
            .get(name)
            .map(|slot| Arc::clone(&slot.target))
            .ok_or_else(|| self.not_found(name))
    }

    /// Call `name` with `arguments`
    pub fn call(&self, name: &str, arguments: &[Value]) -> anyhow::Result<Value> {
        let target = self.target(name)?;
        target(arguments)
    }

    /// Publish `event` on the event channel of target `name`.
    /// Returns the number of hooks notified.
    pub fn publish(&self, name: &str, event: &str, data: Value) -> Result<usize> {
        let events = self.events(name)?;
        Ok(events.emit(event, &data))
    }

    fn events(&self, name: &str) -> Result<EventBus<Value>> {
        self.inner
            .slots
            .read()
            .get(name)
            .map(|slot| slot.events.clone())
            .ok_or_else(|| self.not_found(name))
    }

    /// Replace the target of `name` with `wrap(target)` and record
    /// `interceptor` in its chain
    pub(crate) fn intercept<W>(&self, name: &str, interceptor: &str, wrap: W) -> Result<()>
    where
        W: FnOnce(Target) -> Target,
    {
        let mut slots = self.inner.slots.write();
        let slot = slots.get_mut(name).ok_or_else(|| self.not_found(name))?;
        slot.target = wrap(Arc::clone(&slot.target));
        slot.interceptors.push(interceptor.to_string());
        Ok(())
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("name", &self.inner.name)
            .field("targets", &self.names())
            .finish()
    }
}

/// A reusable bundle of advice
#[derive(Clone)]
pub struct Aspect {
    id: String,
    advice: Advice,
}

impl Aspect {
    /// Aspect called `id` applying `advice`
    pub fn new(id: &str, advice: Advice) -> Self {
        Self {
            id: id.to_string(),
            advice,
        }
    }

    /// Aspect with a generated id
    pub fn anonymous(advice: Advice) -> Self {
        Self::new(&format!("_anonymous_aspect_{}", next_uid()), advice)
    }

    /// Id recorded in interceptor chains
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wrap the listed targets, or every registered target when `names` is
    /// `None`. Unknown names fail before anything is wrapped.
    pub fn point_cut(&self, capabilities: &Capabilities, names: Option<&[&str]>) -> Result<()> {
        let names: Vec<String> = match names {
            Some(names) => names.iter().map(|s| s.to_string()).collect(),
            None => capabilities.names(),
        };
        if let Some(missing) = names.iter().find(|name| !capabilities.contains(name)) {
            return Err(capabilities.not_found(missing));
        }

        for name in &names {
            let original = capabilities.target(name)?;
            let current: Arc<Mutex<Option<JoinPoint>>> = Arc::new(Mutex::new(None));
            self.hook_events(capabilities, name, &original, &current)?;

            let wrapper = Wrapper {
                aspect_id: self.id.clone(),
                advice: self.advice.clone(),
                context_name: capabilities.name().to_string(),
                target_name: name.clone(),
                current,
            };
            capabilities.intercept(name, &self.id, move |target| wrapper.into_target(target))?;
            debug!("Aspect {} intercepts {}.{}", self.id, capabilities.name(), name);
        }
        Ok(())
    }

    fn hook_events(
        &self,
        capabilities: &Capabilities,
        name: &str,
        original: &Target,
        current: &Arc<Mutex<Option<JoinPoint>>>,
    ) -> Result<()> {
        if self.advice.events.is_empty() {
            return Ok(());
        }
        let events = capabilities.events(name)?;
        for (event, hook) in &self.advice.events {
            let hook = Arc::clone(hook);
            let current = Arc::clone(current);
            let original = Arc::clone(original);
            let event_name = event.clone();
            let context_name = capabilities.name().to_string();
            let target_name = name.to_string();
            events.on(event, move |data| {
                // Taken out so the hook may call the target without deadlocking.
                let mut join_point = current.lock().take().unwrap_or_else(|| {
                    JoinPoint::new(
                        context_name.clone(),
                        target_name.clone(),
                        Arc::clone(&original),
                        Vec::new(),
                    )
                });
                join_point.event_datas.insert(event_name.clone(), data.clone());
                if let Err(e) = hook(&mut join_point) {
                    warn!("Event hook {} on {}.{} failed: {:#}", event_name, context_name, target_name, e);
                    join_point.error = Some(format!("{:#}", e));
                }
                let mut slot = current.lock();
                if slot.is_none() {
                    *slot = Some(join_point);
                }
            });
        }
        Ok(())
    }
}

struct Wrapper {
    aspect_id: String,
    advice: Advice,
    context_name: String,
    target_name: String,
    current: Arc<Mutex<Option<JoinPoint>>>,
}

impl Wrapper {
    fn into_target(self, original: Target) -> Target {
        Arc::new(move |arguments: &[Value]| -> anyhow::Result<Value> {
            let mut join_point = JoinPoint::new(
                self.context_name.clone(),
                self.target_name.clone(),
                Arc::clone(&original),
                arguments.to_vec(),
            );

            let result = match self.advice.run(&mut join_point) {
                Ok(true) => Value::Null,
                Ok(false) => join_point.result.clone(),
                Err(e) => {
                    join_point.error = Some(format!("{:#}", e));
                    match &self.advice.throwing {
                        Some(throwing) => {
                            if let Err(e) = throwing(&mut join_point) {
                                warn!("Throwing advice of {} failed: {:#}", self.aspect_id, e);
                            }
                        }
                        None => warn!(
                            "Suppressed error in {}.{}: {:#}",
                            self.context_name, self.target_name, e
                        ),
                    }
                    join_point.result.clone()
                }
            };

            *self.current.lock() = Some(join_point);
            Ok(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_add(calls: &Arc<AtomicUsize>) -> impl Fn(&[Value]) -> anyhow::Result<Value> {
        let calls = calls.clone();
        move |args: &[Value]| -> anyhow::Result<Value> {
            calls.fetch_add(1, Ordering::SeqCst);
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        }
    }

    #[test]
    fn test_before_stop_skips_target() {
        let calls = Arc::new(AtomicUsize::new(0));
        let caps = Capabilities::new("math");
        caps.register("add", counted_add(&calls));

        let aspect = Aspect::new("guard", Advice::new().before(|jp| {
            jp.stop = true;
            Ok(())
        }));
        aspect.point_cut(&caps, Some(&["add"])).unwrap();

        assert_eq!(caps.call("add", &[json!(1), json!(2)]).unwrap(), Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(caps.interceptors("add"), vec!["guard"]);
    }

    #[test]
    fn test_around_replaces_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let caps = Capabilities::new("math");
        caps.register("add", counted_add(&calls));

        Aspect::anonymous(Advice::new().around(|jp| {
            jp.result = json!(99);
            Ok(())
        }))
        .point_cut(&caps, None)
        .unwrap();

        assert_eq!(caps.call("add", &[json!(1)]).unwrap(), json!(99));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_around_proceed_and_after() {
        let calls = Arc::new(AtomicUsize::new(0));
        let caps = Capabilities::new("math");
        caps.register("add", counted_add(&calls));

        let advice = Advice::new()
            .around(|jp| {
                jp.arguments.push(json!(10));
                jp.proceed()?;
                Ok(())
            })
            .after(|jp| {
                jp.result = json!(jp.result.as_i64().unwrap_or(0) * 2);
                Ok(())
            });
        Aspect::new("double", advice).point_cut(&caps, None).unwrap();

        assert_eq!(caps.call("add", &[json!(1), json!(2)]).unwrap(), json!(26));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_in_around_or_after_returns_null() {
        let calls = Arc::new(AtomicUsize::new(0));
        let caps = Capabilities::new("math");
        caps.register("add", counted_add(&calls));
        caps.register("sub", counted_add(&calls));

        let around = Advice::new().around(|jp| {
            jp.result = json!(99);
            jp.stop = true;
            Ok(())
        });
        Aspect::new("halt", around).point_cut(&caps, Some(&["add"])).unwrap();
        let after = Advice::new().after(|jp| {
            jp.stop = true;
            Ok(())
        });
        Aspect::new("late", after).point_cut(&caps, Some(&["sub"])).unwrap();

        assert_eq!(caps.call("add", &[json!(1)]).unwrap(), Value::Null);
        assert_eq!(caps.call("sub", &[json!(1)]).unwrap(), Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_throwing_receives_suppressed_error() {
        let caps = Capabilities::new("io");
        caps.register("read", |_: &[Value]| anyhow::bail!("disk on fire"));
        let seen = Arc::new(Mutex::new(None));

        let seen_clone = seen.clone();
        let advice = Advice::new().throwing(move |jp| {
            *seen_clone.lock() = jp.error.clone();
            jp.result = json!("fallback");
            Ok(())
        });
        Aspect::new("safe", advice).point_cut(&caps, Some(&["read"])).unwrap();

        assert_eq!(caps.call("read", &[]).unwrap(), json!("fallback"));
        assert_eq!(seen.lock().as_deref(), Some("disk on fire"));
    }

    #[test]
    fn test_unknown_target_fails_before_wrapping() {
        let caps = Capabilities::new("math");
        caps.register("add", |_: &[Value]| Ok(Value::Null));
        let result = Aspect::new("a", Advice::new()).point_cut(&caps, Some(&["add", "mul"]));

        assert!(matches!(result, Err(ModuleError::TargetNotFound { .. })));
        assert!(caps.interceptors("add").is_empty());
    }

    #[test]
    fn test_event_hooks_replay_with_data() {
        let caps = Capabilities::new("ui");
        caps.register("click", |args: &[Value]| Ok(args.first().cloned().unwrap_or(Value::Null)));
        let replays = Arc::new(Mutex::new(Vec::new()));

        let replays_clone = replays.clone();
        let advice = Advice::new().on_event("progress", move |jp| {
            replays_clone
                .lock()
                .push((jp.arguments.clone(), jp.event_datas.get("progress").cloned()));
            Ok(())
        });
        Aspect::new("watch", advice).point_cut(&caps, None).unwrap();

        caps.call("click", &[json!("button")]).unwrap();
        assert_eq!(caps.publish("click", "progress", json!(50)).unwrap(), 1);
        assert_eq!(caps.publish("click", "other", json!(1)).unwrap(), 0);

        let replays = replays.lock();
        assert_eq!(replays.len(), 1);
        assert_eq!(replays[0], (vec![json!("button")], Some(json!(50))));
    }

    #[test]
    fn test_stacked_aspects_record_chain() {
        let caps = Capabilities::new("math");
        caps.register("id", |args: &[Value]| Ok(args[0].clone()));

        Aspect::new("inner", Advice::new()).point_cut(&caps, None).unwrap();
        Aspect::new("outer", Advice::new()).point_cut(&caps, None).unwrap();

        assert_eq!(caps.interceptors("id"), vec!["inner", "outer"]);
        assert_eq!(caps.call("id", &[json!(3)]).unwrap(), json!(3));
    }
}
