//! Integration tests for module definition and execution

use eco_modules::{
    Advice, Aspect, Capabilities, Exports, Factory, MemoryFetcher, ModuleError, ModuleStatus,
    NamespaceConfig, Runtime,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn runtime() -> Runtime {
    Runtime::new(MemoryFetcher::new())
}

#[test]
fn test_zero_dependency_module_is_ready_before_any_fetch() {
    let fetcher = MemoryFetcher::new();
    let runtime = Runtime::new(fetcher.clone());

    let module = runtime.root().define("a", &[], Factory::value(1_i32)).unwrap();

    assert_eq!(module.status(), ModuleStatus::Ready);
    assert_eq!(fetcher.total_fetches(), 0);
}

#[test]
fn test_fan_in_executes_shared_dependency_once() {
    let runtime = runtime();
    let root = runtime.root();
    let a_calls = Arc::new(AtomicUsize::new(0));
    let seen: Arc<Mutex<Vec<Exports>>> = Arc::new(Mutex::new(Vec::new()));

    let calls = a_calls.clone();
    root.define(
        "a",
        &[],
        Factory::from_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Exports::new(vec![1, 2, 3])
        }),
    )
    .unwrap();
    for id in ["b", "c"] {
        let seen = seen.clone();
        root.define(
            id,
            &["a"],
            Factory::from_fn(move |deps| {
                seen.lock().push(deps[0].clone());
                Exports::empty()
            }),
        )
        .unwrap();
    }
    root.define("top", &["b", "c"], Factory::empty()).unwrap();

    root.use_sync(&["top"]).unwrap();

    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].ptr_eq(&seen[1]));
    assert_eq!(seen[0].downcast_ref::<Vec<i32>>(), Some(&vec![1, 2, 3]));
}

#[test]
fn test_fan_in_across_threads_waits_for_shared_dependency() {
    let runtime = runtime();
    let root = runtime.root();
    let a_calls = Arc::new(AtomicUsize::new(0));

    let calls = a_calls.clone();
    root.define(
        "a",
        &[],
        Factory::from_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            Exports::new(42_i32)
        }),
    )
    .unwrap();
    root.define("b", &["a"], Factory::from_fn(|deps| deps[0].clone())).unwrap();
    root.define("c", &["a"], Factory::from_fn(|deps| deps[0].clone())).unwrap();

    let first = {
        let root = root.clone();
        thread::spawn(move || root.use_sync(&["b"]).unwrap().remove(0))
    };
    thread::sleep(Duration::from_millis(50));
    let second = {
        let root = root.clone();
        thread::spawn(move || root.use_sync(&["c"]).unwrap().remove(0))
    };

    let from_b = first.join().unwrap();
    let from_c = second.join().unwrap();

    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(from_b.downcast_ref::<i32>(), Some(&42));
    assert_eq!(from_c.downcast_ref::<i32>(), Some(&42));
    assert!(from_b.ptr_eq(&from_c));
}

#[test]
fn test_transitive_cycle_terminates() {
    let runtime = runtime();
    let root = runtime.root();
    root.define("x", &["y"], Factory::from_fn(|_| Exports::new("x"))).unwrap();
    root.define(
        "y",
        &["x"],
        Factory::from_fn(|deps| Exports::new(deps[0].is_empty())),
    )
    .unwrap();

    let exports = root.use_sync(&["x"]).unwrap();

    assert_eq!(exports[0].downcast_ref::<&str>(), Some(&"x"));
    let y = root.module("y").unwrap();
    assert_eq!(y.status(), ModuleStatus::Executed);
    assert_eq!(y.exports().downcast_ref::<bool>(), Some(&true));
}

#[test]
fn test_sum_of_dependencies() {
    let runtime = runtime();
    let root = runtime.root();
    root.define("a", &[], Factory::value(2_i64)).unwrap();
    root.define("b", &[], Factory::value(3_i64)).unwrap();
    root.define(
        "sum",
        &["a", "b"],
        Factory::from_fn(|deps| {
            let a = deps[0].downcast_ref::<i64>().copied().unwrap_or(0);
            let b = deps[1].downcast_ref::<i64>().copied().unwrap_or(0);
            Exports::new(a + b)
        }),
    )
    .unwrap();

    let sum = root.use_sync(&["sum"]).unwrap();
    assert_eq!(sum[0].downcast_ref::<i64>(), Some(&5));
    assert_eq!(root.module("sum").unwrap().status(), ModuleStatus::Executed);
}

#[test]
fn test_dependency_resolved_through_parent_namespace() {
    let runtime = runtime();
    let root = runtime.root();
    root.define("config", &[], Factory::value("shared")).unwrap();

    let game = root.namespace("game").unwrap();
    game.define(
        "player",
        &["config"],
        Factory::from_fn(|deps| deps[0].clone()),
    )
    .unwrap();

    let exports = game.use_sync(&["player"]).unwrap();
    assert!(exports[0].ptr_eq(&root.module("config").unwrap().exports()));
}

#[test]
fn test_sync_use_of_unloaded_dependency_without_executor() {
    let runtime = runtime();
    let root = runtime.root();
    root.config(NamespaceConfig {
        modules: [("remote".to_string(), "remote.js".to_string())].into(),
        ..Default::default()
    });
    root.define("needs", &["remote"], Factory::empty()).unwrap();

    let result = root.use_sync(&["needs"]);

    assert!(matches!(result, Err(ModuleError::NotLoaded { ref id, .. }) if id == "remote"));
    assert_eq!(
        runtime.fetch_status("/remote.js"),
        eco_modules::FetchStatus::Error
    );
}

#[test]
fn test_disabled_dependency_blocks_consumer() {
    let runtime = runtime();
    let root = runtime.root();
    let off = root.define("off", &[], Factory::empty()).unwrap();
    let consumer = root.define("consumer", &["off"], Factory::empty()).unwrap();
    off.disable();

    assert!(matches!(root.use_sync(&["consumer"]), Err(ModuleError::Disabled { .. })));
    assert!(consumer.status() < ModuleStatus::Executing);

    off.enable();
    assert!(root.use_sync(&["consumer"]).is_ok());
}

#[test]
fn test_aspect_guards_capability() {
    let caps = Capabilities::new("math");
    let target_calls = Arc::new(AtomicUsize::new(0));
    let calls = target_calls.clone();
    caps.register("add", move |args: &[Value]| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
    });
    caps.register("mul", |args: &[Value]| {
        Ok(json!(args.iter().filter_map(Value::as_i64).product::<i64>()))
    });

    Aspect::new(
        "stop-add",
        Advice::new().before(|jp| {
            jp.stop = jp.target_name == "add";
            Ok(())
        }),
    )
    .point_cut(&caps, None)
    .unwrap();

    assert_eq!(caps.call("add", &[json!(1), json!(2)]).unwrap(), Value::Null);
    assert_eq!(caps.call("mul", &[json!(3), json!(4)]).unwrap(), json!(12));
    assert_eq!(target_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_introspection() {
    let runtime = runtime();
    let root = runtime.root();
    let game = root.namespace("game").unwrap();
    game.namespace("hud").unwrap();
    root.define("a", &[], Factory::empty()).unwrap();
    root.define("b", &["a"], Factory::empty()).unwrap();

    assert_eq!(root.module_ids(), vec!["a", "b"]);
    assert_eq!(root.child_names(), vec!["game"]);
    assert_eq!(root.namespace_tree(), "eco\n  game\n    hud\n");
    assert_eq!(root.module_tree("b").unwrap(), "b [Created]\n  a [Ready]\n");
    assert_eq!(runtime.namespace_names(), vec!["eco", "game", "hud"]);
}
