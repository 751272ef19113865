//! Moving instance handles between tenant runtimes.

use std::sync::Arc;

use serde_json::Value;

use fnrun::ClassDef;
use fnrun::ClassPath;
use fnrun::Config;
use fnrun::ErrorCode;
use fnrun::FunctionDescriptor;
use fnrun::InvokeOptions;
use fnrun::Runtime;
use fnrun::descriptor::Language;
use fnrun::handle::ExportedHandle;
use fnrun::handle::INSTANCE_ID;
use fnrun::handle::INSTANCE_KEY;
use fnrun::handle::INSTANCE_ROUTE;
use fnrun::handle::NEED_ORDER;
use fnrun::instance::HandlerKind;
use fnrun::local::LocalEngine;
use fnrun::ret;

struct Worker;

fn tenant(name: &str, engine: Arc<LocalEngine>) -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let classes = ClassPath::new().with(
        ClassDef::class("jobs.Worker")
            .constructor::<Worker, _>("()V", |_| Ok(Worker))
            .method::<Worker, _>("id", "()J", |_, _| ret(7))
            .build()
            .expect("Worker"),
    );
    Runtime::builder(Arc::new(classes))
        .config(Config::default().with_tenant(name))
        .engine(engine)
        .build()
}

fn remote_worker() -> FunctionDescriptor {
    FunctionDescriptor::builder("jobs.RemoteWorker")
        .function_id("fn-worker")
        .language(Language::Foreign)
        .build()
}

// --- Test 1: Remote Handle Crosses Tenants ---

#[test]
fn test_remote_handle_crosses_tenants() -> anyhow::Result<()> {
    let engine = Arc::new(LocalEngine::new());
    let alice = tenant("alice", engine.clone());
    let bob = tenant("bob", engine.clone());

    let handle = alice.create(&remote_worker(), &[], &InvokeOptions::default())?;
    let exported = alice.export_handle(&handle)?;

    // The map survives a serialization hop.
    let wire = serde_json::to_string(&exported)?;
    let received: ExportedHandle = serde_json::from_str(&wire)?;

    let imported = bob.import_handle(&received)?;
    assert_eq!(imported.instance_id(), handle.instance_id());
    assert_eq!(imported.real_instance_id(), format!("{}-real", handle.instance_id()));
    assert_eq!(bob.instances().instance_route(&imported.instance_id()).as_deref(), Some("local"));

    bob.method(&imported, "work", "()V").invoke_remote(&[])?;
    assert_eq!(engine.invocations().len(), 1);
    Ok(())
}

// --- Test 2: Termination Is Visible Through the Engine ---

#[test]
fn test_termination_seen_by_other_tenant() -> anyhow::Result<()> {
    let engine = Arc::new(LocalEngine::new());
    let alice = tenant("alice", engine.clone());
    let bob = tenant("bob", engine.clone());

    let handle = alice.create(&remote_worker(), &[], &InvokeOptions::default())?;
    let imported = bob.import_handle(&alice.export_handle(&handle)?)?;

    bob.terminate(&imported, true)?;
    assert!(imported.is_cleared());

    let err = alice
        .method(&handle, "work", "()V")
        .invoke_remote(&[])
        .expect_err("terminated elsewhere");
    assert_eq!(err.code(), ErrorCode::InstanceNotFound);
    Ok(())
}

// --- Test 3: Ordering Flag Round Trip ---

#[test]
fn test_need_order_round_trip() -> anyhow::Result<()> {
    let engine = Arc::new(LocalEngine::new());
    let alice = tenant("alice", engine.clone());
    let bob = tenant("bob", engine);

    let options = InvokeOptions::builder().concurrency(8).build()?;
    let handle = alice
        .instance(FunctionDescriptor::constructor("jobs.Worker", "()V"))
        .options(&options)
        .create()?;
    assert!(!handle.need_order());

    let exported = alice.export_handle(&handle)?;
    assert_eq!(exported.get(NEED_ORDER).map(String::as_str), Some("false"));
    let imported = bob.import_handle(&exported)?;
    assert!(!imported.need_order());
    assert_eq!(bob.handler_count(HandlerKind::Host), 1);

    // Host instances live in exactly one runtime.
    let err = bob.method(&imported, "id", "()J").invoke(&[]).expect_err("not hosted here");
    assert_eq!(err.code(), ErrorCode::InstanceNotFound);
    assert_eq!(alice.method(&handle, "id", "()J").invoke(&[])?, Value::from(7));
    Ok(())
}

// --- Test 4: Minimal Maps Import With Defaults ---

#[test]
fn test_minimal_map_import() -> anyhow::Result<()> {
    let bob = tenant("bob", Arc::new(LocalEngine::new()));
    let mut exported = ExportedHandle::new();
    exported.insert(INSTANCE_KEY.to_string(), "inst-1".to_string());
    exported.insert(INSTANCE_ID.to_string(), "phys-1".to_string());
    exported.insert(INSTANCE_ROUTE.to_string(), "node-3".to_string());

    let imported = bob.import_handle(&exported)?;
    assert!(imported.need_order());
    assert_eq!(bob.instances().real_instance_id("inst-1").as_deref(), Some("phys-1"));
    assert_eq!(bob.instances().instance_route("inst-1").as_deref(), Some("node-3"));

    let again = bob.export_handle(&imported)?;
    assert_eq!(again.get(INSTANCE_ID).map(String::as_str), Some("phys-1"));
    assert_eq!(again.get(INSTANCE_ROUTE).map(String::as_str), Some("node-3"));
    Ok(())
}
