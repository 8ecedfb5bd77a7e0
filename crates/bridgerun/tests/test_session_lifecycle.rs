//! Handle and session lifecycle, end to end through an in-process remote.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bridgepack::SessionId;
use bridgepack::Value;
use bridgerun::BridgeConfig;
use bridgerun::CallOptions;
use bridgerun::Dispatcher;
use bridgerun::ErrorKind;
use bridgerun::Kwargs;
use bridgerun::Owner;
use bridgerun::SessionSpec;
use rand::Rng;

use common::eventually;
use common::remote;

fn counter_args(start: i64) -> (Vec<Value>, Kwargs) {
    (vec![Value::Int(start)], Kwargs::new())
}

// --- Handle addressing ---

#[tokio::test]
async fn test_store_resolve_release_scenario() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());
    let s1 = CallOptions::new().session("s1");
    let s2 = CallOptions::new().session("s2");

    let (args, kwargs) = counter_args(7);
    let h1 = dispatcher.call_constructor("models", "Counter", args, kwargs, &s1).await?;
    assert_eq!(h1.session_id, SessionId::from("s1"));

    let value = dispatcher.call_method(&h1, "get", Vec::new(), Kwargs::new(), &s1).await?;
    assert_eq!(value, Value::Int(7));

    let err = dispatcher
        .call_method(&h1, "get", Vec::new(), Kwargs::new(), &s2)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionMismatch);

    assert!(dispatcher.release_ref(&h1).await?);

    let err = dispatcher
        .call_method(&h1, "get", Vec::new(), Kwargs::new(), &s1)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RefNotFound);
    Ok(())
}

#[tokio::test]
async fn test_handle_session_is_used_without_override() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());

    let (args, kwargs) = counter_args(1);
    let handle = dispatcher
        .call_constructor("models", "Counter", args, kwargs, &CallOptions::new().session("elsewhere"))
        .await?;

    // The caller's own session differs; the handle's session still wins.
    let own = dispatcher.current_session();
    assert_ne!(own, handle.session_id);
    let value = dispatcher.call_method(&handle, "increment", Vec::new(), Kwargs::new(), &CallOptions::new()).await?;
    assert_eq!(value, Value::Int(2));
    Ok(())
}

// --- Eviction ---

#[tokio::test(start_paused = true)]
async fn test_ttl_eviction() -> anyhow::Result<()> {
    let remote = Arc::new(remote(1, 0));
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());
    let opts = CallOptions::new();

    let (args, kwargs) = counter_args(0);
    let handle = dispatcher.call_constructor("models", "Counter", args, kwargs, &opts).await?;

    tokio::time::advance(Duration::from_millis(1500)).await;
    let err = dispatcher
        .call_method(&handle, "get", Vec::new(), Kwargs::new(), &opts)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RefNotFound);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_zero_ttl_never_evicts() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());
    let opts = CallOptions::new();

    let (args, kwargs) = counter_args(3);
    let handle = dispatcher.call_constructor("models", "Counter", args, kwargs, &opts).await?;

    tokio::time::advance(Duration::from_secs(7 * 86_400)).await;
    assert_eq!(remote.prune(), 0);
    let value = dispatcher.call_method(&handle, "get", Vec::new(), Kwargs::new(), &opts).await?;
    assert_eq!(value, Value::Int(3));
    Ok(())
}

#[tokio::test]
async fn test_lru_evicts_least_recently_used() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 2));
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());
    let opts = CallOptions::new();

    let (args, kwargs) = counter_args(1);
    let a = dispatcher.call_constructor("models", "Counter", args, kwargs, &opts).await?;
    let (args, kwargs) = counter_args(2);
    let b = dispatcher.call_constructor("models", "Counter", args, kwargs, &opts).await?;
    dispatcher.call_method(&a, "get", Vec::new(), Kwargs::new(), &opts).await?;

    let (args, kwargs) = counter_args(3);
    let c = dispatcher.call_constructor("models", "Counter", args, kwargs, &opts).await?;

    assert_eq!(remote.live_refs(), 2);
    assert!(remote.holds(&a.id));
    assert!(!remote.holds(&b.id));
    assert!(remote.holds(&c.id));

    let err = dispatcher
        .call_method(&b, "get", Vec::new(), Kwargs::new(), &opts)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RefNotFound);
    Ok(())
}

// --- Sessions ---

#[tokio::test]
async fn test_release_session_is_isolated() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let root = Dispatcher::new(remote.clone(), BridgeConfig::default());
    let first = root.with_owner(Owner::new("first"));
    let second = root.with_owner(Owner::new("second"));
    let opts = CallOptions::new();

    let mut kept = Vec::new();
    for i in 0..3 {
        let (args, kwargs) = counter_args(i);
        first.call_constructor("models", "Counter", args, kwargs, &opts).await?;
        let (args, kwargs) = counter_args(i);
        kept.push(second.call_constructor("models", "Counter", args, kwargs, &opts).await?);
    }

    let s1 = first.current_session();
    let s2 = second.current_session();
    assert_ne!(s1, s2);
    assert_eq!(remote.session_refs(&s1), 3);

    first.release_session(&s1).await?;
    assert_eq!(remote.session_refs(&s1), 0);
    assert_eq!(remote.session_refs(&s2), 3);
    assert!(root.sessions().get(&s1).is_none());

    for (i, handle) in kept.iter().enumerate() {
        let value = second.call_method(handle, "get", Vec::new(), Kwargs::new(), &opts).await?;
        assert_eq!(value, Value::Int(i as i64));
    }

    // Releasing twice, or releasing a session nobody created, is fine.
    first.release_session(&s1).await?;
    first.release_session(&SessionId::from("never-existed")).await?;
    Ok(())
}

#[tokio::test]
async fn test_owner_exit_releases_its_sessions() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let root = Dispatcher::new(remote.clone(), BridgeConfig::default());
    let bystander = root.with_owner(Owner::new("bystander"));
    let opts = CallOptions::new();

    let (args, kwargs) = counter_args(9);
    let survivor = bystander.call_constructor("models", "Counter", args, kwargs, &opts).await?;

    let worker = root.with_owner(Owner::new("worker"));
    for i in 0..4 {
        let (args, kwargs) = counter_args(i);
        worker.call_constructor("models", "Counter", args, kwargs, &opts).await?;
    }
    let session = worker.current_session();
    assert_eq!(remote.session_refs(&session), 4);

    drop(worker);
    assert!(eventually(|| remote.session_refs(&session) == 0).await);
    assert!(root.sessions().get(&session).is_none());

    let value = bystander.call_method(&survivor, "get", Vec::new(), Kwargs::new(), &opts).await?;
    assert_eq!(value, Value::Int(9));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_releases_root_sessions() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let root = Dispatcher::new(remote.clone(), BridgeConfig::default());
    let worker = root.with_owner(Owner::new("worker"));
    let opts = CallOptions::new();

    for i in 0..2 {
        let (args, kwargs) = counter_args(i);
        root.call_constructor("models", "Counter", args, kwargs, &opts).await?;
        let (args, kwargs) = counter_args(i);
        worker.call_constructor("models", "Counter", args, kwargs, &opts).await?;
    }
    assert_eq!(remote.live_refs(), 4);

    root.shutdown().await?;
    assert_eq!(remote.live_refs(), 0);
    assert!(root.list_sessions().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_implicit_session_is_stable_per_owner() {
    let remote = Arc::new(remote(0, 0));
    let root = Dispatcher::new(remote.clone(), BridgeConfig::default());
    let worker = root.with_owner(Owner::new("worker"));

    let first = worker.current_session();
    assert_eq!(worker.current_session(), first);
    assert_eq!(worker.clone().current_session(), first);
    assert!(first.as_str().starts_with("worker-"));
    assert_ne!(root.current_session(), first);
}

#[tokio::test]
async fn test_create_session_with_settings() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());

    let spec = SessionSpec {
        session_id: Some(SessionId::from("analysis")),
        max_handles: Some(100),
        ttl_seconds: Some(600),
        tags: BTreeMap::from([("team".to_string(), "vision".to_string())]),
    };
    let id = dispatcher.create_session(spec.clone());
    assert_eq!(id, SessionId::from("analysis"));
    assert_eq!(dispatcher.create_session(spec), id);
    assert_eq!(dispatcher.current_session(), id);

    let (args, kwargs) = counter_args(0);
    let handle = dispatcher.call_constructor("models", "Counter", args, kwargs, &CallOptions::new()).await?;
    assert_eq!(handle.session_id, id);

    let listed = dispatcher.list_sessions();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].max_handles, Some(100));
    assert_eq!(listed[0].tags["team"], "vision");
    Ok(())
}

#[tokio::test]
async fn test_shared_session_id_keeps_first_owner() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let root = Dispatcher::new(remote.clone(), BridgeConfig::default());
    let first = root.with_owner(Owner::new("first"));
    let second = root.with_owner(Owner::new("second"));
    let opts = CallOptions::new();
    let shared = SessionSpec { session_id: Some(SessionId::from("shared")), ..Default::default() };

    assert_eq!(first.create_session(shared.clone()), SessionId::from("shared"));
    assert_eq!(second.create_session(shared), SessionId::from("shared"));
    assert_eq!(root.sessions().get(&SessionId::from("shared")).unwrap().owner, first.owner().id());
    assert_ne!(second.current_session(), SessionId::from("shared"));

    let (args, kwargs) = counter_args(1);
    first.call_constructor("models", "Counter", args, kwargs, &opts).await?;
    let (args, kwargs) = counter_args(2);
    let kept = second.call_constructor("models", "Counter", args, kwargs, &opts).await?;
    assert_ne!(kept.session_id, SessionId::from("shared"));

    drop(first);
    assert!(eventually(|| remote.session_refs(&SessionId::from("shared")) == 0).await);

    let value = second.call_method(&kept, "get", Vec::new(), Kwargs::new(), &opts).await?;
    assert_eq!(value, Value::Int(2));
    assert!(second.sessions().bound_session(second.owner()).is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_owners_get_separate_sessions() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let root = Dispatcher::new(remote.clone(), BridgeConfig::default());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let dispatcher = root.with_owner(Owner::new(format!("task{}", i)));
        tasks.push(tokio::spawn(async move {
            let bumps = rand::thread_rng().gen_range(1..10);
            let opts = CallOptions::new();
            let handle = dispatcher
                .call_constructor("models", "Counter", Vec::new(), Kwargs::new(), &opts)
                .await?;
            for _ in 0..bumps {
                dispatcher.call_method(&handle, "increment", Vec::new(), Kwargs::new(), &opts).await?;
            }
            let value = dispatcher.call_method(&handle, "get", Vec::new(), Kwargs::new(), &opts).await?;
            assert_eq!(value, Value::Int(bumps));
            Ok::<_, bridgerun::BridgeError>((dispatcher.current_session(), dispatcher))
        }));
    }

    let mut sessions = Vec::new();
    let mut alive = Vec::new();
    for task in tasks {
        let (session, dispatcher) = task.await??;
        sessions.push(session);
        alive.push(dispatcher);
    }
    sessions.sort();
    sessions.dedup();
    assert_eq!(sessions.len(), 8);
    assert_eq!(root.list_sessions().len(), 8);
    Ok(())
}
