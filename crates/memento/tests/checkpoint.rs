//! End-to-end checkpoint behavior across backends

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use memento::{
    ArgPolicies, Args, AsyncCheckpoint, Backend, BoxFuture, CallableId, CallableSpec,
    CapturePolicy, CaptureSet, Checkpoint, Engine, Options, Registry, Signature, Stack, Value,
    Verbosity,
};

fn silent() -> Options {
    Options::new().verbosity(Verbosity::Silent)
}

fn fresh_registry() -> Arc<Registry> {
    Arc::new(Registry::new())
}

fn counting_square(
    options: Options,
    registry: Arc<Registry>,
) -> (Checkpoint<i64>, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);
    let ckpt = Checkpoint::new(
        CallableSpec::declared("demo/square", "x * x", vec![]),
        Signature::new(["x"]),
        options,
        move |bound| {
            executed.fetch_add(1, Ordering::SeqCst);
            let x = bound.i64("x")?;
            Ok(x * x)
        },
    )
    .unwrap()
    .with_registry(registry);
    (ckpt, counter)
}

#[test]
fn square_end_to_end() {
    let (square, counter) = counting_square(silent(), fresh_registry());

    // First call computes and stores, second is remembered
    assert_eq!(square.invoke(&Args::new().pos(4i64)).unwrap(), 16);
    assert_eq!(square.invoke(&Args::new().pos(4i64)).unwrap(), 16);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // rerun overwrites unconditionally
    assert_eq!(square.rerun(&Args::new().pos(4i64)).unwrap(), 16);
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    // delete, then get reports a miss without executing
    square.delete(&Args::new().pos(4i64)).unwrap();
    let err = square.get(&Args::new().pos(4i64)).unwrap_err();
    assert!(err.is_cache_miss());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn identical_inputs_share_an_entry_regardless_of_binding_style() {
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);
    let ckpt = Checkpoint::new(
        CallableSpec::declared("demo/area", "w * h", vec![]),
        Signature::new(["w"]).with_default("h", 2i64),
        silent(),
        move |bound| {
            executed.fetch_add(1, Ordering::SeqCst);
            Ok(bound.i64("w")? * bound.i64("h")?)
        },
    )
    .unwrap()
    .with_registry(fresh_registry());

    assert_eq!(ckpt.invoke(&Args::new().pos(3i64).pos(2i64)).unwrap(), 6);
    assert_eq!(
        ckpt.invoke(&Args::new().named("h", 2i64).named("w", 3i64))
            .unwrap(),
        6
    );
    // Defaults fill in and land on the same entry
    assert_eq!(ckpt.invoke(&Args::new().pos(3i64)).unwrap(), 6);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn editing_a_dependency_retires_cached_results() {
    let registry = fresh_registry();
    registry.declare("demo/helper", "n + 1", Vec::new());

    let make = |registry: Arc<Registry>| {
        let counter = Arc::new(AtomicUsize::new(0));
        let executed = Arc::clone(&counter);
        let ckpt = Checkpoint::new(
            CallableSpec::declared(
                "demo/top",
                "helper(n) * 2",
                vec![CallableId::from("demo/helper")],
            ),
            Signature::new(["n"]),
            silent(),
            move |bound| {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok((bound.i64("n")? + 1) * 2)
            },
        )
        .unwrap()
        .with_registry(registry);
        (ckpt, counter)
    };

    let (top, counter) = make(Arc::clone(&registry));
    top.invoke(&Args::new().pos(1i64)).unwrap();
    top.invoke(&Args::new().pos(1i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let before = top.engine().identity().unwrap().hash().clone();

    // Simulate an edit of the helper and pick it up with a recursive reinit
    registry.declare("demo/helper", "n + 2", Vec::new());
    top.reinit(true).unwrap();

    let after = top.engine().identity().unwrap().hash().clone();
    assert_ne!(before, after);

    // The old entry is unreachable under the new identity
    top.invoke(&Args::new().pos(1i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn excluded_and_transformed_parameters_widen_hits() {
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);
    let ckpt = Checkpoint::new(
        CallableSpec::declared("demo/sum", "sum(items)", vec![]),
        Signature::new(["items", "log_level"]),
        silent(),
        move |bound| {
            executed.fetch_add(1, Ordering::SeqCst);
            match bound.get("items")? {
                Value::List(items) => Ok(items.iter().filter_map(Value::as_i64).sum::<i64>()),
                _ => Ok(0),
            }
        },
    )
    .unwrap()
    .with_registry(fresh_registry())
    .with_policies(
        ArgPolicies::new()
            .exclude("log_level")
            .transform("items", |v| match v {
                Value::List(items) => {
                    let mut sorted = items.clone();
                    sorted.sort_by_key(|v| v.as_i64());
                    Value::List(sorted)
                }
                other => other.clone(),
            }),
    );

    let a = ckpt
        .invoke(&Args::new().pos(vec![3i64, 1, 2]).pos("debug"))
        .unwrap();
    // Different element order and a different excluded argument: same entry
    let b = ckpt
        .invoke(&Args::new().pos(vec![1i64, 2, 3]).pos("info"))
        .unwrap();
    assert_eq!(a, 6);
    assert_eq!(b, 6);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // A semantically different input misses
    ckpt.invoke(&Args::new().pos(vec![1i64, 2, 4]).pos("info"))
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn captured_context_participates_in_the_key() {
    let env = Arc::new(AtomicUsize::new(1));
    let reader = Arc::clone(&env);
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);

    let ckpt = Checkpoint::new(
        CallableSpec::declared("demo/render", "render(x)", vec![]),
        Signature::new(["x"]),
        silent(),
        move |bound| {
            executed.fetch_add(1, Ordering::SeqCst);
            bound.i64("x")
        },
    )
    .unwrap()
    .with_registry(fresh_registry())
    .with_captures(CaptureSet::new().with("theme", CapturePolicy::EveryCall, move || {
        Value::Int(reader.load(Ordering::SeqCst) as i64)
    }));

    ckpt.invoke(&Args::new().pos(7i64)).unwrap();
    ckpt.invoke(&Args::new().pos(7i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Same argument, changed context: a different entry
    env.store(2, Ordering::SeqCst);
    ckpt.invoke(&Args::new().pos(7i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn once_for_process_captures_resnapshot_on_reinit() {
    let env = Arc::new(AtomicUsize::new(1));
    let reader = Arc::clone(&env);
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);

    let ckpt = Checkpoint::new(
        CallableSpec::declared("demo/seeded", "seed + x", vec![]),
        Signature::new(["x"]),
        silent(),
        move |bound| {
            executed.fetch_add(1, Ordering::SeqCst);
            bound.i64("x")
        },
    )
    .unwrap()
    .with_registry(fresh_registry())
    .with_captures(
        CaptureSet::new().with("seed", CapturePolicy::OnceForProcess, move || {
            Value::Int(reader.load(Ordering::SeqCst) as i64)
        }),
    );

    ckpt.invoke(&Args::new().pos(1i64)).unwrap();
    // The snapshot is pinned: a mutated source still hits
    env.store(2, Ordering::SeqCst);
    ckpt.invoke(&Args::new().pos(1i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // reinit re-snapshots, so the change now shows as a miss
    ckpt.reinit(false).unwrap();
    ckpt.invoke(&Args::new().pos(1i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn file_backend_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let options = silent().backend(Backend::File {
        root: Some(dir.path().to_path_buf()),
    });

    let (first, counter1) = counting_square(options.clone(), fresh_registry());
    assert_eq!(first.invoke(&Args::new().pos(9i64)).unwrap(), 81);
    assert_eq!(counter1.load(Ordering::SeqCst), 1);
    drop(first);

    // Same code, new process as far as the engine can tell
    let (second, counter2) = counting_square(options, fresh_registry());
    assert_eq!(second.invoke(&Args::new().pos(9i64)).unwrap(), 81);
    assert_eq!(counter2.load(Ordering::SeqCst), 0);
    assert!(second.exists(&Args::new().pos(9i64)).unwrap());
    assert!(second.checkpoint_date(&Args::new().pos(9i64)).is_ok());
}

#[test]
fn clear_removes_every_entry_for_the_callable() {
    let (square, counter) = counting_square(silent(), fresh_registry());
    square.invoke(&Args::new().pos(1i64)).unwrap();
    square.invoke(&Args::new().pos(2i64)).unwrap();
    square.clear().unwrap();

    square.invoke(&Args::new().pos(1i64)).unwrap();
    square.invoke(&Args::new().pos(2i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn expired_entries_are_recomputed_and_overwritten() {
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);
    let ckpt = Checkpoint::new(
        CallableSpec::declared("demo/volatile", "now()", vec![]),
        Signature::new(["x"]),
        silent().expire_when(|created| created < chrono::Utc::now()),
        move |bound| {
            executed.fetch_add(1, Ordering::SeqCst);
            bound.i64("x")
        },
    )
    .unwrap()
    .with_registry(fresh_registry());

    ckpt.invoke(&Args::new().pos(1i64)).unwrap();
    ckpt.invoke(&Args::new().pos(1i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    // Expired entries also surface as misses on the read-only paths
    assert!(!ckpt.exists(&Args::new().pos(1i64)).unwrap());
    assert!(ckpt.get(&Args::new().pos(1i64)).unwrap_err().is_cache_miss());
}

#[test]
fn corrupt_durable_records_heal_on_invoke() {
    let dir = tempfile::tempdir().unwrap();
    let options = silent().backend(Backend::File {
        root: Some(dir.path().to_path_buf()),
    });
    let (square, counter) = counting_square(options, fresh_registry());
    square.invoke(&Args::new().pos(3i64)).unwrap();

    // Truncate the one stored record on disk
    let mut records = Vec::new();
    for entry in walk(dir.path()) {
        if entry.extension().is_some_and(|e| e == "json") {
            records.push(entry);
        }
    }
    assert_eq!(records.len(), 1);
    std::fs::write(&records[0], b"{ not json").unwrap();

    // The corrupt entry is dropped and recomputed, not surfaced as an error
    assert_eq!(square.invoke(&Args::new().pos(3i64)).unwrap(), 9);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(square.get(&Args::new().pos(3i64)).unwrap(), 9);
}

#[test]
fn corrupt_record_heals_even_with_expiry_configured() {
    let dir = tempfile::tempdir().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);
    let ckpt = Checkpoint::new(
        CallableSpec::declared("demo/square", "x * x", vec![]),
        Signature::new(["x"]),
        silent()
            .backend(Backend::File {
                root: Some(dir.path().to_path_buf()),
            })
            .expire_when(|_| false),
        move |bound| {
            executed.fetch_add(1, Ordering::SeqCst);
            let x = bound.i64("x")?;
            Ok(x * x)
        },
    )
    .unwrap()
    .with_registry(fresh_registry());
    ckpt.invoke(&Args::new().pos(3i64)).unwrap();

    let records: Vec<_> = walk(dir.path())
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect();
    assert_eq!(records.len(), 1);
    std::fs::write(&records[0], b"{ not json").unwrap();

    // The expiry check parses the record too; a corrupt one is still dropped
    // and recomputed instead of surfacing an error
    assert_eq!(ckpt.invoke(&Args::new().pos(3i64)).unwrap(), 9);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(ckpt.get(&Args::new().pos(3i64)).unwrap(), 9);
}

#[test]
fn unhashable_argument_aborts_without_executing() {
    let (square, counter) = counting_square(silent(), fresh_registry());
    let opaque = Value::Opaque {
        type_name: "std::fs::File".into(),
    };

    let err = square.invoke(&Args::new().pos(opaque.clone())).unwrap_err();
    assert!(matches!(err, memento::Error::Hash(_)));
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // The read-only paths abort the same way instead of reporting a miss
    assert!(matches!(
        square.exists(&Args::new().pos(opaque)).unwrap_err(),
        memento::Error::Hash(_)
    ));
}

fn walk(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(walk(&path));
        } else {
            files.push(path);
        }
    }
    files
}

#[test]
fn stacked_layers_backfill_from_the_durable_one() {
    let dir = tempfile::tempdir().unwrap();
    let registry = fresh_registry();
    let spec = CallableSpec::declared("demo/stacked", "x * x", vec![]);
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);

    let build = |backend: Backend| {
        Engine::new(spec.clone(), Signature::new(["x"]), silent().backend(backend))
            .unwrap()
            .with_registry(Arc::clone(&registry))
    };

    let stack = Stack::new(
        vec![
            build(Backend::Memory),
            build(Backend::File {
                root: Some(dir.path().to_path_buf()),
            }),
        ],
        move |bound| {
            executed.fetch_add(1, Ordering::SeqCst);
            let x = bound.i64("x")?;
            Ok(x * x)
        },
    )
    .unwrap();

    // A miss everywhere executes once and stores at every layer
    assert_eq!(stack.invoke(&Args::new().pos(5i64)).unwrap(), 25);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(stack.layer(0).exists(&Args::new().pos(5i64)).unwrap());
    assert!(stack.layer(1).exists(&Args::new().pos(5i64)).unwrap());

    // Clearing the ephemeral layer leaves the durable hit, which backfills
    stack.layer(0).clear().unwrap();
    assert_eq!(stack.invoke(&Args::new().pos(5i64)).unwrap(), 25);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(stack.layer(0).exists(&Args::new().pos(5i64)).unwrap());
}

#[tokio::test]
async fn async_surface_mirrors_the_sync_one() {
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);
    let ckpt = AsyncCheckpoint::new(
        CallableSpec::declared("demo/fetch", "fetch(x)", vec![]),
        Signature::new(["x"]),
        silent(),
        move |bound| -> BoxFuture<i64> {
            let executed = Arc::clone(&executed);
            Box::pin(async move {
                executed.fetch_add(1, Ordering::SeqCst);
                let x = bound.i64("x")?;
                tokio::task::yield_now().await;
                Ok(x * x)
            })
        },
    )
    .unwrap()
    .with_registry(fresh_registry());

    assert_eq!(ckpt.invoke(&Args::new().pos(6i64)).await.unwrap(), 36);
    assert_eq!(ckpt.invoke(&Args::new().pos(6i64)).await.unwrap(), 36);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    assert_eq!(ckpt.get(&Args::new().pos(6i64)).await.unwrap(), 36);
    assert!(ckpt.exists(&Args::new().pos(6i64)).await.unwrap());
    assert!(ckpt.checkpoint_date(&Args::new().pos(6i64)).await.is_ok());

    assert_eq!(ckpt.rerun(&Args::new().pos(6i64)).await.unwrap(), 36);
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    ckpt.delete(&Args::new().pos(6i64)).await.unwrap();
    assert!(
        ckpt.get(&Args::new().pos(6i64))
            .await
            .unwrap_err()
            .is_cache_miss()
    );
}

#[tokio::test]
async fn concurrent_async_callers_settle_on_one_entry() {
    let counter = Arc::new(AtomicUsize::new(0));
    let executed = Arc::clone(&counter);
    let ckpt = Arc::new(
        AsyncCheckpoint::new(
            CallableSpec::declared("demo/shared", "x + 1", vec![]),
            Signature::new(["x"]),
            silent(),
            move |bound| -> BoxFuture<i64> {
                let executed = Arc::clone(&executed);
                Box::pin(async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok(bound.i64("x")? + 1)
                })
            },
        )
        .unwrap()
        .with_registry(fresh_registry()),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ckpt = Arc::clone(&ckpt);
        handles.push(tokio::spawn(
            async move { ckpt.invoke(&Args::new().pos(1i64)).await },
        ));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 2);
    }

    // Overlapping misses may each execute (no deduplication), but afterwards
    // the entry is settled and further calls are remembered
    let settled = counter.load(Ordering::SeqCst);
    assert!(settled >= 1);
    ckpt.invoke(&Args::new().pos(1i64)).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), settled);
}

#[test]
fn recursion_can_skip_caching_of_inner_steps() {
    let stored = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&stored);
    let ckpt = Checkpoint::new(
        CallableSpec::declared("demo/fact", "n * fact(n - 1)", vec![]),
        Signature::new(["n"]),
        silent(),
        move |bound| {
            observed.fetch_add(1, Ordering::SeqCst);
            let n = bound.i64("n")?;
            Ok((1..=n).product::<i64>())
        },
    )
    .unwrap()
    .with_registry(fresh_registry());

    // call_uncached runs the computation without consulting or writing storage
    assert_eq!(ckpt.call_uncached(&Args::new().pos(5i64)).unwrap(), 120);
    assert!(!ckpt.exists(&Args::new().pos(5i64)).unwrap());

    // while invoke on the outer call stores as usual
    assert_eq!(ckpt.invoke(&Args::new().pos(5i64)).unwrap(), 120);
    assert!(ckpt.exists(&Args::new().pos(5i64)).unwrap());
    assert_eq!(stored.load(Ordering::SeqCst), 2);
}

#[test]
fn identity_override_pins_the_container() {
    let pinned = memento::hash_value(&Value::Str("v1".into())).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let storage: Arc<dyn memento::Storage> = Arc::new(memento::MemoryStorage::new());

    let make = |body: &str| {
        let executed = Arc::clone(&counter);
        Checkpoint::from_engine(
            Engine::new(
                CallableSpec::declared("demo/pinned", body, vec![]),
                Signature::new(["x"]),
                silent()
                    .override_identity(pinned.clone())
                    .backend(Backend::Custom(Arc::clone(&storage))),
            )
            .unwrap()
            .with_registry(fresh_registry()),
            move |bound: &memento::BoundArgs| {
                executed.fetch_add(1, Ordering::SeqCst);
                bound.i64("x")
            },
        )
    };

    // Two engines with different bodies but the same override share entries
    let first = make("x");
    first.invoke(&Args::new().pos(1i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let second = make("x + 0");
    second.invoke(&Args::new().pos(1i64)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
