mod common;

use common::{logged_in, FakeServer};
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use taskboard_sync::model::{EntityKey, MutationStatus, TaskStatus};
use taskboard_sync::mutation::MutationController;
use taskboard_sync::store::{LocalStore, StoreEvent};
use taskboard_sync::SyncError;
use tokio::sync::{broadcast, oneshot, Mutex};

type Reply = Result<Value, SyncError>;

fn patch(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("patch must be an object, got {other}"),
    }
}

/// A commit that waits for the test to decide its result.
async fn gated(rx: oneshot::Receiver<Reply>) -> Reply {
    rx.await
        .unwrap_or_else(|_| Err(SyncError::Aborted("gate dropped".into())))
}

fn seeded(key: EntityKey, value: Value) -> (LocalStore, MutationController) {
    let store = LocalStore::new();
    store.upsert(key, value);
    let controller = MutationController::new(store.clone());
    (store, controller)
}

fn drain(events: &mut broadcast::Receiver<StoreEvent>) -> Vec<StoreEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn failures(events: &[StoreEvent]) -> Vec<SyncError> {
    events
        .iter()
        .filter_map(|event| match event {
            StoreEvent::MutationFailed { error, .. } => Some(error.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn optimistic_state_visible_until_commit_fails_then_restored() {
    let key = EntityKey::task(1);
    let original = json!({"id": 1, "title": "Arqueo", "status": "pendiente"});
    let (store, controller) = seeded(key, original.clone());
    let mut events = store.subscribe();

    let (tx, rx) = oneshot::channel();
    let handle =
        controller.apply_mutation(key, patch(json!({"status": "completada"})), move || gated(rx));

    assert_eq!(store.get(key).unwrap()["status"], "completada");
    let pending = store.pending(key);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, handle.id());
    assert_eq!(pending[0].status, MutationStatus::Applied);
    assert_eq!(pending[0].previous_snapshot, Some(original.clone()));

    tx.send(Err(SyncError::Server {
        status: 500,
        body: "db down".into(),
    }))
    .unwrap();
    let err = handle.outcome().await.unwrap_err();
    assert!(matches!(err, SyncError::Server { status: 500, .. }));

    assert_eq!(store.get(key), Some(original));
    assert!(store.pending(key).is_empty());
    let seen = drain(&mut events);
    assert_eq!(failures(&seen), vec![err]);
}

#[tokio::test]
async fn server_representation_wins_on_success() {
    let key = EntityKey::task(2);
    let (store, controller) = seeded(key, json!({"id": 2, "status": "pendiente", "title": "A"}));
    let authoritative = json!({"id": 2, "status": "completada", "title": "A (revisada)"});

    let reply = authoritative.clone();
    let outcome = controller
        .mutate(key, patch(json!({"status": "completada"})), move || async move { Ok(reply) })
        .await
        .unwrap();

    assert_eq!(outcome.status, MutationStatus::Confirmed);
    assert_eq!(outcome.state, Some(authoritative.clone()));
    assert_eq!(store.get(key), Some(authoritative));
}

#[tokio::test]
async fn empty_reply_keeps_the_patch() {
    let key = EntityKey::task(3);
    let (store, controller) = seeded(key, json!({"id": 3, "status": "pendiente"}));

    controller
        .mutate(key, patch(json!({"status": "en_progreso"})), || async { Ok(Value::Null) })
        .await
        .unwrap();
    assert_eq!(store.get(key), Some(json!({"id": 3, "status": "en_progreso"})));
}

#[tokio::test]
async fn commits_on_one_entity_run_in_submission_order() {
    let key = EntityKey::task(4);
    let (store, controller) = seeded(key, json!({"id": 4, "n": -1}));
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for n in 0..5u64 {
        let log = log.clone();
        handles.push(controller.apply_mutation(key, patch(json!({"n": n})), move || async move {
            log.lock().await.push(format!("start {n}"));
            // Earlier commits are slower; order must still hold.
            tokio::time::sleep(Duration::from_millis((5 - n) * 5)).await;
            log.lock().await.push(format!("end {n}"));
            Ok(Value::Null)
        }));
    }
    // Every patch is layered immediately, newest on top.
    assert_eq!(store.get(key).unwrap()["n"], 4);

    for handle in handles {
        handle.outcome().await.unwrap();
    }
    let expected: Vec<String> = (0..5)
        .flat_map(|n| [format!("start {n}"), format!("end {n}")])
        .collect();
    assert_eq!(*log.lock().await, expected);
    assert_eq!(store.get(key).unwrap()["n"], 4);
}

#[tokio::test]
async fn failed_second_mutation_keeps_first() {
    let key = EntityKey::task(5);
    let (store, controller) =
        seeded(key, json!({"id": 5, "status": "pendiente", "priority": "baja"}));

    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    let first = controller.apply_mutation(key, patch(json!({"priority": "alta"})), move || gated(rx1));
    let second =
        controller.apply_mutation(key, patch(json!({"status": "completada"})), move || gated(rx2));

    tx1.send(Ok(Value::Null)).unwrap();
    tx2.send(Err(SyncError::ValidationFailed("status".into()))).unwrap();
    first.outcome().await.unwrap();
    second.outcome().await.unwrap_err();

    assert_eq!(
        store.get(key),
        Some(json!({"id": 5, "status": "pendiente", "priority": "alta"}))
    );
}

#[tokio::test]
async fn failed_first_mutation_keeps_second() {
    let key = EntityKey::task(6);
    let (store, controller) =
        seeded(key, json!({"id": 6, "status": "pendiente", "priority": "baja"}));

    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    let first = controller.apply_mutation(key, patch(json!({"priority": "alta"})), move || gated(rx1));
    let second =
        controller.apply_mutation(key, patch(json!({"status": "completada"})), move || gated(rx2));

    tx1.send(Err(SyncError::NetworkUnavailable("offline".into())))
        .unwrap();
    first.outcome().await.unwrap_err();
    // The second patch is still pending and still visible.
    assert_eq!(
        store.get(key),
        Some(json!({"id": 6, "status": "completada", "priority": "baja"}))
    );

    tx2.send(Ok(Value::Null)).unwrap();
    let outcome = second.outcome().await.unwrap();
    assert_eq!(outcome.status, MutationStatus::Confirmed);
    assert_eq!(
        store.get(key),
        Some(json!({"id": 6, "status": "completada", "priority": "baja"}))
    );
}

#[tokio::test]
async fn different_entities_do_not_wait_for_each_other() {
    let slow = EntityKey::task(7);
    let fast = EntityKey::task(8);
    let store = LocalStore::new();
    store.upsert(slow, json!({"id": 7}));
    store.upsert(fast, json!({"id": 8}));
    let controller = MutationController::new(store.clone());

    let (tx, rx) = oneshot::channel();
    let blocked = controller.apply_mutation(slow, patch(json!({"title": "x"})), move || gated(rx));
    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        controller.mutate(fast, patch(json!({"title": "y"})), || async { Ok(Value::Null) }),
    )
    .await
    .expect("independent entity must not wait")
    .unwrap();
    assert_eq!(outcome.state.unwrap()["title"], "y");

    tx.send(Ok(Value::Null)).unwrap();
    blocked.outcome().await.unwrap();
}

#[tokio::test]
async fn dropped_handle_still_commits() {
    let key = EntityKey::task(9);
    let (store, controller) = seeded(key, json!({"id": 9, "status": "pendiente"}));
    let mut events = store.subscribe();

    let (tx, rx) = oneshot::channel();
    let handle =
        controller.apply_mutation(key, patch(json!({"status": "completada"})), move || gated(rx));
    drop(handle);
    tx.send(Ok(json!({"id": 9, "status": "completada", "rev": 2})))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while !store.pending(key).is_empty() {
            let _ = events.recv().await;
        }
    })
    .await
    .expect("commit settles without its handle");
    assert_eq!(store.get(key).unwrap()["rev"], 2);
}

#[tokio::test]
async fn conflict_adopts_server_state() {
    let key = EntityKey::task(10);
    let (store, controller) = seeded(key, json!({"id": 10, "status": "pendiente"}));
    let mut events = store.subscribe();
    let server = json!({"id": 10, "status": "completada", "title": "ya cerrada"});

    let reply = server.clone();
    let err = controller
        .mutate(key, patch(json!({"status": "en_progreso"})), move || async move {
            Err(SyncError::Conflict {
                server: Some(reply),
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Conflict { .. }));
    assert_eq!(store.get(key), Some(server));
    assert_eq!(failures(&drain(&mut events)), vec![err]);
}

#[tokio::test]
async fn auth_failures_roll_back_without_a_banner() {
    let key = EntityKey::task(11);
    let original = json!({"id": 11, "status": "pendiente"});
    let (store, controller) = seeded(key, original.clone());
    let mut events = store.subscribe();

    let err = controller
        .mutate(key, patch(json!({"status": "completada"})), || async {
            Err(SyncError::SessionExpired)
        })
        .await
        .unwrap_err();

    assert_eq!(err, SyncError::SessionExpired);
    assert_eq!(store.get(key), Some(original));
    assert!(failures(&drain(&mut events)).is_empty());
}

#[tokio::test]
async fn rollback_of_new_entity_removes_it() {
    let key = EntityKey::task(12);
    let store = LocalStore::new();
    let controller = MutationController::new(store.clone());

    let err = controller
        .mutate(key, patch(json!({"title": "borrador"})), || async {
            Err(SyncError::NotFound("tasks/12/".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert!(store.get(key).is_none());
}

async fn board_with_one_task(server: &FakeServer) -> taskboard_sync::AppContext {
    let (ctx, _) = logged_in(server).await;
    server
        .route(
            Method::GET,
            "tasks/",
            200,
            json!([{"id": 1, "title": "Caja", "status": "pendiente"}]),
        )
        .await;
    assert_eq!(ctx.tasks.refresh().await.unwrap(), 1);
    ctx
}

#[tokio::test]
async fn set_status_survives_token_expiry() {
    let server = FakeServer::new();
    let ctx = board_with_one_task(&server).await;
    server
        .route(
            Method::PATCH,
            "tasks/1/",
            200,
            json!({"id": 1, "title": "Caja", "status": "completada"}),
        )
        .await;
    server.expire_access().await;

    let handle = ctx.tasks.set_status(1, TaskStatus::Done);
    assert_eq!(ctx.tasks.task(1).unwrap().unwrap().status, TaskStatus::Done);

    let outcome = handle.outcome().await.unwrap();
    assert_eq!(outcome.status, MutationStatus::Confirmed);
    assert_eq!(server.renew_calls().await, 1);
    assert_eq!(ctx.tasks.task(1).unwrap().unwrap().status, TaskStatus::Done);

    let sent = server.requests_to("tasks/1/").await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].body, Some(json!({"status": "completada"})));
}

#[tokio::test]
async fn set_status_offline_rolls_back() {
    let server = FakeServer::new();
    let ctx = board_with_one_task(&server).await;
    let mut events = ctx.store.subscribe();
    server.set_offline(true).await;

    let err = ctx
        .tasks
        .set_status(1, TaskStatus::InProgress)
        .outcome()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NetworkUnavailable(_)));
    assert_eq!(ctx.tasks.task(1).unwrap().unwrap().status, TaskStatus::Pending);
    assert_eq!(failures(&drain(&mut events)).len(), 1);
    assert!(ctx.session.is_authenticated());
}

#[tokio::test]
async fn delete_restores_task_when_refused() {
    let server = FakeServer::new();
    let ctx = board_with_one_task(&server).await;
    server
        .route(Method::DELETE, "tasks/1/", 404, json!({"detail": "Not found."}))
        .await;

    let err = ctx.tasks.delete_task(1).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert_eq!(ctx.tasks.task(1).unwrap().unwrap().title, "Caja");
}

#[tokio::test]
async fn refresh_keeps_entities_with_pending_mutations() {
    let server = FakeServer::new();
    let ctx = board_with_one_task(&server).await;

    let (tx, rx) = oneshot::channel();
    let handle = ctx.tasks.mutations().apply_mutation(
        EntityKey::task(1),
        patch(json!({"status": "en_progreso"})),
        move || gated(rx),
    );
    server.route(Method::GET, "tasks/", 200, json!({"results": []})).await;
    assert_eq!(ctx.tasks.refresh().await.unwrap(), 0);
    assert_eq!(ctx.tasks.task(1).unwrap().unwrap().status, TaskStatus::InProgress);

    tx.send(Ok(Value::Null)).unwrap();
    handle.outcome().await.unwrap();
    // The listing no longer has it and nothing is pending.
    assert!(ctx.tasks.task(1).unwrap().is_none());
}

/// Start `delete_task(1)` in the background and wait until it is hidden.
async fn spawn_delete(
    ctx: &taskboard_sync::AppContext,
) -> tokio::task::JoinHandle<Result<(), SyncError>> {
    let board = ctx.tasks.clone();
    let delete = tokio::spawn(async move { board.delete_task(1).await });
    tokio::time::timeout(Duration::from_secs(1), async {
        while ctx.tasks.task(1).unwrap().is_some() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("delete hides the task");
    delete
}

#[tokio::test]
async fn refused_delete_after_failed_edit_restores_original() {
    let server = FakeServer::new();
    let ctx = board_with_one_task(&server).await;
    server
        .route(Method::DELETE, "tasks/1/", 404, json!({"detail": "Not found."}))
        .await;

    let (tx, rx) = oneshot::channel();
    let edit = ctx.tasks.mutations().apply_mutation(
        EntityKey::task(1),
        patch(json!({"status": "completada"})),
        move || gated(rx),
    );
    let delete = spawn_delete(&ctx).await;
    // Queued behind the edit.
    assert!(server.requests_to("tasks/1/").await.is_empty());

    tx.send(Err(SyncError::ValidationFailed("status".into()))).unwrap();
    assert!(edit.outcome().await.is_err());
    let err = delete.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));

    let task = ctx.tasks.task(1).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.title, "Caja");
    assert!(ctx.store.pending(EntityKey::task(1)).is_empty());
}

#[tokio::test]
async fn delete_after_failed_edit_removes_task() {
    let server = FakeServer::new();
    let ctx = board_with_one_task(&server).await;
    let mut events = ctx.store.subscribe();

    let (tx, rx) = oneshot::channel();
    let edit = ctx.tasks.mutations().apply_mutation(
        EntityKey::task(1),
        patch(json!({"title": "Caja chica"})),
        move || gated(rx),
    );
    let delete = spawn_delete(&ctx).await;

    tx.send(Err(SyncError::Server {
        status: 500,
        body: "boom".into(),
    }))
    .unwrap();
    assert!(edit.outcome().await.is_err());
    delete.await.unwrap().unwrap();

    assert!(ctx.tasks.task(1).unwrap().is_none());
    assert!(ctx.tasks.tasks().unwrap().is_empty());
    let sent = server.requests_to("tasks/1/").await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, Method::DELETE);
    let seen = drain(&mut events);
    assert_eq!(failures(&seen).len(), 1);
    assert!(seen.contains(&StoreEvent::Removed {
        key: EntityKey::task(1)
    }));
}

#[tokio::test]
async fn failed_edit_after_refresh_dropped_task_removes_it() {
    let server = FakeServer::new();
    let ctx = board_with_one_task(&server).await;

    let (tx, rx) = oneshot::channel();
    let edit = ctx.tasks.mutations().apply_mutation(
        EntityKey::task(1),
        patch(json!({"status": "en_progreso"})),
        move || gated(rx),
    );
    server.route(Method::GET, "tasks/", 200, json!([])).await;
    ctx.tasks.refresh().await.unwrap();
    assert!(ctx.tasks.task(1).unwrap().is_some());

    tx.send(Err(SyncError::ValidationFailed("status".into()))).unwrap();
    assert!(edit.outcome().await.is_err());
    assert!(ctx.tasks.task(1).unwrap().is_none());
}

#[tokio::test]
async fn failed_edit_after_refresh_shows_refreshed_value() {
    let server = FakeServer::new();
    let ctx = board_with_one_task(&server).await;

    let (tx, rx) = oneshot::channel();
    let edit = ctx.tasks.mutations().apply_mutation(
        EntityKey::task(1),
        patch(json!({"status": "completada"})),
        move || gated(rx),
    );
    server
        .route(
            Method::GET,
            "tasks/",
            200,
            json!([{"id": 1, "title": "Caja fuerte", "status": "en_progreso"}]),
        )
        .await;
    ctx.tasks.refresh().await.unwrap();
    let task = ctx.tasks.task(1).unwrap().unwrap();
    assert_eq!(task.title, "Caja fuerte");
    assert_eq!(task.status, TaskStatus::Done);

    tx.send(Err(SyncError::ValidationFailed("status".into()))).unwrap();
    assert!(edit.outcome().await.is_err());
    let task = ctx.tasks.task(1).unwrap().unwrap();
    assert_eq!(task.title, "Caja fuerte");
    assert_eq!(task.status, TaskStatus::InProgress);
}
