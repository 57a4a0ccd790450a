use chrono::Utc;
use domain::{Task, TaskChange, TaskDraft, TaskId, TaskPriority, TaskStatus, UserId};
use futures::future::join_all;
use infrastructure::{AuthEvent, AuthGateway, GatewayOperation, InMemoryGateway, CHANNEL_CAPACITY};
use shared::AppError;
use std::collections::HashSet;
use std::sync::Arc;
use task_sync::{spawn_auth_listener, TaskSyncSession};
use tokio::time::{sleep, timeout, Duration};

const EMAIL: &str = "alex@example.com";
const PASSWORD: &str = "correct horse";

/// サインイン済みのセッションを用意する
async fn setup_signed_in() -> (Arc<InMemoryGateway>, TaskSyncSession<InMemoryGateway>, UserId) {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway
        .register_user(EMAIL, PASSWORD, Some("Alex Doe"))
        .await;
    let session = TaskSyncSession::new(gateway.clone(), Duration::from_secs(2));
    let owner = sign_in(&gateway, &session).await;
    (gateway, session, owner)
}

async fn sign_in(
    gateway: &InMemoryGateway,
    session: &TaskSyncSession<InMemoryGateway>,
) -> UserId {
    let auth = gateway.sign_in(EMAIL, PASSWORD).await.unwrap();
    session
        .handle_auth_event(AuthEvent::SignedIn(auth))
        .await
        .unwrap();
    session.current_user().unwrap().id
}

/// 条件を満たすまでストアのスナップショットを待つ
async fn wait_for_store<F>(session: &TaskSyncSession<InMemoryGateway>, predicate: F) -> Vec<Task>
where
    F: Fn(&[Task]) -> bool,
{
    let mut snapshots = session.store().subscribe();
    timeout(Duration::from_secs(2), async {
        loop {
            {
                let snapshot = snapshots.borrow_and_update();
                if predicate(&snapshot.tasks) {
                    return snapshot.tasks.clone();
                }
            }
            snapshots.changed().await.unwrap();
        }
    })
    .await
    .expect("store did not reach the expected state")
}

/// 書き込みのエコーが反映されるのを待つ
async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

fn assert_unique_ids(tasks: &[Task]) {
    let ids: HashSet<&TaskId> = tasks.iter().map(|task| &task.id).collect();
    assert_eq!(ids.len(), tasks.len(), "duplicate task ids: {tasks:?}");
}

fn remote_task(id: &str, owner: &UserId, title: &str) -> Task {
    let now = Utc::now();
    Task {
        id: TaskId::from_string(id).unwrap(),
        title: title.to_string(),
        description: None,
        status: TaskStatus::Todo,
        priority: TaskPriority::Low,
        due_date: None,
        assignee: None,
        category: None,
        user_id: owner.clone(),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn test_create_write_report() {
    let (gateway, session, owner) = setup_signed_in().await;

    let created = session
        .controller()
        .create(TaskDraft::titled("Write report"))
        .await
        .unwrap();
    settle().await;

    let tasks = session.store().tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0], created);
    assert_eq!(tasks[0].title, "Write report");
    assert_eq!(tasks[0].status, TaskStatus::Todo);
    assert_eq!(tasks[0].priority, TaskPriority::Medium);
    assert_eq!(tasks[0].due_date, None);
    assert_eq!(tasks[0].user_id, owner);
    assert_eq!(gateway.rows().await, tasks);
}

#[tokio::test]
async fn test_toggle_status_cycles() {
    let (_gateway, session, _owner) = setup_signed_in().await;
    let controller = session.controller();
    let task = controller
        .create(TaskDraft::titled("Cycle me"))
        .await
        .unwrap();
    settle().await;

    let expected = [
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Todo,
    ];
    for status in expected {
        assert_eq!(controller.toggle_status(&task.id).await.unwrap(), status);
        // 次の切り替えの前に自分の書き込みのエコーを反映させる
        settle().await;
        let tasks = session.store().tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, status);
    }
}

#[tokio::test]
async fn test_failed_delete_restores_record() {
    let (gateway, session, _owner) = setup_signed_in().await;
    let controller = session.controller();
    controller.create(TaskDraft::titled("First")).await.unwrap();
    let mut draft = TaskDraft::titled("Second");
    draft.description = "keep me".to_string();
    draft.priority = TaskPriority::High;
    let target = controller.create(draft).await.unwrap();
    controller.create(TaskDraft::titled("Third")).await.unwrap();
    settle().await;

    let before = session.store().tasks();
    gateway.fail_next(GatewayOperation::Delete, 1).await;

    let result = controller.delete(&target.id).await;
    assert!(matches!(result, Err(AppError::Remote(_))));

    let after = session.store().tasks();
    assert_eq!(after, before);
    let restored = after.iter().find(|t| t.id == target.id).unwrap();
    assert_eq!(restored, &target);
    assert_eq!(restored.description.as_deref(), Some("keep me"));
}

#[tokio::test]
async fn test_failed_update_matches_server_state() {
    let (gateway, session, _owner) = setup_signed_in().await;
    let controller = session.controller();
    let task = controller
        .create(TaskDraft::titled("Stable"))
        .await
        .unwrap();
    settle().await;
    gateway.fail_next(GatewayOperation::Update, 1).await;

    let result = controller.move_to(&task.id, TaskStatus::Completed).await;
    assert!(matches!(result, Err(AppError::Remote(_))));
    settle().await;

    assert_eq!(session.store().tasks(), gateway.rows().await);
    assert_eq!(
        session.store().get(&task.id).unwrap().status,
        TaskStatus::Todo
    );
}

#[tokio::test]
async fn test_duplicate_created_events_do_not_duplicate() {
    let (gateway, session, _owner) = setup_signed_in().await;
    let task = session
        .controller()
        .create(TaskDraft::titled("Echoed"))
        .await
        .unwrap();

    gateway.publish(TaskChange::Created(task.clone()));
    gateway.publish(TaskChange::Created(task.clone()));
    settle().await;

    assert_eq!(session.store().tasks(), vec![task]);
}

#[tokio::test]
async fn test_same_updated_event_twice_is_idempotent() {
    let (gateway, session, owner) = setup_signed_in().await;
    let original = remote_task("remote-1", &owner, "From another tab");
    gateway.publish(TaskChange::Created(original.clone()));
    wait_for_store(&session, |tasks| tasks.len() == 1).await;

    let mut changed = original.clone();
    changed.status = TaskStatus::Completed;
    changed.title = "Done elsewhere".to_string();

    gateway.publish(TaskChange::Updated(changed.clone()));
    let once = wait_for_store(&session, |tasks| {
        tasks.iter().any(|t| t.title == "Done elsewhere")
    })
    .await;

    gateway.publish(TaskChange::Updated(changed.clone()));
    settle().await;
    assert_eq!(session.store().tasks(), once);
    assert_eq!(once, vec![changed]);
}

#[tokio::test]
async fn test_update_arriving_before_create() {
    let (gateway, session, owner) = setup_signed_in().await;
    let original = remote_task("remote-2", &owner, "Original");
    let mut changed = original.clone();
    changed.title = "Updated first".to_string();

    gateway.publish(TaskChange::Updated(changed.clone()));
    gateway.publish(TaskChange::Created(original));
    wait_for_store(&session, |tasks| !tasks.is_empty()).await;
    settle().await;

    assert_eq!(session.store().tasks(), vec![changed]);
}

#[tokio::test]
async fn test_changes_for_other_users_are_ignored() {
    let (gateway, session, owner) = setup_signed_in().await;
    let stranger = UserId::from_string("someone-else").unwrap();

    gateway.publish(TaskChange::Created(remote_task("theirs", &stranger, "Not mine")));
    gateway.publish(TaskChange::Created(remote_task("mine", &owner, "Mine")));

    let tasks = wait_for_store(&session, |tasks| !tasks.is_empty()).await;
    settle().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(session.store().tasks()[0].id.as_str(), "mine");
}

#[tokio::test]
async fn test_remote_delete_removes_task() {
    let (gateway, session, owner) = setup_signed_in().await;
    gateway.publish(TaskChange::Created(remote_task("gone", &owner, "Soon gone")));
    wait_for_store(&session, |tasks| tasks.len() == 1).await;

    gateway.publish(TaskChange::deleted(TaskId::from_string("gone").unwrap()));
    wait_for_store(&session, |tasks| tasks.is_empty()).await;
}

#[tokio::test]
async fn test_concurrent_creates_stay_unique() {
    let (gateway, session, _owner) = setup_signed_in().await;
    let controller = session.controller();

    let results = join_all(
        (0..10).map(|i| controller.create(TaskDraft::titled(format!("Task {i}")))),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));

    let tasks = wait_for_store(&session, |tasks| tasks.len() >= 10).await;
    settle().await;
    assert_eq!(tasks.len(), 10);
    assert_unique_ids(&session.store().tasks());
    assert_eq!(gateway.rows().await.len(), 10);
}

#[tokio::test]
async fn test_sign_out_clears_store() {
    let (gateway, session, owner) = setup_signed_in().await;
    session
        .controller()
        .create(TaskDraft::titled("Private"))
        .await
        .unwrap();

    session.sign_out().await.unwrap();
    assert!(session.store().tasks().is_empty());
    assert!(session.current_user().is_none());
    assert!(!session.is_subscribed().await);

    // 購読解除後の変更は反映されない
    gateway.publish(TaskChange::Created(remote_task("late", &owner, "Late")));
    settle().await;
    assert!(session.store().tasks().is_empty());

    let result = session
        .controller()
        .create(TaskDraft::titled("Anonymous"))
        .await;
    assert_eq!(result, Err(AppError::NotAuthenticated));
}

#[tokio::test]
async fn test_sign_in_again_loads_existing_tasks() {
    let (gateway, session, _owner) = setup_signed_in().await;
    session
        .controller()
        .create(TaskDraft::titled("Persisted"))
        .await
        .unwrap();
    session.sign_out().await.unwrap();

    sign_in(&gateway, &session).await;
    let tasks = session.store().tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Persisted");
}

#[tokio::test]
async fn test_auth_listener_follows_gateway_events() {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.register_user(EMAIL, PASSWORD, None).await;
    let session = Arc::new(TaskSyncSession::new(
        gateway.clone(),
        Duration::from_secs(2),
    ));
    let listener = spawn_auth_listener(session.clone());
    let mut users = session.watch_user();

    gateway.sign_in(EMAIL, PASSWORD).await.unwrap();
    timeout(Duration::from_secs(2), users.wait_for(|user| user.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.current_user().unwrap().name, "alex");

    gateway.sign_out().await.unwrap();
    timeout(Duration::from_secs(2), users.wait_for(|user| user.is_none()))
        .await
        .unwrap()
        .unwrap();
    assert!(session.store().owner().is_none());

    listener.abort();
}

#[tokio::test]
async fn test_two_sessions_share_changes() {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.register_user(EMAIL, PASSWORD, None).await;
    let laptop = TaskSyncSession::new(gateway.clone(), Duration::from_secs(2));
    let phone = TaskSyncSession::new(gateway.clone(), Duration::from_secs(2));
    sign_in(&gateway, &laptop).await;
    sign_in(&gateway, &phone).await;

    let task = laptop
        .controller()
        .create(TaskDraft::titled("Shared"))
        .await
        .unwrap();
    let seen = wait_for_store(&phone, |tasks| tasks.len() == 1).await;
    assert_eq!(seen, vec![task.clone()]);

    phone.controller().delete(&task.id).await.unwrap();
    wait_for_store(&laptop, |tasks| tasks.is_empty()).await;
}

#[tokio::test]
async fn test_change_during_initial_load_is_kept() {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.register_user(EMAIL, PASSWORD, None).await;
    let laptop = TaskSyncSession::new(gateway.clone(), Duration::from_secs(2));
    let phone = TaskSyncSession::new(gateway.clone(), Duration::from_secs(2));
    sign_in(&gateway, &phone).await;

    // 一覧の応答が返る前に別の端末で作成される
    gateway
        .delay_response(GatewayOperation::Select, Some(Duration::from_millis(200)))
        .await;
    let (_, created) = tokio::join!(sign_in(&gateway, &laptop), async {
        sleep(Duration::from_millis(50)).await;
        phone
            .controller()
            .create(TaskDraft::titled("from other tab"))
            .await
            .unwrap()
    });

    assert_eq!(laptop.store().tasks(), vec![created]);
    assert_eq!(gateway.rows().await.len(), 1);
}

#[tokio::test]
async fn test_feed_gap_triggers_reload() {
    let (gateway, session, owner) = setup_signed_in().await;
    let total = CHANNEL_CAPACITY + 20;
    let tasks: Vec<Task> = (0..total)
        .map(|i| remote_task(&format!("bulk-{i}"), &owner, "Imported"))
        .collect();
    for task in &tasks {
        gateway.seed(task.clone()).await;
    }

    // 受信側が追いつく前に配信して取りこぼしを起こす
    for task in tasks {
        gateway.publish(TaskChange::Created(task));
    }

    let loaded = wait_for_store(&session, |tasks| tasks.len() == total).await;
    assert_unique_ids(&loaded);
}
