use domain::{Task, TaskId, TaskPatch, UserId};
use std::collections::HashSet;
use tracing::warn;

/// 挿入結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// 同一IDが既に存在したため無視
    Duplicate,
    /// 所有者が異なるため拒否
    Rejected,
}

/// upsert の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Replaced,
    Inserted,
    Rejected,
}

/// 削除されたレコードと元の位置（失敗時の復元用）
#[derive(Debug, Clone, PartialEq)]
pub struct Removed {
    pub index: usize,
    pub task: Task,
}

/// 全件取得の開始時点を表す受付票
///
/// 取得結果は同じ受付票で `finish_fetch` に渡す。所有者が変わった場合や
/// より新しい取得が先に反映された場合は破棄される。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    owner: UserId,
    sequence: u64,
}

impl FetchTicket {
    pub fn owner(&self) -> &UserId {
        &self.owner
    }
}

/// 取得結果の反映結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 反映後の件数
    Replaced(usize),
    /// 所有者の切り替えや新しい取得により破棄
    Stale,
}

/// 取得中に適用した変更（取得結果の上に再適用する）
#[derive(Debug, Clone)]
enum Replay {
    Insert(Task),
    Upsert(Task),
    Patch(TaskId, TaskPatch),
    Remove(TaskId),
    Restore(Removed),
}

/// ローカルのタスクコレクション
///
/// 現在のユーザーのタスクを ID で重複排除した順序付きリストとして保持する。
/// 所有者が未設定（サインアウト中）の間は何も受け付けない。
///
/// 全件取得の間に届いた変更は記録しておき、取得結果で置き換えた後に
/// 再適用する。取得が読み取った時点より後の変更を失わないため。
#[derive(Debug, Default)]
pub struct TaskStore {
    owner: Option<UserId>,
    tasks: Vec<Task>,
    sequence: u64,
    open_fetches: Vec<u64>,
    journal: Vec<(u64, Replay)>,
    /// 最後に反映した取得の開始番号
    latest_fetch: Option<u64>,
}

impl TaskStore {
    pub fn new(owner: Option<UserId>) -> Self {
        Self {
            owner,
            ..Self::default()
        }
    }

    pub fn owner(&self) -> Option<&UserId> {
        self.owner.as_ref()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.position(id).is_some()
    }

    /// 進行中の全件取得があるか
    pub fn is_fetching(&self) -> bool {
        !self.open_fetches.is_empty()
    }

    fn position(&self, id: &TaskId) -> Option<usize> {
        self.tasks.iter().position(|task| &task.id == id)
    }

    fn accepts(&self, task: &Task) -> bool {
        match &self.owner {
            Some(owner) if task.is_owned_by(owner) => true,
            _ => {
                warn!(
                    task_id = %task.id,
                    task_owner = %task.user_id,
                    "Rejecting task that does not belong to the current user"
                );
                false
            }
        }
    }

    fn record(&mut self, entry: Option<Replay>) {
        if let Some(entry) = entry {
            self.journal.push((self.sequence, entry));
            self.sequence += 1;
        }
    }

    /// 取得中の場合のみ記録用の変更を作る
    fn journaled(&self, build: impl FnOnce() -> Replay) -> Option<Replay> {
        self.is_fetching().then(build)
    }

    /// 所有者を切り替えて空にする（進行中の取得は全て無効になる）
    pub fn reset(&mut self, owner: Option<UserId>) {
        self.owner = owner;
        self.tasks.clear();
        self.open_fetches.clear();
        self.journal.clear();
        self.latest_fetch = None;
        self.sequence += 1;
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// 全件置き換え（取得順を維持し、他ユーザーの行と重複IDは除外）
    pub fn replace_all(&mut self, tasks: Vec<Task>) -> usize {
        let mut seen = HashSet::new();
        let kept: Vec<Task> = tasks
            .into_iter()
            .filter(|task| self.accepts(task))
            .filter(|task| seen.insert(task.id.clone()))
            .collect();
        self.tasks = kept;
        self.tasks.len()
    }

    /// 全件取得を開始する（所有者未設定なら `None`）
    pub fn begin_fetch(&mut self) -> Option<FetchTicket> {
        let owner = self.owner.clone()?;
        self.open_fetches.push(self.sequence);
        Some(FetchTicket {
            owner,
            sequence: self.sequence,
        })
    }

    /// 取得結果で置き換え、取得開始後に適用された変更を上から再適用する
    pub fn finish_fetch(&mut self, ticket: &FetchTicket, tasks: Vec<Task>) -> FetchOutcome {
        if !self.close_fetch(ticket) || self.owner.as_ref() != Some(&ticket.owner) {
            return FetchOutcome::Stale;
        }
        if self
            .latest_fetch
            .map_or(false, |latest| ticket.sequence < latest)
        {
            self.prune_journal();
            return FetchOutcome::Stale;
        }

        self.replace_all(tasks);
        let replay: Vec<Replay> = self
            .journal
            .iter()
            .filter(|(sequence, _)| *sequence >= ticket.sequence)
            .map(|(_, entry)| entry.clone())
            .collect();
        for entry in replay {
            self.replay(entry);
        }

        self.latest_fetch = Some(ticket.sequence);
        self.prune_journal();
        FetchOutcome::Replaced(self.tasks.len())
    }

    /// 失敗した取得を閉じる
    pub fn abandon_fetch(&mut self, ticket: &FetchTicket) {
        if self.close_fetch(ticket) {
            self.prune_journal();
        }
    }

    fn close_fetch(&mut self, ticket: &FetchTicket) -> bool {
        match self
            .open_fetches
            .iter()
            .position(|sequence| *sequence == ticket.sequence)
        {
            Some(index) => {
                self.open_fetches.remove(index);
                true
            }
            None => false,
        }
    }

    /// 進行中の取得が参照しない記録を捨てる
    fn prune_journal(&mut self) {
        match self.open_fetches.iter().min().copied() {
            Some(oldest) => self.journal.retain(|(sequence, _)| *sequence >= oldest),
            None => self.journal.clear(),
        }
    }

    fn replay(&mut self, entry: Replay) {
        match entry {
            Replay::Insert(task) => {
                self.insert_task(task);
            }
            Replay::Upsert(task) => {
                self.upsert_task(task);
            }
            Replay::Patch(id, patch) => {
                self.patch_task(&id, &patch);
            }
            Replay::Remove(id) => {
                self.remove_task(&id);
            }
            Replay::Restore(removed) => {
                self.restore_task(removed);
            }
        }
    }

    /// 先頭に挿入（同一IDが存在する場合は何もしない）
    pub fn insert(&mut self, task: Task) -> InsertOutcome {
        let entry = self.journaled(|| Replay::Insert(task.clone()));
        let outcome = self.insert_task(task);
        if outcome != InsertOutcome::Rejected {
            self.record(entry);
        }
        outcome
    }

    fn insert_task(&mut self, task: Task) -> InsertOutcome {
        if !self.accepts(&task) {
            return InsertOutcome::Rejected;
        }
        if self.contains(&task.id) {
            return InsertOutcome::Duplicate;
        }
        self.tasks.insert(0, task);
        InsertOutcome::Inserted
    }

    /// 部分更新をマージ（存在しない場合は何もしない）
    pub fn apply_update(&mut self, id: &TaskId, patch: &TaskPatch) -> bool {
        let entry = self.journaled(|| Replay::Patch(id.clone(), patch.clone()));
        self.record(entry);
        self.patch_task(id, patch)
    }

    fn patch_task(&mut self, id: &TaskId, patch: &TaskPatch) -> bool {
        match self.tasks.iter_mut().find(|task| &task.id == id) {
            Some(task) => {
                task.apply_patch(patch);
                true
            }
            None => false,
        }
    }

    /// レコード全体で置き換え、無ければ先頭に挿入
    pub fn upsert(&mut self, task: Task) -> UpsertOutcome {
        let entry = self.journaled(|| Replay::Upsert(task.clone()));
        let outcome = self.upsert_task(task);
        if outcome != UpsertOutcome::Rejected {
            self.record(entry);
        }
        outcome
    }

    fn upsert_task(&mut self, task: Task) -> UpsertOutcome {
        if !self.accepts(&task) {
            return UpsertOutcome::Rejected;
        }
        match self.position(&task.id) {
            Some(index) => {
                self.tasks[index] = task;
                UpsertOutcome::Replaced
            }
            None => {
                self.tasks.insert(0, task);
                UpsertOutcome::Inserted
            }
        }
    }

    /// 削除（存在しない場合も取得中なら記録し、取得結果からも取り除く）
    pub fn remove(&mut self, id: &TaskId) -> Option<Removed> {
        let entry = self.journaled(|| Replay::Remove(id.clone()));
        self.record(entry);
        self.remove_task(id)
    }

    fn remove_task(&mut self, id: &TaskId) -> Option<Removed> {
        let index = self.position(id)?;
        let task = self.tasks.remove(index);
        Some(Removed { index, task })
    }

    /// 削除したレコードを元の位置に戻す（既に存在する場合は何もしない）
    pub fn restore(&mut self, removed: Removed) -> bool {
        let entry = self.journaled(|| Replay::Restore(removed.clone()));
        let restored = self.restore_task(removed);
        if restored {
            self.record(entry);
        }
        restored
    }

    fn restore_task(&mut self, removed: Removed) -> bool {
        if !self.accepts(&removed.task) || self.contains(&removed.task.id) {
            return false;
        }
        let index = removed.index.min(self.tasks.len());
        self.tasks.insert(index, removed.task);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use domain::{TaskPriority, TaskStatus};

    fn user(id: &str) -> UserId {
        UserId::from_string(id).unwrap()
    }

    fn task(id: &str, owner: &str) -> Task {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        Task {
            id: TaskId::from_string(id).unwrap(),
            title: format!("Task {id}"),
            description: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            due_date: None,
            assignee: None,
            category: None,
            user_id: user(owner),
            created_at: at,
            updated_at: at,
        }
    }

    fn ids(store: &TaskStore) -> Vec<&str> {
        store.tasks().iter().map(|t| t.id.as_str()).collect()
    }

    fn assert_unique(store: &TaskStore) {
        let unique: HashSet<&TaskId> = store.tasks().iter().map(|t| &t.id).collect();
        assert_eq!(unique.len(), store.len(), "duplicate ids in {:?}", ids(store));
    }

    #[test]
    fn test_insert_prepends_and_dedupes() {
        let mut store = TaskStore::new(Some(user("u1")));
        assert_eq!(store.insert(task("a", "u1")), InsertOutcome::Inserted);
        assert_eq!(store.insert(task("b", "u1")), InsertOutcome::Inserted);
        assert_eq!(store.insert(task("a", "u1")), InsertOutcome::Duplicate);
        assert_eq!(ids(&store), vec!["b", "a"]);
    }

    #[test]
    fn test_foreign_tasks_rejected() {
        let mut store = TaskStore::new(Some(user("u1")));
        assert_eq!(store.insert(task("x", "u2")), InsertOutcome::Rejected);
        assert_eq!(store.upsert(task("x", "u2")), UpsertOutcome::Rejected);
        assert_eq!(store.replace_all(vec![task("a", "u1"), task("x", "u2")]), 1);
        assert_eq!(ids(&store), vec!["a"]);

        let mut signed_out = TaskStore::default();
        assert_eq!(signed_out.insert(task("a", "u1")), InsertOutcome::Rejected);
        assert!(signed_out.is_empty());
    }

    #[test]
    fn test_replace_all_keeps_order_and_drops_duplicates() {
        let mut store = TaskStore::new(Some(user("u1")));
        store.insert(task("old", "u1"));
        store.replace_all(vec![task("c", "u1"), task("b", "u1"), task("c", "u1")]);
        assert_eq!(ids(&store), vec!["c", "b"]);
    }

    #[test]
    fn test_apply_update_merges_fields() {
        let mut store = TaskStore::new(Some(user("u1")));
        store.insert(task("a", "u1"));

        let patch = TaskPatch::status(TaskStatus::Completed).with_title("Renamed");
        assert!(store.apply_update(&TaskId::from_string("a").unwrap(), &patch));
        assert!(!store.apply_update(&TaskId::from_string("zzz").unwrap(), &patch));

        let updated = store.get(&TaskId::from_string("a").unwrap()).unwrap();
        assert_eq!(updated.status, TaskStatus::Completed);
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.priority, TaskPriority::Medium);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut store = TaskStore::new(Some(user("u1")));
        store.insert(task("a", "u1"));
        let mut changed = task("a", "u1");
        changed.title = "Changed".to_string();

        assert_eq!(store.upsert(changed.clone()), UpsertOutcome::Replaced);
        let once = store.tasks().to_vec();
        assert_eq!(store.upsert(changed), UpsertOutcome::Replaced);
        assert_eq!(store.tasks(), once.as_slice());
    }

    #[test]
    fn test_remove_and_restore_position() {
        let mut store = TaskStore::new(Some(user("u1")));
        store.replace_all(vec![task("a", "u1"), task("b", "u1"), task("c", "u1")]);

        let removed = store.remove(&TaskId::from_string("b").unwrap()).unwrap();
        assert_eq!(removed.index, 1);
        assert_eq!(ids(&store), vec!["a", "c"]);
        assert!(store.remove(&TaskId::from_string("b").unwrap()).is_none());

        assert!(store.restore(removed.clone()));
        assert_eq!(ids(&store), vec!["a", "b", "c"]);
        assert!(!store.restore(removed));
    }

    #[test]
    fn test_reset_clears_and_rebinds_owner() {
        let mut store = TaskStore::new(Some(user("u1")));
        store.insert(task("a", "u1"));
        store.reset(Some(user("u2")));
        assert!(store.is_empty());
        assert_eq!(store.insert(task("b", "u2")), InsertOutcome::Inserted);
    }

    #[test]
    fn test_changes_during_fetch_survive_replace() {
        let mut store = TaskStore::new(Some(user("u1")));
        store.insert(task("gone", "u1"));
        let ticket = store.begin_fetch().unwrap();

        // 取得がサーバーを読んだ後に届いた変更
        store.insert(task("from other tab", "u1"));
        let mut renamed = task("a", "u1");
        renamed.title = "Renamed".to_string();
        store.upsert(renamed);
        store.remove(&TaskId::from_string("b").unwrap());

        let fetched = vec![task("a", "u1"), task("b", "u1"), task("gone", "u1")];
        assert_eq!(store.finish_fetch(&ticket, fetched), FetchOutcome::Replaced(3));
        assert_eq!(ids(&store), vec!["from other tab", "a", "gone"]);
        assert_eq!(store.get(&TaskId::from_string("a").unwrap()).unwrap().title, "Renamed");
        assert!(!store.is_fetching());
    }

    #[test]
    fn test_fetch_for_previous_owner_is_dropped() {
        let mut store = TaskStore::new(Some(user("u1")));
        let ticket = store.begin_fetch().unwrap();
        assert_eq!(ticket.owner(), &user("u1"));

        store.reset(Some(user("u2")));
        store.insert(task("b1", "u2"));

        assert_eq!(
            store.finish_fetch(&ticket, vec![task("a1", "u1")]),
            FetchOutcome::Stale
        );
        assert_eq!(ids(&store), vec!["b1"]);
    }

    #[test]
    fn test_older_fetch_does_not_overwrite_newer() {
        let mut store = TaskStore::new(Some(user("u1")));
        let older = store.begin_fetch().unwrap();
        store.apply_update(
            &TaskId::from_string("a").unwrap(),
            &TaskPatch::status(TaskStatus::Completed),
        );
        let newer = store.begin_fetch().unwrap();

        assert_eq!(
            store.finish_fetch(&newer, vec![task("a", "u1")]),
            FetchOutcome::Replaced(1)
        );
        assert_eq!(
            store.finish_fetch(&older, vec![task("a", "u1"), task("old", "u1")]),
            FetchOutcome::Stale
        );
        assert_eq!(ids(&store), vec!["a"]);
        assert_eq!(
            store.get(&TaskId::from_string("a").unwrap()).unwrap().status,
            TaskStatus::Todo
        );
    }

    #[test]
    fn test_abandoned_fetch_releases_journal() {
        let mut store = TaskStore::new(Some(user("u1")));
        let ticket = store.begin_fetch().unwrap();
        store.insert(task("a", "u1"));
        store.abandon_fetch(&ticket);

        assert!(!store.is_fetching());
        assert!(store.journal.is_empty());
        assert_eq!(ids(&store), vec!["a"]);
        assert!(TaskStore::default().begin_fetch().is_none());
    }

    #[test]
    fn test_random_operation_sequences_never_duplicate() {
        // 線形合同法で再現可能な操作列を生成
        let mut seed: u64 = 0x5eed;
        let mut next = move |bound: u64| {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (seed >> 33) % bound
        };

        let mut store = TaskStore::new(Some(user("u1")));
        let mut removed = Vec::new();

        for _ in 0..2000 {
            let id = format!("t{}", next(8));
            let task_id = TaskId::from_string(id.clone()).unwrap();
            match next(6) {
                0 => {
                    store.insert(task(&id, "u1"));
                }
                1 => {
                    let mut t = task(&id, "u1");
                    t.title = format!("v{}", next(100));
                    store.upsert(t);
                }
                2 => {
                    store.apply_update(&task_id, &TaskPatch::status(TaskStatus::InProgress));
                }
                3 => {
                    if let Some(r) = store.remove(&task_id) {
                        removed.push(r);
                    }
                }
                4 => {
                    if let Some(r) = removed.pop() {
                        store.restore(r);
                    }
                }
                _ => {
                    let batch = (0..next(5))
                        .map(|_| task(&format!("t{}", next(8)), "u1"))
                        .collect();
                    store.replace_all(batch);
                }
            }
            assert_unique(&store);
        }
    }
}
