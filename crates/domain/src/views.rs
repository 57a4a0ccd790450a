//! ダッシュボード・一覧・カンバン・カレンダー向けの読み取り専用ビュー

use crate::task::{Task, TaskPriority, TaskStatus};
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// ダッシュボードに表示する最近のタスク数
pub const RECENT_TASK_LIMIT: usize = 5;

/// 期限が近いとみなす日数
pub const UPCOMING_WINDOW_DAYS: i64 = 7;

/// タスク一覧の絞り込み条件（None は「すべて」）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub search: String,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        let status_ok = self.status.map_or(true, |status| task.status == status);
        let priority_ok = self
            .priority
            .map_or(true, |priority| task.priority == priority);

        status_ok && priority_ok && self.matches_search(task)
    }

    /// タイトル・説明・カテゴリ・担当者を大文字小文字を区別せずに検索
    fn matches_search(&self, task: &Task) -> bool {
        let needle = self.search.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }

        let contains = |value: &str| value.to_lowercase().contains(&needle);
        contains(&task.title)
            || task.description.as_deref().is_some_and(contains)
            || task.category.as_deref().is_some_and(contains)
            || task.assignee.as_deref().is_some_and(contains)
    }

    pub fn apply<'a>(&self, tasks: &'a [Task]) -> Vec<&'a Task> {
        tasks.iter().filter(|task| self.matches(task)).collect()
    }
}

/// ダッシュボード集計
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardStats {
    pub total: usize,
    pub todo: usize,
    pub in_progress: usize,
    pub completed: usize,
    /// 完了率（%）
    pub completion_rate: f64,
    pub overdue: usize,
    pub upcoming: Vec<Task>,
    pub recent: Vec<Task>,
}

impl DashboardStats {
    pub fn compute(tasks: &[Task], now: DateTime<Utc>) -> Self {
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();

        let total = tasks.len();
        let completed = count(TaskStatus::Completed);
        let completion_rate = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let horizon = now + Duration::days(UPCOMING_WINDOW_DAYS);
        let upcoming = tasks
            .iter()
            .filter(|task| match task.due_date {
                Some(due) => due >= now && due <= horizon && !task.status.is_completed(),
                None => false,
            })
            .cloned()
            .collect();

        Self {
            total,
            todo: count(TaskStatus::Todo),
            in_progress: count(TaskStatus::InProgress),
            completed,
            completion_rate,
            overdue: tasks.iter().filter(|task| task.is_overdue(now)).count(),
            upcoming,
            recent: tasks.iter().take(RECENT_TASK_LIMIT).cloned().collect(),
        }
    }
}

/// カンバンボードの列
#[derive(Debug, Clone, PartialEq)]
pub struct KanbanColumn {
    pub status: TaskStatus,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KanbanBoard {
    pub columns: Vec<KanbanColumn>,
}

impl KanbanBoard {
    /// 状態ごとに列へ振り分ける（ストアの並び順を保持）
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let columns = TaskStatus::ALL
            .iter()
            .map(|&status| KanbanColumn {
                status,
                tasks: tasks
                    .iter()
                    .filter(|task| task.status == status)
                    .cloned()
                    .collect(),
            })
            .collect();

        Self { columns }
    }

    pub fn column(&self, status: TaskStatus) -> Option<&KanbanColumn> {
        self.columns.iter().find(|column| column.status == status)
    }
}

/// 指定日（UTC）が期限のタスク
pub fn tasks_due_on(tasks: &[Task], date: NaiveDate) -> Vec<&Task> {
    tasks
        .iter()
        .filter(|task| task.due_date.is_some_and(|due| due.date_naive() == date))
        .collect()
}
