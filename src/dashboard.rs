//! Figures for the dashboard landing view, computed from local task state.
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::{Task, TaskStatus};

/// Tasks due within this many days count as upcoming.
pub const UPCOMING_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardSummary {
    pub total: usize,
    pub completed: usize,
    /// Past due and not completed.
    pub overdue: usize,
    /// Due today or later and not completed.
    pub active: usize,
    pub upcoming: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpcomingTask {
    pub task: Task,
    pub due_in_days: i64,
}

pub fn summarize(tasks: &[Task], today: NaiveDate) -> DashboardSummary {
    let mut summary = DashboardSummary {
        total: tasks.len(),
        upcoming: upcoming(tasks, today).len(),
        ..Default::default()
    };
    for task in tasks {
        let done = task.status == TaskStatus::Done;
        if done {
            summary.completed += 1;
        } else if let Some(due) = task.due_date {
            if due < today {
                summary.overdue += 1;
            } else {
                summary.active += 1;
            }
        }
        *summary
            .by_status
            .entry(task.status.as_str().to_string())
            .or_default() += 1;
        if let Some(priority) = &task.priority {
            *summary
                .by_priority
                .entry(priority.as_str().to_string())
                .or_default() += 1;
        }
    }
    summary
}

/// Tasks due between today and the end of the window, soonest first.
pub fn upcoming(tasks: &[Task], today: NaiveDate) -> Vec<UpcomingTask> {
    let mut items: Vec<UpcomingTask> = tasks
        .iter()
        .filter_map(|task| {
            let due_in_days = (task.due_date? - today).num_days();
            (0..=UPCOMING_WINDOW_DAYS)
                .contains(&due_in_days)
                .then(|| UpcomingTask {
                    task: task.clone(),
                    due_in_days,
                })
        })
        .collect();
    items.sort_by_key(|item| (item.due_in_days, item.task.id));
    items
}
