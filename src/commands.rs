//! Command-line front end over [`AppContext`].
use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Subcommand;
use std::path::PathBuf;
use std::time::Duration;
use tracing::instrument;

use crate::context::AppContext;
use crate::dashboard::DashboardSummary;
use crate::model::{NotificationItem, Priority, Task, TaskStatus, User};
use crate::tasks::TaskForm;
use crate::session::AuthState;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Log in and persist the session
    Login {
        #[arg(long)]
        email: String,
        /// Falls back to $TASKBOARD_PASSWORD
        #[arg(long)]
        password: Option<String>,
    },
    /// Clear the persisted session
    Logout,
    /// Show the signed-in identity
    Whoami,
    /// List tasks
    Tasks,
    /// Change a task's status (pendiente, en_progreso, completada)
    SetStatus { id: i64, status: String },
    /// Delegate a task to a user, or withdraw delegation when --user is omitted
    Delegate {
        id: i64,
        #[arg(long)]
        user: Option<i64>,
    },
    /// Edit a task; omitted fields keep their current value
    Edit {
        id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// baja, media or alta
        #[arg(long)]
        priority: Option<String>,
        /// YYYY-MM-DD
        #[arg(long)]
        due: Option<NaiveDate>,
    },
    /// Delete a task
    Delete { id: i64 },
    /// Totals and tasks due in the next week
    Dashboard,
    /// Upload a file to a task
    Attach { id: i64, path: PathBuf },
    /// Remove an attachment from a task
    Detach { task: i64, attachment: i64 },
    /// List users (admins)
    Users,
    /// Show the notification feed
    Notifications {
        /// Keep polling and print the unread count as it changes
        #[arg(long)]
        watch: bool,
    },
    /// Mark a notification read
    MarkRead { id: i64 },
}

#[instrument(skip_all)]
pub async fn run(ctx: &AppContext, command: Command, poll_interval: Duration) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => std::env::var("TASKBOARD_PASSWORD")
                    .context("--password not given and TASKBOARD_PASSWORD not set")?,
            };
            let identity = ctx.session.login(&email, &password).await?;
            println!("Logged in as {} ({})", identity.username, identity.role);
        }
        Command::Logout => {
            ctx.session.logout().await;
            println!("Logged out.");
        }
        Command::Whoami => match ctx.session.identity() {
            Some(identity) => println!("{} ({})", identity.username, identity.role),
            None => println!("Not logged in."),
        },
        Command::Tasks => {
            require_session(ctx)?;
            ctx.tasks.refresh().await?;
            for task in ctx.tasks.tasks()? {
                println!("{}", format_task(&task));
            }
        }
        Command::SetStatus { id, status } => {
            require_session(ctx)?;
            let status = TaskStatus::from(status);
            if let TaskStatus::Other(raw) = &status {
                bail!("unknown status: {raw}");
            }
            let outcome = ctx.tasks.set_status(id, status).outcome().await?;
            println!("Task {} is now {}", id, field(&outcome.state, "status"));
        }
        Command::Delegate { id, user } => {
            require_session(ctx)?;
            ctx.tasks.delegate(id, user).outcome().await?;
            match user {
                Some(user) => println!("Task {id} delegated to user {user}"),
                None => println!("Delegation withdrawn for task {id}"),
            }
        }
        Command::Edit {
            id,
            title,
            description,
            priority,
            due,
        } => {
            require_session(ctx)?;
            ctx.tasks.refresh().await?;
            let task = ctx
                .tasks
                .task(id)?
                .with_context(|| format!("task {id} not found"))?;
            let mut form = TaskForm::from_task(&task);
            if let Some(title) = title {
                form.title = title;
            }
            if let Some(description) = description {
                form.description = description;
            }
            if let Some(priority) = priority {
                let priority = Priority::from(priority);
                if let Priority::Other(raw) = &priority {
                    bail!("unknown priority: {raw}");
                }
                form.priority = Some(priority);
            }
            if due.is_some() {
                form.due_date = due;
            }
            ctx.tasks.edit_task(id, form)?.outcome().await?;
            println!("Task {id} saved");
        }
        Command::Delete { id } => {
            require_session(ctx)?;
            ctx.tasks.delete_task(id).await?;
            println!("Task {id} deleted");
        }
        Command::Dashboard => {
            require_session(ctx)?;
            ctx.tasks.refresh().await?;
            let today = Utc::now().date_naive();
            println!("{}", format_summary(&ctx.tasks.summary(today)?));
            for item in ctx.tasks.upcoming(today)? {
                println!("{:>2}d {}", item.due_in_days, format_task(&item.task));
            }
        }
        Command::Attach { id, path } => {
            require_session(ctx)?;
            let attachment = ctx.tasks.attach_file(id, &path).await?;
            println!("Attached {} to task {id} (#{})", attachment.file_name(), attachment.id);
        }
        Command::Detach { task, attachment } => {
            require_session(ctx)?;
            ctx.tasks.remove_attachment(task, attachment).await?;
            println!("Attachment {attachment} removed from task {task}");
        }
        Command::Users => {
            require_session(ctx)?;
            ctx.users.refresh().await?;
            for user in ctx.users.users()? {
                println!("{}", format_user(&user));
            }
        }
        Command::Notifications { watch } => {
            require_session(ctx)?;
            ctx.notifications.poll_once().await;
            for item in ctx.notifications.items() {
                println!("{}", format_notification(&item));
            }
            if watch {
                let mut unread = ctx.notifications.subscribe_unread();
                let mut auth = ctx.session.subscribe();
                let poller = ctx.notifications.spawn_poller(poll_interval);
                println!("{} unread", *unread.borrow_and_update());
                loop {
                    tokio::select! {
                        changed = unread.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            println!("{} unread", *unread.borrow_and_update());
                        }
                        changed = auth.changed() => {
                            if changed.is_err() || *auth.borrow() == AuthState::SignedOut {
                                println!("Session ended.");
                                break;
                            }
                        }
                    }
                }
                poller.join().await;
            }
        }
        Command::MarkRead { id } => {
            require_session(ctx)?;
            ctx.notifications.mark_read(id).await;
            println!("Notification {id} marked read");
        }
    }
    Ok(())
}

fn require_session(ctx: &AppContext) -> Result<()> {
    if !ctx.session.is_authenticated() {
        bail!("not logged in; run `login` first");
    }
    Ok(())
}

fn field(state: &Option<serde_json::Value>, name: &str) -> String {
    state
        .as_ref()
        .and_then(|v| v.get(name))
        .and_then(|v| v.as_str())
        .unwrap_or("?")
        .to_string()
}

fn format_task(task: &Task) -> String {
    let due = task
        .due_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".into());
    let overdue = if task.is_overdue(Utc::now().date_naive()) {
        " [vencida]"
    } else {
        ""
    };
    let assignee = task
        .assigned_to
        .as_ref()
        .map(|u| u.username.as_str())
        .unwrap_or("-");
    let priority = task
        .priority
        .as_ref()
        .map(Priority::as_str)
        .unwrap_or("-");
    let clips = if task.attachments.is_empty() {
        String::new()
    } else {
        format!(" ({} adj.)", task.attachments.len())
    };
    format!(
        "#{:<5} {:<12} {:<10} {:<6} @{}{} {}{}",
        task.id,
        task.status.as_str(),
        due,
        priority,
        assignee,
        overdue,
        task.title,
        clips
    )
}

fn format_summary(summary: &DashboardSummary) -> String {
    let by_priority: Vec<String> = summary
        .by_priority
        .iter()
        .map(|(priority, count)| format!("{priority}={count}"))
        .collect();
    format!(
        "total {} | completadas {} | vencidas {} | activas {} | próximas {} | {}",
        summary.total,
        summary.completed,
        summary.overdue,
        summary.active,
        summary.upcoming,
        by_priority.join(" ")
    )
}

fn format_user(user: &User) -> String {
    let role = user
        .role_display
        .clone()
        .or_else(|| user.role.as_ref().map(|r| r.to_string()))
        .unwrap_or_else(|| "-".into());
    format!(
        "#{:<5} {:<16} {:<24} {:<10}{}",
        user.id,
        user.username,
        user.email.as_deref().unwrap_or("-"),
        role,
        if user.is_active { "" } else { " [inactivo]" }
    )
}

fn format_notification(item: &NotificationItem) -> String {
    let marker = if item.is_read { " " } else { "*" };
    format!(
        "{} {:<6} {} [{}] {}",
        marker,
        item.id,
        item.created_at.format("%Y-%m-%d %H:%M"),
        item.kind,
        item.message
    )
}
