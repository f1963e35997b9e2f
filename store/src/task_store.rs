//! Directory-per-status task persistence.
//!
//! Layout, per project root:
//!
//! ```text
//! <root>/tasks/<status>/<id>.md        task file (frontmatter + body)
//! <root>/tasks/<status>/<id>/inputs/   optional companion inputs
//! <root>/tasks/<status>/<id>/outputs/  optional companion outputs
//! <root>/events/events.<date>.jsonl    event journal (see event_log)
//! ```
//!
//! Every write goes through a write-then-rename sequence so readers never
//! observe partially written frontmatter; a transition updates the file in
//! place and then moves it (and its companion directory) with single renames
//! inside the same tasks root. Mutations are serialized behind one async
//! lock per store instance; readers tolerate the rename window by retrying
//! a not-found open once after a short backoff.

use aof_core::{
    is_valid_task_id, new_task_id, subtask_id, AofError, NewTask, Result, Task, TaskPatch,
    TaskStatus, TaskValidator, SCHEMA_VERSION,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::frontmatter;

const READ_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(25);

/// Context recorded with a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionCtx {
    /// Why the transition happened (block reason, cancel reason, ...)
    pub reason: Option<String>,
    /// Acting agent, when one drove the transition
    pub agent: Option<String>,
}

impl TransitionCtx {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            agent: None,
        }
    }
}

/// One diagnostic from [`TaskStore::lint`]
#[derive(Debug, Clone)]
pub struct LintIssue {
    pub path: PathBuf,
    pub task_id: Option<String>,
    pub message: String,
}

/// A named file from a task's companion `inputs/` or `outputs/` tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskArtifact {
    pub name: String,
    pub data: Vec<u8>,
}

/// Filesystem-backed task store for one project root.
pub struct TaskStore {
    root: PathBuf,
    mutation: Mutex<()>,
}

impl TaskStore {
    /// Open the store, idempotently creating every status directory and the
    /// events directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for status in TaskStatus::all() {
            tokio::fs::create_dir_all(root.join("tasks").join(status.dir_name())).await?;
        }
        tokio::fs::create_dir_all(root.join("events")).await?;
        Ok(Self {
            root,
            mutation: Mutex::new(()),
        })
    }

    /// Project root this store owns
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical file path for a task in a given status
    pub fn task_path(&self, status: TaskStatus, id: &str) -> PathBuf {
        self.root
            .join("tasks")
            .join(status.dir_name())
            .join(format!("{id}.md"))
    }

    /// Companion directory path for a task in a given status
    pub fn companion_dir(&self, status: TaskStatus, id: &str) -> PathBuf {
        self.root.join("tasks").join(status.dir_name()).join(id)
    }

    /// Task file path relative to the project root
    pub fn task_relpath(&self, task: &Task) -> String {
        format!("tasks/{}/{}.md", task.status.dir_name(), task.id)
    }

    /// Create a task in `backlog`. An id is generated from today's date (or
    /// the parent id for subtasks) when none is supplied.
    pub async fn create(&self, new_task: NewTask) -> Result<Task> {
        TaskValidator::validate_new_task(&new_task)?;
        let _guard = self.mutation.lock().await;

        let existing_ids: Vec<String> = self.scan_ids().await?;
        let id = match new_task.id {
            Some(id) => {
                if existing_ids.iter().any(|e| *e == id) {
                    return Err(AofError::Validation(format!(
                        "Task id '{id}' already exists"
                    )));
                }
                id
            }
            None => next_id(&existing_ids, new_task.parent_id.as_deref()),
        };

        let now = Utc::now();
        let content_hash = hash_body(&new_task.body);
        let task = Task {
            id,
            schema_version: SCHEMA_VERSION,
            project: new_task.project,
            title: new_task.title,
            body: new_task.body,
            status: TaskStatus::Backlog,
            priority: new_task.priority,
            routing: new_task.routing,
            sla: new_task.sla,
            lease: None,
            depends_on: new_task.depends_on,
            parent_id: new_task.parent_id,
            gate: None,
            gate_history: vec![],
            review_context: None,
            tests: new_task.tests,
            resource: new_task.resource,
            required_runbook: None,
            metadata: new_task.metadata,
            created_at: now,
            updated_at: now,
            last_transition_at: now,
            created_by: new_task.created_by,
            content_hash,
        };

        self.write_task(&task).await?;
        tracing::debug!(task_id = %task.id, project = %task.project, "Task created");
        Ok(task)
    }

    /// Read a task by id
    pub async fn get(&self, id: &str) -> Result<Task> {
        let (_, path) = self.locate(id).await?;
        self.read_task_at(&path).await
    }

    /// Read a task by unique id prefix. Ambiguous prefixes are a validation
    /// error naming the candidate count.
    pub async fn get_by_prefix(&self, prefix: &str) -> Result<Task> {
        if prefix.is_empty() {
            return Err(AofError::empty_field("prefix"));
        }
        let ids = self.scan_ids().await?;
        let matches: Vec<&String> = ids.iter().filter(|id| id.starts_with(prefix)).collect();
        match matches.as_slice() {
            [] => Err(AofError::not_found(prefix)),
            [only] => self.get(only).await,
            many => Err(AofError::Validation(format!(
                "Prefix '{prefix}' is ambiguous ({} matches)",
                many.len()
            ))),
        }
    }

    /// Read every task. Files that fail to parse or violate the layout
    /// invariant are skipped with a warning; `lint` reports them.
    pub async fn list(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for status in TaskStatus::all() {
            let dir = self.root.join("tasks").join(status.dir_name());
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !is_task_file(&path) {
                    continue;
                }
                match self.read_task_at(&path).await {
                    Ok(task) if task.status == status => tasks.push(task),
                    Ok(task) => {
                        tracing::warn!(
                            path = %path.display(),
                            frontmatter_status = %task.status,
                            directory = %status,
                            "Skipping task whose status does not match its directory"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable task file");
                    }
                }
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    /// Count task files per status directory
    pub async fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, usize>> {
        let mut counts = BTreeMap::new();
        for status in TaskStatus::all() {
            let dir = self.root.join("tasks").join(status.dir_name());
            let mut entries = tokio::fs::read_dir(&dir).await?;
            let mut count = 0;
            while let Some(entry) = entries.next_entry().await? {
                if is_task_file(&entry.path()) {
                    count += 1;
                }
            }
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Apply a partial update
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        if let Some(sla) = patch.sla.as_ref().and_then(|s| s.as_ref()) {
            TaskValidator::validate_sla(sla)?;
        }
        self.update_with(id, |task| task.apply_patch(patch)).await
    }

    /// Read-modify-write a task in place, without changing its status.
    /// The closure must not touch `status`; use [`Self::transition`] for
    /// status changes so the file moves with it.
    pub async fn update_with(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task> {
        let _guard = self.mutation.lock().await;
        let (status, path) = self.locate(id).await?;
        let mut task = self.read_task_at(&path).await?;
        mutate(&mut task);
        if task.status != status {
            return Err(AofError::Internal(format!(
                "update_with must not change status (task {id})"
            )));
        }
        task.updated_at = Utc::now();
        self.write_task(&task).await?;
        Ok(task)
    }

    /// Transition a task through the status machine.
    ///
    /// Transitioning to the current status is a no-op returning the task
    /// unchanged. Illegal edges fail with no state change. Transitions that
    /// clear ownership also clear the lease; entering `blocked` records the
    /// reason and timestamp in metadata.
    pub async fn transition(
        &self,
        id: &str,
        new_status: TaskStatus,
        ctx: TransitionCtx,
    ) -> Result<Task> {
        self.transition_with(id, new_status, ctx, |_| {}).await
    }

    /// Like [`Self::transition`], additionally applying a mutation inside
    /// the same write (the lease manager grants ownership this way so the
    /// lease and the move to `in-progress` are one durable step).
    pub async fn transition_with(
        &self,
        id: &str,
        new_status: TaskStatus,
        ctx: TransitionCtx,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task> {
        let _guard = self.mutation.lock().await;
        let (old_status, old_path) = self.locate(id).await?;
        let mut task = self.read_task_at(&old_path).await?;

        if task.status == new_status {
            return Ok(task);
        }
        if !task.status.can_transition_to(new_status) {
            return Err(AofError::invalid_transition(task.status, new_status));
        }

        let now = Utc::now();
        task.status = new_status;
        task.updated_at = now;
        task.last_transition_at = now;

        if new_status.clears_lease() {
            task.lease = None;
        }
        match new_status {
            TaskStatus::Blocked => {
                if let Some(reason) = ctx.reason.as_deref() {
                    task.set_block_reason(Some(reason));
                }
                task.set_last_blocked_at(now);
            }
            TaskStatus::Ready if old_status == TaskStatus::Blocked => {
                task.set_block_reason(None);
            }
            TaskStatus::Cancelled => {
                if let Some(reason) = ctx.reason.as_deref() {
                    task.metadata.insert(
                        "cancelReason".to_string(),
                        serde_json::Value::String(reason.to_string()),
                    );
                }
            }
            TaskStatus::Deadletter => {
                if let Some(reason) = ctx.reason.as_deref() {
                    task.metadata.insert(
                        "deadletterReason".to_string(),
                        serde_json::Value::String(reason.to_string()),
                    );
                }
            }
            _ => {}
        }

        mutate(&mut task);
        if task.status != new_status {
            return Err(AofError::Internal(format!(
                "transition mutator must not change status (task {id})"
            )));
        }
        validate_for_write(&task)?;

        // Update in place first (atomic), then move with a single rename
        let rendered = frontmatter::render(&task)?;
        write_atomic(&old_path, rendered.as_bytes()).await?;
        let new_path = self.task_path(new_status, id);
        tokio::fs::rename(&old_path, &new_path).await?;

        let old_companion = self.companion_dir(old_status, id);
        if tokio::fs::try_exists(&old_companion).await.unwrap_or(false) {
            let new_companion = self.companion_dir(new_status, id);
            tokio::fs::rename(&old_companion, &new_companion).await?;
        }

        tracing::debug!(
            task_id = %id,
            from = %old_status,
            to = %new_status,
            agent = ctx.agent.as_deref().unwrap_or(""),
            "Task transitioned"
        );
        Ok(task)
    }

    /// Block a task with a reason
    pub async fn block(&self, id: &str, reason: &str) -> Result<Task> {
        self.transition(id, TaskStatus::Blocked, TransitionCtx::with_reason(reason))
            .await
    }

    /// Return a blocked task to `ready`, clearing the block reason
    pub async fn unblock(&self, id: &str) -> Result<Task> {
        self.transition(id, TaskStatus::Ready, TransitionCtx::default())
            .await
    }

    /// Cancel a task with a reason
    pub async fn cancel(&self, id: &str, reason: &str) -> Result<Task> {
        self.transition(id, TaskStatus::Cancelled, TransitionCtx::with_reason(reason))
            .await
    }

    /// Remove a task file and its companion directory
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let (status, path) = self.locate(id).await?;
        tokio::fs::remove_file(&path).await?;
        let companion = self.companion_dir(status, id);
        if tokio::fs::try_exists(&companion).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&companion).await?;
        }
        tracing::debug!(task_id = %id, "Task deleted");
        Ok(())
    }

    /// Scan every task file and report schema and invariant violations
    /// without repairing anything.
    pub async fn lint(&self) -> Result<Vec<LintIssue>> {
        let mut issues = Vec::new();
        for status in TaskStatus::all() {
            let dir = self.root.join("tasks").join(status.dir_name());
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !is_task_file(&path) {
                    continue;
                }
                let text = match tokio::fs::read_to_string(&path).await {
                    Ok(text) => text,
                    Err(e) => {
                        issues.push(LintIssue {
                            path,
                            task_id: None,
                            message: format!("unreadable: {e}"),
                        });
                        continue;
                    }
                };
                let task = match frontmatter::parse(&text) {
                    Ok(task) => task,
                    Err(e) => {
                        issues.push(LintIssue {
                            path,
                            task_id: None,
                            message: format!("frontmatter: {e}"),
                        });
                        continue;
                    }
                };

                if !is_valid_task_id(&task.id) {
                    issues.push(issue(&path, &task, "invalid task id"));
                }
                if task.status != status {
                    issues.push(issue(
                        &path,
                        &task,
                        &format!(
                            "status '{}' does not match directory '{}'",
                            task.status, status
                        ),
                    ));
                }
                if task.status.requires_lease() && task.lease.is_none() {
                    issues.push(issue(&path, &task, "in-progress without a lease"));
                }
                if !task.status.may_hold_lease() && task.lease.is_some() {
                    issues.push(issue(
                        &path,
                        &task,
                        &format!("status '{}' must not hold a lease", task.status),
                    ));
                }
                if task.project.trim().is_empty() {
                    issues.push(issue(&path, &task, "missing project"));
                }
                for dep in &task.depends_on {
                    if !is_valid_task_id(dep) {
                        issues.push(issue(&path, &task, &format!("invalid dependency id '{dep}'")));
                    }
                }
            }
        }
        Ok(issues)
    }

    /// Replace the markdown body, refreshing the content hash
    pub async fn update_body(&self, id: &str, body: &str) -> Result<Task> {
        self.update_with(id, |task| {
            task.body = body.to_string();
            task.content_hash = hash_body(&task.body);
        })
        .await
    }

    /// Write one named file into the task's companion `outputs/` tree
    pub async fn write_task_output(&self, id: &str, name: &str, data: &[u8]) -> Result<PathBuf> {
        validate_artifact_name(name)?;
        let _guard = self.mutation.lock().await;
        let (status, _) = self.locate(id).await?;
        let dir = self.companion_dir(status, id).join("outputs");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        write_atomic(&path, data).await?;
        Ok(path)
    }

    /// Read the task's companion `inputs/` files, sorted by name
    pub async fn get_task_inputs(&self, id: &str) -> Result<Vec<TaskArtifact>> {
        self.read_artifacts(id, "inputs").await
    }

    /// Read the task's companion `outputs/` files, sorted by name
    pub async fn get_task_outputs(&self, id: &str) -> Result<Vec<TaskArtifact>> {
        self.read_artifacts(id, "outputs").await
    }

    /// Add a dependency edge
    pub async fn add_dep(&self, id: &str, dep: &str) -> Result<Task> {
        TaskValidator::validate_task_id(dep)?;
        if id == dep {
            return Err(AofError::Validation(format!(
                "Task '{id}' cannot depend on itself"
            )));
        }
        self.update_with(id, |task| {
            if !task.depends_on.iter().any(|d| d == dep) {
                task.depends_on.push(dep.to_string());
            }
        })
        .await
    }

    /// Remove a dependency edge
    pub async fn remove_dep(&self, id: &str, dep: &str) -> Result<Task> {
        self.update_with(id, |task| {
            task.depends_on.retain(|d| d != dep);
        })
        .await
    }

    async fn read_artifacts(&self, id: &str, kind: &str) -> Result<Vec<TaskArtifact>> {
        let (status, _) = self.locate(id).await?;
        let dir = self.companion_dir(status, id).join(kind);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(vec![]);
        }
        let mut artifacts = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let data = tokio::fs::read(&path).await?;
            artifacts.push(TaskArtifact { name, data });
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }

    /// Find the status directory currently holding the task. Retries once
    /// after a short backoff to tolerate a concurrent move.
    async fn locate(&self, id: &str) -> Result<(TaskStatus, PathBuf)> {
        for attempt in 0..2 {
            for status in TaskStatus::all() {
                let path = self.task_path(status, id);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Ok((status, path));
                }
            }
            if attempt == 0 {
                tokio::time::sleep(READ_RETRY_BACKOFF).await;
            }
        }
        Err(AofError::not_found(id))
    }

    /// Read and parse one task file, retrying a not-found open once
    async fn read_task_at(&self, path: &Path) -> Result<Task> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::time::sleep(READ_RETRY_BACKOFF).await;
                tokio::fs::read_to_string(path).await?
            }
            Err(e) => return Err(e.into()),
        };
        frontmatter::parse(&text)
    }

    async fn write_task(&self, task: &Task) -> Result<()> {
        validate_for_write(task)?;
        let rendered = frontmatter::render(task)?;
        let path = self.task_path(task.status, &task.id);
        write_atomic(&path, rendered.as_bytes()).await
    }

    async fn scan_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for status in TaskStatus::all() {
            let dir = self.root.join("tasks").join(status.dir_name());
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if let Some(id) = task_id_from_path(&path) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

/// Reassert the write-time invariants; failure aborts without mutation
fn validate_for_write(task: &Task) -> Result<()> {
    if !is_valid_task_id(&task.id) {
        return Err(AofError::Validation(format!(
            "Invalid task id format: '{}'",
            task.id
        )));
    }
    if task.project.trim().is_empty() {
        return Err(AofError::empty_field("project"));
    }
    if task.status.requires_lease() && task.lease.is_none() {
        return Err(AofError::Validation(format!(
            "Task '{}' cannot be {} without a lease",
            task.id, task.status
        )));
    }
    if !task.status.may_hold_lease() && task.lease.is_some() {
        return Err(AofError::Validation(format!(
            "Task '{}' must not hold a lease in status {}",
            task.id, task.status
        )));
    }
    Ok(())
}

/// Write-then-rename within the destination directory
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AofError::Internal(format!("no parent dir for {}", path.display())))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| AofError::Internal(format!("no file name in {}", path.display())))?
        .to_string_lossy();
    let tmp = dir.join(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn is_task_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.') && name.ends_with(".md")
}

fn task_id_from_path(path: &Path) -> Option<String> {
    if !is_task_file(path) {
        return None;
    }
    path.file_stem().map(|s| s.to_string_lossy().to_string())
}

fn validate_artifact_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AofError::empty_field("name"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(AofError::Validation(format!(
            "Artifact name '{name}' must be a plain file name"
        )));
    }
    Ok(())
}

fn hash_body(body: &str) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

/// Next free id: date-sequenced for top-level tasks, parent-sequenced for
/// subtasks.
fn next_id(existing: &[String], parent: Option<&str>) -> String {
    match parent {
        Some(parent) => {
            let prefix = format!("{parent}-");
            let max = existing
                .iter()
                .filter_map(|id| id.strip_prefix(&prefix))
                .filter_map(|suffix| suffix.parse::<u32>().ok())
                .max()
                .unwrap_or(0);
            subtask_id(parent, max + 1)
        }
        None => {
            let today = Utc::now().date_naive();
            let prefix = format!("TASK-{}-", today.format("%Y-%m-%d"));
            let max = existing
                .iter()
                .filter_map(|id| id.strip_prefix(&prefix))
                // Ignore subtask ids, which carry an extra -NN segment
                .filter(|rest| rest.len() == 3)
                .filter_map(|rest| rest.parse::<u32>().ok())
                .max()
                .unwrap_or(0);
            new_task_id(today, max + 1)
        }
    }
}

fn issue(path: &Path, task: &Task, message: &str) -> LintIssue {
    LintIssue {
        path: path.to_path_buf(),
        task_id: Some(task.id.clone()),
        message: message.to_string(),
    }
}
