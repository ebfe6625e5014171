/// Project board: six date buckets of tasks, and the page of one task.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::paths::{self, ProjectRef};
use crate::store::{StoreError, TreeStore};
use crate::sync::{move_between, CollectionSync, MoveOutcome, SyncError, SyncRegistry};
use crate::types::{
    BoardStats, Bucket, Item, Payload, Principal, Priority, SectionKind, SectionPayload,
    TableError, TableGrid, TaskPayload, TodoPayload,
};
use crate::validate;

/// Hand sessions back to `registry` from a context that cannot await.
fn release_detached<S: TreeStore, T: Payload>(
    registry: &Arc<SyncRegistry<S, T>>,
    paths: Vec<String>,
) {
    if paths.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let registry = registry.clone();
            handle.spawn(async move {
                for path in paths {
                    registry.release(&path).await;
                }
            });
        }
        Err(_) => log::warn!(
            "[teamboard.board.drop] No runtime to release {} sessions",
            paths.len()
        ),
    }
}

/// Live view of a project's tasks, one shared session per bucket.
///
/// `close` releases the bucket sessions. A board dropped without it releases
/// them from a spawned task on the current runtime.
pub struct TaskBoard<S: TreeStore> {
    project: ProjectRef,
    registry: Arc<SyncRegistry<S, TaskPayload>>,
    /// Indexed like `Bucket::ALL`
    buckets: Vec<Arc<CollectionSync<S, TaskPayload>>>,
    released: bool,
}

impl<S: TreeStore> TaskBoard<S> {
    pub async fn open(
        registry: Arc<SyncRegistry<S, TaskPayload>>,
        project: ProjectRef,
    ) -> Result<Self, SyncError> {
        let mut buckets = Vec::with_capacity(Bucket::ALL.len());
        for bucket in Bucket::ALL {
            match registry.acquire(&project.bucket(bucket)).await {
                Ok(sync) => buckets.push(sync),
                Err(e) => {
                    for opened in &Bucket::ALL[..buckets.len()] {
                        registry.release(&project.bucket(*opened)).await;
                    }
                    return Err(e);
                }
            }
        }
        log::info!("[teamboard.board.open] {}", project.path());
        Ok(Self {
            project,
            registry,
            buckets,
            released: false,
        })
    }

    pub fn project(&self) -> &ProjectRef {
        &self.project
    }

    pub fn bucket(&self, bucket: Bucket) -> &Arc<CollectionSync<S, TaskPayload>> {
        &self.buckets[bucket as usize]
    }

    pub fn tasks(&self, bucket: Bucket) -> Vec<Item<TaskPayload>> {
        self.bucket(bucket).items()
    }

    /// Bucket and position of the task called `name`.
    pub fn find(&self, name: &str) -> Option<(Bucket, usize)> {
        Bucket::ALL
            .into_iter()
            .find_map(|bucket| self.bucket(bucket).position(name).map(|i| (bucket, i)))
    }

    /// Append a task to `bucket`. Names are unique across the whole board so
    /// that any task can later move to any bucket.
    pub async fn create_task(
        &self,
        bucket: Bucket,
        name: &str,
        priority: Priority,
        creator: &Principal,
    ) -> Result<Item<TaskPayload>, SyncError> {
        let name = validate::validate_name(name)?;
        if let Some((existing, _)) = self.find(&name) {
            return Err(SyncError::AlreadyExists(self.project.task(existing, &name)));
        }
        self.bucket(bucket)
            .create_with_id(name, TaskPayload::new(priority, creator))
            .await
    }

    /// Same-bucket reorder or cross-bucket relocation.
    pub async fn move_task(
        &self,
        source: Bucket,
        target: Bucket,
        from: usize,
        to: usize,
    ) -> Result<MoveOutcome, SyncError> {
        if source == target {
            return self.bucket(source).move_item(from, to).await;
        }
        move_between(self.bucket(source), self.bucket(target), from, to).await?;
        Ok(MoveOutcome::Moved)
    }

    /// Delete a task with its sections and todos.
    pub async fn delete_task(
        &self,
        bucket: Bucket,
        index: usize,
    ) -> Result<Item<TaskPayload>, SyncError> {
        self.bucket(bucket).delete(index).await
    }

    pub async fn set_priority(
        &self,
        bucket: Bucket,
        index: usize,
        priority: Priority,
    ) -> Result<Item<TaskPayload>, SyncError> {
        self.bucket(bucket)
            .update_item(index, |task| {
                task.priority = priority;
                Ok(())
            })
            .await
    }

    /// Counts from the displayed buckets.
    pub fn stats(&self) -> BoardStats {
        BoardStats::from_counts(
            Bucket::ALL
                .into_iter()
                .map(|bucket| (bucket, self.bucket(bucket).len())),
        )
    }

    /// Counts from one point read, without opening the board.
    pub async fn fetch_stats(store: &S, project: &ProjectRef) -> Result<BoardStats, StoreError> {
        let tasks = store.get(&project.tasks()).await?;
        Ok(BoardStats::from_tasks_value(&tasks))
    }

    /// Release this board's hold on the bucket sessions.
    pub async fn close(mut self) {
        for bucket in Bucket::ALL {
            self.registry.release(&self.project.bucket(bucket)).await;
        }
        self.released = true;
        log::info!("[teamboard.board.close] {}", self.project.path());
    }
}

impl<S: TreeStore> Drop for TaskBoard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let paths = Bucket::ALL
            .into_iter()
            .map(|bucket| self.project.bucket(bucket))
            .collect();
        release_detached(&self.registry, paths);
    }
}

/// Sessions shared by every open task page.
pub struct PageRegistries<S: TreeStore> {
    pub sections: Arc<SyncRegistry<S, SectionPayload>>,
    pub todos: Arc<SyncRegistry<S, TodoPayload>>,
}

impl<S: TreeStore> PageRegistries<S> {
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        Self {
            sections: Arc::new(SyncRegistry::new(store.clone(), config.clone())),
            todos: Arc::new(SyncRegistry::new(store, config)),
        }
    }
}

impl<S: TreeStore> Clone for PageRegistries<S> {
    fn clone(&self) -> Self {
        Self {
            sections: self.sections.clone(),
            todos: self.todos.clone(),
        }
    }
}

/// Sections of one task, plus the todo lists of its todo sections. Pages on
/// the same task share their sessions through `PageRegistries`.
pub struct TaskPage<S: TreeStore> {
    project: ProjectRef,
    bucket: Bucket,
    task: String,
    sections: Arc<CollectionSync<S, SectionPayload>>,
    registries: PageRegistries<S>,
    /// section id -> todo list acquired by this page
    todo_lists: Mutex<HashMap<String, Arc<CollectionSync<S, TodoPayload>>>>,
    released: bool,
}

impl<S: TreeStore> TaskPage<S> {
    pub async fn open(
        registries: PageRegistries<S>,
        project: ProjectRef,
        bucket: Bucket,
        task: &str,
    ) -> Result<Self, SyncError> {
        let sections = registries
            .sections
            .acquire(&project.sections(bucket, task))
            .await?;
        Ok(Self {
            project,
            bucket,
            task: task.to_string(),
            sections,
            registries,
            todo_lists: Mutex::new(HashMap::new()),
            released: false,
        })
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn sections(&self) -> Vec<Item<SectionPayload>> {
        self.sections.items()
    }

    pub fn section_sync(&self) -> &Arc<CollectionSync<S, SectionPayload>> {
        &self.sections
    }

    /// Append an empty section. Tables start with the configured size.
    pub async fn add_section(&self, kind: SectionKind) -> Result<Item<SectionPayload>, SyncError> {
        let config = self.sections.config();
        let payload = SectionPayload::empty(kind, config.table_rows, config.table_cols);
        self.sections.create(payload).await
    }

    pub async fn move_section(&self, from: usize, to: usize) -> Result<MoveOutcome, SyncError> {
        self.sections.move_item(from, to).await
    }

    /// Delete a section and, for todo sections, every todo below it.
    pub async fn delete_section(&self, index: usize) -> Result<Item<SectionPayload>, SyncError> {
        let removed = self.sections.delete(index).await?;
        if self.todo_lists.lock().await.remove(&removed.id).is_some() {
            self.registries
                .todos
                .release(&self.todos_path(&removed.id))
                .await;
        }
        Ok(removed)
    }

    pub async fn set_content(
        &self,
        index: usize,
        content: &str,
    ) -> Result<Item<SectionPayload>, SyncError> {
        let content = content.to_string();
        self.sections
            .update_item(index, move |section| {
                section.set_content(&content);
                Ok(())
            })
            .await
    }

    pub async fn set_cell(
        &self,
        index: usize,
        row: usize,
        col: usize,
        value: &str,
    ) -> Result<Item<SectionPayload>, SyncError> {
        let value = value.to_string();
        self.edit_table(index, move |table| table.set_cell(row, col, &value))
            .await
    }

    pub async fn insert_row_after(
        &self,
        index: usize,
        row: usize,
    ) -> Result<Item<SectionPayload>, SyncError> {
        self.edit_table(index, move |table| table.insert_row_after(row))
            .await
    }

    pub async fn insert_column_after(
        &self,
        index: usize,
        col: usize,
    ) -> Result<Item<SectionPayload>, SyncError> {
        self.edit_table(index, move |table| table.insert_column_after(col))
            .await
    }

    pub async fn delete_row(
        &self,
        index: usize,
        row: usize,
    ) -> Result<Item<SectionPayload>, SyncError> {
        self.edit_table(index, move |table| table.delete_row(row))
            .await
    }

    pub async fn delete_column(
        &self,
        index: usize,
        col: usize,
    ) -> Result<Item<SectionPayload>, SyncError> {
        self.edit_table(index, move |table| table.delete_column(col))
            .await
    }

    async fn edit_table<F>(&self, index: usize, edit: F) -> Result<Item<SectionPayload>, SyncError>
    where
        F: FnOnce(&mut TableGrid) -> Result<(), TableError> + Send,
    {
        self.sections
            .update_item(index, |section| Ok(edit(section.table_mut()?)?))
            .await
    }

    fn todos_path(&self, section: &str) -> String {
        self.project.todos(self.bucket, &self.task, section)
    }

    /// Todo list of `section`, subscribed on first use.
    pub async fn todos(
        &self,
        section: &str,
    ) -> Result<Arc<CollectionSync<S, TodoPayload>>, SyncError> {
        let mut lists = self.todo_lists.lock().await;
        if let Some(list) = lists.get(section) {
            return Ok(list.clone());
        }
        if self.sections.position(section).is_none() {
            return Err(SyncError::ItemVanished(paths::join(
                self.sections.path(),
                section,
            )));
        }
        let list = self
            .registries
            .todos
            .acquire(&self.todos_path(section))
            .await?;
        lists.insert(section.to_string(), list.clone());
        Ok(list)
    }

    /// Append a todo. Blank text is rejected before anything is opened or
    /// written.
    pub async fn add_todo(&self, section: &str, text: &str) -> Result<Item<TodoPayload>, SyncError> {
        let text = validate::validate_text(text)?;
        let payload = TodoPayload {
            text: text.trim().to_string(),
            completed: false,
        };
        self.todos(section).await?.create(payload).await
    }

    pub async fn toggle_todo(
        &self,
        section: &str,
        index: usize,
    ) -> Result<Item<TodoPayload>, SyncError> {
        self.todos(section)
            .await?
            .update_item(index, |todo| {
                todo.completed = !todo.completed;
                Ok(())
            })
            .await
    }

    pub async fn delete_todo(
        &self,
        section: &str,
        index: usize,
    ) -> Result<Item<TodoPayload>, SyncError> {
        self.todos(section).await?.delete(index).await
    }

    pub async fn move_todo(
        &self,
        section: &str,
        from: usize,
        to: usize,
    ) -> Result<MoveOutcome, SyncError> {
        self.todos(section).await?.move_item(from, to).await
    }

    /// Release the todo lists and the sections session.
    pub async fn close(mut self) {
        let lists: Vec<String> = self.todo_lists.lock().await.drain().map(|(id, _)| id).collect();
        for section in lists {
            self.registries
                .todos
                .release(&self.todos_path(&section))
                .await;
        }
        self.registries.sections.release(self.sections.path()).await;
        self.released = true;
    }
}

impl<S: TreeStore> Drop for TaskPage<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let sections: Vec<String> = self.todo_lists.get_mut().drain().map(|(id, _)| id).collect();
        let lists = sections
            .iter()
            .map(|section| self.todos_path(section))
            .collect();
        release_detached(&self.registries.todos, lists);
        release_detached(
            &self.registries.sections,
            vec![self.sections.path().to_string()],
        );
    }
}
