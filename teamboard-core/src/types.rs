use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field that carries an item's rank inside its stored object.
pub const ORDER_FIELD: &str = "order";

/// Bounds shared by every payload that can live in an ordered collection.
pub trait Payload:
    Serialize + DeserializeOwned + Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
}

impl<T> Payload for T where
    T: Serialize + DeserializeOwned + Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
}

/// A ranked entry of an ordered collection.
/// `id` is the key under the collection path, `order` the ascending sort rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item<T> {
    pub id: String,
    pub order: u64,
    pub payload: T,
}

impl<T: Payload> Item<T> {
    pub fn new(id: impl Into<String>, order: u64, payload: T) -> Self {
        Self {
            id: id.into(),
            order,
            payload,
        }
    }

    /// Serialize the payload fields. Non-object payloads cannot be stored
    /// next to an `order` field and are rejected.
    pub fn payload_fields(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(&self.payload)? {
            Value::Object(mut fields) => {
                fields.remove(ORDER_FIELD);
                Ok(fields)
            }
            other => Err(serde::ser::Error::custom(format!(
                "payload of {} must serialize to an object, got {}",
                self.id, other
            ))),
        }
    }

    /// Stored representation: payload fields plus `order`.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut fields = self.payload_fields()?;
        fields.insert(ORDER_FIELD.to_string(), Value::from(self.order));
        Ok(Value::Object(fields))
    }
}

/// Date partitions of a project's task collection, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Overdue,
    Today,
    Tomorrow,
    ThisWeek,
    NextWeek,
    Later,
}

impl Bucket {
    pub const ALL: [Bucket; 6] = [
        Bucket::Overdue,
        Bucket::Today,
        Bucket::Tomorrow,
        Bucket::ThisWeek,
        Bucket::NextWeek,
        Bucket::Later,
    ];

    /// Key used for the bucket in store paths.
    pub fn label(self) -> &'static str {
        match self {
            Bucket::Overdue => "Overdue",
            Bucket::Today => "Today",
            Bucket::Tomorrow => "Tomorrow",
            Bucket::ThisWeek => "On this week",
            Bucket::NextWeek => "On next week",
            Bucket::Later => "Later",
        }
    }

    pub fn from_label(label: &str) -> Option<Bucket> {
        Bucket::ALL.into_iter().find(|b| b.label() == label)
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Low,
    Medium,
    High,
}

/// Task fields stored next to `order`. Sections live below the task as a
/// separate collection and are not part of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub created_by: String,
}

impl TaskPayload {
    pub fn new(priority: Priority, principal: &Principal) -> Self {
        Self {
            priority,
            created_at: chrono::Utc::now().to_rfc3339(),
            created_by: principal.attribution(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoPayload {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    Todo,
    Table,
}

/// A free-form block of a task page. Todo items of a todo section are a
/// child collection under `todos/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SectionPayload {
    Text {
        #[serde(default)]
        content: String,
    },
    Todo {
        #[serde(default)]
        content: String,
    },
    Table {
        #[serde(default)]
        content: String,
        #[serde(rename = "tableData", default)]
        table: TableGrid,
    },
}

impl SectionPayload {
    pub fn empty(kind: SectionKind, rows: usize, cols: usize) -> Self {
        match kind {
            SectionKind::Text => SectionPayload::Text {
                content: String::new(),
            },
            SectionKind::Todo => SectionPayload::Todo {
                content: String::new(),
            },
            SectionKind::Table => SectionPayload::Table {
                content: String::new(),
                table: TableGrid::new(rows, cols),
            },
        }
    }

    pub fn kind(&self) -> SectionKind {
        match self {
            SectionPayload::Text { .. } => SectionKind::Text,
            SectionPayload::Todo { .. } => SectionKind::Todo,
            SectionPayload::Table { .. } => SectionKind::Table,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            SectionPayload::Text { content }
            | SectionPayload::Todo { content }
            | SectionPayload::Table { content, .. } => content,
        }
    }

    pub fn set_content(&mut self, value: &str) {
        match self {
            SectionPayload::Text { content }
            | SectionPayload::Todo { content }
            | SectionPayload::Table { content, .. } => *content = value.to_string(),
        }
    }

    pub fn table_mut(&mut self) -> Result<&mut TableGrid, TableError> {
        match self {
            SectionPayload::Table { table, .. } => Ok(table),
            _ => Err(TableError::NotATable),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("Cell ({row}, {col}) outside a {rows}x{cols} table")]
    CellOutOfRange {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Row {0} out of range")]
    RowOutOfRange(usize),

    #[error("Column {0} out of range")]
    ColumnOutOfRange(usize),

    #[error("A table keeps at least one row and one column")]
    LastRowOrColumn,

    #[error("Section is not a table")]
    NotATable,
}

/// Rectangular table content, stored as an array of rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableGrid(pub Vec<Vec<String>>);

impl TableGrid {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self(vec![vec![String::new(); cols.max(1)]; rows.max(1)])
    }

    pub fn rows(&self) -> usize {
        self.0.len()
    }

    pub fn cols(&self) -> usize {
        self.0.first().map_or(0, Vec::len)
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.0.get(row)?.get(col).map(String::as_str)
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: &str) -> Result<(), TableError> {
        let (rows, cols) = (self.rows(), self.cols());
        let cell = self
            .0
            .get_mut(row)
            .and_then(|r| r.get_mut(col))
            .ok_or(TableError::CellOutOfRange { row, col, rows, cols })?;
        *cell = value.to_string();
        Ok(())
    }

    /// Insert an empty row below `after`.
    pub fn insert_row_after(&mut self, after: usize) -> Result<(), TableError> {
        if after >= self.rows() {
            return Err(TableError::RowOutOfRange(after));
        }
        let cols = self.cols();
        self.0.insert(after + 1, vec![String::new(); cols]);
        Ok(())
    }

    /// Insert an empty column right of `after`, in every row.
    pub fn insert_column_after(&mut self, after: usize) -> Result<(), TableError> {
        if after >= self.cols() {
            return Err(TableError::ColumnOutOfRange(after));
        }
        for row in &mut self.0 {
            let at = (after + 1).min(row.len());
            row.insert(at, String::new());
        }
        Ok(())
    }

    pub fn delete_row(&mut self, row: usize) -> Result<(), TableError> {
        if row >= self.rows() {
            return Err(TableError::RowOutOfRange(row));
        }
        if self.rows() == 1 {
            return Err(TableError::LastRowOrColumn);
        }
        self.0.remove(row);
        Ok(())
    }

    pub fn delete_column(&mut self, col: usize) -> Result<(), TableError> {
        if col >= self.cols() {
            return Err(TableError::ColumnOutOfRange(col));
        }
        if self.cols() == 1 {
            return Err(TableError::LastRowOrColumn);
        }
        for row in &mut self.0 {
            if col < row.len() {
                row.remove(col);
            }
        }
        Ok(())
    }
}

/// The signed-in user as seen by the board. Only used for attribution and
/// membership keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub uid: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Principal {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: None,
            email: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Display name, else email, else uid.
    pub fn attribution(&self) -> String {
        self.display_name
            .iter()
            .chain(self.email.iter())
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| self.uid.clone())
    }
}

/// Task counts shown on a project's statistics panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardStats {
    pub total: usize,
    pub overdue: usize,
    pub today: usize,
    /// Today + Tomorrow + On this week.
    pub this_week: usize,
}

impl BoardStats {
    pub fn from_counts(counts: impl IntoIterator<Item = (Bucket, usize)>) -> Self {
        let mut stats = BoardStats::default();
        let mut tomorrow = 0;
        let mut on_this_week = 0;
        for (bucket, count) in counts {
            stats.total += count;
            match bucket {
                Bucket::Overdue => stats.overdue += count,
                Bucket::Today => stats.today += count,
                Bucket::Tomorrow => tomorrow += count,
                Bucket::ThisWeek => on_this_week += count,
                Bucket::NextWeek | Bucket::Later => {}
            }
        }
        stats.this_week = stats.today + tomorrow + on_this_week;
        stats
    }

    /// Count tasks from the raw `tasks` subtree of a project. Keys that are
    /// not known buckets still count towards the total.
    pub fn from_tasks_value(tasks: &Value) -> Self {
        let Some(buckets) = tasks.as_object() else {
            return BoardStats::default();
        };
        let mut extra = 0;
        let mut counts = Vec::new();
        for (label, entries) in buckets {
            let count = match entries {
                Value::Object(map) => map.len(),
                Value::Array(list) => list.iter().filter(|v| !v.is_null()).count(),
                _ => 0,
            };
            match Bucket::from_label(label) {
                Some(bucket) => counts.push((bucket, count)),
                None => extra += count,
            }
        }
        let mut stats = BoardStats::from_counts(counts);
        stats.total += extra;
        stats
    }
}
