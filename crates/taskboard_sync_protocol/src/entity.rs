//! Tasks, lanes, and the patches that change them.

use crate::error::ValidationError;
use crate::ids::{EntityId, UserId, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Maximum task title length in characters.
pub const MAX_TASK_TITLE_LEN: usize = 200;
/// Maximum lane title length in characters.
pub const MAX_LANE_TITLE_LEN: usize = 100;
/// Maximum task description length in characters.
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

/// Kind of a synchronized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A task.
    Task,
    /// A kanban lane.
    Lane,
}

/// Workflow status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not started.
    #[serde(rename = "todo")]
    Todo,
    /// Being worked on.
    #[serde(rename = "in progress")]
    InProgress,
    /// Finished.
    #[serde(rename = "done")]
    Done,
}

impl TaskStatus {
    /// Parses the wire name of a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(TaskStatus::Todo),
            "in progress" => Some(TaskStatus::InProgress),
            "done" => Some(TaskStatus::Done),
            _ => None,
        }
    }
}

/// Priority of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (default).
    #[default]
    Low,
    /// Medium priority.
    Medium,
    /// High priority.
    High,
}

impl Priority {
    /// Parses the wire name of a priority.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

/// Fields of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFields {
    /// Title shown in lists and cards.
    pub title: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Workflow status.
    pub status: TaskStatus,
    /// Priority.
    pub priority: Priority,
    /// Due date as `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    /// Assignee.
    #[serde(default)]
    pub assigned_to: Option<UserId>,
    /// Creator. Set on create and never patched.
    pub created_by: UserId,
    /// Kanban lane holding this task.
    #[serde(default)]
    pub lane_id: Option<EntityId>,
    /// Ordering key inside its lane or list.
    #[serde(default)]
    pub position: u32,
}

/// Fields of a kanban lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneFields {
    /// Lane title.
    pub title: String,
    /// Ordering key on the board.
    #[serde(default)]
    pub position: u32,
}

/// The payload of an entity, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntityFields {
    /// Task payload.
    Task(TaskFields),
    /// Lane payload.
    Lane(LaneFields),
}

impl EntityFields {
    /// Returns the entity kind.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityFields::Task(_) => EntityKind::Task,
            EntityFields::Lane(_) => EntityKind::Lane,
        }
    }

    /// Returns the task payload, if this is a task.
    pub fn as_task(&self) -> Option<&TaskFields> {
        match self {
            EntityFields::Task(task) => Some(task),
            EntityFields::Lane(_) => None,
        }
    }

    /// Returns the lane payload, if this is a lane.
    pub fn as_lane(&self) -> Option<&LaneFields> {
        match self {
            EntityFields::Lane(lane) => Some(lane),
            EntityFields::Task(_) => None,
        }
    }

    /// Builds the payload of a new entity from a create patch.
    ///
    /// `title` is required; every other field takes its default.
    pub fn create(
        kind: EntityKind,
        patch: &Patch,
        created_by: &UserId,
    ) -> Result<Self, ValidationError> {
        let changes = patch.validate(kind)?;
        let missing_title = || ValidationError::MissingField {
            field: "title".into(),
        };

        match changes {
            FieldChanges::Task(c) => {
                let base = TaskFields {
                    title: c.title.clone().ok_or_else(missing_title)?,
                    description: None,
                    status: TaskStatus::Todo,
                    priority: Priority::Low,
                    due_date: None,
                    assigned_to: None,
                    created_by: created_by.clone(),
                    lane_id: None,
                    position: 0,
                };
                Ok(EntityFields::Task(c.apply(&base)))
            }
            FieldChanges::Lane(c) => {
                let base = LaneFields {
                    title: c.title.clone().ok_or_else(missing_title)?,
                    position: 0,
                };
                Ok(EntityFields::Lane(c.apply(&base)))
            }
        }
    }

    /// Applies validated changes, producing the next payload.
    pub fn apply(&self, changes: &FieldChanges) -> Result<Self, ValidationError> {
        match (self, changes) {
            (EntityFields::Task(task), FieldChanges::Task(c)) => Ok(EntityFields::Task(c.apply(task))),
            (EntityFields::Lane(lane), FieldChanges::Lane(c)) => Ok(EntityFields::Lane(c.apply(lane))),
            _ => Err(ValidationError::KindMismatch),
        }
    }

    /// Returns the assignee of a task.
    pub fn assignee(&self) -> Option<&UserId> {
        self.as_task().and_then(|t| t.assigned_to.as_ref())
    }

    /// Returns the title of a task or lane.
    pub fn title(&self) -> &str {
        match self {
            EntityFields::Task(t) => &t.title,
            EntityFields::Lane(l) => &l.title,
        }
    }
}

/// Authoritative state of an entity as held by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    /// Entity id.
    pub id: EntityId,
    /// Current payload (for a tombstone, the last payload before delete).
    pub fields: EntityFields,
    /// Current version.
    pub version: Version,
    /// Time of the last accepted mutation, Unix milliseconds.
    pub updated_at: u64,
    /// Whether the entity has been soft-deleted.
    #[serde(default)]
    pub deleted: bool,
    /// User behind the last accepted mutation.
    #[serde(default)]
    pub last_actor: Option<UserId>,
}

impl EntityState {
    /// Returns the entity kind.
    pub fn kind(&self) -> EntityKind {
        self.fields.kind()
    }
}

/// A partial update: field name to new JSON value.
///
/// Patches arrive untyped from clients and are checked by
/// [`Patch::validate`] before anything else happens. `null` clears an
/// optional field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(BTreeMap<String, Value>);

impl Patch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, builder style.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Merges `other` into this patch; fields in `other` win.
    pub fn merge(&mut self, other: &Patch) {
        for (field, value) in &other.0 {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Returns true if the patch has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if the patch sets `field`.
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Iterates over field names.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Checks every field against the schema of `kind`.
    pub fn validate(&self, kind: EntityKind) -> Result<FieldChanges, ValidationError> {
        if self.0.is_empty() {
            return Err(ValidationError::EmptyPatch);
        }
        match kind {
            EntityKind::Task => TaskChanges::from_patch(self).map(FieldChanges::Task),
            EntityKind::Lane => LaneChanges::from_patch(self).map(FieldChanges::Lane),
        }
    }
}

/// A validated, typed patch.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChanges {
    /// Changes to a task.
    Task(TaskChanges),
    /// Changes to a lane.
    Lane(LaneChanges),
}

impl FieldChanges {
    /// True if the change is visible in the task list view.
    pub fn touches_list(&self) -> bool {
        match self {
            FieldChanges::Task(c) => {
                c.title.is_some()
                    || c.status.is_some()
                    || c.priority.is_some()
                    || c.due_date.is_some()
                    || c.assigned_to.is_some()
            }
            FieldChanges::Lane(_) => false,
        }
    }

    /// True if the change is visible on the kanban board.
    pub fn touches_board(&self) -> bool {
        match self {
            FieldChanges::Task(c) => {
                c.title.is_some()
                    || c.status.is_some()
                    || c.lane_id.is_some()
                    || c.position.is_some()
                    || c.assigned_to.is_some()
            }
            FieldChanges::Lane(_) => true,
        }
    }
}

/// Validated task changes. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskChanges {
    /// New title.
    pub title: Option<String>,
    /// New description.
    pub description: Option<Option<String>>,
    /// New status.
    pub status: Option<TaskStatus>,
    /// New priority.
    pub priority: Option<Priority>,
    /// New due date.
    pub due_date: Option<Option<String>>,
    /// New assignee.
    pub assigned_to: Option<Option<UserId>>,
    /// New lane.
    pub lane_id: Option<Option<EntityId>>,
    /// New position.
    pub position: Option<u32>,
}

impl TaskChanges {
    fn from_patch(patch: &Patch) -> Result<Self, ValidationError> {
        let mut changes = Self::default();
        for (field, value) in &patch.0 {
            match field.as_str() {
                "title" => changes.title = Some(title(field, value, MAX_TASK_TITLE_LEN)?),
                "description" => {
                    changes.description = Some(optional_text(field, value, MAX_DESCRIPTION_LEN)?)
                }
                "status" => {
                    let s = text(field, value)?;
                    let status = TaskStatus::parse(s).ok_or_else(|| {
                        ValidationError::invalid(field, format!("unknown status '{s}'"))
                    })?;
                    changes.status = Some(status);
                }
                "priority" => {
                    let s = text(field, value)?;
                    let priority = Priority::parse(s).ok_or_else(|| {
                        ValidationError::invalid(field, format!("unknown priority '{s}'"))
                    })?;
                    changes.priority = Some(priority);
                }
                "due_date" => {
                    let date = optional_text(field, value, 10)?;
                    if let Some(d) = &date {
                        if !is_iso_date(d) {
                            return Err(ValidationError::invalid(field, "expected YYYY-MM-DD"));
                        }
                    }
                    changes.due_date = Some(date);
                }
                "assigned_to" => {
                    changes.assigned_to =
                        Some(optional_text(field, value, 128)?.map(UserId::new))
                }
                "lane_id" => {
                    let lane = match optional_text(field, value, 64)? {
                        None => None,
                        Some(s) => Some(EntityId::parse(&s).ok_or_else(|| {
                            ValidationError::invalid(field, "not an entity id")
                        })?),
                    };
                    changes.lane_id = Some(lane);
                }
                "position" => changes.position = Some(position(field, value)?),
                "created_by" | "id" | "version" | "updated_at" => {
                    return Err(ValidationError::ImmutableField {
                        field: field.clone(),
                    })
                }
                _ => {
                    return Err(ValidationError::UnknownField {
                        field: field.clone(),
                    })
                }
            }
        }
        Ok(changes)
    }

    fn apply(&self, base: &TaskFields) -> TaskFields {
        let mut next = base.clone();
        if let Some(title) = &self.title {
            next.title = title.clone();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(due_date) = &self.due_date {
            next.due_date = due_date.clone();
        }
        if let Some(assigned_to) = &self.assigned_to {
            next.assigned_to = assigned_to.clone();
        }
        if let Some(lane_id) = self.lane_id {
            next.lane_id = lane_id;
        }
        if let Some(position) = self.position {
            next.position = position;
        }
        next
    }
}

/// Validated lane changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneChanges {
    /// New title.
    pub title: Option<String>,
    /// New position.
    pub position: Option<u32>,
}

impl LaneChanges {
    fn from_patch(patch: &Patch) -> Result<Self, ValidationError> {
        let mut changes = Self::default();
        for (field, value) in &patch.0 {
            match field.as_str() {
                "title" => changes.title = Some(title(field, value, MAX_LANE_TITLE_LEN)?),
                "position" => changes.position = Some(position(field, value)?),
                "id" | "version" | "updated_at" => {
                    return Err(ValidationError::ImmutableField {
                        field: field.clone(),
                    })
                }
                _ => {
                    return Err(ValidationError::UnknownField {
                        field: field.clone(),
                    })
                }
            }
        }
        Ok(changes)
    }

    fn apply(&self, base: &LaneFields) -> LaneFields {
        LaneFields {
            title: self.title.clone().unwrap_or_else(|| base.title.clone()),
            position: self.position.unwrap_or(base.position),
        }
    }
}

fn text<'a>(field: &str, value: &'a Value) -> Result<&'a str, ValidationError> {
    value
        .as_str()
        .ok_or_else(|| ValidationError::invalid(field, "expected a string"))
}

fn title(field: &str, value: &Value, max: usize) -> Result<String, ValidationError> {
    let s = text(field, value)?.trim();
    if s.is_empty() {
        return Err(ValidationError::invalid(field, "must not be empty"));
    }
    if s.chars().count() > max {
        return Err(ValidationError::invalid(field, format!("longer than {max} characters")));
    }
    Ok(s.to_string())
}

fn optional_text(field: &str, value: &Value, max: usize) -> Result<Option<String>, ValidationError> {
    if value.is_null() {
        return Ok(None);
    }
    let s = text(field, value)?;
    if s.chars().count() > max {
        return Err(ValidationError::invalid(field, format!("longer than {max} characters")));
    }
    Ok(Some(s.to_string()))
}

fn position(field: &str, value: &Value) -> Result<u32, ValidationError> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ValidationError::invalid(field, "expected a non-negative integer"))
}

fn is_iso_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    if !s.is_ascii() || bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let part = &s[range];
        if part.bytes().all(|b| b.is_ascii_digit()) {
            part.parse().ok()
        } else {
            None
        }
    };
    match (digits(0..4), digits(5..7), digits(8..10)) {
        (Some(year), Some(month), Some(day)) => {
            (1..=12).contains(&month) && (1..=days_in_month(year, month)).contains(&day)
        }
        _ => false,
    }
}

fn days_in_month(year: u32, month: u32) -> u32 {
    match month {
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}
