//! Broadcast scopes.

use crate::error::ProtocolError;
use crate::ids::EntityId;
use std::fmt;
use std::str::FromStr;

/// A broadcast scope identifying which connections receive an update.
///
/// Every entity has its own topic. The two aggregate topics carry
/// list-level changes (create, delete, reorder, status moves) for the
/// task list and the kanban board views.
///
/// On the wire a topic is a plain string: `task-list`, `kanban-board`,
/// or the entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    /// Aggregate topic for the task list view.
    TaskList,
    /// Aggregate topic for the kanban board view.
    KanbanBoard,
    /// Topic of a single task or lane.
    Entity(EntityId),
}

impl Topic {
    const TASK_LIST: &'static str = "task-list";
    const KANBAN_BOARD: &'static str = "kanban-board";

    /// Returns true for `task-list` and `kanban-board`.
    pub fn is_aggregate(&self) -> bool {
        !matches!(self, Topic::Entity(_))
    }

    /// Returns the entity id for an entity topic.
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            Topic::Entity(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::TaskList => f.write_str(Self::TASK_LIST),
            Topic::KanbanBoard => f.write_str(Self::KANBAN_BOARD),
            Topic::Entity(id) => id.fmt(f),
        }
    }
}

impl FromStr for Topic {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::TASK_LIST => Ok(Topic::TaskList),
            Self::KANBAN_BOARD => Ok(Topic::KanbanBoard),
            other => EntityId::parse(other)
                .map(Topic::Entity)
                .ok_or_else(|| ProtocolError::InvalidTopic(other.to_string())),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

impl From<EntityId> for Topic {
    fn from(id: EntityId) -> Self {
        Topic::Entity(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn aggregate_names() {
        assert_eq!("task-list".parse::<Topic>().unwrap(), Topic::TaskList);
        assert_eq!("kanban-board".parse::<Topic>().unwrap(), Topic::KanbanBoard);
        assert_eq!(Topic::KanbanBoard.to_string(), "kanban-board");
        assert!(Topic::TaskList.is_aggregate());
    }

    #[test]
    fn entity_topic() {
        let id = EntityId::new();
        let topic: Topic = id.to_string().parse().unwrap();
        assert_eq!(topic, Topic::Entity(id));
        assert_eq!(topic.entity_id(), Some(id));
        assert!(!topic.is_aggregate());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            "board".parse::<Topic>(),
            Err(ProtocolError::InvalidTopic(_))
        ));
    }

    #[test]
    fn topics_as_json_map_keys() {
        let id = EntityId::new();
        let mut last_seen = BTreeMap::new();
        last_seen.insert(Topic::TaskList, 3u64);
        last_seen.insert(Topic::Entity(id), 7u64);

        let json = serde_json::to_string(&last_seen).unwrap();
        assert!(json.contains("\"task-list\":3"));

        let back: BTreeMap<Topic, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, last_seen);
    }
}
