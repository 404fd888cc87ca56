//! The fixed catalog of daily tasks.

use serde::Serialize;

/// A completable daily task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskDefinition {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    /// Reward in TASK tokens
    pub reward: u64,
    /// Category ("social", "content", "video")
    #[serde(rename = "type")]
    pub category: &'static str,
    pub platform: &'static str,
}

pub const DAILY_TASKS: [TaskDefinition; 5] = [
    TaskDefinition {
        id: "tweet",
        title: "Tweet on X",
        description: "Share a tweet about your day or interests",
        reward: 10,
        category: "social",
        platform: "twitter",
    },
    TaskDefinition {
        id: "linkedin",
        title: "Write a Blog or Thread on LinkedIn",
        description: "Create engaging content on LinkedIn",
        reward: 15,
        category: "content",
        platform: "linkedin",
    },
    TaskDefinition {
        id: "youtube",
        title: "Upload a Short on YouTube",
        description: "Create and upload a YouTube Short",
        reward: 20,
        category: "video",
        platform: "youtube",
    },
    TaskDefinition {
        id: "telegram",
        title: "Talk in Telegram Group Chat",
        description: "Engage in a Telegram group conversation",
        reward: 8,
        category: "social",
        platform: "telegram",
    },
    TaskDefinition {
        id: "whatsapp",
        title: "Talk in WhatsApp Group Chat",
        description: "Participate in a WhatsApp group discussion",
        reward: 8,
        category: "social",
        platform: "whatsapp",
    },
];

/// Read-only view over a set of task definitions.
#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    tasks: &'static [TaskDefinition],
}

impl Catalog {
    pub fn new(tasks: &'static [TaskDefinition]) -> Self {
        Self { tasks }
    }

    pub fn daily() -> Self {
        Self::new(&DAILY_TASKS)
    }

    pub fn find(&self, id: &str) -> Option<&'static TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn tasks(&self) -> &'static [TaskDefinition] {
        self.tasks
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::daily()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_daily_catalog_ids_are_unique() {
        let ids: HashSet<_> = DAILY_TASKS.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), DAILY_TASKS.len());
    }

    #[test]
    fn test_find_known_and_unknown() {
        let catalog = Catalog::daily();
        assert_eq!(catalog.find("tweet").map(|t| t.reward), Some(10));
        assert_eq!(catalog.find("youtube").map(|t| t.platform), Some("youtube"));
        assert!(catalog.find("unknown_task").is_none());
    }

    #[test]
    fn test_category_serialized_as_type() {
        let value = serde_json::to_value(DAILY_TASKS[1]).unwrap();
        assert_eq!(value["type"], "content");
        assert!(value.get("category").is_none());
    }
}
