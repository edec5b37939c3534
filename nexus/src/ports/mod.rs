//! Collaborators the executor consumes but does not own.

mod budget;
mod topic_queue;

pub use budget::{BudgetTracker, CostStatus, InMemoryBudgetTracker};
pub use topic_queue::{next_queue_date, FailedTopic, InMemoryTopicQueue, QueuedTopic, TopicQueue};

#[cfg(test)]
pub use budget::MockBudgetTracker;
#[cfg(test)]
pub use topic_queue::MockTopicQueue;
