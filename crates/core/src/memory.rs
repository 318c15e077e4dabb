use crate::models::ConversationTurn;
use chrono::Utc;
use std::collections::VecDeque;

pub const DEFAULT_MEMORY_TURNS: usize = 5;

/// The last `capacity` question/answer turns, oldest first.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    capacity: usize,
    turns: VecDeque<ConversationTurn>,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_TURNS)
    }
}

impl ConversationMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            turns: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn add(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        while self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(ConversationTurn {
            question: question.into(),
            answer: answer.into(),
            asked_at: Utc::now(),
        });
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn summary(&self) -> String {
        if self.turns.is_empty() {
            "No conversation history".to_string()
        } else {
            format!("Memory contains {} messages", self.turns.len() * 2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_last_k_turns() {
        let mut memory = ConversationMemory::new(2);
        memory.add("q1", "a1");
        memory.add("q2", "a2");
        memory.add("q3", "a3");

        let questions: Vec<_> = memory.history().into_iter().map(|turn| turn.question).collect();
        assert_eq!(questions, vec!["q2", "q3"]);
    }

    #[test]
    fn summary_counts_messages() {
        let mut memory = ConversationMemory::default();
        assert_eq!(memory.summary(), "No conversation history");
        memory.add("q", "a");
        assert_eq!(memory.summary(), "Memory contains 2 messages");
        memory.clear();
        assert!(memory.is_empty());
        assert_eq!(memory.summary(), "No conversation history");
    }

    #[test]
    fn zero_capacity_remembers_nothing() {
        let mut memory = ConversationMemory::new(0);
        memory.add("q", "a");
        assert!(memory.history().is_empty());
    }
}
