//! Sliding conversation window.
//!
//! The window is capped in message count and auto-clears after an idle
//! timeout, so a request in the morning doesn't drag in last night's
//! context. There is no persistent memory beyond this.

use super::provider::ChatMessage;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct WindowEntry {
    message: ChatMessage,
    at: Instant,
}

#[derive(Debug)]
pub struct ConversationWindow {
    entries: VecDeque<WindowEntry>,
    max_messages: usize,
    idle_timeout: Duration,
}

impl ConversationWindow {
    pub fn new(max_messages: usize, idle_timeout: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            max_messages,
            idle_timeout,
        }
    }

    /// Drop stale context before a new turn begins.
    pub fn begin_turn(&mut self) {
        if let Some(last) = self.entries.back() {
            if last.at.elapsed() >= self.idle_timeout {
                log::info!(
                    "Conversation idle for {:?}, clearing {} messages",
                    self.idle_timeout,
                    self.entries.len()
                );
                self.entries.clear();
            }
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push_back(WindowEntry {
            message,
            at: Instant::now(),
        });
        while self.entries.len() > self.max_messages {
            self.entries.pop_front();
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
