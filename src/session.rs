use std::collections::HashMap;
use std::sync::Mutex;

use agmai_core::types::ImageService;

/// Per-chat dialogue state for multi-step flows. Keyed by Telegram chat id;
/// everything durable lives in the database, so losing this map on restart
/// only cancels an in-flight prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatState {
    Idle,
    AwaitingCaptcha { answer: String },
    AwaitingCharacterName,
    AwaitingCharacterPrompt { name: String },
    AwaitingEditName { character_id: i64 },
    AwaitingEditPrompt { character_id: i64 },
    AwaitingImagePrompt { service: ImageService },
}

#[derive(Default)]
pub struct SessionMap {
    states: Mutex<HashMap<i64, ChatState>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chat_id: i64) -> ChatState {
        match self.states.lock() {
            Ok(states) => states.get(&chat_id).cloned().unwrap_or(ChatState::Idle),
            Err(poisoned) => poisoned
                .into_inner()
                .get(&chat_id)
                .cloned()
                .unwrap_or(ChatState::Idle),
        }
    }

    pub fn set(&self, chat_id: i64, state: ChatState) {
        let mut states = match self.states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state == ChatState::Idle {
            states.remove(&chat_id);
        } else {
            states.insert(chat_id, state);
        }
    }

    pub fn clear(&self, chat_id: i64) {
        self.set(chat_id, ChatState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_idle() {
        let sessions = SessionMap::new();
        assert_eq!(sessions.get(1), ChatState::Idle);
    }

    #[test]
    fn test_set_and_clear() {
        let sessions = SessionMap::new();
        sessions.set(1, ChatState::AwaitingCharacterName);
        assert_eq!(sessions.get(1), ChatState::AwaitingCharacterName);
        assert_eq!(sessions.get(2), ChatState::Idle);

        sessions.clear(1);
        assert_eq!(sessions.get(1), ChatState::Idle);
    }

    #[test]
    fn test_idle_set_removes_entry() {
        let sessions = SessionMap::new();
        sessions.set(5, ChatState::AwaitingCaptcha { answer: "7".into() });
        sessions.set(5, ChatState::Idle);
        assert_eq!(sessions.get(5), ChatState::Idle);
    }
}
