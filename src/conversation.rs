//! The ordered log of turns shown in the chat sidebar.
//!
//! Assistant turns move `Pending -> Streaming -> Complete | Failed`. Only
//! pending or streaming turns accept content updates, and at most one turn is
//! in flight at a time.

use std::fmt;
use uuid::Uuid;

pub const GREETING: &str = "привет. давай напишем что-нибудь красивое.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(Uuid);

impl TurnId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
}

impl TurnStatus {
    pub fn is_final(self) -> bool {
        matches!(self, TurnStatus::Complete | TurnStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Turn {
    id: TurnId,
    role: Role,
    content: String,
    status: TurnStatus,
}

impl Turn {
    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn is_streaming(&self) -> bool {
        !self.status.is_final()
    }
}

/// How a failed assistant turn is presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisplay {
    /// Keep whatever streamed in and append the marker after it.
    KeepPartial { marker: String },
    /// Discard streamed text and show `text` instead.
    Replace { text: String },
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_greeting() -> Self {
        let mut conversation = Self::new();
        conversation.push_finalized(Role::Assistant, GREETING.to_string());
        conversation
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    #[cfg(test)]
    pub fn get(&self, id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.id() == id)
    }

    pub fn streaming_turn(&self) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.is_streaming())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_turn().is_some()
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> TurnId {
        self.push_finalized(Role::User, content.into())
    }

    /// Opens an empty assistant turn, or returns `None` while another turn is
    /// still in flight.
    pub fn begin_assistant(&mut self) -> Option<TurnId> {
        if self.is_streaming() {
            return None;
        }

        let id = TurnId::new();
        self.turns.push(Turn {
            id,
            role: Role::Assistant,
            content: String::new(),
            status: TurnStatus::Pending,
        });
        Some(id)
    }

    /// Replaces the content of an in-flight turn with the cumulative text.
    pub fn update_streaming(&mut self, id: TurnId, cumulative: &str) -> bool {
        let Some(turn) = self.in_flight_mut(id) else {
            return false;
        };
        turn.content.clear();
        turn.content.push_str(cumulative);
        turn.status = TurnStatus::Streaming;
        true
    }

    pub fn complete(&mut self, id: TurnId, full_text: &str) -> bool {
        let Some(turn) = self.in_flight_mut(id) else {
            return false;
        };
        turn.content.clear();
        turn.content.push_str(full_text);
        turn.status = TurnStatus::Complete;
        true
    }

    pub fn fail(&mut self, id: TurnId, display: &ErrorDisplay) -> bool {
        let Some(turn) = self.in_flight_mut(id) else {
            return false;
        };
        match display {
            ErrorDisplay::KeepPartial { marker } => {
                if !turn.content.is_empty() {
                    turn.content.push_str("\n\n");
                }
                turn.content.push_str(marker);
            }
            ErrorDisplay::Replace { text } => {
                turn.content.clone_from(text);
            }
        }
        turn.status = TurnStatus::Failed;
        true
    }

    fn push_finalized(&mut self, role: Role, content: String) -> TurnId {
        let id = TurnId::new();
        self.turns.push(Turn {
            id,
            role,
            content,
            status: TurnStatus::Complete,
        });
        id
    }

    fn in_flight_mut(&mut self, id: TurnId) -> Option<&mut Turn> {
        self.turns
            .iter_mut()
            .find(|turn| turn.id() == id)
            .filter(|turn| turn.is_streaming())
    }
}
