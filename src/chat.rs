//! Send orchestration for the chat sidebar.
//!
//! The controller owns the conversation and the one live [`Session`]. A send
//! moves the session into a [`SendJob`]; the job hands it back inside
//! [`ChatEvent::Finished`], so no second send can start while one is running.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::conversation::{Conversation, ErrorDisplay, TurnId};
use crate::error::ChatError;
use crate::session::{Session, SessionFactory};
use crate::stream::send_and_stream;

#[derive(Debug)]
pub enum ChatEvent {
    Increment {
        turn: TurnId,
        text: String,
    },
    Finished {
        turn: TurnId,
        session: Session,
        result: Result<String, ChatError>,
    },
}

/// One user message on its way to the model.
#[derive(Debug)]
pub struct SendJob {
    turn: TurnId,
    message: String,
    session: Session,
    cancel: CancellationToken,
}

impl SendJob {
    pub fn turn(&self) -> TurnId {
        self.turn
    }

    pub async fn run(self, events: mpsc::UnboundedSender<ChatEvent>) {
        let SendJob {
            turn,
            message,
            mut session,
            cancel,
        } = self;

        let increments = events.clone();
        let result = send_and_stream(&mut session, &message, &cancel, |text| {
            let _ = increments.send(ChatEvent::Increment {
                turn,
                text: text.to_string(),
            });
        })
        .await;

        let _ = events.send(ChatEvent::Finished {
            turn,
            session,
            result,
        });
    }
}

struct InFlight {
    turn: TurnId,
    cancel: CancellationToken,
}

pub struct ChatController {
    conversation: Conversation,
    factory: SessionFactory,
    session: Option<Session>,
    in_flight: Option<InFlight>,
    on_error: ErrorDisplay,
    cancelled_marker: String,
}

impl ChatController {
    /// Opens the conversation with its greeting and a ready session.
    pub fn new(factory: SessionFactory, on_error: ErrorDisplay) -> Self {
        let session = factory.create();
        Self {
            conversation: Conversation::with_greeting(),
            factory,
            session: Some(session),
            in_flight: None,
            on_error,
            cancelled_marker: "[остановлено]".to_string(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn is_streaming(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn model(&self) -> &str {
        &self.factory.config().model
    }

    /// Records the user's message and prepares the request for it.
    ///
    /// Blank input, or input arriving while a reply is still streaming, is
    /// ignored: no turn is added and nothing is sent.
    pub fn submit(&mut self, input: &str) -> Option<SendJob> {
        let message = input.trim();
        if message.is_empty() || self.is_streaming() || self.conversation.is_streaming() {
            return None;
        }

        self.conversation.push_user(message);
        let turn = self.conversation.begin_assistant()?;

        let session = match self.session.take() {
            Some(session) => session,
            None => self.factory.create(),
        };
        tracing::info!(
            session = %session.id(),
            exchanges = session.exchanges(),
            %turn,
            chars = message.chars().count(),
            "sending message"
        );

        let cancel = CancellationToken::new();
        self.in_flight = Some(InFlight {
            turn,
            cancel: cancel.clone(),
        });

        Some(SendJob {
            turn,
            message: message.to_string(),
            session,
            cancel,
        })
    }

    /// Asks the running send to stop. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        match &self.in_flight {
            Some(in_flight) => {
                in_flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Fails `turn` when its job ended without reporting back, as after a
    /// panic in the spawned task. The session went down with the job, so the
    /// next send opens a fresh one. Returns false if the turn already finished.
    pub fn abandon(&mut self, turn: TurnId) -> bool {
        if self.in_flight.as_ref().map(|f| f.turn) != Some(turn) {
            return false;
        }
        self.in_flight = None;
        tracing::error!(%turn, "send job ended without a result");
        self.conversation.fail(turn, &self.on_error);
        true
    }

    pub fn apply(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Increment { turn, text } => {
                self.conversation.update_streaming(turn, &text);
            }
            ChatEvent::Finished {
                turn,
                session,
                result,
            } => {
                if self.in_flight.as_ref().map(|f| f.turn) == Some(turn) {
                    self.in_flight = None;
                }

                match result {
                    Ok(text) => {
                        if text.is_empty() {
                            tracing::info!(%turn, "model returned an empty reply");
                        }
                        self.conversation.complete(turn, &text);
                        self.session = Some(session);
                    }
                    Err(ChatError::Cancelled) => {
                        let display = ErrorDisplay::KeepPartial {
                            marker: self.cancelled_marker.clone(),
                        };
                        self.conversation.fail(turn, &display);
                        self.session = Some(session);
                    }
                    Err(err) => {
                        tracing::error!(%turn, error = %err, "reply failed");
                        self.conversation.fail(turn, &self.on_error);
                        if err.invalidates_session() {
                            tracing::warn!(session = %session.id(), "discarding session");
                        } else {
                            self.session = Some(session);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Role, TurnStatus};
    use crate::session::testing::{factory, Reply, ScriptedTransport};
    use std::sync::Arc;

    fn keep() -> ErrorDisplay {
        ErrorDisplay::KeepPartial {
            marker: "ошибка соединения...".to_string(),
        }
    }

    fn decode_error() -> ChatError {
        ChatError::Decode(serde_json::from_str::<()>("garbage").unwrap_err())
    }

    /// Runs the job to completion and feeds every event back in order.
    async fn drive(controller: &mut ChatController, job: SendJob) -> Vec<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        job.run(tx).await;

        let mut increments = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::Increment { text, .. } = &event {
                increments.push(text.clone());
            }
            controller.apply(event);
        }
        increments
    }

    #[tokio::test]
    async fn successful_send_streams_into_the_assistant_turn() {
        let transport = ScriptedTransport::new(vec![Reply::Fragments(vec!["при", "вет"])]);
        let mut controller = ChatController::new(factory(transport), keep());

        let job = controller.submit("  hello  ").unwrap();
        let turn = job.turn();
        assert!(controller.is_streaming());
        assert!(controller.conversation().get(turn).unwrap().is_streaming());

        let increments = drive(&mut controller, job).await;

        assert_eq!(increments, vec!["при", "привет"]);
        let turns = controller.conversation().turns();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1].role(), Role::User);
        assert_eq!(turns[1].content(), "hello");
        assert_eq!(turns[2].content(), "привет");
        assert_eq!(turns[2].status(), TurnStatus::Complete);
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn blank_input_creates_nothing_and_sends_nothing() {
        let transport = ScriptedTransport::new(Vec::new());
        let mut controller = ChatController::new(factory(Arc::clone(&transport)), keep());

        assert!(controller.submit("").is_none());
        assert!(controller.submit("   \n\t").is_none());

        assert_eq!(controller.conversation().turns().len(), 1);
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_a_no_op() {
        let transport = ScriptedTransport::new(vec![Reply::Fragments(vec!["ok"])]);
        let mut controller = ChatController::new(factory(Arc::clone(&transport)), keep());

        let job = controller.submit("first").unwrap();
        let before = controller.conversation().turns().len();

        assert!(controller.submit("second").is_none());
        assert_eq!(controller.conversation().turns().len(), before);

        drive(&mut controller, job).await;
        assert_eq!(transport.request_count(), 1);
        assert!(controller.submit("third").is_some());
    }

    #[tokio::test]
    async fn failure_keeps_partial_text_visible() {
        let transport = ScriptedTransport::new(vec![Reply::FailAfter(
            vec!["partial"],
            decode_error,
        )]);
        let mut controller = ChatController::new(factory(transport), keep());

        let job = controller.submit("hello").unwrap();
        let turn = job.turn();
        drive(&mut controller, job).await;

        let reply = controller.conversation().get(turn).unwrap();
        assert!(reply.content().starts_with("partial"));
        assert!(reply.content().contains("ошибка соединения..."));
        assert!(!reply.is_streaming());
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn invalidating_error_replaces_the_session() {
        let transport = ScriptedTransport::new(vec![
            Reply::FailAfter(vec![], decode_error),
            Reply::Fragments(vec!["fresh"]),
        ]);
        let mut controller = ChatController::new(factory(transport), keep());

        let job = controller.submit("one").unwrap();
        let first_session = job.session.id();
        drive(&mut controller, job).await;

        let job = controller.submit("two").unwrap();
        assert_ne!(job.session.id(), first_session);
        assert_eq!(job.session.exchanges(), 0);
    }

    #[tokio::test]
    async fn recoverable_error_keeps_the_session_and_its_history() {
        let transport = ScriptedTransport::new(vec![
            Reply::Fragments(vec!["hi"]),
            Reply::Refuse(|| ChatError::Api {
                status: 503,
                body: "overloaded".to_string(),
            }),
            Reply::Fragments(vec!["again"]),
        ]);
        let mut controller = ChatController::new(factory(transport), keep());

        let job = controller.submit("one").unwrap();
        let session_id = job.session.id();
        drive(&mut controller, job).await;

        let job = controller.submit("two").unwrap();
        drive(&mut controller, job).await;

        let job = controller.submit("three").unwrap();
        assert_eq!(job.session.id(), session_id);
        assert_eq!(job.session.exchanges(), 1);
    }

    #[tokio::test]
    async fn cancel_finalizes_the_turn_and_keeps_the_session() {
        let transport = ScriptedTransport::new(vec![Reply::Hang(vec!["half"])]);
        let mut controller = ChatController::new(factory(transport), keep());

        let job = controller.submit("hello").unwrap();
        let turn = job.turn();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(job.run(tx));

        match rx.recv().await.unwrap() {
            event @ ChatEvent::Increment { .. } => controller.apply(event),
            other => panic!("expected increment, got {:?}", other),
        }
        assert!(controller.cancel());
        handle.await.unwrap();
        while let Ok(event) = rx.try_recv() {
            controller.apply(event);
        }

        let reply = controller.conversation().get(turn).unwrap();
        assert_eq!(reply.status(), TurnStatus::Failed);
        assert!(reply.content().starts_with("half"));
        assert!(!controller.cancel());
        assert!(controller.submit("next").is_some());
    }

    #[tokio::test]
    async fn lost_job_fails_its_turn_and_unblocks_sending() {
        let transport = ScriptedTransport::new(vec![Reply::Fragments(vec!["fresh"])]);
        let mut controller = ChatController::new(factory(transport), keep());

        let job = controller.submit("hello").unwrap();
        let turn = job.turn();
        let lost_session = job.session.id();
        drop(job);
        assert!(controller.submit("blocked").is_none());

        assert!(controller.abandon(turn));
        assert!(!controller.abandon(turn));
        let reply = controller.conversation().get(turn).unwrap();
        assert_eq!(reply.status(), TurnStatus::Failed);
        assert_eq!(reply.content(), "ошибка соединения...");

        let job = controller.submit("again").unwrap();
        assert_ne!(job.session.id(), lost_session);
        drive(&mut controller, job).await;
        assert_eq!(
            controller.conversation().turns().last().unwrap().content(),
            "fresh"
        );
    }

    #[tokio::test]
    async fn abandon_after_finish_changes_nothing() {
        let transport = ScriptedTransport::new(vec![Reply::Fragments(vec!["done"])]);
        let mut controller = ChatController::new(factory(transport), keep());

        let job = controller.submit("hello").unwrap();
        let turn = job.turn();
        drive(&mut controller, job).await;

        assert!(!controller.abandon(turn));
        assert_eq!(controller.conversation().get(turn).unwrap().content(), "done");
    }

    #[tokio::test]
    async fn late_increment_after_finish_is_ignored() {
        let transport = ScriptedTransport::new(vec![Reply::Fragments(vec!["done"])]);
        let mut controller = ChatController::new(factory(transport), keep());

        let job = controller.submit("hello").unwrap();
        let turn = job.turn();
        drive(&mut controller, job).await;

        controller.apply(ChatEvent::Increment {
            turn,
            text: "done and then some".to_string(),
        });
        assert_eq!(controller.conversation().get(turn).unwrap().content(), "done");
    }
}
