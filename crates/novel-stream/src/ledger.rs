//! Per-conversation fold of classified events into messages.
//!
//! At most one non-finalized message exists per agent. Deltas append to it,
//! a turn completion replaces its fields and closes it, and notices/errors
//! always land in their own finalized `system` message.

use std::collections::BTreeMap;

use crate::event::AgentEvent;
use crate::model::{AgentRole, Author, FieldMap};

/// One ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Message {
    pub author: Author,
    pub fields: BTreeMap<String, String>,
    pub finalized: bool,
}

impl Message {
    fn finalized(author: Author, message: impl Into<String>) -> Self {
        Self {
            author,
            fields: BTreeMap::from([(FieldMap::MESSAGE_FIELD.to_string(), message.into())]),
            finalized: true,
        }
    }

    /// Text of a field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// What a single `apply` changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerDelta {
    /// A new open message was started for the agent.
    Opened { index: usize, agent: AgentRole },
    /// Text was appended to the agent's open message.
    Appended { index: usize, agent: AgentRole },
    /// The agent's message was overwritten and closed.
    Finalized { index: usize, agent: AgentRole },
    /// A system message was appended.
    Notice { index: usize },
    /// End of exchange; nothing changed.
    Ended,
}

/// Ordered messages for one conversation plus the open-message index.
#[derive(Clone, Debug, Default)]
pub struct Ledger {
    fields: FieldMap,
    messages: Vec<Message>,
    open: [Option<usize>; 3],
}

impl Ledger {
    /// Creates an empty ledger with the given designated-field mapping.
    pub fn new(fields: FieldMap) -> Self {
        Self {
            fields,
            messages: Vec::new(),
            open: [None; 3],
        }
    }

    /// Designated-field mapping this ledger folds with.
    pub fn field_map(&self) -> &FieldMap {
        &self.fields
    }

    /// Messages in arrival order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Index of the agent's non-finalized message, if any.
    pub fn open_message(&self, agent: AgentRole) -> Option<usize> {
        self.open[agent.index()]
    }

    /// Folds one event.
    pub fn apply(&mut self, event: AgentEvent) -> LedgerDelta {
        match event {
            AgentEvent::StreamDelta { agent, content } => {
                let field = self.fields.field(agent).to_string();
                match self.open[agent.index()] {
                    Some(index) => {
                        self.messages[index]
                            .fields
                            .entry(field)
                            .or_default()
                            .push_str(&content);
                        LedgerDelta::Appended { index, agent }
                    }
                    None => {
                        let index = self.messages.len();
                        self.messages.push(Message {
                            author: Author::Agent(agent),
                            fields: BTreeMap::from([(field, content)]),
                            finalized: false,
                        });
                        self.open[agent.index()] = Some(index);
                        LedgerDelta::Opened { index, agent }
                    }
                }
            }
            AgentEvent::TurnComplete { agent, payload } => {
                let index = match self.open[agent.index()].take() {
                    Some(index) => index,
                    None => {
                        self.messages.push(Message {
                            author: Author::Agent(agent),
                            fields: BTreeMap::new(),
                            finalized: false,
                        });
                        self.messages.len() - 1
                    }
                };
                let message = &mut self.messages[index];
                message.fields = payload;
                message.finalized = true;
                LedgerDelta::Finalized { index, agent }
            }
            AgentEvent::SystemNotice { message } => self.push_system(message),
            AgentEvent::Error { message } => self.push_system(format!("Error: {message}")),
            AgentEvent::StreamEnd => LedgerDelta::Ended,
        }
    }

    fn push_system(&mut self, message: String) -> LedgerDelta {
        self.messages.push(Message::finalized(Author::System, message));
        LedgerDelta::Notice {
            index: self.messages.len() - 1,
        }
    }

    /// Appends a finalized message authored by the user.
    pub fn push_user(&mut self, text: impl Into<String>) -> usize {
        self.messages.push(Message::finalized(Author::User, text));
        self.messages.len() - 1
    }

    /// Closes the agent's open message as-is, keeping its accumulated deltas.
    pub fn seal(&mut self, agent: AgentRole) -> Option<usize> {
        let index = self.open[agent.index()].take()?;
        self.messages[index].finalized = true;
        Some(index)
    }

    /// Drops the agent's stale open message so a new turn starts clean.
    pub fn reset_open(&mut self, agent: AgentRole) -> Option<Message> {
        let index = self.open[agent.index()].take()?;
        let removed = self.messages.remove(index);
        for slot in self.open.iter_mut().flatten() {
            if *slot > index {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    /// Designated-field text of the agent's latest finalized message.
    pub fn artifact(&self, agent: AgentRole) -> Option<&str> {
        let field = self.fields.field(agent);
        self.messages
            .iter()
            .rev()
            .find(|m| m.finalized && m.author == Author::Agent(agent))
            .and_then(|m| m.field(field))
    }

    /// Text a renderer shows for a message: the designated field for agent
    /// messages, the message field otherwise.
    pub fn display_text<'a>(&self, message: &'a Message) -> &'a str {
        let field = match message.author {
            Author::Agent(agent) => self.fields.field(agent),
            Author::User | Author::System => FieldMap::MESSAGE_FIELD,
        };
        message.field(field).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StructuredResult;

    fn delta(agent: AgentRole, content: &str) -> AgentEvent {
        AgentEvent::StreamDelta {
            agent,
            content: content.into(),
        }
    }

    fn complete(agent: AgentRole, field: &str, text: &str) -> AgentEvent {
        AgentEvent::TurnComplete {
            agent,
            payload: StructuredResult::from([(field.to_string(), text.to_string())]),
        }
    }

    fn open_count(ledger: &Ledger, agent: AgentRole) -> usize {
        ledger
            .messages()
            .iter()
            .filter(|m| m.author == Author::Agent(agent) && !m.finalized)
            .count()
    }

    #[test]
    fn deltas_concatenate_in_order_for_any_count() {
        for n in 0..6 {
            let mut ledger = Ledger::default();
            let fragments: Vec<String> = (0..n).map(|i| format!("<{i}>")).collect();
            for fragment in &fragments {
                ledger.apply(delta(AgentRole::Planner, fragment));
            }
            let expected = fragments.concat();
            match n {
                0 => assert!(ledger.messages().is_empty()),
                _ => {
                    assert_eq!(ledger.messages().len(), 1);
                    let message = &ledger.messages()[0];
                    assert!(!message.finalized);
                    assert_eq!(message.field("novel_outline"), Some(expected.as_str()));
                }
            }
        }
    }

    #[test]
    fn completion_overwrites_accumulated_deltas() {
        let mut ledger = Ledger::default();
        assert_eq!(
            ledger.apply(delta(AgentRole::Planner, "第一章")),
            LedgerDelta::Opened {
                index: 0,
                agent: AgentRole::Planner
            }
        );
        ledger.apply(delta(AgentRole::Planner, "：觉醒"));
        let change = ledger.apply(complete(
            AgentRole::Planner,
            "novel_outline",
            "第一章：觉醒（终稿）",
        ));
        assert_eq!(
            change,
            LedgerDelta::Finalized {
                index: 0,
                agent: AgentRole::Planner
            }
        );
        assert_eq!(ledger.messages().len(), 1);
        assert!(ledger.messages()[0].finalized);
        assert_eq!(
            ledger.artifact(AgentRole::Planner),
            Some("第一章：觉醒（终稿）")
        );
    }

    #[test]
    fn completion_replaces_fields_wholesale() {
        let mut ledger = Ledger::default();
        ledger.apply(delta(AgentRole::Writer, "partial"));
        ledger.apply(complete(AgentRole::Writer, "summary", "only this"));
        let message = &ledger.messages()[0];
        assert_eq!(message.field("draft"), None);
        assert_eq!(message.field("summary"), Some("only this"));
    }

    #[test]
    fn completion_without_deltas_creates_finalized_message() {
        let mut ledger = Ledger::default();
        ledger.apply(complete(AgentRole::Reviewer, "critique", "ok"));
        assert_eq!(ledger.messages().len(), 1);
        assert!(ledger.messages()[0].finalized);
        assert_eq!(ledger.open_message(AgentRole::Reviewer), None);
    }

    #[test]
    fn delta_after_completion_opens_a_new_message() {
        let mut ledger = Ledger::default();
        ledger.apply(delta(AgentRole::Planner, "a"));
        ledger.apply(complete(AgentRole::Planner, "novel_outline", "A"));
        ledger.apply(delta(AgentRole::Planner, "b"));
        assert_eq!(ledger.messages().len(), 2);
        assert_eq!(ledger.open_message(AgentRole::Planner), Some(1));
        assert_eq!(ledger.artifact(AgentRole::Planner), Some("A"));
    }

    #[test]
    fn interleaved_agents_never_share_or_duplicate_open_messages() {
        let events = vec![
            delta(AgentRole::Planner, "p1"),
            delta(AgentRole::Writer, "w1"),
            AgentEvent::SystemNotice {
                message: "progress".into(),
            },
            delta(AgentRole::Planner, "p2"),
            complete(AgentRole::Writer, "draft", "W"),
            delta(AgentRole::Writer, "w2"),
            delta(AgentRole::Planner, "p3"),
        ];
        let mut ledger = Ledger::default();
        for event in events {
            ledger.apply(event);
            for role in AgentRole::ALL {
                assert!(open_count(&ledger, role) <= 1);
            }
        }
        let planner = ledger.open_message(AgentRole::Planner).expect("open");
        assert_eq!(ledger.messages()[planner].field("novel_outline"), Some("p1p2p3"));
        assert_eq!(ledger.artifact(AgentRole::Writer), Some("W"));
    }

    #[test]
    fn notices_and_errors_are_finalized_system_messages() {
        let mut ledger = Ledger::default();
        ledger.apply(delta(AgentRole::Planner, "x"));
        ledger.apply(AgentEvent::Error {
            message: "boom".into(),
        });
        ledger.apply(delta(AgentRole::Planner, "y"));
        assert_eq!(ledger.messages().len(), 2);
        let system = &ledger.messages()[1];
        assert_eq!(system.author, Author::System);
        assert!(system.finalized);
        assert_eq!(ledger.display_text(system), "Error: boom");
        assert_eq!(ledger.display_text(&ledger.messages()[0]), "xy");
    }

    #[test]
    fn seal_keeps_deltas_and_reset_drops_them() {
        let mut ledger = Ledger::default();
        ledger.apply(delta(AgentRole::Planner, "kept"));
        assert_eq!(ledger.seal(AgentRole::Planner), Some(0));
        assert_eq!(ledger.artifact(AgentRole::Planner), Some("kept"));

        ledger.push_user("again");
        ledger.apply(delta(AgentRole::Writer, "w"));
        ledger.apply(delta(AgentRole::Planner, "stale"));
        let removed = ledger.reset_open(AgentRole::Writer).expect("open writer");
        assert_eq!(removed.field("draft"), Some("w"));
        assert_eq!(ledger.messages().len(), 3);
        let planner = ledger.open_message(AgentRole::Planner).expect("still open");
        assert_eq!(ledger.messages()[planner].field("novel_outline"), Some("stale"));
        assert_eq!(ledger.reset_open(AgentRole::Writer), None);
    }

    #[test]
    fn stream_end_changes_nothing() {
        let mut ledger = Ledger::default();
        assert_eq!(ledger.apply(AgentEvent::StreamEnd), LedgerDelta::Ended);
        assert!(ledger.messages().is_empty());
    }
}
