//! Provider context assembly.

use crate::llm::types::ContextMessage;
use crate::store::types::{Message, MessageRole};

/// Build the provider context: the system preamble, then at most `window`
/// of the most recent messages in chronological order.
///
/// `history` must already be oldest first.
#[must_use]
pub fn build_context(system_prompt: &str, history: &[Message], window: usize) -> Vec<ContextMessage> {
    let skip = history.len().saturating_sub(window);
    let mut context = Vec::with_capacity(history.len() - skip + 1);
    context.push(ContextMessage::new(MessageRole::System, system_prompt));
    context.extend(
        history[skip..]
            .iter()
            .map(|message| ContextMessage::new(message.role, message.content.clone())),
    );
    context
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::ids::{MessageId, SessionId};

    fn message(role: MessageRole, content: &str) -> Message {
        Message {
            id: MessageId::new(),
            session_id: SessionId::new(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            model: None,
            prompt_tokens: None,
            completion_tokens: None,
        }
    }

    #[test]
    fn test_preamble_first_then_history() {
        let history = vec![
            message(MessageRole::User, "Hello"),
            message(MessageRole::Assistant, "Hi"),
        ];
        let context = build_context("be brief", &history, 20);
        assert_eq!(context.len(), 3);
        assert_eq!(context[0], ContextMessage::new(MessageRole::System, "be brief"));
        assert_eq!(context[2].role, MessageRole::Assistant);
    }

    #[test]
    fn test_window_keeps_most_recent() {
        let history: Vec<Message> = (0..30)
            .map(|i| message(MessageRole::User, &format!("m{i}")))
            .collect();
        let context = build_context("sys", &history, 20);
        assert_eq!(context.len(), 21);
        assert_eq!(context[1].content, "m10");
        assert_eq!(context[20].content, "m29");
    }
}
