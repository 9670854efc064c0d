use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    errors::MessagingError,
    schemas::{ConversationKey, Message, MessageDraft},
};

/// Append-and-flag storage for messages. Content never changes after `append`;
/// only `is_read` moves, and only from `false` to `true`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Assigns id, sequence and (when unset) timestamp. A draft carrying a
    /// `client_token` already used by the same sender returns the stored message.
    async fn append(&self, draft: MessageDraft) -> Result<Message, MessagingError>;

    async fn find_by_client_token(
        &self,
        sender_id: &str,
        client_token: &str,
    ) -> Result<Option<Message>, MessagingError>;

    /// Ascending by timestamp, insertion sequence breaking ties.
    async fn list_by_conversation_key(
        &self,
        key: &ConversationKey,
    ) -> Result<Vec<Message>, MessagingError>;

    /// Returns how many messages flipped to read.
    async fn mark_read(
        &self,
        receiver_id: &str,
        key: &ConversationKey,
    ) -> Result<u64, MessagingError>;

    async fn unread_count(
        &self,
        receiver_id: &str,
        key: &ConversationKey,
    ) -> Result<u64, MessagingError>;
}

#[derive(Default)]
struct MemoryMessages {
    by_key: HashMap<String, Vec<Message>>,
    by_token: HashMap<(String, String), (String, usize)>,
    next_sequence: i64,
}

impl MemoryMessages {
    fn lookup_token(&self, token_key: &(String, String)) -> Option<Message> {
        let (key, position) = self.by_token.get(token_key)?;
        self.by_key.get(key)?.get(*position).cloned()
    }
}

#[derive(Default)]
pub struct MemoryMessageStore {
    inner: RwLock<MemoryMessages>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, draft: MessageDraft) -> Result<Message, MessagingError> {
        draft.validate()?;

        let mut inner = self.inner.write().await;

        let token_key = draft
            .client_token
            .as_ref()
            .map(|token| (draft.sender.id.clone(), token.clone()));

        if let Some(existing) = token_key.as_ref().and_then(|k| inner.lookup_token(k)) {
            return Ok(existing);
        }

        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        let message = draft.into_message(Uuid::new_v4().to_string(), sequence, Utc::now())?;

        let thread = inner
            .by_key
            .entry(message.conversation_key.clone())
            .or_default();
        thread.push(message.clone());
        let position = thread.len() - 1;

        if let Some(token_key) = token_key {
            inner
                .by_token
                .insert(token_key, (message.conversation_key.clone(), position));
        }

        Ok(message)
    }

    async fn find_by_client_token(
        &self,
        sender_id: &str,
        client_token: &str,
    ) -> Result<Option<Message>, MessagingError> {
        let inner = self.inner.read().await;
        Ok(inner.lookup_token(&(sender_id.to_string(), client_token.to_string())))
    }

    async fn list_by_conversation_key(
        &self,
        key: &ConversationKey,
    ) -> Result<Vec<Message>, MessagingError> {
        let inner = self.inner.read().await;

        let mut messages = inner
            .by_key
            .get(&key.digest())
            .cloned()
            .unwrap_or_default();
        messages.sort_by_key(Message::order_key);

        Ok(messages)
    }

    async fn mark_read(
        &self,
        receiver_id: &str,
        key: &ConversationKey,
    ) -> Result<u64, MessagingError> {
        let mut inner = self.inner.write().await;

        let Some(thread) = inner.by_key.get_mut(&key.digest()) else {
            return Ok(0);
        };

        let mut flipped = 0;
        for message in thread
            .iter_mut()
            .filter(|m| m.receiver_id == receiver_id && !m.is_read)
        {
            message.is_read = true;
            flipped += 1;
        }

        Ok(flipped)
    }

    async fn unread_count(
        &self,
        receiver_id: &str,
        key: &ConversationKey,
    ) -> Result<u64, MessagingError> {
        let inner = self.inner.read().await;

        Ok(inner.by_key.get(&key.digest()).map_or(0, |thread| {
            thread
                .iter()
                .filter(|m| m.receiver_id == receiver_id && !m.is_read)
                .count() as u64
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::schemas::{Participant, Role};
    use chrono::{DateTime, TimeZone};

    fn draft(sender: &str, receiver: &str, content: &str) -> MessageDraft {
        let role = |id: &str| {
            if id.starts_with('s') {
                Role::Shelter
            } else {
                Role::Adopter
            }
        };
        MessageDraft {
            sender: Participant::new(sender, sender.to_uppercase(), role(sender)),
            receiver: Participant::new(receiver, receiver.to_uppercase(), role(receiver)),
            content: content.to_string(),
            timestamp: None,
            listing_id: Some("thor".to_string()),
            listing_name: Some("Thor".to_string()),
            application_id: None,
            client_token: None,
        }
    }

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).single().unwrap()
    }

    fn key() -> ConversationKey {
        ConversationKey::new("u1", "s1", Some("thor"), None)
    }

    #[tokio::test]
    async fn equal_timestamps_keep_insertion_order() {
        let store = MemoryMessageStore::new();
        for content in ["first", "second", "third"] {
            let mut d = draft("u1", "s1", content);
            d.timestamp = Some(at(1_700_000_000_000));
            store.append(d).await.unwrap();
        }

        let contents: Vec<String> = store
            .list_by_conversation_key(&key())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn listing_sorts_by_timestamp_before_sequence() {
        let store = MemoryMessageStore::new();
        let mut late = draft("u1", "s1", "late");
        late.timestamp = Some(at(2_000));
        let mut early = draft("s1", "u1", "early");
        early.timestamp = Some(at(1_000));
        store.append(late).await.unwrap();
        store.append(early).await.unwrap();

        let messages = store.list_by_conversation_key(&key()).await.unwrap();
        assert_eq!(messages[0].content, "early");
        assert_eq!(messages[1].content, "late");
        assert!(messages[0].sequence > messages[1].sequence);
    }

    #[tokio::test]
    async fn append_rejects_invalid_drafts() {
        let store = MemoryMessageStore::new();
        assert!(matches!(
            store.append(draft("u1", "s1", "   ")).await,
            Err(MessagingError::Validation(_))
        ));
        assert!(matches!(
            store.append(draft("u1", "u1", "Hello")).await,
            Err(MessagingError::Validation(_))
        ));
        assert!(store.list_by_conversation_key(&key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_receiver_scoped() {
        let store = MemoryMessageStore::new();
        store.append(draft("u1", "s1", "Hello")).await.unwrap();
        store.append(draft("u1", "s1", "Anyone?")).await.unwrap();
        store.append(draft("s1", "u1", "Hi!")).await.unwrap();

        assert_eq!(store.mark_read("s1", &key()).await.unwrap(), 2);
        assert_eq!(store.mark_read("s1", &key()).await.unwrap(), 0);
        assert_eq!(store.unread_count("s1", &key()).await.unwrap(), 0);
        assert_eq!(store.unread_count("u1", &key()).await.unwrap(), 1);

        store.append(draft("s1", "u1", "Still there?")).await.unwrap();
        let messages = store.list_by_conversation_key(&key()).await.unwrap();
        assert!(
            messages
                .iter()
                .filter(|m| m.receiver_id == "s1")
                .all(|m| m.is_read)
        );
    }

    #[tokio::test]
    async fn replayed_token_returns_original_message() {
        let store = MemoryMessageStore::new();
        let mut first = draft("u1", "s1", "Hello");
        first.client_token = Some("tok-1".to_string());
        let mut retry = draft("u1", "s1", "Hello");
        retry.client_token = Some("tok-1".to_string());

        let original = store.append(first).await.unwrap();
        let replayed = store.append(retry).await.unwrap();

        assert_eq!(original.message_id, replayed.message_id);
        let found = store.find_by_client_token("u1", "tok-1").await.unwrap();
        assert_eq!(found.map(|m| m.message_id), Some(original.message_id.clone()));
        assert!(store.find_by_client_token("s1", "tok-1").await.unwrap().is_none());
        assert_eq!(store.list_by_conversation_key(&key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_key_lists_nothing() {
        let store = MemoryMessageStore::new();
        let other = ConversationKey::new("u9", "s9", None, None);
        assert!(store.list_by_conversation_key(&other).await.unwrap().is_empty());
        assert_eq!(store.mark_read("s9", &other).await.unwrap(), 0);
    }
}
