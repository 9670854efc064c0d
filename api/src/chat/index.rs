use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    errors::MessagingError,
    schemas::{ConversationKey, ConversationRecord, Message},
};
use crate::auth::schemas::Role;

/// Derived conversation aggregates, one per conversation key.
#[async_trait]
pub trait ConversationIndex: Send + Sync {
    /// Creates the conversation for the message's key if needed, then folds the
    /// message in. Never creates a conversation with a single participant.
    async fn upsert_from_message(
        &self,
        message: &Message,
    ) -> Result<ConversationRecord, MessagingError>;

    async fn find_by_key(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationRecord>, MessagingError>;

    async fn get(&self, conversation_id: &str)
    -> Result<Option<ConversationRecord>, MessagingError>;

    /// Most recent activity first.
    async fn list_for_participant(
        &self,
        participant_id: &str,
        role: Role,
    ) -> Result<Vec<ConversationRecord>, MessagingError>;

    async fn set_unread(
        &self,
        conversation_id: &str,
        participant_id: &str,
        count: u64,
    ) -> Result<(), MessagingError>;
}

pub(crate) fn check_not_self_conversation(message: &Message) -> Result<(), MessagingError> {
    if ConversationKey::for_message(message).is_self_conversation() {
        return Err(MessagingError::validation(
            "A conversation needs two distinct participants",
        ));
    }
    Ok(())
}

pub(crate) fn sort_by_recent_activity(records: &mut [ConversationRecord]) {
    records.sort_by(|a, b| {
        let a_seq = a.last_message.as_ref().map_or(0, |m| m.sequence);
        let b_seq = b.last_message.as_ref().map_or(0, |m| m.sequence);
        b.updated_at.cmp(&a.updated_at).then(b_seq.cmp(&a_seq))
    });
}

#[derive(Default)]
struct MemoryConversations {
    records: HashMap<String, ConversationRecord>,
    id_to_key: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryConversationIndex {
    inner: RwLock<MemoryConversations>,
}

impl MemoryConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationIndex for MemoryConversationIndex {
    async fn upsert_from_message(
        &self,
        message: &Message,
    ) -> Result<ConversationRecord, MessagingError> {
        check_not_self_conversation(message)?;

        let mut inner = self.inner.write().await;
        let inner = &mut *inner;

        let record = inner
            .records
            .entry(message.conversation_key.clone())
            .or_insert_with(|| {
                let record = ConversationRecord::seed(Uuid::new_v4().to_string(), message);
                inner
                    .id_to_key
                    .insert(record.conversation_id.clone(), record.conversation_key.clone());
                record
            });
        record.apply_message(message);

        Ok(record.clone())
    }

    async fn find_by_key(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationRecord>, MessagingError> {
        let inner = self.inner.read().await;
        Ok(inner.records.get(&key.digest()).cloned())
    }

    async fn get(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, MessagingError> {
        let inner = self.inner.read().await;
        Ok(inner
            .id_to_key
            .get(conversation_id)
            .and_then(|key| inner.records.get(key))
            .cloned())
    }

    async fn list_for_participant(
        &self,
        participant_id: &str,
        role: Role,
    ) -> Result<Vec<ConversationRecord>, MessagingError> {
        let inner = self.inner.read().await;

        let mut records: Vec<ConversationRecord> = inner
            .records
            .values()
            .filter(|record| record.has_member(participant_id, role))
            .cloned()
            .collect();
        sort_by_recent_activity(&mut records);

        Ok(records)
    }

    async fn set_unread(
        &self,
        conversation_id: &str,
        participant_id: &str,
        count: u64,
    ) -> Result<(), MessagingError> {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;

        let Some(record) = inner
            .id_to_key
            .get(conversation_id)
            .and_then(|key| inner.records.get_mut(key))
        else {
            return Err(MessagingError::NotFound("Conversation not found".to_string()));
        };

        if let Some(member) = record
            .participants
            .iter_mut()
            .find(|m| m.id == participant_id)
        {
            member.unread_count = count;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::schemas::Participant;
    use crate::chat::schemas::MessageDraft;
    use chrono::{Duration, Utc};

    fn message(
        sequence: i64,
        sender: (&str, Role),
        receiver: (&str, Role),
        offset_secs: i64,
    ) -> Message {
        MessageDraft {
            sender: Participant::new(sender.0, format!("{} name", sender.0), sender.1),
            receiver: Participant::new(receiver.0, format!("{} name", receiver.0), receiver.1),
            content: format!("message {}", sequence),
            timestamp: Some(Utc::now() + Duration::seconds(offset_secs)),
            listing_id: Some("thor".to_string()),
            listing_name: Some("Thor".to_string()),
            application_id: None,
            client_token: None,
        }
        .into_message(format!("m{}", sequence), sequence, Utc::now())
        .unwrap()
    }

    const U1: (&str, Role) = ("u1", Role::Adopter);
    const U2: (&str, Role) = ("u2", Role::Adopter);
    const S1: (&str, Role) = ("s1", Role::Shelter);

    #[tokio::test]
    async fn one_record_per_key_in_either_direction() {
        let index = MemoryConversationIndex::new();
        let first = index
            .upsert_from_message(&message(1, U1, S1, 0))
            .await
            .unwrap();
        let reply = index
            .upsert_from_message(&message(2, S1, U1, 1))
            .await
            .unwrap();

        assert_eq!(first.conversation_id, reply.conversation_id);
        assert_eq!(reply.created_at, first.created_at);
        assert_eq!(reply.last_message.as_ref().unwrap().message_id, "m2");
        assert_eq!(reply.unread_for("u1"), 1);
        assert_eq!(reply.unread_for("s1"), 1);

        let by_id = index.get(&first.conversation_id).await.unwrap().unwrap();
        assert_eq!(by_id, reply);
        let by_key = index
            .find_by_key(&ConversationKey::new("s1", "u1", Some("thor"), None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.conversation_id, first.conversation_id);
    }

    #[tokio::test]
    async fn listing_filters_by_role_and_orders_by_activity() {
        let index = MemoryConversationIndex::new();
        let older = index
            .upsert_from_message(&message(1, U1, S1, 0))
            .await
            .unwrap();
        let newer = index
            .upsert_from_message(&message(2, U2, S1, 5))
            .await
            .unwrap();

        let listed = index.list_for_participant("s1", Role::Shelter).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.conversation_id.as_str()).collect();
        assert_eq!(ids, [newer.conversation_id.as_str(), older.conversation_id.as_str()]);

        assert!(
            index
                .list_for_participant("s1", Role::Adopter)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            index
                .list_for_participant("u1", Role::Adopter)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let index = MemoryConversationIndex::new();
        let mut forged = message(1, U1, S1, 0);
        forged.receiver_id = "u1".to_string();

        assert!(matches!(
            index.upsert_from_message(&forged).await,
            Err(MessagingError::Validation(_))
        ));
        assert!(index.list_for_participant("u1", Role::Adopter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_unread_targets_one_member() {
        let index = MemoryConversationIndex::new();
        let record = index
            .upsert_from_message(&message(1, U1, S1, 0))
            .await
            .unwrap();

        index.set_unread(&record.conversation_id, "s1", 0).await.unwrap();
        let record = index.get(&record.conversation_id).await.unwrap().unwrap();
        assert_eq!(record.unread_for("s1"), 0);

        assert!(matches!(
            index.set_unread("missing", "s1", 0).await,
            Err(MessagingError::NotFound(_))
        ));
    }
}
