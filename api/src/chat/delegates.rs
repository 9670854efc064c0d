use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use super::{
    errors::MessagingError,
    index::ConversationIndex,
    schemas::*,
    store::MessageStore,
};
use crate::auth::schemas::{Participant, Role, is_valid_identifier};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub store_timeout: Duration,
    pub read_retry_attempts: u32,
    pub read_retry_backoff: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(2000),
            read_retry_attempts: 2,
            read_retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Entry point for every messaging operation. Mutations serialize on one write
/// lock so an append and its index update are never interleaved with another.
pub struct MessagingService {
    store: Arc<dyn MessageStore>,
    index: Arc<dyn ConversationIndex>,
    settings: ServiceSettings,
    write_lock: Mutex<()>,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        index: Arc<dyn ConversationIndex>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            index,
            settings,
            write_lock: Mutex::new(()),
        }
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, MessagingError>
    where
        F: Future<Output = Result<T, MessagingError>>,
    {
        match timeout(self.settings.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, "Store call timed out");
                Err(MessagingError::TransientStore(format!(
                    "{} timed out",
                    operation
                )))
            }
        }
    }

    /// For calls that are safe to repeat: reads, and writes of absolute values.
    /// Transient failures back off and retry.
    async fn retried<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, MessagingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MessagingError>>,
    {
        let mut backoff = self.settings.read_retry_backoff;
        let mut attempt = 0;

        loop {
            match self.bounded(operation, call()).await {
                Err(err) if err.is_transient() && attempt < self.settings.read_retry_attempts => {
                    attempt += 1;
                    warn!(operation, attempt, error = %err, "Retrying read");
                    sleep(backoff).await;
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }

    async fn require_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationRecord, MessagingError> {
        if !is_valid_identifier(conversation_id) {
            return Err(MessagingError::validation("Malformed conversation id"));
        }

        self.retried("get_conversation", || self.index.get(conversation_id))
            .await?
            .ok_or_else(|| MessagingError::NotFound("Conversation not found".to_string()))
    }

    fn record_key(record: &ConversationRecord) -> Result<ConversationKey, MessagingError> {
        let [a, b] = record.participants.as_slice() else {
            return Err(MessagingError::Conflict(
                "Conversation does not have exactly two participants".to_string(),
            ));
        };

        Ok(ConversationKey::new(
            &a.id,
            &b.id,
            record.listing_id.as_deref(),
            record.application_id.as_deref(),
        ))
    }

    pub async fn send_message(
        &self,
        request: SendMessageRequest,
        sender: &Participant,
    ) -> Result<Message, MessagingError> {
        let _guard = self.write_lock.lock().await;

        let key = ConversationKey::new(
            &sender.id,
            &request.receiver_id,
            request.listing_id.as_deref(),
            request.application_id.as_deref(),
        );

        let receiver_name = match request.receiver_name.filter(|n| !n.trim().is_empty()) {
            Some(name) => name,
            None => self
                .bounded("find_by_key", self.index.find_by_key(&key))
                .await?
                .and_then(|record| {
                    record
                        .member(&request.receiver_id)
                        .map(|m| m.display_name.clone())
                })
                .unwrap_or_else(|| request.receiver_id.clone()),
        };

        let draft = MessageDraft {
            sender: sender.clone(),
            receiver: Participant::new(request.receiver_id, receiver_name, request.receiver_role),
            content: request.content,
            timestamp: None,
            listing_id: request.listing_id,
            listing_name: request.listing_name,
            application_id: request.application_id,
            client_token: request.client_token,
        };

        self.append_locked(draft).await
    }

    /// Appends a prepared draft. Drafts may carry their own timestamp, which is
    /// how imported history keeps its original ordering.
    pub async fn send_draft(&self, draft: MessageDraft) -> Result<Message, MessagingError> {
        let _guard = self.write_lock.lock().await;
        self.append_locked(draft).await
    }

    async fn append_locked(&self, draft: MessageDraft) -> Result<Message, MessagingError> {
        if let Err(err) = draft.validate() {
            debug!(sender_id = %draft.sender.id, error = %err, "Rejected message");
            return Err(err);
        }

        if let Some(token) = &draft.client_token {
            if let Some(existing) = self
                .retried("find_by_client_token", || {
                    self.store.find_by_client_token(&draft.sender.id, token)
                })
                .await?
            {
                debug!(message_id = %existing.message_id, "Replayed client token");
                self.repair_replayed(&existing).await?;
                return Ok(existing);
            }
        }

        let key = draft.conversation_key();
        if let Some(record) = self
            .retried("find_by_key", || self.index.find_by_key(&key))
            .await?
        {
            if let Err(err) = record.check_roles(&draft) {
                debug!(conversation_id = %record.conversation_id, error = %err, "Rejected message");
                return Err(err);
            }
        }

        let message = self.bounded("append", self.store.append(draft)).await?;

        let record = self
            .bounded("upsert_from_message", self.index.upsert_from_message(&message))
            .await?;

        info!(
            conversation_id = %record.conversation_id,
            message_id = %message.message_id,
            sender_id = %message.sender_id,
            receiver_id = %message.receiver_id,
            "Message sent"
        );

        Ok(message)
    }

    /// A replayed send may follow an attempt whose append landed but whose index
    /// update did not. Folds the stored message in if the index never saw it,
    /// then resets both unread counters from the store.
    async fn repair_replayed(&self, message: &Message) -> Result<(), MessagingError> {
        let key = ConversationKey::for_message(message);

        let record = match self
            .retried("find_by_key", || self.index.find_by_key(&key))
            .await?
        {
            Some(record) if !record.supersedes_last(message) => record,
            _ => {
                warn!(message_id = %message.message_id, "Indexing replayed message");
                self.bounded("upsert_from_message", self.index.upsert_from_message(message))
                    .await?
            }
        };

        for member in &record.participants {
            self.reconcile_unread(&record.conversation_id, &member.id, &key)
                .await?;
        }

        Ok(())
    }

    /// Sets the member's index counter to the store's recount.
    async fn reconcile_unread(
        &self,
        conversation_id: &str,
        participant_id: &str,
        key: &ConversationKey,
    ) -> Result<u64, MessagingError> {
        let remaining = self
            .retried("unread_count", || self.store.unread_count(participant_id, key))
            .await?;
        self.retried("set_unread", || {
            self.index.set_unread(conversation_id, participant_id, remaining)
        })
        .await?;

        Ok(remaining)
    }

    pub async fn get_conversations(
        &self,
        user_id: &str,
        role: Role,
    ) -> Result<Vec<Conversation>, MessagingError> {
        if !is_valid_identifier(user_id) {
            return Err(MessagingError::validation("Malformed participant id"));
        }

        let records = self
            .retried("list_for_participant", || {
                self.index.list_for_participant(user_id, role)
            })
            .await?;

        Ok(records
            .iter()
            .filter_map(|record| record.view_for(user_id))
            .collect())
    }

    pub async fn get_conversation(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<Conversation, MessagingError> {
        self.require_conversation(conversation_id)
            .await?
            .view_for(viewer_id)
            .ok_or_else(|| {
                MessagingError::AccessDenied("Access denied to this conversation".to_string())
            })
    }

    pub async fn ensure_member(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<(), MessagingError> {
        self.get_conversation(conversation_id, viewer_id)
            .await
            .map(|_| ())
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, MessagingError> {
        let record = self.require_conversation(conversation_id).await?;
        let key = Self::record_key(&record)?;

        self.retried("list_by_conversation_key", || {
            self.store.list_by_conversation_key(&key)
        })
        .await
    }

    pub async fn get_message_days(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<MessageDay>, MessagingError> {
        Ok(group_by_day(self.get_messages(conversation_id).await?))
    }

    /// Flips the viewer's unread messages, then resets the viewer's counter to
    /// whatever the store still reports as unread. The counter is reconciled
    /// even when the flip fails, since a timed-out flip may still have landed.
    pub async fn mark_as_read(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<u64, MessagingError> {
        let _guard = self.write_lock.lock().await;

        let record = self.require_conversation(conversation_id).await?;
        let key = Self::record_key(&record)?;

        let flipped = self
            .bounded("mark_read", self.store.mark_read(viewer_id, &key))
            .await;

        if record.member(viewer_id).is_some() {
            self.reconcile_unread(conversation_id, viewer_id, &key)
                .await?;
        }

        let flipped = flipped?;
        if flipped > 0 {
            info!(conversation_id, viewer_id, flipped, "Messages marked as read");
        }

        Ok(flipped)
    }

    pub async fn unread_total(&self, user_id: &str, role: Role) -> Result<u64, MessagingError> {
        Ok(self
            .get_conversations(user_id, role)
            .await?
            .iter()
            .map(|c| c.unread_count)
            .sum())
    }

    /// Sends the opening message for a pair and context. The conversation is
    /// created by that first message, or reused when the key already exists.
    pub async fn start_conversation(
        &self,
        request: StartConversationRequest,
        initiator: &Participant,
    ) -> Result<Conversation, MessagingError> {
        let recipient_id = request.recipient.id.clone();

        let message = self
            .send_message(
                SendMessageRequest {
                    receiver_id: request.recipient.id,
                    receiver_role: request.recipient.role,
                    receiver_name: Some(request.recipient.display_name),
                    content: request.content,
                    listing_id: request.listing_id,
                    listing_name: request.listing_name,
                    application_id: request.application_id,
                    client_token: request.client_token,
                },
                initiator,
            )
            .await?;

        let key = ConversationKey::for_message(&message);
        let record = self
            .retried("find_by_key", || self.index.find_by_key(&key))
            .await?
            .ok_or_else(|| MessagingError::NotFound("Conversation not found".to_string()))?;

        info!(
            conversation_id = %record.conversation_id,
            initiator_id = %initiator.id,
            recipient_id = %recipient_id,
            "Conversation started"
        );

        record.view_for(&initiator.id).ok_or_else(|| {
            MessagingError::Conflict("Initiator missing from conversation".to_string())
        })
    }
}
