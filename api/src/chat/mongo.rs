use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{Bson, doc, to_bson, to_document},
    error::{ErrorKind, WriteFailure},
    options::{ClientOptions, IndexOptions, ReturnDocument},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    errors::MessagingError,
    index::{ConversationIndex, check_not_self_conversation},
    schemas::{ConversationKey, ConversationRecord, Message, MessageDraft},
    store::MessageStore,
};
use crate::auth::schemas::Role;

pub const COLLECTIONS_MESSAGES: &str = "messages";
pub const COLLECTIONS_CONVERSATIONS: &str = "conversations";
pub const COLLECTIONS_COUNTERS: &str = "counters";

const MESSAGE_SEQUENCE_COUNTER: &str = "message_sequence";
const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Serialize, Deserialize)]
struct Counter {
    #[serde(rename = "_id")]
    id: String,
    value: i64,
}

pub async fn connect(uri: &str, database_name: &str) -> Result<Database, MessagingError> {
    let client_options = ClientOptions::parse(uri).await?;
    let client = Client::with_options(client_options)?;
    Ok(client.database(database_name))
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Command(command_error) => command_error.code == DUPLICATE_KEY_CODE,
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY_CODE
        }
        _ => false,
    }
}

pub struct MongoMessageStore {
    messages: Collection<Message>,
    counters: Collection<Counter>,
}

impl MongoMessageStore {
    pub fn new(database: &Database) -> Self {
        Self {
            messages: database.collection(COLLECTIONS_MESSAGES),
            counters: database.collection(COLLECTIONS_COUNTERS),
        }
    }

    pub async fn ensure_indexes(&self) -> Result<(), MessagingError> {
        self.messages
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "conversation_key": 1, "timestamp": 1, "sequence": 1 })
                    .build(),
            )
            .await?;

        self.messages
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "sender_id": 1, "client_token": 1 })
                    .options(
                        IndexOptions::builder()
                            .unique(true)
                            .partial_filter_expression(doc! { "client_token": { "$exists": true } })
                            .build(),
                    )
                    .build(),
            )
            .await?;

        info!(collection = COLLECTIONS_MESSAGES, "Message indexes ensured");
        Ok(())
    }

    async fn next_sequence(&self) -> Result<i64, MessagingError> {
        let counter = self
            .counters
            .find_one_and_update(
                doc! { "_id": MESSAGE_SEQUENCE_COUNTER },
                doc! { "$inc": { "value": 1_i64 } },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| {
                MessagingError::TransientStore("Sequence counter unavailable".to_string())
            })?;

        Ok(counter.value)
    }
}

#[async_trait]
impl MessageStore for MongoMessageStore {
    async fn append(&self, draft: MessageDraft) -> Result<Message, MessagingError> {
        draft.validate()?;

        if let Some(token) = &draft.client_token {
            if let Some(existing) = self.find_by_client_token(&draft.sender.id, token).await? {
                debug!(message_id = %existing.message_id, "Replayed client token");
                return Ok(existing);
            }
        }

        let sequence = self.next_sequence().await?;
        let message = draft.into_message(Uuid::new_v4().to_string(), sequence, Utc::now())?;

        match self.messages.insert_one(&message).await {
            Ok(_) => Ok(message),
            Err(err) if is_duplicate_key(&err) => {
                let token = message.client_token.as_deref().unwrap_or_default();
                self.find_by_client_token(&message.sender_id, token)
                    .await?
                    .ok_or_else(|| MessagingError::Conflict("Duplicate message".to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_by_client_token(
        &self,
        sender_id: &str,
        client_token: &str,
    ) -> Result<Option<Message>, MessagingError> {
        Ok(self
            .messages
            .find_one(doc! { "sender_id": sender_id, "client_token": client_token })
            .await?)
    }

    async fn list_by_conversation_key(
        &self,
        key: &ConversationKey,
    ) -> Result<Vec<Message>, MessagingError> {
        let cursor = self
            .messages
            .find(doc! { "conversation_key": key.digest() })
            .sort(doc! { "timestamp": 1, "sequence": 1 })
            .await?;

        Ok(cursor.try_collect().await?)
    }

    async fn mark_read(
        &self,
        receiver_id: &str,
        key: &ConversationKey,
    ) -> Result<u64, MessagingError> {
        let result = self
            .messages
            .update_many(
                doc! {
                    "conversation_key": key.digest(),
                    "receiver_id": receiver_id,
                    "is_read": false
                },
                doc! { "$set": { "is_read": true } },
            )
            .await?;

        Ok(result.modified_count)
    }

    async fn unread_count(
        &self,
        receiver_id: &str,
        key: &ConversationKey,
    ) -> Result<u64, MessagingError> {
        Ok(self
            .messages
            .count_documents(doc! {
                "conversation_key": key.digest(),
                "receiver_id": receiver_id,
                "is_read": false
            })
            .await?)
    }
}

pub struct MongoConversationIndex {
    conversations: Collection<ConversationRecord>,
}

impl MongoConversationIndex {
    pub fn new(database: &Database) -> Self {
        Self {
            conversations: database.collection(COLLECTIONS_CONVERSATIONS),
        }
    }

    pub async fn ensure_indexes(&self) -> Result<(), MessagingError> {
        for keys in [
            doc! { "conversation_key": 1 },
            doc! { "conversation_id": 1 },
        ] {
            self.conversations
                .create_index(
                    IndexModel::builder()
                        .keys(keys)
                        .options(IndexOptions::builder().unique(true).build())
                        .build(),
                )
                .await?;
        }

        self.conversations
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "participants.id": 1, "updated_at": -1 })
                    .build(),
            )
            .await?;

        info!(collection = COLLECTIONS_CONVERSATIONS, "Conversation indexes ensured");
        Ok(())
    }

    /// Inserts the seed document unless the key already exists. Concurrent
    /// creators race on the unique key index; the loser re-reads the winner.
    async fn create_if_absent(&self, message: &Message) -> Result<(), MessagingError> {
        let seed = ConversationRecord::seed(Uuid::new_v4().to_string(), message);
        let mut seed_document = to_document(&seed)?;
        seed_document.remove("conversation_key");

        let created = self
            .conversations
            .find_one_and_update(
                doc! { "conversation_key": &message.conversation_key },
                doc! { "$setOnInsert": seed_document },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => {
                debug!(conversation_key = %message.conversation_key, "Lost creation race");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ConversationIndex for MongoConversationIndex {
    async fn upsert_from_message(
        &self,
        message: &Message,
    ) -> Result<ConversationRecord, MessagingError> {
        check_not_self_conversation(message)?;
        self.create_if_absent(message).await?;

        let key = &message.conversation_key;
        let timestamp = message.timestamp.timestamp_millis();

        self.conversations
            .update_one(
                doc! {
                    "conversation_key": key,
                    "$or": [
                        { "last_message": Bson::Null },
                        { "last_message.timestamp": { "$lt": timestamp } },
                        {
                            "last_message.timestamp": timestamp,
                            "last_message.sequence": { "$lt": message.sequence }
                        }
                    ]
                },
                doc! {
                    "$set": {
                        "last_message": to_bson(message)?,
                        "updated_at": timestamp
                    }
                },
            )
            .await?;

        self.conversations
            .update_one(
                doc! { "conversation_key": key },
                doc! {
                    "$inc": { "participants.$[receiver].unread_count": 1_i64 },
                    "$set": {
                        "participants.$[sender].display_name": &message.sender_name,
                        "participants.$[receiver].display_name": &message.receiver_name
                    }
                },
            )
            .array_filters(vec![
                doc! { "sender.id": &message.sender_id },
                doc! { "receiver.id": &message.receiver_id },
            ])
            .await?;

        if let Some(listing_name) = &message.listing_name {
            self.conversations
                .update_one(
                    doc! { "conversation_key": key, "listing_name": Bson::Null },
                    doc! { "$set": { "listing_name": listing_name } },
                )
                .await?;
        }

        self.conversations
            .find_one(doc! { "conversation_key": key })
            .await?
            .ok_or_else(|| MessagingError::Conflict("Conversation vanished during update".to_string()))
    }

    async fn find_by_key(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationRecord>, MessagingError> {
        Ok(self
            .conversations
            .find_one(doc! { "conversation_key": key.digest() })
            .await?)
    }

    async fn get(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, MessagingError> {
        Ok(self
            .conversations
            .find_one(doc! { "conversation_id": conversation_id })
            .await?)
    }

    async fn list_for_participant(
        &self,
        participant_id: &str,
        role: Role,
    ) -> Result<Vec<ConversationRecord>, MessagingError> {
        let cursor = self
            .conversations
            .find(doc! {
                "participants": {
                    "$elemMatch": { "id": participant_id, "role": role.as_str() }
                }
            })
            .sort(doc! { "updated_at": -1, "last_message.sequence": -1 })
            .await?;

        Ok(cursor.try_collect().await?)
    }

    async fn set_unread(
        &self,
        conversation_id: &str,
        participant_id: &str,
        count: u64,
    ) -> Result<(), MessagingError> {
        let count = i64::try_from(count)
            .map_err(|_| MessagingError::validation("Unread count out of range"))?;

        let result = self
            .conversations
            .update_one(
                doc! { "conversation_id": conversation_id, "participants.id": participant_id },
                doc! { "$set": { "participants.$.unread_count": count } },
            )
            .await?;

        if result.matched_count == 0 && self.get(conversation_id).await?.is_none() {
            return Err(MessagingError::NotFound("Conversation not found".to_string()));
        }

        Ok(())
    }
}
