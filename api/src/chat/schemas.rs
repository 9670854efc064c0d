use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::MessagingError;
use crate::auth::schemas::{Participant, Role, is_valid_display_name, is_valid_identifier};

pub const MAX_MESSAGE_LENGTH: usize = 4000;

/// Unordered participant pair plus the optional listing/application context.
/// Participant ids are kept sorted so `new(a, b, ..) == new(b, a, ..)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    participant_ids: [String; 2],
    listing_id: Option<String>,
    application_id: Option<String>,
}

impl ConversationKey {
    pub fn new(
        participant_a: &str,
        participant_b: &str,
        listing_id: Option<&str>,
        application_id: Option<&str>,
    ) -> Self {
        let (low, high) = if participant_a <= participant_b {
            (participant_a, participant_b)
        } else {
            (participant_b, participant_a)
        };

        Self {
            participant_ids: [low.to_string(), high.to_string()],
            listing_id: listing_id.map(str::to_string),
            application_id: application_id.map(str::to_string),
        }
    }

    pub fn for_message(message: &Message) -> Self {
        Self::new(
            &message.sender_id,
            &message.receiver_id,
            message.listing_id.as_deref(),
            message.application_id.as_deref(),
        )
    }

    #[inline]
    pub fn is_self_conversation(&self) -> bool {
        self.participant_ids[0] == self.participant_ids[1]
    }

    /// Hex SHA-256 over length-prefixed components, stable across processes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::default();
        for id in &self.participant_ids {
            hasher.update(format!("{}:{}|", id.len(), id).as_bytes());
        }
        for part in [&self.listing_id, &self.application_id] {
            match part {
                Some(value) => hasher.update(format!("1:{}:{}|", value.len(), value).as_bytes()),
                None => hasher.update(b"0|"),
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A message as submitted, before the store assigns identity and ordering.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender: Participant,
    pub receiver: Participant,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub listing_id: Option<String>,
    pub listing_name: Option<String>,
    pub application_id: Option<String>,
    pub client_token: Option<String>,
}

impl MessageDraft {
    pub fn validate(&self) -> Result<(), MessagingError> {
        let content = self.content.trim();
        if content.is_empty() {
            return Err(MessagingError::validation("Message content cannot be empty"));
        }

        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(MessagingError::validation(format!(
                "Message cannot exceed {} characters",
                MAX_MESSAGE_LENGTH
            )));
        }

        if !is_valid_identifier(&self.sender.id) || !is_valid_identifier(&self.receiver.id) {
            return Err(MessagingError::validation("Malformed participant id"));
        }

        if self.sender.id == self.receiver.id {
            return Err(MessagingError::validation(
                "Cannot send a message to yourself",
            ));
        }

        if !is_valid_display_name(&self.sender.display_name)
            || !is_valid_display_name(&self.receiver.display_name)
        {
            return Err(MessagingError::validation("Malformed participant name"));
        }

        for (label, value) in [
            ("listing id", &self.listing_id),
            ("application id", &self.application_id),
            ("client token", &self.client_token),
        ] {
            if let Some(value) = value {
                if !is_valid_identifier(value) {
                    return Err(MessagingError::validation(format!("Malformed {}", label)));
                }
            }
        }

        Ok(())
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(
            &self.sender.id,
            &self.receiver.id,
            self.listing_id.as_deref(),
            self.application_id.as_deref(),
        )
    }

    /// Validates and stamps the draft. Timestamps are truncated to milliseconds so
    /// every backend orders them identically.
    pub fn into_message(
        self,
        message_id: String,
        sequence: i64,
        now: DateTime<Utc>,
    ) -> Result<Message, MessagingError> {
        self.validate()?;

        let conversation_key = self.conversation_key().digest();
        let timestamp = truncate_to_millis(self.timestamp.unwrap_or(now));

        Ok(Message {
            message_id,
            sequence,
            conversation_key,
            sender_id: self.sender.id,
            sender_name: self.sender.display_name.trim().to_string(),
            sender_role: self.sender.role,
            receiver_id: self.receiver.id,
            receiver_name: self.receiver.display_name.trim().to_string(),
            receiver_role: self.receiver.role,
            content: self.content.trim().to_string(),
            timestamp,
            is_read: false,
            listing_id: self.listing_id,
            listing_name: self.listing_name,
            application_id: self.application_id,
            client_token: self.client_token,
        })
    }
}

#[inline]
pub fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(timestamp.timestamp_millis())
        .single()
        .unwrap_or(timestamp)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub sequence: i64,
    pub conversation_key: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: Role,
    pub receiver_id: String,
    pub receiver_name: String,
    pub receiver_role: Role,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub listing_id: Option<String>,
    pub listing_name: Option<String>,
    pub application_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

impl Message {
    #[inline]
    pub fn sender(&self) -> Participant {
        Participant::new(&self.sender_id, &self.sender_name, self.sender_role)
    }

    #[inline]
    pub fn receiver(&self) -> Participant {
        Participant::new(&self.receiver_id, &self.receiver_name, self.receiver_role)
    }

    /// Thread order: timestamp first, insertion sequence as the tiebreak.
    #[inline]
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.timestamp, self.sequence)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConversationMember {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub unread_count: u64,
}

impl ConversationMember {
    pub fn participant(&self) -> Participant {
        Participant::new(&self.id, &self.display_name, self.role)
    }
}

/// Stored conversation aggregate. Unread counters live per member because the
/// count only makes sense relative to a viewer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub conversation_key: String,
    pub participants: Vec<ConversationMember>,
    pub last_message: Option<Message>,
    pub listing_id: Option<String>,
    pub listing_name: Option<String>,
    pub application_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    /// Seeds a record from the first message of a key. Counters start at zero;
    /// the caller applies the message afterwards like any other.
    pub fn seed(conversation_id: String, message: &Message) -> Self {
        let sender = message.sender();
        let receiver = message.receiver();

        Self {
            conversation_id,
            conversation_key: message.conversation_key.clone(),
            participants: [sender, receiver]
                .into_iter()
                .map(|p| ConversationMember {
                    id: p.id,
                    display_name: p.display_name,
                    role: p.role,
                    unread_count: 0,
                })
                .collect(),
            last_message: None,
            listing_id: message.listing_id.clone(),
            listing_name: message.listing_name.clone(),
            application_id: message.application_id.clone(),
            created_at: message.timestamp,
            updated_at: message.timestamp,
        }
    }

    /// Folds a newly appended message into the aggregate. Member roles are
    /// fixed by `seed`; later messages only refresh display names.
    pub fn apply_message(&mut self, message: &Message) {
        for participant in [message.sender(), message.receiver()] {
            if let Some(member) = self.member_mut(&participant.id) {
                member.display_name = participant.display_name;
            }
        }

        if let Some(receiver) = self.member_mut(&message.receiver_id) {
            receiver.unread_count += 1;
        }

        if self.listing_name.is_none() {
            self.listing_name = message.listing_name.clone();
        }

        if self.supersedes_last(message) {
            self.updated_at = message.timestamp;
            self.last_message = Some(message.clone());
        }
    }

    /// Rejects a draft that names a member under a different role than the one
    /// this conversation was opened with.
    pub fn check_roles(&self, draft: &MessageDraft) -> Result<(), MessagingError> {
        for participant in [&draft.sender, &draft.receiver] {
            if let Some(member) = self.member(&participant.id) {
                if member.role != participant.role {
                    return Err(MessagingError::validation(format!(
                        "{} takes part in this conversation as {}",
                        participant.id, member.role
                    )));
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn supersedes_last(&self, message: &Message) -> bool {
        self.last_message
            .as_ref()
            .is_none_or(|last| message.order_key() > last.order_key())
    }

    pub fn member(&self, participant_id: &str) -> Option<&ConversationMember> {
        self.participants.iter().find(|m| m.id == participant_id)
    }

    fn member_mut(&mut self, participant_id: &str) -> Option<&mut ConversationMember> {
        self.participants.iter_mut().find(|m| m.id == participant_id)
    }

    #[inline]
    pub fn has_member(&self, participant_id: &str, role: Role) -> bool {
        self.participants
            .iter()
            .any(|m| m.id == participant_id && m.role == role)
    }

    /// The counterpart of `viewer_id`, or `None` when the viewer is not a member.
    pub fn other_participant(&self, viewer_id: &str) -> Option<&ConversationMember> {
        self.member(viewer_id)?;
        self.participants.iter().find(|m| m.id != viewer_id)
    }

    pub fn unread_for(&self, viewer_id: &str) -> u64 {
        self.member(viewer_id).map_or(0, |m| m.unread_count)
    }

    pub fn view_for(&self, viewer_id: &str) -> Option<Conversation> {
        let other = self.other_participant(viewer_id)?;

        Some(Conversation {
            conversation_id: self.conversation_id.clone(),
            participants: self.participants.iter().map(|m| m.participant()).collect(),
            other_participant: other.participant(),
            last_message: self.last_message.clone(),
            unread_count: self.unread_for(viewer_id),
            listing_id: self.listing_id.clone(),
            listing_name: self.listing_name.clone(),
            application_id: self.application_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conversation {
    pub conversation_id: String,
    pub participants: Vec<Participant>,
    pub other_participant: Participant,
    pub last_message: Option<Message>,
    pub unread_count: u64,
    pub listing_id: Option<String>,
    pub listing_name: Option<String>,
    pub application_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MessageDay {
    pub date: NaiveDate,
    pub messages: Vec<Message>,
}

/// Splits an ordered thread at UTC midnight.
pub fn group_by_day(messages: Vec<Message>) -> Vec<MessageDay> {
    let mut days: Vec<MessageDay> = Vec::new();

    for message in messages {
        let date = message.timestamp.date_naive();
        match days.last_mut() {
            Some(day) if day.date == date => day.messages.push(message),
            _ => days.push(MessageDay {
                date,
                messages: vec![message],
            }),
        }
    }

    days
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SendMessageRequest {
    pub receiver_id: String,
    pub receiver_role: Role,
    pub receiver_name: Option<String>,
    pub content: String,
    pub listing_id: Option<String>,
    pub listing_name: Option<String>,
    pub application_id: Option<String>,
    pub client_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StartConversationRequest {
    pub recipient: Participant,
    pub content: String,
    pub listing_id: Option<String>,
    pub listing_name: Option<String>,
    pub application_id: Option<String>,
    pub client_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConversationsQuery {
    pub role: Option<Role>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft(sender: &str, receiver: &str, content: &str) -> MessageDraft {
        MessageDraft {
            sender: Participant::new(sender, "Sam", Role::Adopter),
            receiver: Participant::new(receiver, "Happy Paws", Role::Shelter),
            content: content.to_string(),
            timestamp: None,
            listing_id: Some("thor".to_string()),
            listing_name: Some("Thor".to_string()),
            application_id: None,
            client_token: None,
        }
    }

    #[test]
    fn key_is_symmetric() {
        let ab = ConversationKey::new("u1", "s1", Some("thor"), None);
        let ba = ConversationKey::new("s1", "u1", Some("thor"), None);
        assert_eq!(ab, ba);
        assert_eq!(ab.digest(), ba.digest());
    }

    #[test]
    fn key_depends_on_context() {
        let plain = ConversationKey::new("u1", "s1", None, None);
        let listing = ConversationKey::new("u1", "s1", Some("thor"), None);
        let application = ConversationKey::new("u1", "s1", None, Some("thor"));
        assert_ne!(plain.digest(), listing.digest());
        assert_ne!(listing.digest(), application.digest());
    }

    #[test]
    fn key_components_cannot_bleed_into_each_other() {
        let a = ConversationKey::new("ab", "c", None, None);
        let b = ConversationKey::new("a", "bc", None, None);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn whitespace_content_is_rejected() {
        let err = draft("u1", "s1", "   \n\t").validate().unwrap_err();
        assert!(matches!(err, MessagingError::Validation(_)));
    }

    #[test]
    fn self_messaging_is_rejected() {
        let err = draft("u1", "u1", "Hello").validate().unwrap_err();
        assert!(matches!(err, MessagingError::Validation(_)));
    }

    #[test]
    fn oversized_content_is_rejected() {
        let content = "a".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(draft("u1", "s1", &content).validate().is_err());
    }

    #[test]
    fn length_limit_counts_characters() {
        let content = "é".repeat(MAX_MESSAGE_LENGTH);
        assert!(content.len() > MAX_MESSAGE_LENGTH);
        assert!(draft("u1", "s1", &content).validate().is_ok());
    }

    #[test]
    fn into_message_trims_and_truncates() {
        let now = Utc::now();
        let message = draft("u1", "s1", "  Hello  ")
            .into_message("m1".to_string(), 1, now)
            .unwrap();
        assert_eq!(message.content, "Hello");
        assert!(!message.is_read);
        assert_eq!(message.timestamp.timestamp_millis(), now.timestamp_millis());
        assert_eq!(message.timestamp.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(
            message.conversation_key,
            ConversationKey::new("s1", "u1", Some("thor"), None).digest()
        );
    }

    #[test]
    fn older_message_does_not_supersede_last() {
        let now = Utc::now();
        let newer = draft("u1", "s1", "newer")
            .into_message("m2".to_string(), 2, now)
            .unwrap();
        let mut older_draft = draft("s1", "u1", "older");
        older_draft.sender = Participant::new("s1", "Happy Paws", Role::Shelter);
        older_draft.receiver = Participant::new("u1", "Sam", Role::Adopter);
        older_draft.timestamp = Some(now - Duration::seconds(30));
        let older = older_draft.into_message("m3".to_string(), 3, now).unwrap();

        let mut record = ConversationRecord::seed("c1".to_string(), &newer);
        record.apply_message(&newer);
        record.apply_message(&older);

        assert_eq!(record.last_message.as_ref().unwrap().message_id, "m2");
        assert_eq!(record.updated_at, newer.timestamp);
        assert_eq!(record.unread_for("s1"), 1);
        assert_eq!(record.unread_for("u1"), 1);
    }

    #[test]
    fn other_participant_requires_membership() {
        let message = draft("u1", "s1", "Hello")
            .into_message("m1".to_string(), 1, Utc::now())
            .unwrap();
        let record = ConversationRecord::seed("c1".to_string(), &message);

        assert_eq!(record.other_participant("u1").unwrap().id, "s1");
        assert_eq!(record.other_participant("s1").unwrap().id, "u1");
        assert!(record.other_participant("stranger").is_none());
        assert!(record.view_for("stranger").is_none());
    }

    #[test]
    fn member_roles_stay_as_seeded() {
        let opening = draft("u1", "s1", "Hello")
            .into_message("m1".to_string(), 1, Utc::now())
            .unwrap();
        let mut record = ConversationRecord::seed("c1".to_string(), &opening);
        record.apply_message(&opening);

        let mut reply = draft("s1", "u1", "Hi Sam");
        reply.sender = Participant::new("s1", "Happy Paws Rescue", Role::Shelter);
        reply.receiver = Participant::new("u1", "Sam", Role::Shelter);
        assert!(matches!(
            record.check_roles(&reply),
            Err(MessagingError::Validation(_))
        ));

        let reply = reply.into_message("m2".to_string(), 2, Utc::now()).unwrap();
        record.apply_message(&reply);
        assert!(record.has_member("u1", Role::Adopter));
        assert!(!record.has_member("u1", Role::Shelter));
        assert_eq!(record.member("s1").unwrap().display_name, "Happy Paws Rescue");
    }

    #[test]
    fn group_by_day_splits_at_midnight() {
        let base = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 0).unwrap();
        let messages: Vec<Message> = [0, 61, 120]
            .into_iter()
            .enumerate()
            .map(|(i, offset)| {
                let mut d = draft("u1", "s1", "hi");
                d.timestamp = Some(base + Duration::seconds(offset));
                d.into_message(format!("m{}", i), i as i64, base).unwrap()
            })
            .collect();

        let days = group_by_day(messages);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        assert_eq!(days[0].messages.len(), 1);
        assert_eq!(days[1].date, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(days[1].messages.len(), 2);
    }
}
