use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const PARTICIPANT_ID_HEADER: &str = "x-participant-id";
pub const PARTICIPANT_NAME_HEADER: &str = "x-participant-name";
pub const PARTICIPANT_ROLE_HEADER: &str = "x-participant-role";

pub const MAX_IDENTIFIER_LENGTH: usize = 128;
pub const MAX_DISPLAY_NAME_LENGTH: usize = 120;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Adopter,
    Shelter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Adopter => "adopter",
            Role::Shelter => "shelter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "adopter" => Ok(Role::Adopter),
            "shelter" => Ok(Role::Shelter),
            other => Err(format!("Unknown participant role: {}", other)),
        }
    }
}

/// Identity reference for an adopter or a shelter. Participants are owned by
/// the identity provider; messaging only keeps copies of these fields.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub role: Role,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }
}

/// Non-empty, bounded, and free of whitespace or control characters.
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LENGTH
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
}

#[inline]
pub fn is_valid_display_name(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && trimmed.len() <= MAX_DISPLAY_NAME_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Shelter".parse::<Role>(), Ok(Role::Shelter));
        assert_eq!(" adopter ".parse::<Role>(), Ok(Role::Adopter));
        assert!("volunteer".parse::<Role>().is_err());
    }

    #[test]
    fn identifiers_reject_whitespace_and_empty() {
        assert!(is_valid_identifier("u1"));
        assert!(is_valid_identifier("shelter-42_north"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("u 1"));
        assert!(!is_valid_identifier("u1\n"));
        assert!(!is_valid_identifier(&"x".repeat(MAX_IDENTIFIER_LENGTH + 1)));
    }
}
