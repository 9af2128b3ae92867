//! Wire message schema, per-type validation and sanitization

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{MAX_DISPLAY_NAME_LENGTH, MAX_MESSAGE_CONTENT_LENGTH};
use crate::error::{Result, RustyChatError};
use crate::security::{clean_user_text, contains_html_tag, contains_script_pattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Chat,
    Private,
    System,
    UserList,
    Error,
    Join,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Private => "private",
            Self::System => "system",
            Self::UserList => "user_list",
            Self::Error => "error",
            Self::Join => "join",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single frame of the chat protocol.
///
/// Which optional fields must be present depends on `kind`; see [`Message::validate`].
/// Absent fields are omitted when encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            from: None,
            to: None,
            content: None,
            users: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn join(display_name: impl Into<String>) -> Self {
        Self {
            content: Some(display_name.into()),
            ..Self::empty(MessageType::Join)
        }
    }

    pub fn chat(from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
            content: Some(content.into()),
            ..Self::empty(MessageType::Chat)
        }
    }

    pub fn private(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
            content: Some(content.into()),
            ..Self::empty(MessageType::Private)
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::empty(MessageType::System)
        }
    }

    pub fn user_list(users: Vec<String>) -> Self {
        Self {
            users: Some(users),
            ..Self::empty(MessageType::UserList)
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            error: Some(text.into()),
            ..Self::empty(MessageType::Error)
        }
    }

    /// Replace whatever timestamp the client sent with the server clock
    pub fn stamp(&mut self) {
        self.timestamp = Utc::now();
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RustyChatError::MessageParseError(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check the fields required by this message's type.
    ///
    /// Runs against the raw input; sanitization happens afterwards.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        match self.kind {
            MessageType::Chat => {
                check(Field::Content, self.content.as_deref(), validate_message_content)?;
                check(Field::From, self.from.as_deref(), validate_display_name)?;
            }
            MessageType::Private => {
                check(Field::Content, self.content.as_deref(), validate_message_content)?;
                check(Field::From, self.from.as_deref(), validate_display_name)?;
                check(Field::To, self.to.as_deref(), validate_display_name)?;
                if self.from.as_deref().map(str::trim) == self.to.as_deref().map(str::trim) {
                    return Err(ValidationError::new(Field::To, Rule::SameAsSender));
                }
            }
            MessageType::Join => {
                check(Field::Content, self.content.as_deref(), validate_display_name)?;
            }
            MessageType::Error => {
                if self.error.as_deref().map_or(true, str::is_empty) {
                    return Err(ValidationError::new(Field::Error, Rule::Missing));
                }
            }
            MessageType::UserList => {
                if self.users.is_none() {
                    return Err(ValidationError::new(Field::Users, Rule::Missing));
                }
            }
            MessageType::System => {}
        }
        Ok(())
    }

    /// HTML-escape and trim every user-supplied text field
    pub fn sanitize_input(&mut self) {
        for field in [&mut self.from, &mut self.to, &mut self.content, &mut self.error] {
            if let Some(text) = field.as_mut() {
                *text = clean_user_text(text);
            }
        }

        if let Some(users) = self.users.as_mut() {
            for user in users.iter_mut() {
                *user = clean_user_text(user);
            }
        }
    }
}

fn check(
    field: Field,
    value: Option<&str>,
    rule: fn(&str) -> std::result::Result<(), Rule>,
) -> std::result::Result<(), ValidationError> {
    let value = value.ok_or(ValidationError::new(field, Rule::Missing))?;
    rule(value).map_err(|rule| ValidationError::new(field, rule))
}

/// Rules for display names: 1-50 characters after trimming, no control
/// characters other than tab/LF/CR, no HTML tags, no script URIs.
pub fn validate_display_name(name: &str) -> std::result::Result<(), Rule> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(Rule::Empty);
    }
    if trimmed.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(Rule::TooLong(MAX_DISPLAY_NAME_LENGTH));
    }
    if trimmed
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Err(Rule::ControlCharacters);
    }
    if contains_html_tag(trimmed) {
        return Err(Rule::HtmlTags);
    }
    if contains_script_pattern(trimmed) {
        return Err(Rule::ScriptContent);
    }
    Ok(())
}

/// Rules for chat bodies: 1-1000 characters after trimming
pub fn validate_message_content(content: &str) -> std::result::Result<(), Rule> {
    let trimmed = content.trim();

    if trimmed.is_empty() {
        return Err(Rule::Empty);
    }
    if trimmed.chars().count() > MAX_MESSAGE_CONTENT_LENGTH {
        return Err(Rule::TooLong(MAX_MESSAGE_CONTENT_LENGTH));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    From,
    To,
    Content,
    Users,
    Error,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::From => "from",
            Self::To => "to",
            Self::Content => "content",
            Self::Users => "users",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Missing,
    Empty,
    TooLong(usize),
    ControlCharacters,
    HtmlTags,
    ScriptContent,
    SameAsSender,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "is required"),
            Self::Empty => write!(f, "cannot be empty"),
            Self::TooLong(max) => write!(f, "cannot exceed {} characters", max),
            Self::ControlCharacters => write!(f, "contains invalid control characters"),
            Self::HtmlTags => write!(f, "cannot contain HTML tags"),
            Self::ScriptContent => write!(f, "contains prohibited script content"),
            Self::SameAsSender => write!(f, "cannot send private message to yourself"),
        }
    }
}

/// Which field failed validation and why
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationError {
    pub field: Field,
    pub rule: Rule,
}

impl ValidationError {
    pub fn new(field: Field, rule: Rule) -> Self {
        Self { field, rule }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.rule)
    }
}

impl std::error::Error for ValidationError {}
