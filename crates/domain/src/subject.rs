use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use taskgate_core::AppError;

/// A permission subject named by policy rules and approval requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Subject {
    /// Matches every user (`user:*`).
    AnyUser,
    /// Matches exactly one user id (`user:<id>`).
    User(String),
    /// Matches members of one provider-scoped group (`group:<provider>:<id>`).
    Group {
        /// Chat provider that owns the group.
        provider: String,
        /// Provider-scoped group identifier.
        group_id: String,
    },
}

impl Subject {
    /// Creates a user subject.
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::User(user_id.into())
    }

    /// Creates a group subject.
    #[must_use]
    pub fn group(provider: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self::Group {
            provider: provider.into(),
            group_id: group_id.into(),
        }
    }
}

impl Display for Subject {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnyUser => write!(formatter, "user:*"),
            Self::User(user_id) => write!(formatter, "user:{user_id}"),
            Self::Group { provider, group_id } => {
                write!(formatter, "group:{provider}:{group_id}")
            }
        }
    }
}

impl FromStr for Subject {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "user:*" {
            return Ok(Self::AnyUser);
        }

        if let Some(user_id) = value.strip_prefix("user:") {
            if user_id.is_empty() {
                return Err(AppError::Validation(
                    "user subject id must not be empty".to_owned(),
                ));
            }
            return Ok(Self::User(user_id.to_owned()));
        }

        if let Some(rest) = value.strip_prefix("group:") {
            let (provider, group_id) = rest.split_once(':').ok_or_else(|| {
                AppError::Validation(format!(
                    "group subject '{value}' must use the form 'group:<provider>:<group_id>'"
                ))
            })?;

            if provider.is_empty() || group_id.is_empty() {
                return Err(AppError::Validation(format!(
                    "group subject '{value}' must carry a provider and a group id"
                )));
            }

            return Ok(Self::Group {
                provider: provider.to_owned(),
                group_id: group_id.to_owned(),
            });
        }

        Err(AppError::Validation(format!(
            "unknown subject value '{value}'"
        )))
    }
}

impl TryFrom<String> for Subject {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(value.as_str())
    }
}

impl From<Subject> for String {
    fn from(value: Subject) -> Self {
        value.to_string()
    }
}
