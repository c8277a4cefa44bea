//! User record stored on every shard.

use crate::error::{ShardError, ShardResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
}

impl From<(i64, String, String)> for User {
    fn from((id, name, email): (i64, String, String)) -> Self {
        Self { id, name, email }
    }
}

/// Payload for creating or replacing a user.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
}

impl NewUser {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    pub fn validate(&self) -> ShardResult<()> {
        if self.name.trim().is_empty() {
            return Err(ShardError::invalid_argument("User name cannot be empty"));
        }
        if !self.email.contains('@') {
            return Err(ShardError::invalid_argument(format!(
                "Invalid email address: {}",
                self.email
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_validate() {
        assert!(NewUser::new("Ada", "ada@example.com").validate().is_ok());
        assert!(NewUser::new("  ", "ada@example.com").validate().is_err());
        assert!(NewUser::new("Ada", "not-an-email").validate().is_err());
    }

    #[test]
    fn test_user_from_row_tuple() {
        let user = User::from((7, "Ada".to_string(), "ada@example.com".to_string()));
        assert_eq!(user.id, 7);
        assert_eq!(user.name, "Ada");
    }
}
