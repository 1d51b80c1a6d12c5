use serde::{Deserialize, Serialize};
use uuid::Uuid;

// User identity = stable account identifier issued by the auth backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one call attempt (one signaling record).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Display data for one party, captured when the call is placed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: UserId,
    pub name: String,
    pub photo: String,
}

impl Profile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, photo: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
            photo: photo.into(),
        }
    }
}

/// Which side of the call this party is on.
///
/// Decides the record fields a party may write: the caller owns `offer` and
/// `callerCandidates`, the receiver owns `answer` and `receiverCandidates`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Receiver,
}

impl CallRole {
    pub fn remote(self) -> Self {
        match self {
            Self::Caller => Self::Receiver,
            Self::Receiver => Self::Caller,
        }
    }
}

impl std::fmt::Display for CallRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Caller => write!(f, "caller"),
            Self::Receiver => write!(f, "receiver"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_short() {
        let id = UserId::new("u-1234567890");
        assert_eq!(id.short(), "u-123456");
        assert_eq!(UserId::new("abc").short(), "abc");
    }

    #[test]
    fn test_call_id_parse() {
        let id = CallId::new();
        let parsed = CallId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(CallId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_role_remote() {
        assert_eq!(CallRole::Caller.remote(), CallRole::Receiver);
        assert_eq!(CallRole::Receiver.remote(), CallRole::Caller);
    }
}
