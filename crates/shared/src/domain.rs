use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

pub const TEMP_MESSAGE_ID_PREFIX: &str = "temp-";

impl MessageId {
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_MESSAGE_ID_PREFIX)
    }
}

/// Delivery lifecycle of a message. Ordering follows the lifecycle, so
/// `max` never regresses a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn from_flags(delivered: bool, read: bool) -> Self {
        if read {
            Self::Read
        } else if delivered {
            Self::Delivered
        } else {
            Self::Sent
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Idle,
    RingingOut,
    RingingIn,
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default, alias = "username")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactPresence {
    pub user_id: UserId,
    pub name: Option<String>,
    pub online: bool,
}
