use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub uid: String,
    pub full_name: String,
    /// Push delivery token registered by the user's device, if any
    #[serde(default)]
    pub device_token: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            full_name: full_name.into(),
            device_token: None,
        }
    }

    pub fn with_device_token(mut self, token: impl Into<String>) -> Self {
        self.device_token = Some(token.into());
        self
    }
}
