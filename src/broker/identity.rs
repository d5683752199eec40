//! # Originating Identity
//!
//! The `X-Broker-API-Originating-Identity` header tells the broker which
//! platform user caused a request.

use crate::constants::ORIGINATING_IDENTITY_PLATFORM;
use crate::crd::UserInfo;
use base64::Engine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginatingIdentity {
    pub platform: String,
    /// JSON document describing the user
    pub value: String,
}

impl OriginatingIdentity {
    /// Build the identity for `user_info`; no user info means no identity
    pub fn from_user_info(
        user_info: Option<&UserInfo>,
    ) -> Result<Option<Self>, serde_json::Error> {
        user_info
            .map(|info| {
                Ok(Self {
                    platform: ORIGINATING_IDENTITY_PLATFORM.to_string(),
                    value: serde_json::to_string(info)?,
                })
            })
            .transpose()
    }

    /// Header value: `<platform> <base64(value)>`
    #[must_use]
    pub fn header_value(&self) -> String {
        format!(
            "{} {}",
            self.platform,
            base64::engine::general_purpose::STANDARD.encode(&self.value)
        )
    }
}
