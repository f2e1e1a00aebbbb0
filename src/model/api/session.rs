use chrono::{serde::ts_seconds, DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sign-in credentials. Fingerprint signals travel in the request itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInRequest {
    pub institutional_email: String,
    pub personal_email: String,
    pub matric_number: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInResponse {
    pub session_token: String,
    #[serde(with = "ts_seconds")]
    pub expires_at: DateTime<Utc>,
    /// Positions still to vote, in roster order.
    pub remaining_positions: Vec<String>,
}

/// Proof of a live session, carried by every voter request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub session_token: String,
    pub institutional_email: String,
}

#[cfg(test)]
mod examples {
    use super::*;

    impl SignInRequest {
        /// Credentials of `Identity::example()`.
        pub fn example() -> Self {
            Self {
                institutional_email: "2203sen001@inst.edu".to_string(),
                personal_email: "ada@mail.com".to_string(),
                matric_number: "22/03sen001".to_string(),
                full_name: "Ada Okoro".to_string(),
            }
        }

        /// Credentials of `Identity::example2()`.
        pub fn example2() -> Self {
            Self {
                institutional_email: "2203sen002@inst.edu".to_string(),
                personal_email: "bola@mail.com".to_string(),
                matric_number: "22/03sen002".to_string(),
                full_name: "Bola Ade".to_string(),
            }
        }
    }

    impl SignInResponse {
        /// Credentials for further requests by the voter who signed in as `request`.
        pub fn credentials(&self, request: &SignInRequest) -> SessionCredentials {
            SessionCredentials {
                session_token: self.session_token.clone(),
                institutional_email: request.institutional_email.clone(),
            }
        }
    }
}
