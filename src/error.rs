use log::{debug, error};
use rocket::{
    http::{Status, StatusClass},
    response::{self, Responder},
    serde::json::Json,
    Request,
};
use serde::Serialize;
use thiserror::Error;

use crate::model::{
    identity::IdentityField,
    store::{StoreError, Violation},
};

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while signing in, voting, or tallying.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid {field}: {reason}")]
    Validation { field: IdentityField, reason: String },
    #[error("Duplicate identity: {0}")]
    DuplicateIdentity(String),
    #[error("Duplicate device: {0}")]
    DuplicateDevice(String),
    #[error("Duplicate network: {0}")]
    DuplicateNetwork(String),
    #[error("Session expired or invalid, please sign in again")]
    SessionExpired,
    #[error("Already voted for {0}")]
    AlreadyVoted(String),
    #[error("Candidate '{candidate}' is not standing for '{position}'")]
    CandidateMismatch { candidate: String, position: String },
    #[error("Candidate '{0}' not found")]
    CandidateNotFound(String),
    #[error("Too many votes from this network, try again later")]
    RateLimit,
    #[error("Ballot incomplete: voted for {voted} of {required} positions")]
    IncompleteBallot { voted: usize, required: usize },
    #[error("Ballot set invalidated: {0}")]
    DuplicateCompletion(String),
    #[error("Transaction conflict, please retry")]
    TransactionConflict,
    #[error("Store unavailable")]
    StoreUnavailable(#[source] mongodb::error::Error),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(field: IdentityField, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable reason code, sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::DuplicateIdentity(_) => "duplicate_identity",
            Self::DuplicateDevice(_) => "duplicate_device",
            Self::DuplicateNetwork(_) => "duplicate_network",
            Self::SessionExpired => "session_expired",
            Self::AlreadyVoted(_) => "already_voted",
            Self::CandidateMismatch { .. } => "candidate_mismatch",
            Self::CandidateNotFound(_) => "candidate_not_found",
            Self::RateLimit => "rate_limited",
            Self::IncompleteBallot { .. } => "incomplete_ballot",
            Self::DuplicateCompletion(_) => "duplicate_completion",
            Self::TransactionConflict => "transaction_conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::NotFound(_) => "not_found",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Validation { .. } | Self::CandidateMismatch { .. } => Status::BadRequest,
            Self::DuplicateIdentity(_)
            | Self::DuplicateDevice(_)
            | Self::DuplicateNetwork(_)
            | Self::DuplicateCompletion(_) => Status::Forbidden,
            Self::SessionExpired => Status::Unauthorized,
            Self::AlreadyVoted(_) => Status::Conflict,
            Self::CandidateNotFound(_) | Self::NotFound(_) => Status::NotFound,
            Self::RateLimit => Status::TooManyRequests,
            Self::IncompleteBallot { .. } => Status::UnprocessableEntity,
            Self::TransactionConflict => Status::ServiceUnavailable,
            Self::StoreUnavailable(_) => Status::InternalServerError,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => Self::TransactionConflict,
            StoreError::Violation(violation) => violation.into(),
            StoreError::Db(e) => Self::StoreUnavailable(e),
        }
    }
}

impl From<Violation> for Error {
    /// A unique index refused a write. Identity and fingerprint indexes
    /// mean another voter got there first; the remaining indexes only trip
    /// when the same voter races itself, which a retry resolves.
    fn from(violation: Violation) -> Self {
        match violation {
            Violation::PersonalEmail => Self::DuplicateIdentity(
                "personal email is already registered to another student".to_string(),
            ),
            Violation::Signal(kind) => kind.block_error(),
            Violation::CompletionKey => Self::DuplicateDevice(
                "this device has already completed a ballot".to_string(),
            ),
            Violation::InstitutionalEmail | Violation::ValidBallot => Self::TransactionConflict,
        }
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::from(err).into()
    }
}

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let status = self.status();
        if status.class() == StatusClass::ServerError {
            match &self {
                Self::StoreUnavailable(e) => error!("{self}: {e}"),
                _ => error!("{self}"),
            }
        } else {
            debug!("Rejected request: {self}");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).respond_to(req)
    }
}
