use rocket::{serde::json::Json, Route, State};

use crate::{
    error::Result,
    model::{
        api::{
            session::SessionCredentials,
            vote::{CompletionReceipt, VoteReceipt, VoteRequest},
        },
        fingerprint::Fingerprint,
    },
    service::VotingService,
};

pub fn routes() -> Vec<Route> {
    routes![cast_vote, complete_voting]
}

#[post("/votes", data = "<request>", format = "json")]
pub async fn cast_vote(
    request: Json<VoteRequest>,
    fingerprint: Fingerprint,
    service: &State<VotingService>,
) -> Result<Json<VoteReceipt>> {
    Ok(Json(service.cast_vote(&request, &fingerprint).await?))
}

#[post("/votes/complete", data = "<credentials>", format = "json")]
pub async fn complete_voting(
    credentials: Json<SessionCredentials>,
    fingerprint: Fingerprint,
    service: &State<VotingService>,
) -> Result<Json<CompletionReceipt>> {
    Ok(Json(service.complete_voting(&credentials, &fingerprint).await?))
}
