use rocket::{serde::json::Json, Route, State};

use crate::{
    error::Result,
    model::{
        api::session::{SessionCredentials, SignInRequest, SignInResponse},
        fingerprint::Fingerprint,
    },
    service::VotingService,
};

pub fn routes() -> Vec<Route> {
    routes![sign_in, sign_out]
}

#[post("/auth/sign-in", data = "<request>", format = "json")]
pub async fn sign_in(
    request: Json<SignInRequest>,
    fingerprint: Fingerprint,
    service: &State<VotingService>,
) -> Result<Json<SignInResponse>> {
    Ok(Json(service.sign_in(&request, &fingerprint).await?))
}

#[delete("/auth", data = "<credentials>", format = "json")]
pub async fn sign_out(
    credentials: Json<SessionCredentials>,
    service: &State<VotingService>,
) -> Result<()> {
    service.sign_out(&credentials).await
}

#[cfg(test)]
mod tests {
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::{serde_json::json, Value},
    };

    use crate::{
        api::common::testing::WithFingerprint,
        model::{
            api::vote::VoteRequest,
            store::{MemoryStore, Store},
        },
    };

    use super::*;

    #[backend_test]
    async fn sign_in_valid(client: Client, store: MemoryStore) {
        let response = client
            .post(uri!(sign_in))
            .header(ContentType::JSON)
            .body(json!(SignInRequest::example()).to_string())
            .fingerprint(&Fingerprint::example())
            .dispatch()
            .await;

        assert_eq!(Status::Ok, response.status());
        let session = response.into_json::<SignInResponse>().await.unwrap();
        assert_eq!(session.remaining_positions.len(), 4);
        assert!(!session.session_token.is_empty());

        // Only a hash of the token is kept.
        let voter = store
            .voter_by_institutional_email("2203sen001@inst.edu")
            .await
            .unwrap()
            .unwrap();
        let stored = voter.session.as_ref().unwrap();
        assert_ne!(stored.token_hash, session.session_token);
    }

    #[backend_test]
    async fn sign_in_invalid(client: Client, store: MemoryStore) {
        let mut request = SignInRequest::example();
        request.institutional_email = "2203sen001@gmail.com".to_string();
        let response = client
            .post(uri!(sign_in))
            .header(ContentType::JSON)
            .body(json!(request).to_string())
            .fingerprint(&Fingerprint::example())
            .dispatch()
            .await;

        assert_eq!(Status::BadRequest, response.status());
        let body = response.into_json::<Value>().await.unwrap();
        assert_eq!(body["error"], "validation_error");
        assert!(store
            .voter_by_personal_email("ada@mail.com")
            .await
            .unwrap()
            .is_none());
    }

    #[backend_test]
    async fn sign_in_malformed(client: Client) {
        let response = client
            .post(uri!(sign_in))
            .header(ContentType::JSON)
            .body(json!({ "institutional_email": "2203sen001@inst.edu" }).to_string())
            .dispatch()
            .await;

        assert_eq!(Status::UnprocessableEntity, response.status());
    }

    #[backend_test(voter)]
    async fn sign_in_from_used_device(client: Client) {
        let response = client
            .post(uri!(sign_in))
            .header(ContentType::JSON)
            .body(json!(SignInRequest::example2()).to_string())
            .fingerprint(&Fingerprint::example())
            .dispatch()
            .await;

        assert_eq!(Status::Forbidden, response.status());
        let body = response.into_json::<Value>().await.unwrap();
        assert_eq!(body["error"], "duplicate_device");
    }

    #[backend_test(voter)]
    async fn sign_in_from_used_network(client: Client) {
        let shared_network = Fingerprint {
            network: Fingerprint::example().network,
            ..Fingerprint::example2()
        };
        let response = client
            .post(uri!(sign_in))
            .header(ContentType::JSON)
            .body(json!(SignInRequest::example2()).to_string())
            .fingerprint(&shared_network)
            .dispatch()
            .await;

        assert_eq!(Status::Forbidden, response.status());
        let body = response.into_json::<Value>().await.unwrap();
        assert_eq!(body["error"], "duplicate_network");
    }

    #[backend_test(voter)]
    async fn sign_in_with_taken_personal_email(client: Client) {
        let mut request = SignInRequest::example2();
        request.personal_email = SignInRequest::example().personal_email;
        let response = client
            .post(uri!(sign_in))
            .header(ContentType::JSON)
            .body(json!(request).to_string())
            .fingerprint(&Fingerprint::example2())
            .dispatch()
            .await;

        assert_eq!(Status::Forbidden, response.status());
        let body = response.into_json::<Value>().await.unwrap();
        assert_eq!(body["error"], "duplicate_identity");
    }

    #[backend_test(voter)]
    async fn sign_out_ends_session(client: Client, session: SignInResponse) {
        let credentials = session.credentials(&SignInRequest::example());
        let response = client
            .delete(uri!(sign_out))
            .header(ContentType::JSON)
            .body(json!(credentials).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());

        let vote = VoteRequest {
            session: credentials.clone(),
            candidate_id: "c1".to_string(),
            position: "President".to_string(),
        };
        let response = client
            .post(uri!(crate::api::voting::cast_vote))
            .header(ContentType::JSON)
            .body(json!(vote).to_string())
            .fingerprint(&Fingerprint::example())
            .dispatch()
            .await;
        assert_eq!(Status::Unauthorized, response.status());

        // Signing out twice needs a live session.
        let response = client
            .delete(uri!(sign_out))
            .header(ContentType::JSON)
            .body(json!(credentials).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Unauthorized, response.status());
    }
}
