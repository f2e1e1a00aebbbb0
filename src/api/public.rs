use rocket::{serde::json::Json, Route, State};

use crate::{
    error::Result,
    model::{api::candidate::CandidateView, tally::Tally},
    service::VotingService,
};

pub fn routes() -> Vec<Route> {
    routes![positions, candidates, tally]
}

#[get("/positions")]
async fn positions(service: &State<VotingService>) -> Json<Vec<String>> {
    Json(service.positions().to_vec())
}

#[get("/positions/<position>/candidates")]
async fn candidates(
    position: &str,
    service: &State<VotingService>,
) -> Result<Json<Vec<CandidateView>>> {
    Ok(Json(service.candidates(position)?))
}

#[get("/tally")]
async fn tally(service: &State<VotingService>) -> Result<Json<Tally>> {
    Ok(Json(service.tally().await?))
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
            api::{
                session::{SignInRequest, SignInResponse},
                vote::VoteRequest,
            },
            fingerprint::Fingerprint,
        },
    };

    use super::*;

    #[backend_test]
    async fn list_positions(client: Client) {
        let response = client.get(uri!(positions)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let positions = response.into_json::<Vec<String>>().await.unwrap();
        assert_eq!(
            positions,
            ["President", "Vice President", "Senate President", "Treasurer"]
        );
    }

    #[backend_test]
    async fn list_candidates(client: Client) {
        let response = client
            .get(uri!(candidates("Vice President")))
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let candidates = response.into_json::<Vec<CandidateView>>().await.unwrap();
        let ids = candidates.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["c3", "c4"]);
        assert!(candidates.iter().all(|c| c.position == "Vice President"));
    }

    #[backend_test]
    async fn candidates_for_unknown_position(client: Client) {
        let response = client.get(uri!(candidates("Secretary"))).dispatch().await;
        assert_eq!(Status::NotFound, response.status());
    }

    #[backend_test]
    async fn tally_before_any_votes(client: Client) {
        let response = client.get(uri!(tally)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let tally = response.into_json::<Value>().await.unwrap();

        assert_eq!(tally["total_valid_votes"], 0);
        let positions = tally["vote_counts"].as_array().unwrap();
        assert_eq!(positions.len(), 4);
        for position in positions {
            let results = position["results"].as_array().unwrap();
            assert_eq!(results.len(), 2);
            assert!(results.iter().all(|r| r["count"] == 0));
        }
    }

    #[backend_test(voter)]
    async fn tally_counts_each_vote_once(client: Client, session: SignInResponse) {
        let vote = VoteRequest {
            session: session.credentials(&SignInRequest::example()),
            candidate_id: "c2".to_string(),
            position: "President".to_string(),
        };
        for _ in 0..2 {
            client
                .post(uri!(crate::api::voting::cast_vote))
                .header(ContentType::JSON)
                .body(json!(vote).to_string())
                .fingerprint(&Fingerprint::example())
                .dispatch()
                .await;
        }

        let tally = client
            .get(uri!(tally))
            .dispatch()
            .await
            .into_json::<Value>()
            .await
            .unwrap();
        assert_eq!(tally["total_valid_votes"], 1);
        let president = &tally["vote_counts"][0];
        assert_eq!(president["position"], "President");
        assert_eq!(president["results"][0]["candidate_id"], "c2");
        assert_eq!(president["results"][0]["count"], 1);
        assert_eq!(president["results"][1]["count"], 0);
    }
}
