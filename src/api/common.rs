use std::convert::Infallible;

use rocket::{
    request::{FromRequest, Outcome},
    Request,
};

use crate::model::fingerprint::Fingerprint;

/// Stable per-install identifier sent by the voting client.
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";
/// Browser fingerprint computed by the voting client.
pub const BROWSER_SIGNATURE_HEADER: &str = "X-Browser-Signature";

/// Extract the fingerprint of the calling device. Missing headers or an
/// unknown client address just leave the corresponding signal empty.
#[rocket::async_trait]
impl<'r> FromRequest<'r> for Fingerprint {
    type Error = Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let header = |name| {
            req.headers()
                .get_one(name)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(String::from)
        };
        Outcome::Success(Fingerprint {
            device_id: header(DEVICE_ID_HEADER),
            browser_signature: header(BROWSER_SIGNATURE_HEADER),
            network: req.client_ip().map(|ip| ip.to_string()),
        })
    }
}
