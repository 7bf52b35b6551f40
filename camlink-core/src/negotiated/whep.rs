use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::peer::Negotiator;
use crate::error::{check_response, StreamResult};

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// WHEP-style signalling: one POST carrying the offer, the answer in the body
pub struct WhepClient {
    client: reqwest::Client,
}

impl WhepClient {
    pub fn new(timeout: Duration) -> StreamResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Negotiator for WhepClient {
    async fn exchange(&self, endpoint: &Url, offer: &str) -> StreamResult<String> {
        debug!(endpoint = %endpoint, offer_len = offer.len(), "Posting SDP offer");

        let response = self
            .client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer.to_string())
            .send()
            .await?;
        let answer = check_response(response)?.text().await?;

        debug!(endpoint = %endpoint, answer_len = answer.len(), "Received SDP answer");
        Ok(answer)
    }
}
