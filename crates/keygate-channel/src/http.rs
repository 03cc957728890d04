use std::time::Duration;

use bytes::Bytes;

use keygate_common::Headers;

const VALIDATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Long-lived HTTP client shared by every channel's key validation; probe
/// traffic never competes for the per-request continuation clients.
#[derive(Clone)]
pub struct ValidationHttp {
    client: wreq::Client,
}

impl ValidationHttp {
    pub fn new() -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(VALIDATION_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    pub async fn post_json(
        &self,
        url: &str,
        headers: &Headers,
        body: Bytes,
    ) -> Result<(u16, Bytes), String> {
        let mut builder = self.client.post(url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let response = builder
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|err| err.to_string())?;
        Ok((status, body))
    }
}
