//! Shared reqwest plumbing for every blockfs RPC client.

use crate::error::{BlockFsError, ErrorResponse, Result};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Default connection timeout for RPCs.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default request timeout for RPCs.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn build_client(connect_timeout: Duration, request_timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// POST `body` as JSON to `http://{addr}/{endpoint}` and decode the reply.
pub async fn post_json<Req, Resp>(
    client: &Client,
    addr: &str,
    endpoint: &str,
    body: &Req,
) -> Result<Resp>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let response = client
        .post(format!("http://{}/{}", addr, endpoint))
        .json(body)
        .send()
        .await?;
    read_json(response).await
}

pub async fn get_json<Resp: DeserializeOwned>(
    client: &Client,
    addr: &str,
    endpoint: &str,
) -> Result<Resp> {
    let response = client
        .get(format!("http://{}/{}", addr, endpoint))
        .send()
        .await?;
    read_json(response).await
}

pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    if response.status().is_success() {
        return Ok(response.json().await?);
    }
    Err(read_error(response).await)
}

/// Rebuild the server's typed error from its envelope.
pub async fn read_error(response: Response) -> BlockFsError {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => BlockFsError::from_wire(body),
        Err(_) => BlockFsError::Network(format!("unexpected status {}", status)),
    }
}
