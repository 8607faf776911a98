//! HTTP client for node-to-node messages
//!
//! Every call carries the sender header and the per-request timeout; a
//! timeout is reported exactly like a connection error.

use crate::common::{Error, NodeConfig, Result, FORWARDED_HEADER, SENDER_HEADER};
use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue, Method};
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    config: Arc<NodeConfig>,
}

impl PeerClient {
    pub fn new(config: Arc<NodeConfig>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// This node's address
    pub fn address(&self) -> &str {
        &self.config.node_address
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        address: &str,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = self.config.peer_url(address, path);
        let response = self
            .http
            .post(&url)
            .header(SENDER_HEADER, self.address())
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!("{} returned {}: {}", url, status, detail)));
        }
        Ok(response)
    }

    /// POST a message and decode the reply
    pub async fn call<B, R>(&self, address: &str, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.send(address, path, body).await?;
        Ok(response.json::<R>().await?)
    }

    /// POST a message, ignoring the reply body
    pub async fn notify<B: Serialize + ?Sized>(
        &self,
        address: &str,
        path: &str,
        body: &B,
    ) -> Result<()> {
        self.send(address, path, body).await.map(|_| ())
    }

    /// Send the same message to every address concurrently.
    ///
    /// Results come back in the order of `addresses`; failures are logged
    /// at debug and left to the caller.
    pub async fn broadcast<B>(
        &self,
        addresses: &[String],
        path: &str,
        body: &B,
    ) -> Vec<(String, Result<()>)>
    where
        B: Serialize + ?Sized,
    {
        let calls = addresses.iter().map(|address| async move {
            let res = self.notify(address, path, body).await;
            if let Err(e) = &res {
                tracing::debug!(peer = %address, path, "Peer call failed: {}", e);
            }
            (address.clone(), res)
        });
        join_all(calls).await
    }

    /// Like [`broadcast`](Self::broadcast) but decoding each reply
    pub async fn gather<B, R>(
        &self,
        addresses: &[String],
        path: &str,
        body: &B,
    ) -> Vec<(String, Result<R>)>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let calls = addresses.iter().map(|address| async move {
            let res = self.call::<B, R>(address, path, body).await;
            if let Err(e) = &res {
                tracing::debug!(peer = %address, path, "Peer call failed: {}", e);
            }
            (address.clone(), res)
        });
        join_all(calls).await
    }

    /// Re-issue a client request to `leader`, marking it as forwarded.
    ///
    /// The leader's status and body are returned untouched so the caller
    /// can relay them.
    pub async fn forward(
        &self,
        leader: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<(reqwest::StatusCode, Option<HeaderValue>, Bytes)> {
        let url = self.config.peer_url(leader, path);

        let mut outgoing = headers.clone();
        outgoing.remove(header::HOST);
        outgoing.remove(header::CONTENT_LENGTH);
        if let Ok(me) = HeaderValue::from_str(self.address()) {
            outgoing.insert(FORWARDED_HEADER, me);
        }

        // the leader may legitimately hold a write far longer than a peer call
        let response = self
            .http
            .request(method, &url)
            .timeout(self.config.forward_timeout())
            .headers(outgoing)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let bytes = response.bytes().await?;
        Ok((status, content_type, bytes))
    }
}
