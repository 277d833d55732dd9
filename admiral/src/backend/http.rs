//! Shared HTTP plumbing for backend adapters.

use bytes::Bytes;
use http::{header::CONTENT_TYPE, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::Serialize;

use crate::error::Error;

/// The client every adapter shares: HTTPS with native roots, plain HTTP
/// allowed for in-cluster sinks.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Builds the shared backend client.
pub fn client() -> Result<HttpClient, Error> {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_native_roots(rustls::crypto::ring::default_provider())
        .map_err(|err| Error::BackendTransport(format!("loading native roots: {err}")))?
        .https_or_http()
        .enable_http1()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// Sends `body` to `url` and returns the response status with its collected
/// body. Transport failures map to [`Error::BackendTransport`]; status
/// classification is left to the caller.
pub async fn send(
    client: &HttpClient,
    method: Method,
    url: &str,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> Result<(StatusCode, String), Error> {
    let mut request = Request::builder().method(method).uri(url);
    if let Some(content_type) = content_type {
        request = request.header(CONTENT_TYPE, content_type);
    }
    let request = request
        .body(Full::new(Bytes::from(body)))
        .map_err(|err| Error::BackendTransport(format!("building request for {url}: {err}")))?;

    let response = client
        .request(request)
        .await
        .map_err(|err| Error::BackendTransport(format!("sending to {url}: {err}")))?;

    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|err| Error::BackendTransport(format!("reading response from {url}: {err}")))?
        .to_bytes();
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

/// Bare GET used by the performance prober.
pub async fn get(client: &HttpClient, url: &str) -> Result<(StatusCode, String), Error> {
    send(client, Method::GET, url, None, Vec::new()).await
}

/// JSON POST helper used by the loki and gchat adapters.
pub async fn post_json<T: Serialize>(
    client: &HttpClient,
    url: &str,
    payload: &T,
) -> Result<(StatusCode, String), Error> {
    let body = serde_json::to_vec(payload)
        .map_err(|err| Error::BackendTransport(format!("serializing payload: {err}")))?;
    send(client, Method::POST, url, Some("application/json"), body).await
}
