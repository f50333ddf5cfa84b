use crate::acme::error::ProtocolResult;
use crate::acme::object::Nonce;
use reqwest::{ClientBuilder, Method, Request, Response};
use serde::Serialize;
use std::time::{Duration, SystemTime};
use url::Url;

// As per RFC8555 Section 6.1, we should conform both to RFC 7525 and supply the name + version
// of our HTTP library.
const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " reqwest/",
    env!("REQWEST_VERSION"),
    " ( +",
    env!("CARGO_PKG_REPOSITORY"),
    " )"
);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);

const REPLAY_NONCE: &str = "Replay-Nonce";

#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn try_new() -> ProtocolResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        // RFC8555 Section 6.1, "clients SHOULD send an Accept-Language header field in
        // accordance with RFC7231"
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en"),
        );
        let client_builder = ClientBuilder::new()
            // RFC8555 Section 6, "Communications [...] are done over HTTPS [...]", except for test runs where we allow HTTP
            .https_only(!cfg!(test))
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .default_headers(headers)
            // Make TRACE logs available for test or debug builds (still needs to be enabled separately)
            .connection_verbose(cfg!(any(test, debug_assertions)));
        Ok(Self {
            client: client_builder.build()?,
        })
    }

    pub fn extract_nonce(res: &Response) -> Option<Nonce> {
        res.headers()
            .get(REPLAY_NONCE)
            .and_then(|header| header.to_str().ok())
            .and_then(|nonce_value| Nonce::try_from(nonce_value.to_string()).ok())
    }

    pub fn extract_backoff(res: &Response) -> Option<SystemTime> {
        res.headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|header| header.to_str().ok())
            .and_then(parse_retry_after)
    }

    pub fn extract_location(res: &Response) -> Option<Url> {
        res.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|location_str| parse_url(res.url(), location_str))
    }

    async fn execute(&self, req: Request) -> ProtocolResult<Response> {
        Ok(self.client.execute(req).await?)
    }

    pub async fn get(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::GET, url)).await
    }

    pub async fn head(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::HEAD, url)).await
    }

    pub async fn post<T: Serialize + 'static>(&self, url: Url, body: &T) -> ProtocolResult<Response> {
        let request_builder = self.client.post(url);
        // RFC8555 Section 6.2, "[clients] must have the Content-Type header field set
        // to "application/jose+json""
        let request = request_builder
            .header(
                reqwest::header::CONTENT_TYPE,
                reqwest::header::HeaderValue::from_static("application/jose+json"),
            )
            .json(&body)
            .build()?;
        self.execute(request).await
    }
}

fn parse_retry_after(retry_after: &str) -> Option<SystemTime> {
    // As per RFC9110, the Retry-After header either contains a value in seconds, or
    // a Date/Time string.
    if let Ok(seconds) = retry_after.parse::<u64>() {
        let timeout = Duration::from_secs(seconds);
        SystemTime::now().checked_add(timeout)
    } else {
        // Refer to RFC9110 Date/Time format parsing
        httpdate::parse_http_date(retry_after).ok()
    }
}

fn parse_url(base_url: &Url, raw_url: &str) -> Option<Url> {
    // Location may be relative (RFC 7231), joining resolves both forms
    base_url.join(raw_url).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn server_url(server: &mockito::ServerGuard, path: &str) -> Url {
        Url::parse(&server.url()).unwrap().join(path).unwrap()
    }

    #[test]
    fn test_try_new() {
        let _ = HttpClient::try_new().unwrap();
    }

    #[tokio::test]
    async fn test_sends_user_agent_and_accept_language() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("HEAD", "/")
            .match_header("user-agent", USER_AGENT)
            .match_header("accept-language", "en")
            .with_status(200)
            .create_async()
            .await;
        let mock_get = server
            .mock("GET", "/")
            .match_header("user-agent", USER_AGENT)
            .match_header("accept-language", "en")
            .with_status(200)
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        client.head(server_url(&server, "/")).await.unwrap();
        client.get(server_url(&server, "/")).await.unwrap();

        mock.assert_async().await;
        mock_get.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_sends_content_type() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("content-type", "application/jose+json")
            .match_header("user-agent", USER_AGENT)
            .with_status(200)
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        client.post(server_url(&server, "/"), &()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_extract_nonce() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/valid")
            .with_status(200)
            .with_header(REPLAY_NONCE, "nonceValue")
            .create_async()
            .await;
        server
            .mock("HEAD", "/invalid")
            .with_status(200)
            .with_header(REPLAY_NONCE, "!invalid-nonce!")
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        let response = client.head(server_url(&server, "/valid")).await.unwrap();
        let nonce = HttpClient::extract_nonce(&response).expect("No nonce found");
        assert_eq!(nonce.to_string(), "nonceValue");

        let response = client.head(server_url(&server, "/invalid")).await.unwrap();
        assert!(HttpClient::extract_nonce(&response).is_none());
    }

    #[tokio::test]
    async fn test_extract_backoff_with_seconds() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_header("retry-after", "60")
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        let response = client.get(server_url(&server, "/")).await.unwrap();
        let retry_after = HttpClient::extract_backoff(&response).expect("No retry after value or parsed");
        let backoff = retry_after.duration_since(SystemTime::now()).unwrap();
        let difference = backoff.abs_diff(Duration::from_secs(60));
        // Allow some leeway to account for a slow test or jumping clock
        assert!(
            difference < Duration::from_secs(3),
            "Time difference greater than 3s: {difference:?}"
        );
    }

    #[test]
    fn test_parse_retry_after_with_timestamp() {
        let retry_after = parse_retry_after("Sun, 06 Nov 1994 08:49:37 GMT").expect("timestamp must parse");
        assert_eq!(retry_after, SystemTime::from(datetime!(1994-11-06 08:49:37 UTC)));
    }

    #[test]
    fn test_parse_retry_after_with_garbage() {
        assert!(parse_retry_after("tomorrow, probably").is_none());
    }

    #[tokio::test]
    async fn test_extract_location_with_relative_url() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(201)
            .with_header("Location", "/everything-is-relative")
            .create_async()
            .await;

        let client = HttpClient::try_new().unwrap();
        let response = client.post(server_url(&server, "/"), &()).await.unwrap();
        let location = HttpClient::extract_location(&response).unwrap();
        assert_eq!(location, server_url(&server, "/everything-is-relative"));
    }
}
