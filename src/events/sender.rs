//! Delivery of event payloads to the events service.
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, DATE, USER_AGENT},
    StatusCode,
};
use url::Url;
use uuid::Uuid;

use crate::{Error, Result};

/// Which endpoint a payload is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventDataKind {
    /// A batch of analytics events, sent to `/bulk`.
    Analytics,
    /// A single diagnostic event, sent to `/diagnostic`.
    Diagnostics,
}

impl EventDataKind {
    fn path(self) -> &'static str {
        match self {
            EventDataKind::Analytics => "/bulk",
            EventDataKind::Diagnostics => "/diagnostic",
        }
    }

    fn description(self) -> &'static str {
        match self {
            EventDataKind::Analytics => "analytics events",
            EventDataKind::Diagnostics => "diagnostic event",
        }
    }
}

/// Outcome of a delivery attempt (including its retry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    /// The payload was accepted by the server.
    pub success: bool,
    /// The server rejected the credentials. No further deliveries should be attempted.
    pub must_shut_down: bool,
    /// Server time taken from the `Date` header of a successful response.
    pub time_from_server: Option<DateTime<Utc>>,
}

impl SendResult {
    pub(crate) fn succeeded(time_from_server: Option<DateTime<Utc>>) -> SendResult {
        SendResult {
            success: true,
            must_shut_down: false,
            time_from_server,
        }
    }

    pub(crate) fn failed() -> SendResult {
        SendResult {
            success: false,
            must_shut_down: false,
            time_from_server: None,
        }
    }

    pub(crate) fn unrecoverable() -> SendResult {
        SendResult {
            success: false,
            must_shut_down: true,
            time_from_server: None,
        }
    }
}

/// Delivers serialized event payloads.
///
/// [`HttpEventSender`] is the production implementation. Implementations are called from flush
/// worker threads and may block.
pub trait EventSender: Send + Sync {
    /// Deliver `payload` (a JSON document containing `event_count` events) to the endpoint for
    /// `kind` under `base_uri`.
    fn send_event_data(
        &self,
        kind: EventDataKind,
        payload: &str,
        event_count: usize,
        base_uri: &Url,
    ) -> SendResult;
}

/// HTTP settings for [`HttpEventSender`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// SDK key, sent as the `Authorization` header.
    pub sdk_key: String,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// Defaults to [`HttpConfig::DEFAULT_CONNECT_TIMEOUT`].
    pub connect_timeout: Duration,
    /// Total time allowed for a single request. Defaults to [`HttpConfig::DEFAULT_REQUEST_TIMEOUT`].
    pub request_timeout: Duration,
    /// Delay before retrying a failed request. Defaults to [`HttpConfig::DEFAULT_RETRY_DELAY`].
    pub retry_delay: Duration,
}

impl HttpConfig {
    /// Default value for [`HttpConfig::connect_timeout`].
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Default value for [`HttpConfig::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default value for [`HttpConfig::retry_delay`].
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Create a new `HttpConfig` with default timeouts.
    pub fn new(sdk_key: impl Into<String>) -> HttpConfig {
        HttpConfig {
            sdk_key: sdk_key.into(),
            headers: Vec::new(),
            connect_timeout: HttpConfig::DEFAULT_CONNECT_TIMEOUT,
            request_timeout: HttpConfig::DEFAULT_REQUEST_TIMEOUT,
            retry_delay: HttpConfig::DEFAULT_RETRY_DELAY,
        }
    }

    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&self.sdk_key)?);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("flagpulse-rust/", env!("CARGO_PKG_VERSION"))),
        );
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidHeader(name.clone()))?;
            headers.insert(name, header_value(value)?);
        }
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    let mut value =
        HeaderValue::from_str(value).map_err(|_| Error::InvalidHeader(value.to_owned()))?;
    value.set_sensitive(true);
    Ok(value)
}

const EVENT_SCHEMA_HEADER: &str = "X-Flagpulse-Event-Schema";
const EVENT_SCHEMA_VERSION: &str = "4";
const PAYLOAD_ID_HEADER: &str = "X-Flagpulse-Payload-ID";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Sends payloads over HTTP, retrying recoverable failures once.
pub struct HttpEventSender {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    retry_delay: Duration,
}

impl HttpEventSender {
    /// Build the HTTP client.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHeader`] if the SDK key or an extra header cannot be sent as a header.
    /// - [`Error::Network`] if the HTTP client cannot be initialized.
    pub fn new(config: &HttpConfig) -> Result<HttpEventSender> {
        let client = reqwest::blocking::Client::builder()
            .default_headers(config.default_headers()?)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(HttpEventSender {
            client,
            retry_delay: config.retry_delay,
        })
    }
}

impl EventSender for HttpEventSender {
    fn send_event_data(
        &self,
        kind: EventDataKind,
        payload: &str,
        event_count: usize,
        base_uri: &Url,
    ) -> SendResult {
        if payload.is_empty() || event_count == 0 {
            return SendResult::succeeded(None);
        }

        let url = endpoint(base_uri, kind);
        // Generated once per payload so that the server can discard a duplicate delivered by the
        // retry.
        let payload_id = match kind {
            EventDataKind::Analytics => Some(Uuid::new_v4().to_string()),
            EventDataKind::Diagnostics => None,
        };

        for attempt in 0..2 {
            if attempt > 0 {
                log::debug!(target: "flagpulse", "retrying delivery of {}", kind.description());
                std::thread::sleep(self.retry_delay);
            }

            log::debug!(target: "flagpulse", event_count, url:display = url; "posting {}", kind.description());

            let mut request = self
                .client
                .post(url.clone())
                .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
                .body(payload.to_owned());
            if let Some(payload_id) = &payload_id {
                request = request
                    .header(EVENT_SCHEMA_HEADER, EVENT_SCHEMA_VERSION)
                    .header(PAYLOAD_ID_HEADER, payload_id.as_str());
            }

            let response = match request.send() {
                Ok(response) => response,
                Err(err) => {
                    log::warn!(target: "flagpulse",
                               "error while sending {}: {:?}", kind.description(), err.without_url());
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return SendResult::succeeded(server_time(response.headers()));
            }

            if is_unrecoverable(status) {
                log::error!(target: "flagpulse",
                            status:display = status;
                            "events service rejected the SDK key, event delivery is stopped. Check your SDK key");
                return SendResult::unrecoverable();
            }

            log::warn!(target: "flagpulse",
                       status:display = status;
                       "received unsuccessful response while sending {}", kind.description());
        }

        SendResult::failed()
    }
}

fn endpoint(base_uri: &Url, kind: EventDataKind) -> Url {
    let mut url = base_uri.clone();
    let path = format!("{}{}", base_uri.path().trim_end_matches('/'), kind.path());
    url.set_path(&path);
    url
}

/// Invalid credentials will not become valid by retrying.
fn is_unrecoverable(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

fn server_time(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let date = headers.get(DATE)?.to_str().ok()?;
    match DateTime::parse_from_rfc2822(date) {
        Ok(date) => Some(date.with_timezone(&Utc)),
        Err(err) => {
            log::debug!(target: "flagpulse", date; "ignoring unparseable Date header: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use url::Url;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    /// A mock events service. The blocking client under test must run outside of the async
    /// runtime, so the server is driven from a runtime we only enter for setup and inspection.
    struct TestServer {
        server: MockServer,
        runtime: tokio::runtime::Runtime,
    }

    impl TestServer {
        fn start() -> TestServer {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let server = runtime.block_on(MockServer::start());
            TestServer { server, runtime }
        }

        fn mount(&self, mock: Mock) {
            self.runtime.block_on(mock.mount(&self.server));
        }

        fn requests(&self) -> Vec<wiremock::Request> {
            self.runtime
                .block_on(self.server.received_requests())
                .unwrap()
        }

        fn base_uri(&self) -> Url {
            Url::parse(&self.server.uri()).unwrap()
        }
    }

    fn sender() -> HttpEventSender {
        let mut config = HttpConfig::new("sdk-key");
        config.retry_delay = Duration::from_millis(10);
        config.headers.push(("X-Custom".to_owned(), "custom-value".to_owned()));
        HttpEventSender::new(&config).unwrap()
    }

    fn header_of<'a>(request: &'a wiremock::Request, name: &str) -> Option<&'a str> {
        request
            .headers
            .get(name)
            .map(|value| value.to_str().unwrap())
    }

    const PAYLOAD: &str = r#"[{"kind":"identify"}]"#;

    #[test]
    fn delivers_analytics_payload_with_headers() {
        let server = TestServer::start();
        server.mount(
            Mock::given(method("POST"))
                .and(path("/bulk"))
                .respond_with(ResponseTemplate::new(202)),
        );

        let result = sender().send_event_data(
            EventDataKind::Analytics,
            PAYLOAD,
            1,
            &server.base_uri(),
        );

        assert!(result.success);
        assert!(!result.must_shut_down);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.body, PAYLOAD.as_bytes());
        assert_eq!(header_of(request, "authorization"), Some("sdk-key"));
        assert_eq!(header_of(request, "x-custom"), Some("custom-value"));
        assert_eq!(header_of(request, "content-type"), Some(JSON_CONTENT_TYPE));
        assert_eq!(header_of(request, "x-flagpulse-event-schema"), Some("4"));
        assert!(header_of(request, "user-agent")
            .unwrap()
            .starts_with("flagpulse-rust/"));
        let payload_id = header_of(request, "x-flagpulse-payload-id").unwrap();
        assert!(Uuid::parse_str(payload_id).is_ok());
    }

    #[test]
    fn delivers_diagnostic_payload_without_analytics_headers() {
        let server = TestServer::start();
        server.mount(
            Mock::given(method("POST"))
                .and(path("/diagnostic"))
                .respond_with(ResponseTemplate::new(202)),
        );

        let result = sender().send_event_data(
            EventDataKind::Diagnostics,
            r#"{"kind":"diagnostic"}"#,
            1,
            &server.base_uri(),
        );

        assert!(result.success);
        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(header_of(&requests[0], "x-flagpulse-event-schema"), None);
        assert_eq!(header_of(&requests[0], "x-flagpulse-payload-id"), None);
    }

    #[test]
    fn base_uri_path_and_trailing_slash_are_handled() {
        let server = TestServer::start();
        server.mount(
            Mock::given(method("POST"))
                .and(path("/events/bulk"))
                .respond_with(ResponseTemplate::new(202)),
        );
        let base_uri = server.base_uri().join("/events/").unwrap();

        let result = sender().send_event_data(EventDataKind::Analytics, PAYLOAD, 1, &base_uri);

        assert!(result.success);
        assert_eq!(server.requests()[0].url.path(), "/events/bulk");
    }

    #[test]
    fn base_uri_context_path_prefixes_both_endpoints() {
        let server = TestServer::start();
        server.mount(
            Mock::given(method("POST"))
                .and(path("/ctx/path/bulk"))
                .respond_with(ResponseTemplate::new(202)),
        );
        server.mount(
            Mock::given(method("POST"))
                .and(path("/ctx/path/diagnostic"))
                .respond_with(ResponseTemplate::new(202)),
        );
        let base_uri = Url::parse(&format!("{}/ctx/path", server.server.uri())).unwrap();
        let sender = sender();

        let analytics = sender.send_event_data(EventDataKind::Analytics, PAYLOAD, 1, &base_uri);
        let diagnostic = sender.send_event_data(
            EventDataKind::Diagnostics,
            r#"{"kind":"diagnostic"}"#,
            1,
            &base_uri,
        );

        assert!(analytics.success);
        assert!(diagnostic.success);
        let paths: Vec<String> = server
            .requests()
            .iter()
            .map(|request| request.url.path().to_owned())
            .collect();
        assert_eq!(paths, vec!["/ctx/path/bulk", "/ctx/path/diagnostic"]);
    }

    #[test]
    fn endpoint_resolves_against_each_base_uri_form() {
        let bases = [
            "http://host",
            "http://host/",
            "http://host/ctx/path",
            "http://host/ctx/path/",
        ];
        for base in bases {
            let base_uri = Url::parse(base).unwrap();
            let prefix = base.trim_end_matches('/');

            assert_eq!(
                endpoint(&base_uri, EventDataKind::Analytics).as_str(),
                format!("{prefix}/bulk")
            );
            assert_eq!(
                endpoint(&base_uri, EventDataKind::Diagnostics).as_str(),
                format!("{prefix}/diagnostic")
            );
        }
    }

    #[test]
    fn empty_payload_is_not_sent() {
        let server = TestServer::start();
        let sender = sender();

        assert!(sender
            .send_event_data(EventDataKind::Analytics, "", 1, &server.base_uri())
            .success);
        assert!(sender
            .send_event_data(EventDataKind::Analytics, PAYLOAD, 0, &server.base_uri())
            .success);
        assert!(server.requests().is_empty());
    }

    #[test]
    fn recoverable_errors_are_retried_once() {
        for status in [400, 408, 429, 500, 503] {
            let server = TestServer::start();
            server.mount(Mock::given(method("POST")).respond_with(ResponseTemplate::new(status)));

            let result = sender().send_event_data(
                EventDataKind::Analytics,
                PAYLOAD,
                1,
                &server.base_uri(),
            );

            assert_eq!(result, SendResult::failed(), "status {status}");
            assert_eq!(server.requests().len(), 2, "status {status}");
        }
    }

    #[test]
    fn unrecoverable_errors_are_not_retried() {
        for status in [401, 403] {
            let server = TestServer::start();
            server.mount(Mock::given(method("POST")).respond_with(ResponseTemplate::new(status)));

            let result = sender().send_event_data(
                EventDataKind::Diagnostics,
                PAYLOAD,
                1,
                &server.base_uri(),
            );

            assert_eq!(result, SendResult::unrecoverable(), "status {status}");
            assert_eq!(server.requests().len(), 1, "status {status}");
        }
    }

    #[test]
    fn retry_reuses_payload_id() {
        let server = TestServer::start();
        server.mount(
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(503))
                .up_to_n_times(1),
        );
        server.mount(Mock::given(method("POST")).respond_with(ResponseTemplate::new(202)));

        let result =
            sender().send_event_data(EventDataKind::Analytics, PAYLOAD, 1, &server.base_uri());

        assert!(result.success);
        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            header_of(&requests[0], "x-flagpulse-payload-id"),
            header_of(&requests[1], "x-flagpulse-payload-id")
        );
    }

    #[test]
    fn each_payload_gets_a_new_id() {
        let server = TestServer::start();
        server.mount(Mock::given(method("POST")).respond_with(ResponseTemplate::new(202)));
        let sender = sender();

        sender.send_event_data(EventDataKind::Analytics, PAYLOAD, 1, &server.base_uri());
        sender.send_event_data(EventDataKind::Analytics, PAYLOAD, 1, &server.base_uri());

        let requests = server.requests();
        assert_ne!(
            header_of(&requests[0], "x-flagpulse-payload-id"),
            header_of(&requests[1], "x-flagpulse-payload-id")
        );
    }

    #[test]
    fn connection_failure_is_recoverable() {
        // Nothing listens on port 1.
        let base_uri = Url::parse("http://127.0.0.1:1").unwrap();

        let result = sender().send_event_data(EventDataKind::Analytics, PAYLOAD, 1, &base_uri);

        assert_eq!(result, SendResult::failed());
    }

    #[test]
    fn server_time_is_read_from_date_header() {
        let server = TestServer::start();
        server.mount(
            Mock::given(method("POST"))
                .and(header("x-flagpulse-event-schema", "4"))
                .respond_with(
                    ResponseTemplate::new(202)
                        .insert_header("Date", "Fri, 13 Feb 2009 23:31:30 GMT"),
                ),
        );

        let result =
            sender().send_event_data(EventDataKind::Analytics, PAYLOAD, 1, &server.base_uri());

        assert!(result.success);
        assert_eq!(
            result.time_from_server,
            Some(Utc.with_ymd_and_hms(2009, 2, 13, 23, 31, 30).unwrap())
        );
    }

    #[test]
    fn invalid_date_header_is_ignored() {
        let server = TestServer::start();
        server.mount(
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(202).insert_header("Date", "not a date")),
        );

        let result =
            sender().send_event_data(EventDataKind::Analytics, PAYLOAD, 1, &server.base_uri());

        assert!(result.success);
        assert_eq!(result.time_from_server, None);
    }

    #[test]
    fn rejects_invalid_header_values() {
        let mut config = HttpConfig::new("sdk-key");
        config.headers.push(("Bad Name".to_owned(), "value".to_owned()));
        assert!(matches!(
            HttpEventSender::new(&config),
            Err(Error::InvalidHeader(_))
        ));

        assert!(matches!(
            HttpEventSender::new(&HttpConfig::new("key\nwith newline")),
            Err(Error::InvalidHeader(_))
        ));
    }
}
