//! Request/response plumbing to the Clutch servers.
//!
//! [`RemoteClient`] is the seam between the SDK and the network. [`HttpRemoteClient`] is the
//! default implementation over blocking `reqwest`; hosts and tests can provide their own.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use reqwest::{header::HeaderMap, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{Error, Result};

/// Version of the RPC protocol spoken by this SDK.
pub const API_VERSION: &str = "1";

/// Whether a tunnel poll should return immediately or be held open by the server until something
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Return the current state right away.
    Immediate,
    /// Long-poll: hold the request until content changes or the server times out.
    LongPoll,
}

/// Files that changed along with their new versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    /// Map of file name to version.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// Result of a tunnel poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResponse {
    /// Nothing changed since the supplied cursor.
    Unchanged,
    /// Content changed; `cursor` is the new position.
    Changed {
        /// New opaque cursor.
        cursor: String,
        /// What changed.
        change: ChangeDescriptor,
    },
}

/// Wire representation of a tunnel poll response.
#[derive(Debug, Deserialize)]
struct TunnelResponse {
    #[serde(default)]
    unchanged: bool,
    #[serde(default)]
    changed: bool,
    new_cursor: Option<String>,
    #[serde(default)]
    files: BTreeMap<String, String>,
}

impl TryFrom<TunnelResponse> for PollResponse {
    type Error = Error;

    fn try_from(response: TunnelResponse) -> Result<PollResponse> {
        if response.unchanged || !response.changed {
            return Ok(PollResponse::Unchanged);
        }
        let cursor = response.new_cursor.ok_or_else(|| {
            Error::MalformedResponse("changed tunnel response without new_cursor".to_owned())
        })?;
        Ok(PollResponse::Changed {
            cursor,
            change: ChangeDescriptor {
                files: response.files,
            },
        })
    }
}

/// A black-box executor for requests to the Clutch servers.
///
/// Implementations block the calling thread until the request completes. The SDK only calls them
/// from background threads.
pub trait RemoteClient {
    /// Call a remote RPC method with `params`, returning its result.
    fn call_method(&self, method: &str, params: &Map<String, Value>) -> Result<Value>;

    /// Download version `version` of the content file `file_name`.
    fn download_file(&self, file_name: &str, version: &str) -> Result<Vec<u8>>;

    /// Ask the tunnel whether content changed since `cursor`.
    fn poll_tunnel(&self, cursor: Option<&str>, mode: PollMode) -> Result<PollResponse>;
}

impl<T: RemoteClient + ?Sized> RemoteClient for Arc<T> {
    fn call_method(&self, method: &str, params: &Map<String, Value>) -> Result<Value> {
        (**self).call_method(method, params)
    }

    fn download_file(&self, file_name: &str, version: &str) -> Result<Vec<u8>> {
        (**self).download_file(file_name, version)
    }

    fn poll_tunnel(&self, cursor: Option<&str>, mode: PollMode) -> Result<PollResponse> {
        (**self).poll_tunnel(cursor, mode)
    }
}

/// Configuration for [`HttpRemoteClient`].
#[derive(Debug, Clone)]
pub struct HttpRemoteClientConfig {
    /// Application key.
    pub app_key: String,
    /// Base URL of the RPC endpoint.
    pub rpc_url: String,
    /// Base URL of the tunnel endpoint, if content sync is used.
    pub tunnel_url: Option<String>,
    /// Installation identifier sent with every request.
    pub installation_id: String,
    /// How long a long-poll request may be held open.
    pub long_poll_timeout: Duration,
}

/// [`RemoteClient`] over HTTP.
pub struct HttpRemoteClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    rpc_url: Url,
    tunnel_url: Option<Url>,
    app_key: String,
    long_poll_timeout: Duration,
    next_id: AtomicU64,
    /// If we receive a 401 Unauthorized error during a request, it means the app key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpRemoteClient {
    /// Create a new client. Fails if the configured URLs cannot be parsed.
    pub fn new(config: HttpRemoteClientConfig) -> Result<HttpRemoteClient> {
        let rpc_url = base_url(&config.rpc_url).map_err(Error::InvalidRpcUrl)?;
        let tunnel_url = config
            .tunnel_url
            .as_deref()
            .map(base_url)
            .transpose()
            .map_err(Error::InvalidTunnelUrl)?;

        let mut headers = HeaderMap::new();
        let mut insert = |name: &'static str, value: &str| match value.parse() {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => {
                log::warn!(target: "clutch", header = name; "skipping header with invalid value");
            }
        };
        insert("X-App-Key", &config.app_key);
        insert("X-UDID", &config.installation_id);
        insert("X-API-Version", API_VERSION);
        insert("X-SDK-Version", env!("CARGO_PKG_VERSION"));
        insert("X-Platform", std::env::consts::OS);

        let client = reqwest::blocking::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(HttpRemoteClient {
            client,
            rpc_url,
            tunnel_url,
            app_key: config.app_key,
            long_poll_timeout: config.long_poll_timeout,
            next_id: AtomicU64::new(1),
            unauthorized: AtomicBool::new(false),
        })
    }

    /// Send `request`, returning the raw body of a successful response.
    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<Vec<u8>> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let response = request.send()?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            log::warn!(target: "clutch", "client is not authorized. Check your app key");
            self.unauthorized.store(true, Ordering::Relaxed);
            return Err(Error::Unauthorized);
        }

        let body = response.bytes()?.to_vec();
        if !status.is_success() {
            log::warn!(target: "clutch", status = status.as_u16(); "received non-success response");
            return Err(Error::Status {
                status: status.as_u16(),
                body: Arc::new(body),
            });
        }

        Ok(body)
    }

    /// `{rpc_url}/view/{version}/{file_name}`, with both values percent-encoded as single path
    /// segments.
    fn download_url(&self, file_name: &str, version: &str) -> Result<Url> {
        if is_dot_segment(file_name) {
            return Err(Error::InvalidFileName(file_name.to_owned()));
        }
        if is_dot_segment(version) {
            return Err(Error::MalformedResponse(format!(
                "invalid content version: {version:?}"
            )));
        }

        let mut target = self.rpc_url.clone();
        target
            .path_segments_mut()
            .map_err(|()| Error::InvalidRpcUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["view", version, file_name]);
        Ok(target)
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|err| {
        Error::MalformedResponse(format!("{err}: {}", String::from_utf8_lossy(body)))
    })
}

/// Wire representation of a JSON-RPC response.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

impl RemoteClient for HttpRemoteClient {
    fn call_method(&self, method: &str, params: &Map<String, Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "method": method, "params": params, "id": id });

        log::debug!(target: "clutch", method, id; "calling remote method");
        let response: RpcResponse =
            parse_json(&self.send(self.client.post(self.rpc_url.clone()).json(&body))?)?;

        if !response.error.is_null() {
            let message = match response.error {
                Value::String(message) => message,
                other => other.to_string(),
            };
            log::warn!(target: "clutch", method, message:display = message; "remote method failed");
            return Err(Error::Remote {
                method: method.to_owned(),
                message,
            });
        }

        Ok(response.result)
    }

    fn download_file(&self, file_name: &str, version: &str) -> Result<Vec<u8>> {
        let url = self.download_url(file_name, version)?;

        log::debug!(target: "clutch", file_name, version; "downloading content file");
        self.send(self.client.get(url))
    }

    fn poll_tunnel(&self, cursor: Option<&str>, mode: PollMode) -> Result<PollResponse> {
        let tunnel_url = self.tunnel_url.as_ref().ok_or(Error::TunnelNotConfigured)?;
        let wait = match mode {
            PollMode::Immediate => "0",
            PollMode::LongPoll => "1",
        };
        let url = Url::parse_with_params(
            tunnel_url.join("poll").map_err(Error::InvalidTunnelUrl)?.as_str(),
            &[
                ("appKey", self.app_key.as_str()),
                ("cursor", cursor.unwrap_or_default()),
                ("wait", wait),
            ],
        )
        .map_err(Error::InvalidTunnelUrl)?;

        let mut request = self.client.get(url);
        if mode == PollMode::LongPoll {
            request = request.timeout(self.long_poll_timeout);
        }

        match self.send(request) {
            Ok(body) => parse_json::<TunnelResponse>(&body)?.try_into(),
            // The server did not answer before the long-poll timeout: nothing changed.
            Err(Error::Network(err)) if mode == PollMode::LongPoll && err.is_timeout() => {
                Ok(PollResponse::Unchanged)
            }
            Err(err) => Err(err),
        }
    }
}

/// Segments that `Url` would drop or resolve instead of encoding.
fn is_dot_segment(segment: &str) -> bool {
    matches!(segment, "" | "." | "..")
}

/// Parse `url`, making sure it ends with a slash so relative paths are joined under it.
fn base_url(url: &str) -> std::result::Result<Url, url::ParseError> {
    if url.ends_with('/') {
        Url::parse(url)
    } else {
        Url::parse(&format!("{url}/"))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    use serde_json::{Map, Value};

    use super::{PollMode, PollResponse, RemoteClient};
    use crate::{Error, Result};

    /// Scripted [`RemoteClient`] that records every request.
    #[derive(Default)]
    pub(crate) struct FakeRemote {
        pub methods: Mutex<HashMap<String, Result<Value>>>,
        pub calls: Mutex<Vec<(String, Map<String, Value>)>>,
        pub files: Mutex<HashMap<(String, String), Vec<u8>>>,
        pub downloads: Mutex<Vec<(String, String)>>,
        /// Responses returned by successive polls. Once exhausted, polls return `Unchanged`.
        pub polls: Mutex<VecDeque<Result<PollResponse>>>,
        pub poll_cursors: Mutex<Vec<Option<String>>>,
    }

    impl FakeRemote {
        pub(crate) fn with_method(self, method: &str, result: Result<Value>) -> Self {
            self.methods.lock().unwrap().insert(method.to_owned(), result);
            self
        }

        pub(crate) fn with_file(self, file_name: &str, version: &str, bytes: &[u8]) -> Self {
            self.files
                .lock()
                .unwrap()
                .insert((file_name.to_owned(), version.to_owned()), bytes.to_vec());
            self
        }

        pub(crate) fn push_poll(&self, response: Result<PollResponse>) {
            self.polls.lock().unwrap().push_back(response);
        }

        pub(crate) fn calls_to(&self, method: &str) -> Vec<Map<String, Value>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == method)
                .map(|(_, params)| params.clone())
                .collect()
        }
    }

    impl RemoteClient for FakeRemote {
        fn call_method(&self, method: &str, params: &Map<String, Value>) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_owned(), params.clone()));
            self.methods
                .lock()
                .unwrap()
                .get(method)
                .cloned()
                .unwrap_or(Ok(Value::Null))
        }

        fn download_file(&self, file_name: &str, version: &str) -> Result<Vec<u8>> {
            let key = (file_name.to_owned(), version.to_owned());
            self.downloads.lock().unwrap().push(key.clone());
            self.files
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .ok_or(Error::Status {
                    status: 404,
                    body: Default::default(),
                })
        }

        fn poll_tunnel(&self, cursor: Option<&str>, _mode: PollMode) -> Result<PollResponse> {
            self.poll_cursors
                .lock()
                .unwrap()
                .push(cursor.map(str::to_owned));
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PollResponse::Unchanged))
        }
    }
}
