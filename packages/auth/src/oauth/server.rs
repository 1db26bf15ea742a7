// ABOUTME: Loopback HTTP listener that captures a single OAuth redirect
// ABOUTME: Handles code callbacks directly and bounces implicit-grant fragments back as a query parameter

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AuthError, AuthResult};

/// Query parameter the bounce page uses to hand the fragment back to us
pub const FRAGMENT_PARAM: &str = "sonata_fragment";

const MAX_REQUEST_BYTES: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Port to listen on if `redirect_uri` can be serviced by a local listener.
///
/// Only plain-HTTP loopback URIs with an explicit port qualify; anything else
/// needs the manual "visit this URL" flow.
pub fn redirect_port(redirect_uri: &str) -> Option<u16> {
    let url = Url::parse(redirect_uri).ok()?;
    if url.scheme() != "http" {
        return None;
    }
    match url.host_str() {
        Some("127.0.0.1") | Some("localhost") => url.port(),
        _ => None,
    }
}

/// OAuth callback server configuration
#[derive(Debug, Clone)]
pub struct CallbackServer {
    port: u16,
    expected_state: Option<String>,
}

impl CallbackServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            expected_state: None,
        }
    }

    /// Server for a redirect URI, or `None` if it is not a local HTTP address
    pub fn for_redirect_uri(redirect_uri: &str) -> Option<Self> {
        redirect_port(redirect_uri).map(Self::new)
    }

    /// State the callback must echo back; a mismatch is a hard failure
    pub fn with_expected_state(mut self, state: impl Into<String>) -> Self {
        self.expected_state = Some(state.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `127.0.0.1:<port>`. Port conflicts fail immediately.
    pub async fn bind(&self) -> AuthResult<BoundCallbackServer> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AuthError::CallbackServer(format!("Failed to bind to {}: {}", addr, e)))?;
        let port = listener.local_addr()?.port();

        info!("Waiting for OAuth callback on 127.0.0.1:{}", port);
        Ok(BoundCallbackServer {
            listener,
            port,
            expected_state: self.expected_state.clone(),
        })
    }

    /// Bind, then wait for an authorization code
    pub async fn wait_for_code(&self, cancel: &CancellationToken) -> AuthResult<String> {
        self.bind().await?.wait_for_code(cancel).await
    }

    /// Bind, then wait for an implicit-grant fragment
    pub async fn wait_for_fragment(&self, cancel: &CancellationToken) -> AuthResult<String> {
        self.bind().await?.wait_for_fragment(cancel).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackMode {
    Code,
    Fragment,
}

/// What the handler captured from the redirect
#[derive(Debug)]
struct Captured {
    params: HashMap<String, String>,
    raw: String,
}

/// A listening callback server; consumed by the wait
#[derive(Debug)]
pub struct BoundCallbackServer {
    listener: TcpListener,
    port: u16,
    expected_state: Option<String>,
}

impl BoundCallbackServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for `?code=...&state=...`.
    ///
    /// A provider `error` parameter is reported before the state is compared.
    pub async fn wait_for_code(self, cancel: &CancellationToken) -> AuthResult<String> {
        let expected_state = self.expected_state.clone();
        let captured = self.serve(CallbackMode::Code, cancel).await?;

        if let Some(error) = captured.params.get("error") {
            return Err(AuthError::OAuth {
                error: error.clone(),
                description: captured.params.get("error_description").cloned(),
            });
        }
        check_state(expected_state.as_deref(), captured.params.get("state"))?;

        captured.params.get("code").cloned().ok_or_else(|| {
            AuthError::CallbackServer("No authorization code found in callback".to_string())
        })
    }

    /// Wait for the bounced fragment and return it as a raw query string.
    ///
    /// The state is compared before a provider error is reported.
    pub async fn wait_for_fragment(self, cancel: &CancellationToken) -> AuthResult<String> {
        let expected_state = self.expected_state.clone();
        let captured = self.serve(CallbackMode::Fragment, cancel).await?;

        check_state(expected_state.as_deref(), captured.params.get("state"))?;
        if let Some(error) = captured.params.get("error") {
            return Err(AuthError::OAuth {
                error: error.clone(),
                description: captured.params.get("error_description").cloned(),
            });
        }

        Ok(captured.raw)
    }

    async fn serve(self, mode: CallbackMode, cancel: &CancellationToken) -> AuthResult<Captured> {
        let (tx, rx) = oneshot::channel::<Captured>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let expected_state: Option<Arc<str>> = self.expected_state.as_deref().map(Arc::from);
        let mut server = tokio::spawn(accept_loop(self.listener, tx, expected_state, mode));

        let outcome = tokio::select! {
            captured = rx => captured.map_err(|_| {
                AuthError::CallbackServer("Callback channel closed before a redirect arrived".to_string())
            }),
            result = &mut server => match result {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(AuthError::CallbackServer("Callback server stopped".to_string())),
                Err(e) => Err(AuthError::CallbackServer(format!("Callback server task failed: {}", e))),
            },
            _ = cancel.cancelled() => {
                debug!("Callback wait cancelled");
                Err(AuthError::Cancelled { attempts: 0 })
            }
        };

        // Dropping the listener here closes the socket
        server.abort();
        outcome
    }
}

fn check_state(expected: Option<&str>, received: Option<&String>) -> AuthResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let received = received.map(String::as_str).unwrap_or_default();
    if received != expected {
        warn!("OAuth state mismatch on callback");
        return Err(AuthError::StateMismatch {
            expected: expected.to_string(),
            received: received.to_string(),
        });
    }
    Ok(())
}

type SharedSender = Arc<Mutex<Option<oneshot::Sender<Captured>>>>;

async fn accept_loop(
    listener: TcpListener,
    tx: SharedSender,
    expected_state: Option<Arc<str>>,
    mode: CallbackMode,
) -> AuthResult<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await.map_err(|e| {
            AuthError::CallbackServer(format!("Failed to accept connection: {}", e))
        })?;
        debug!("Received connection from {}", peer_addr);

        let tx = tx.clone();
        let expected_state = expected_state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, tx, expected_state, mode).await {
                debug!("Callback connection failed: {}", e);
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    tx: SharedSender,
    expected_state: Option<Arc<str>>,
    mode: CallbackMode,
) -> std::io::Result<()> {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(request) => request?,
        Err(_) => return Ok(()),
    };

    let Some(target) = request_target(&request) else {
        return stream.write_all(not_found_response().as_bytes()).await;
    };

    match route(&target, mode) {
        Route::Capture(captured) => {
            let response = match page_error(&captured, expected_state.as_deref()) {
                Some(message) => error_response(&message),
                None => success_response(),
            };
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;

            let sender = tx.lock().ok().and_then(|mut guard| guard.take());
            if let Some(sender) = sender {
                let _ = sender.send(captured);
            }
            Ok(())
        }
        Route::Bounce => stream.write_all(bounce_response().as_bytes()).await,
        Route::Ignore => stream.write_all(not_found_response().as_bytes()).await,
    }
}

/// What the browser should be told went wrong, if anything
fn page_error(captured: &Captured, expected_state: Option<&str>) -> Option<String> {
    if let Some(error) = captured.params.get("error") {
        return Some(error.clone());
    }
    match expected_state {
        Some(expected) if captured.params.get("state").map(String::as_str) != Some(expected) => {
            Some("State mismatch; the authorization request was not started here".to_string())
        }
        _ => None,
    }
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// `GET /callback?code=... HTTP/1.1` -> `/callback?code=...`
fn request_target(request: &str) -> Option<String> {
    let first_line = request.lines().next()?;
    let mut parts = first_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    (method == "GET" && target.starts_with('/')).then(|| target.to_string())
}

enum Route {
    Capture(Captured),
    Bounce,
    Ignore,
}

fn route(target: &str, mode: CallbackMode) -> Route {
    let Ok(url) = Url::parse(&format!("http://127.0.0.1{}", target)) else {
        return Route::Ignore;
    };
    if url.path() == "/favicon.ico" {
        return Route::Ignore;
    }
    let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

    match mode {
        CallbackMode::Code => {
            if query.contains_key("code") || query.contains_key("error") {
                Route::Capture(Captured {
                    raw: url.query().unwrap_or_default().to_string(),
                    params: query,
                })
            } else {
                Route::Ignore
            }
        }
        CallbackMode::Fragment => match query.get(FRAGMENT_PARAM) {
            Some(fragment) => Route::Capture(Captured {
                params: url::form_urlencoded::parse(fragment.as_bytes())
                    .into_owned()
                    .collect(),
                raw: fragment.clone(),
            }),
            None => Route::Bounce,
        },
    }
}

fn html_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

fn success_response() -> String {
    html_response("200 OK", SUCCESS_HTML)
}

fn error_response(error_msg: &str) -> String {
    let html = format!(
        r#"<html><body><h1>Authentication Failed</h1><p>{}</p><p>You can close this tab and return to your terminal.</p></body></html>"#,
        escape_html(error_msg)
    );
    html_response("400 Bad Request", &html)
}

fn bounce_response() -> String {
    html_response("200 OK", &BOUNCE_HTML.replace("{param}", FRAGMENT_PARAM))
}

fn not_found_response() -> String {
    html_response("404 Not Found", "<html><body>Not found</body></html>")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

const SUCCESS_HTML: &str = r#"<html>
<head>
    <title>Authentication Successful</title>
    <style>
        body { font-family: system-ui, -apple-system, sans-serif; max-width: 600px; margin: 100px auto; text-align: center; }
        h1 { color: #22c55e; }
        p { color: #64748b; }
    </style>
</head>
<body>
    <h1>Authentication Successful</h1>
    <p>You can now close this tab and return to your terminal.</p>
    <script>window.close()</script>
</body>
</html>"#;

const BOUNCE_HTML: &str = r#"<html>
<head><title>Completing authentication</title></head>
<body>
    <p>Completing authentication...</p>
    <script>
        var fragment = window.location.hash.substring(1);
        window.location.replace(window.location.pathname + "?{param}=" + encodeURIComponent(fragment));
    </script>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_port_accepts_loopback_http() {
        assert_eq!(redirect_port("http://127.0.0.1:8080/callback"), Some(8080));
        assert_eq!(redirect_port("http://localhost:3737/auth/callback"), Some(3737));
    }

    #[test]
    fn test_redirect_port_rejects_remote_https_and_portless() {
        assert_eq!(redirect_port("https://localhost:8080/callback"), None);
        assert_eq!(redirect_port("http://example.com:8080/callback"), None);
        assert_eq!(redirect_port("http://localhost/callback"), None);
        assert_eq!(redirect_port("not a url"), None);
    }

    #[test]
    fn test_request_target() {
        let request = "GET /callback?code=abc123&state=xyz789 HTTP/1.1\r\nHost: localhost:3737\r\n\r\n";
        assert_eq!(
            request_target(request),
            Some("/callback?code=abc123&state=xyz789".to_string())
        );
        assert_eq!(request_target("POST /callback HTTP/1.1\r\n\r\n"), None);
        assert_eq!(request_target(""), None);
    }

    #[test]
    fn test_route_code_callback() {
        match route("/callback?state=xyz&code=abc%20def", CallbackMode::Code) {
            Route::Capture(captured) => {
                assert_eq!(captured.params.get("code").map(String::as_str), Some("abc def"));
                assert_eq!(captured.params.get("state").map(String::as_str), Some("xyz"));
            }
            _ => panic!("expected capture"),
        }
    }

    #[test]
    fn test_route_ignores_unrelated_requests() {
        assert!(matches!(route("/favicon.ico", CallbackMode::Code), Route::Ignore));
        assert!(matches!(route("/callback", CallbackMode::Code), Route::Ignore));
        assert!(matches!(route("/favicon.ico", CallbackMode::Fragment), Route::Ignore));
    }

    #[test]
    fn test_route_fragment_bounce_then_capture() {
        assert!(matches!(route("/callback", CallbackMode::Fragment), Route::Bounce));

        let target = "/callback?sonata_fragment=access_token%3Dtok%26state%3Dxyz%26expires_in%3D60";
        match route(target, CallbackMode::Fragment) {
            Route::Capture(captured) => {
                assert_eq!(captured.raw, "access_token=tok&state=xyz&expires_in=60");
                assert_eq!(captured.params.get("access_token").map(String::as_str), Some("tok"));
            }
            _ => panic!("expected capture"),
        }
    }

    #[test]
    fn test_check_state() {
        assert!(check_state(None, None).is_ok());
        assert!(check_state(Some("a"), Some(&"a".to_string())).is_ok());
        assert!(matches!(
            check_state(Some("a"), None),
            Err(AuthError::StateMismatch { received, .. }) if received.is_empty()
        ));
    }

    #[test]
    fn test_error_response_escapes_html() {
        let response = error_response("<script>");
        assert!(response.starts_with("HTTP/1.1 400"));
        assert!(response.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_bounce_page_uses_fragment_param() {
        assert!(bounce_response().contains("?sonata_fragment="));
    }
}
