//! Scripted internal API server for tests.
//!
//! Serves a fixed set of routes over a UNIX socket, loopback TCP or loopback
//! TLS and records every request it receives.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

type Handler = Arc<dyn Fn(&RecordedRequest) -> (StatusCode, String) + Send + Sync>;

// ---------------------------------------------------------------------------
// Routes and recorded requests
// ---------------------------------------------------------------------------

pub struct TestRoute {
    path: &'static str,
    handler: Handler,
    delay: Option<Duration>,
}

impl TestRoute {
    /// Always answer `status` with `body`.
    pub fn json(path: &'static str, status: StatusCode, body: &'static str) -> Self {
        Self::with_handler(path, move |_| (status, body.to_string()))
    }

    pub fn with_handler<F>(path: &'static str, handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> (StatusCode, String) + Send + Sync + 'static,
    {
        Self {
            path,
            handler: Arc::new(handler),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn json_body(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct State {
    routes: Vec<TestRoute>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl State {
    async fn handle(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = request.into_parts();
        let body = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        let recorded = RecordedRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        };

        let (status, body, delay) = match self.routes.iter().find(|r| r.path == recorded.uri.path()) {
            Some(route) => {
                let (status, body) = (route.handler)(&recorded);
                (status, body, route.delay)
            }
            None => (StatusCode::NOT_FOUND, String::new(), None),
        };
        self.requests.lock().unwrap().push(recorded);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, "application/json".parse().unwrap());
        response
    }
}

pub struct TestServer {
    // Keeps the socket directory alive for the lifetime of the server.
    _dir: Option<tempfile::TempDir>,
    socket: Option<PathBuf>,
    url: Option<String>,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub fn socket_path(&self) -> &Path {
        self.socket.as_deref().expect("not a UNIX socket server")
    }

    pub fn url(&self) -> &str {
        self.url.as_deref().expect("not a TCP server")
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_socket_server(routes: Vec<TestRoute>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("gitlab.socket");
    let listener = UnixListener::bind(&socket).unwrap();
    let state = new_state(routes);

    let task = tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&state)));
            }
        }
    });

    TestServer {
        _dir: Some(dir),
        socket: Some(socket),
        url: None,
        state,
        task,
    }
}

pub async fn start_tcp_server(routes: Vec<TestRoute>) -> TestServer {
    start_loopback_server(routes, None).await
}

/// Serve HTTPS on loopback with `tls`.  Connections that fail the handshake
/// are dropped.
pub async fn start_tls_server(routes: Vec<TestRoute>, tls: rustls::ServerConfig) -> TestServer {
    start_loopback_server(routes, Some(TlsAcceptor::from(Arc::new(tls)))).await
}

async fn start_loopback_server(routes: Vec<TestRoute>, acceptor: Option<TlsAcceptor>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scheme = if acceptor.is_some() { "https" } else { "http" };
    let state = new_state(routes);

    let task = tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&state);
                match acceptor.clone() {
                    Some(acceptor) => {
                        tokio::spawn(async move {
                            if let Ok(stream) = acceptor.accept(stream).await {
                                serve(stream, state).await;
                            }
                        });
                    }
                    None => {
                        tokio::spawn(serve(stream, state));
                    }
                }
            }
        }
    });

    TestServer {
        _dir: None,
        socket: None,
        url: Some(format!("{scheme}://{addr}")),
        state,
        task,
    }
}

fn new_state(routes: Vec<TestRoute>) -> Arc<State> {
    Arc::new(State {
        routes,
        requests: Mutex::new(Vec::new()),
    })
}

async fn serve<S>(io: S, state: Arc<State>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(state.handle(request).await) }
    });
    let _ = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await;
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// A throwaway CA with a server certificate for `localhost`/`127.0.0.1` and a
/// client certificate, both issued by it.
pub struct TestCertificates {
    pub ca_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
    ca_der: CertificateDer<'static>,
    server_cert_der: CertificateDer<'static>,
    server_key_der: Vec<u8>,
}

impl TestCertificates {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "gitlab-sshd test CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server = CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap()
            .signed_by(&server_key, &ca, &ca_key)
            .unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        client_params
            .distinguished_name
            .push(DnType::CommonName, "gitlab-shell");
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        Self {
            ca_pem: ca.pem(),
            client_cert_pem: client.pem(),
            client_key_pem: client_key.serialize_pem(),
            ca_der: ca.der().clone(),
            server_cert_der: server.der().clone(),
            server_key_der: server_key.serialize_der(),
        }
    }

    /// Server TLS configuration.  With `require_client_cert`, only clients
    /// presenting a certificate issued by the test CA complete the handshake.
    pub fn server_config(&self, require_client_cert: bool) -> rustls::ServerConfig {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .unwrap();

        let builder = if require_client_cert {
            let mut roots = rustls::RootCertStore::empty();
            roots.add(self.ca_der.clone()).unwrap();
            let verifier =
                rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .unwrap();
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key_der.clone()));
        builder
            .with_single_cert(vec![self.server_cert_der.clone()], key)
            .unwrap()
    }
}
