//! Integration tests for routegate
//!
//! Every test runs real sockets on the loopback interface: an upstream that
//! records what it receives, the proxy under test, and raw-socket clients.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use routegate::error::{default_error_response, full_body};
use routegate::routes::{ForwardOptions, RequestAction, RouteOptions, RouteSsl};
use routegate::server::{Proxy, ProxyOptions, SslConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ============================================================================
// Helpers
// ============================================================================

fn local_proxy_options() -> ProxyOptions {
    ProxyOptions {
        port: Some(0),
        host: "127.0.0.1".parse().unwrap(),
        ..Default::default()
    }
}

/// A recording upstream: accepts connections, stores each request head and
/// answers 200 with a fixed body.
struct Upstream {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    hits: Arc<AtomicUsize>,
}

impl Upstream {
    fn target(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn last_request(&self) -> String {
        self.requests.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn request_path(&self) -> String {
        self.last_request()
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or_default()
            .to_string()
    }

    fn saw_header(&self, name: &str) -> Option<String> {
        let head = self.last_request();
        head.lines().find_map(|line| {
            let (n, v) = line.split_once(':')?;
            if n.trim().eq_ignore_ascii_case(name) {
                Some(v.trim().to_string())
            } else {
                None
            }
        })
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

async fn spawn_upstream(reply: &'static str) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let hits = Arc::new(AtomicUsize::new(0));

    let task_requests = Arc::clone(&requests);
    let task_hits = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let requests = Arc::clone(&task_requests);
            let hits = Arc::clone(&task_hits);
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                if head.is_empty() {
                    return;
                }
                hits.fetch_add(1, Ordering::SeqCst);
                requests.lock().unwrap().push(head);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    reply.len(),
                    reply
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    Upstream {
        addr,
        requests,
        hits,
    }
}

/// Raw-socket GET through the proxy. Returns `(status, full response text)`.
async fn http_get(
    addr: SocketAddr,
    path: &str,
    host: &str,
    extra_headers: &[(&str, &str)],
) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, host);
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    let text = String::from_utf8_lossy(&response).to_string();
    let status = text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    (status, text)
}

async fn started_proxy(opts: ProxyOptions) -> Proxy {
    let proxy = Proxy::new(opts);
    proxy.listen().await.unwrap();
    proxy
}

// ============================================================================
// URL rewriting
// ============================================================================

#[tokio::test]
async fn test_target_path_concatenation() {
    let upstream = spawn_upstream("ok").await;
    let proxy = started_proxy(local_proxy_options()).await;
    proxy
        .register(
            "127.0.0.1",
            &upstream.target("/foo/bar/qux"),
            RouteOptions::default(),
        )
        .unwrap();

    let (status, _) = http_get(proxy.http_addr().unwrap(), "/a/b/c", "127.0.0.1", &[]).await;
    assert_eq!(status, 200);
    assert_eq!(upstream.request_path(), "/foo/bar/qux/a/b/c");

    proxy.close(true).await;
}

#[tokio::test]
async fn test_route_prefix_strip_and_concat() {
    let upstream = spawn_upstream("ok").await;
    let proxy = started_proxy(local_proxy_options()).await;
    proxy
        .register(
            "127.0.0.1/path",
            &upstream.target("/foo/bar/qux"),
            RouteOptions::default(),
        )
        .unwrap();

    let (status, _) = http_get(proxy.http_addr().unwrap(), "/path/a/b/c", "127.0.0.1", &[]).await;
    assert_eq!(status, 200);
    assert_eq!(upstream.request_path(), "/foo/bar/qux/a/b/c");

    proxy.close(true).await;
}

#[tokio::test]
async fn test_query_only_url_keeps_query_adjacent() {
    let upstream = spawn_upstream("ok").await;
    let proxy = started_proxy(local_proxy_options()).await;
    proxy
        .register(
            "127.0.0.1/path",
            &upstream.target("/foo/bar/qux"),
            RouteOptions::default(),
        )
        .unwrap();

    let (status, _) = http_get(proxy.http_addr().unwrap(), "/path?a=b", "127.0.0.1", &[]).await;
    assert_eq!(status, 200);
    assert_eq!(upstream.request_path(), "/foo/bar/qux?a=b");

    proxy.close(true).await;
}

#[tokio::test]
async fn test_path_boundary_no_false_prefix_match() {
    let upstream = spawn_upstream("ok").await;
    let proxy = started_proxy(local_proxy_options()).await;
    proxy
        .register("127.0.0.1/foo", &upstream.target(""), RouteOptions::default())
        .unwrap();

    let (status, _) = http_get(proxy.http_addr().unwrap(), "/foobar", "127.0.0.1", &[]).await;
    assert_eq!(status, 404);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);

    proxy.close(true).await;
}

// ============================================================================
// Hooks
// ============================================================================

#[tokio::test]
async fn test_on_request_header_mutation_and_snapshot() {
    let upstream = spawn_upstream("ok").await;
    let proxy = started_proxy(local_proxy_options()).await;

    // Resolvers observe the request exactly as the client sent it; that
    // snapshot survives hook mutation.
    let snapshot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let resolver_snapshot = Arc::clone(&snapshot);
    proxy.add_resolver(5, move |_host, _url, info| {
        let value = info
            .headers
            .get("blah")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        *resolver_snapshot.lock().unwrap() = value;
        Box::pin(std::future::ready(Ok(None)))
    });

    let opts = RouteOptions {
        on_request: Some(Arc::new(|req, _target| {
            req.headers_mut()
                .insert("foo", "bar".parse().expect("valid header"));
            req.headers_mut().remove("blah");
            RequestAction::Continue
        })),
        ..Default::default()
    };
    proxy
        .register("127.0.0.1", &upstream.target(""), opts)
        .unwrap();

    let (status, _) = http_get(
        proxy.http_addr().unwrap(),
        "/x",
        "127.0.0.1",
        &[("blah", "xyz")],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(upstream.saw_header("foo"), Some("bar".to_string()));
    assert_eq!(upstream.saw_header("blah"), None);
    assert_eq!(*snapshot.lock().unwrap(), Some("xyz".to_string()));

    proxy.close(true).await;
}

#[tokio::test]
async fn test_on_request_skip_short_circuits_forwarding() {
    let upstream = spawn_upstream("ok").await;
    let proxy = started_proxy(local_proxy_options()).await;

    let response_target: Arc<Mutex<Option<Option<u16>>>> = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&response_target);

    let opts = RouteOptions {
        on_request: Some(Arc::new(|_req, _target| {
            let resp = hyper::Response::builder()
                .status(500)
                .body(full_body("skip forward"))
                .expect("static response parts");
            RequestAction::Respond(resp)
        })),
        on_response: Some(Arc::new(move |_resp, target| {
            *seen.lock().unwrap() = Some(target.map(|t| t.port));
        })),
        ..Default::default()
    };
    proxy
        .register("127.0.0.1", &upstream.target(""), opts)
        .unwrap();

    let (status, text) = http_get(proxy.http_addr().unwrap(), "/x", "127.0.0.1", &[]).await;
    assert_eq!(status, 500);
    assert!(text.contains("skip forward"));
    // The upstream never saw the request, and on_response ran with no target.
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    assert_eq!(*response_target.lock().unwrap(), Some(None));

    proxy.close(true).await;
}

#[tokio::test]
async fn test_upstream_refused_becomes_502() {
    // Grab a port that nothing listens on.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let proxy = started_proxy(local_proxy_options()).await;
    let codes: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_codes = Arc::clone(&codes);

    let opts = RouteOptions {
        on_error: Some(Arc::new(move |err, _target| {
            seen_codes.lock().unwrap().push(err.code());
            default_error_response(err)
        })),
        ..Default::default()
    };
    proxy
        .register(
            "127.0.0.1",
            &format!("http://127.0.0.1:{}", dead_port),
            opts,
        )
        .unwrap();

    let (status, _) = http_get(proxy.http_addr().unwrap(), "/x", "127.0.0.1", &[]).await;
    assert_eq!(status, 502);
    assert_eq!(codes.lock().unwrap().as_slice(), &["ECONNREFUSED"]);

    proxy.close(true).await;
}

// ============================================================================
// Load balancing and table lifecycle
// ============================================================================

#[tokio::test]
async fn test_round_robin_across_targets() {
    let a = spawn_upstream("from-a").await;
    let b = spawn_upstream("from-b").await;
    let proxy = started_proxy(local_proxy_options()).await;
    proxy
        .register("127.0.0.1", &a.target(""), RouteOptions::default())
        .unwrap();
    proxy
        .register("127.0.0.1", &b.target(""), RouteOptions::default())
        .unwrap();

    let mut bodies = Vec::new();
    for _ in 0..4 {
        let (status, text) = http_get(proxy.http_addr().unwrap(), "/", "127.0.0.1", &[]).await;
        assert_eq!(status, 200);
        bodies.push(if text.contains("from-a") { "a" } else { "b" });
    }
    assert_eq!(bodies, vec!["a", "b", "a", "b"]);
    assert_eq!(a.hits.load(Ordering::SeqCst), 2);
    assert_eq!(b.hits.load(Ordering::SeqCst), 2);

    proxy.close(true).await;
}

#[tokio::test]
async fn test_unregister_returns_to_404() {
    let upstream = spawn_upstream("ok").await;
    let proxy = started_proxy(local_proxy_options()).await;
    let target = upstream.target("");
    proxy
        .register("127.0.0.1", &target, RouteOptions::default())
        .unwrap();

    let (status, _) = http_get(proxy.http_addr().unwrap(), "/", "127.0.0.1", &[]).await;
    assert_eq!(status, 200);

    proxy.unregister("127.0.0.1", Some(&target)).unwrap();
    assert_eq!(proxy.routing_table().host_count(), 0);

    let (status, text) = http_get(proxy.http_addr().unwrap(), "/", "127.0.0.1", &[]).await;
    assert_eq!(status, 404);
    assert!(text.contains("Not Found"));

    proxy.close(true).await;
}

#[tokio::test]
async fn test_not_found_override() {
    let proxy = started_proxy(local_proxy_options()).await;
    proxy.not_found(|_req| {
        hyper::Response::builder()
            .status(410)
            .body(full_body("gone fishing"))
            .expect("static response parts")
    });

    let (status, text) = http_get(proxy.http_addr().unwrap(), "/", "unknown.test", &[]).await;
    assert_eq!(status, 410);
    assert!(text.contains("gone fishing"));

    proxy.close(true).await;
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_sse_events_stream_through_in_order() {
    // An event-stream upstream that emits two events with a gap.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = read_head(&mut stream).await;
                let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(b"data: hello1\n\n").await;
                let _ = stream.flush().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = stream.write_all(b"data: hello2\n\n").await;
            });
        }
    });

    let proxy = started_proxy(local_proxy_options()).await;
    proxy
        .register(
            "127.0.0.1",
            &format!("http://{}", addr),
            RouteOptions::default(),
        )
        .unwrap();

    let (status, text) = http_get(proxy.http_addr().unwrap(), "/x", "127.0.0.1", &[]).await;
    assert_eq!(status, 200);
    let first = text.find("hello1").expect("first event missing");
    let second = text.find("hello2").expect("second event missing");
    assert!(first < second);

    proxy.close(true).await;
}

// ============================================================================
// WebSocket upgrade
// ============================================================================

#[tokio::test]
async fn test_websocket_upgrade_echo() {
    // Upstream that accepts the upgrade and echoes bytes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = read_head(&mut stream).await;
                let reply = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
                let _ = stream.write_all(reply.as_bytes()).await;
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let proxy = started_proxy(local_proxy_options()).await;
    proxy
        .register(
            "127.0.0.1",
            &format!("http://{}", addr),
            RouteOptions::default(),
        )
        .unwrap();

    let mut client = TcpStream::connect(proxy.http_addr().unwrap()).await.unwrap();
    let upgrade = "GET /ws HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGVzdA==\r\n\r\n";
    client.write_all(upgrade.as_bytes()).await.unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {}", head);

    client.write_all(b"ping-1").await.unwrap();
    let mut echo = [0u8; 6];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping-1");

    proxy.close(true).await;
}

// ============================================================================
// TLS
// ============================================================================

mod tls {
    use super::*;
    use rustls::pki_types::ServerName;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    #[derive(Debug)]
    struct AcceptAll;

    impl rustls::client::danger::ServerCertVerifier for AcceptAll {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    fn write_self_signed(dir: &std::path::Path, hosts: &[&str]) -> (std::path::PathBuf, std::path::PathBuf) {
        let cert = rcgen::generate_simple_self_signed(
            hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        let key_path = dir.join("key.pem");
        let cert_path = dir.join("cert.pem");
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        (key_path, cert_path)
    }

    async fn spawn_tls_upstream(reply: &'static str) -> SocketAddr {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let cert = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
        let key = routegate::certs::load_key_pem(cert.key_pair.serialize_pem().as_bytes())
            .expect("generated key parses");
        let chain = vec![cert.cert.der().clone()];
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        match tls.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                buf.extend_from_slice(&chunk[..n]);
                                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        reply.len(),
                        reply
                    );
                    let _ = tls.write_all(response.as_bytes()).await;
                    let _ = tls.shutdown().await;
                });
            }
        });
        addr
    }

    async fn tls_get(addr: SocketAddr, path: &str, host: &str) -> (u16, String) {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAll));
        let connector = TlsConnector::from(Arc::new(config));

        let stream = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from(host.to_string()).unwrap();
        let mut tls = connector.connect(name, stream).await.unwrap();

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        tls.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let _ = tls.read_to_end(&mut response).await;
        let text = String::from_utf8_lossy(&response).to_string();
        let status = text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        (status, text)
    }

    /// HTTPS termination in front of a self-signed HTTPS upstream, with
    /// verification disabled per route. Both listeners serve the route.
    #[tokio::test]
    async fn test_https_to_https_with_secure_false() {
        let upstream_addr = spawn_tls_upstream("hello test").await;

        let dir = tempfile::tempdir().unwrap();
        let (key, cert) = write_self_signed(dir.path(), &["127.0.0.1", "localhost"]);

        let mut opts = local_proxy_options();
        opts.ssl = vec![SslConfig::new(0, &key, &cert)];
        opts.ssl[0].ip = "127.0.0.1".parse().unwrap();
        let proxy = started_proxy(opts).await;

        let route_opts = RouteOptions {
            http_proxy: ForwardOptions {
                secure: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        proxy
            .register(
                "127.0.0.1",
                &format!("https://{}", upstream_addr),
                route_opts,
            )
            .unwrap();

        let (status, text) =
            http_get(proxy.http_addr().unwrap(), "/x", "127.0.0.1", &[]).await;
        assert_eq!(status, 200);
        assert!(text.contains("hello test"));

        let https_addr = proxy.https_addrs()[0];
        let (status, text) = tls_get(https_addr, "/x", "127.0.0.1").await;
        assert_eq!(status, 200);
        assert!(text.contains("hello test"));

        proxy.close(true).await;
    }

    /// An SSL route with an installed certificate sends plain-HTTP clients
    /// to the HTTPS listener with a 302.
    #[tokio::test]
    async fn test_http_to_https_redirect() {
        let upstream = spawn_upstream("ok").await;

        let dir = tempfile::tempdir().unwrap();
        let (key, cert) = write_self_signed(dir.path(), &["127.0.0.1"]);

        let mut opts = local_proxy_options();
        let mut ssl = SslConfig::new(0, &key, &cert);
        ssl.ip = "127.0.0.1".parse().unwrap();
        ssl.redirect_port = Some(8443);
        opts.ssl = vec![ssl];
        let proxy = started_proxy(opts).await;

        let route_opts = RouteOptions {
            ssl: Some(RouteSsl {
                key: Some(key.clone()),
                cert: Some(cert.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        proxy
            .register("127.0.0.1", &upstream.target(""), route_opts)
            .unwrap();

        let (status, text) =
            http_get(proxy.http_addr().unwrap(), "/page?q=1", "127.0.0.1", &[]).await;
        assert_eq!(status, 302);
        assert!(
            text.contains("location: https://127.0.0.1:8443/page?q=1")
                || text.contains("Location: https://127.0.0.1:8443/page?q=1"),
            "missing redirect location: {}",
            text
        );
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);

        proxy.close(true).await;
    }

    /// With several HTTPS listeners, the redirect advertises the first
    /// listener that has redirects enabled, not listener zero.
    #[tokio::test]
    async fn test_redirect_skips_non_advertised_listener() {
        let upstream = spawn_upstream("ok").await;

        let dir = tempfile::tempdir().unwrap();
        let (key, cert) = write_self_signed(dir.path(), &["127.0.0.1"]);

        let mut opts = local_proxy_options();
        let mut internal = SslConfig::new(0, &key, &cert);
        internal.ip = "127.0.0.1".parse().unwrap();
        internal.redirect = false;
        let mut public = SslConfig::new(0, &key, &cert);
        public.ip = "127.0.0.1".parse().unwrap();
        public.redirect_port = Some(9443);
        opts.ssl = vec![internal, public];
        let proxy = started_proxy(opts).await;

        let route_opts = RouteOptions {
            ssl: Some(RouteSsl {
                key: Some(key.clone()),
                cert: Some(cert.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        proxy
            .register("127.0.0.1", &upstream.target(""), route_opts)
            .unwrap();

        let (status, text) =
            http_get(proxy.http_addr().unwrap(), "/page", "127.0.0.1", &[]).await;
        assert_eq!(status, 302);
        assert!(
            text.contains("location: https://127.0.0.1:9443/page")
                || text.contains("Location: https://127.0.0.1:9443/page"),
            "redirect must target the advertised listener: {}",
            text
        );

        proxy.close(true).await;
    }
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_close_stops_accepting() {
    let proxy = started_proxy(local_proxy_options()).await;
    let addr = proxy.http_addr().unwrap();

    proxy.close(false).await;

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_drains_live_connections() {
    // An upstream that streams forever.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = read_head(&mut stream).await;
                let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
                let _ = stream.write_all(head.as_bytes()).await;
                loop {
                    if stream.write_all(b"data: tick\n\n").await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            });
        }
    });

    let proxy = started_proxy(local_proxy_options()).await;
    proxy
        .register(
            "127.0.0.1",
            &format!("http://{}", addr),
            RouteOptions::default(),
        )
        .unwrap();

    let proxy_addr = proxy.http_addr().unwrap();
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET /stream HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    // Wait until the stream is flowing.
    let mut first = [0u8; 16];
    client.read_exact(&mut first).await.unwrap();
    assert!(proxy.connection_count() > 0);

    proxy.close(true).await;

    // The captured connection must be ended shortly after the grace period.
    let drained = tokio::time::timeout(Duration::from_secs(3), async {
        let mut sink = Vec::new();
        let _ = client.read_to_end(&mut sink).await;
    })
    .await;
    assert!(drained.is_ok(), "connection not drained after shutdown");
    assert_eq!(proxy.connection_count(), 0);
}

// ============================================================================
// Resolvers end-to-end
// ============================================================================

#[tokio::test]
async fn test_custom_resolver_overrides_table() {
    let table_upstream = spawn_upstream("from-table").await;
    let resolver_upstream = spawn_upstream("from-resolver").await;

    let proxy = started_proxy(local_proxy_options()).await;
    proxy
        .register("127.0.0.1", &table_upstream.target(""), RouteOptions::default())
        .unwrap();

    let resolver_target = resolver_upstream.target("");
    let id = proxy.add_resolver(10, move |_host, url, _info| {
        let target = resolver_target.clone();
        let hit = url.starts_with("/special");
        Box::pin(async move {
            Ok(hit.then(|| routegate::resolver::Resolution::Target(target)))
        })
    });

    let (_, text) = http_get(proxy.http_addr().unwrap(), "/special/x", "127.0.0.1", &[]).await;
    assert!(text.contains("from-resolver"));
    let (_, text) = http_get(proxy.http_addr().unwrap(), "/plain", "127.0.0.1", &[]).await;
    assert!(text.contains("from-table"));

    proxy.remove_resolver(id);
    let (_, text) = http_get(proxy.http_addr().unwrap(), "/special/x", "127.0.0.1", &[]).await;
    assert!(text.contains("from-table"));

    proxy.close(true).await;
}
