use anyhow::{Context, Result, anyhow, bail};
use std::env;
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;
use url::Url;

/// Upper bound on a proxy's CONNECT response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

const DEFAULT_SOCKS_PORT: u16 = 1080;
const DEFAULT_HTTP_PROXY_PORT: u16 = 80;

/// Snapshot of the proxy-relevant environment, taken once per connection
/// attempt. Lowercase variables win over their uppercase forms.
pub struct ProxyEnv {
    pub all_proxy: Option<Url>,
    pub http_proxy: Option<Url>,
    pub https_proxy: Option<Url>,
    pub no_proxy: Option<String>,
}

impl ProxyEnv {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            all_proxy: env_url("all_proxy"),
            http_proxy: env_url("http_proxy"),
            https_proxy: env_url("https_proxy"),
            no_proxy: env_var("no_proxy"),
        }
    }

    /// SOCKS5 discovery: `all_proxy` counts only when it names a SOCKS5
    /// scheme; anything else falls through to the HTTP branch.
    fn socks5(&self) -> Option<&Url> {
        self.all_proxy
            .as_ref()
            .filter(|url| matches!(url.scheme(), "socks5" | "socks5h"))
    }

    fn http_proxy_for(&self, lookup_scheme: &str, host: &str) -> Option<&Url> {
        if self.bypasses(host) {
            return None;
        }
        match lookup_scheme {
            "https" => self.https_proxy.as_ref(),
            _ => self.http_proxy.as_ref(),
        }
    }

    /// `no_proxy` matching: `*` bypasses everything, otherwise an entry
    /// matches the host exactly or as a domain suffix.
    fn bypasses(&self, host: &str) -> bool {
        let Some(list) = self.no_proxy.as_deref() else {
            return false;
        };
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .any(|entry| {
                entry == "*"
                    || host == entry
                    || host.ends_with(&format!(".{}", entry.trim_start_matches('.')))
            })
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(|| {
            env::var(name.to_uppercase())
                .ok()
                .filter(|value| !value.is_empty())
        })
}

fn env_url(name: &str) -> Option<Url> {
    env_var(name).and_then(|value| {
        // Bare host:port values get an implied scheme, matching common
        // proxy tooling.
        let candidate = if value.contains("://") {
            value
        } else {
            format!("http://{value}")
        };
        Url::parse(&candidate).ok()
    })
}

/// Dials the target URL, traversing whatever proxy the environment
/// configures. Precedence: SOCKS5, then HTTP CONNECT, then direct. Each
/// branch is terminal; a failure never falls through to the next one.
pub async fn dial(target: &Url) -> Result<TcpStream> {
    dial_with_env(target, &ProxyEnv::from_env()).await
}

pub async fn dial_with_env(target: &Url, proxies: &ProxyEnv) -> Result<TcpStream> {
    let host = target
        .host_str()
        .ok_or_else(|| anyhow!("Target URL {target} has no host"))?;
    let port = target
        .port_or_known_default()
        .ok_or_else(|| anyhow!("Target URL {target} has no port"))?;

    if let Some(proxy) = proxies.socks5() {
        debug!(proxy = %proxy, target = %target, "Dialing through SOCKS5 proxy");
        return dial_socks5(proxy, host, port).await;
    }

    // The environment lookup wants http schemes; the dial itself keeps the
    // target authority as-is.
    let lookup_scheme = if target.scheme() == "wss" { "https" } else { "http" };
    match proxies.http_proxy_for(lookup_scheme, host) {
        None => {
            debug!(target = %target, "Dialing target directly");
            TcpStream::connect((host, port))
                .await
                .with_context(|| format!("Failed to connect to {host}:{port}"))
        }
        Some(proxy) => {
            debug!(proxy = %proxy, target = %target, "Dialing through HTTP CONNECT proxy");
            dial_http_connect(proxy, host, port).await
        }
    }
}

async fn dial_socks5(proxy: &Url, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_addr = proxy_authority(proxy, DEFAULT_SOCKS_PORT)?;
    let target = (host.to_string(), port);

    let stream = match proxy.password() {
        Some(password) if !proxy.username().is_empty() => {
            Socks5Stream::connect_with_password(
                proxy_addr.as_str(),
                target,
                proxy.username(),
                password,
            )
            .await
        }
        _ => Socks5Stream::connect(proxy_addr.as_str(), target).await,
    }
    .with_context(|| format!("SOCKS5 proxy {proxy_addr} failed to reach {host}:{port}"))?;

    Ok(stream.into_inner())
}

async fn dial_http_connect(proxy: &Url, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_addr = proxy_authority(proxy, DEFAULT_HTTP_PROXY_PORT)?;
    let mut stream = TcpStream::connect(&proxy_addr)
        .await
        .with_context(|| format!("Failed to connect to proxy {proxy_addr}"))?;

    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .with_context(|| format!("Failed to send CONNECT request to proxy {proxy_addr}"))?;

    read_connect_response(&mut stream).await?;
    // From here on the socket carries tunnel bytes only; the HTTP exchange
    // never touches it again.
    Ok(stream)
}

/// Reads the proxy's response head byte-wise so no tunnel bytes end up in a
/// throwaway buffer. A proxy that ends the stream right after a complete 2xx
/// status line is a single-use tunnel, not a failure.
async fn read_connect_response(stream: &mut TcpStream) -> Result<()> {
    let mut head = Vec::with_capacity(256);
    loop {
        match stream.read_u8().await {
            Ok(byte) => {
                head.push(byte);
                if head.ends_with(b"\r\n\r\n") {
                    break;
                }
                if head.len() > MAX_RESPONSE_HEAD {
                    bail!("CONNECT response head exceeds {MAX_RESPONSE_HEAD} bytes");
                }
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("Failed to read CONNECT response"),
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or("");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow!("Malformed CONNECT response: {status_line:?}"))?;

    if !(200..300).contains(&status) {
        bail!("Proxy rejected CONNECT: {status_line}");
    }
    Ok(())
}

fn proxy_authority(proxy: &Url, default_port: u16) -> Result<String> {
    let host = proxy
        .host_str()
        .ok_or_else(|| anyhow!("Proxy URL {proxy} has no host"))?;
    let port = proxy.port_or_known_default().unwrap_or(default_port);
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::{Duration, timeout};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn target_url(addr: SocketAddr) -> Url {
        Url::parse(&format!("ws://{addr}")).unwrap()
    }

    fn no_proxies() -> ProxyEnv {
        ProxyEnv {
            all_proxy: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
        }
    }

    async fn echo_bytes(mut stream: TcpStream) {
        let mut buffer = [0u8; 4096];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) if stream.write_all(&buffer[..n]).await.is_err() => break,
                Ok(_) => {}
            }
        }
    }

    /// TCP server that echoes whatever it receives.
    async fn start_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(echo_bytes(stream));
            }
        });
        addr
    }

    /// Minimal RFC 1928 server: no-auth negotiation, then echoes tunnel
    /// bytes back instead of dialing out. Signals through the channel once
    /// the tunnel request was accepted.
    async fn start_socks5_proxy() -> (SocketAddr, oneshot::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (used_tx, used_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 2];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting[0], 0x05);
            let mut methods = vec![0u8; greeting[1] as usize];
            stream.read_exact(&mut methods).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 4];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request[1], 0x01, "expected CONNECT command");
            match request[3] {
                0x01 => {
                    let mut rest = [0u8; 6];
                    stream.read_exact(&mut rest).await.unwrap();
                }
                0x03 => {
                    let len = stream.read_u8().await.unwrap() as usize;
                    let mut rest = vec![0u8; len + 2];
                    stream.read_exact(&mut rest).await.unwrap();
                }
                _ => {
                    let mut rest = [0u8; 18];
                    stream.read_exact(&mut rest).await.unwrap();
                }
            }
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let _ = used_tx.send(());
            echo_bytes(stream).await;
        });

        (addr, used_rx)
    }

    /// Replies to a single CONNECT and then echoes tunnel bytes. Reports the
    /// request line it saw through the channel.
    async fn start_connect_proxy(response: &'static str) -> (SocketAddr, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                head.push(stream.read_u8().await.unwrap());
            }
            let head = String::from_utf8(head).unwrap();
            let _ = seen_tx.send(head.lines().next().unwrap_or("").to_string());

            stream.write_all(response.as_bytes()).await.unwrap();
            echo_bytes(stream).await;
        });

        (addr, seen_rx)
    }

    async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(payload).await.unwrap();
        let mut received = vec![0u8; payload.len()];
        timeout(TEST_TIMEOUT, stream.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn dials_directly_without_proxies() {
        let target = start_echo_server().await;

        let mut stream = dial_with_env(&target_url(target), &no_proxies())
            .await
            .unwrap();
        roundtrip(&mut stream, b"direct dial").await;
    }

    #[tokio::test]
    async fn socks5_proxy_takes_precedence_over_http_proxy() {
        let (proxy, used_rx) = start_socks5_proxy().await;

        // The HTTP proxy points nowhere; if precedence were wrong the dial
        // would fail instead of reaching the SOCKS mock.
        let proxies = ProxyEnv {
            all_proxy: Some(Url::parse(&format!("socks5://{proxy}")).unwrap()),
            http_proxy: Some(Url::parse("http://127.0.0.1:1").unwrap()),
            https_proxy: Some(Url::parse("http://127.0.0.1:1").unwrap()),
            no_proxy: None,
        };

        let target = Url::parse("ws://192.0.2.1:9999").unwrap();
        let mut stream = dial_with_env(&target, &proxies).await.unwrap();

        timeout(TEST_TIMEOUT, used_rx).await.unwrap().unwrap();
        roundtrip(&mut stream, b"through socks").await;
    }

    #[tokio::test]
    async fn non_socks_all_proxy_is_ignored() {
        let target = start_echo_server().await;

        let proxies = ProxyEnv {
            all_proxy: Some(Url::parse("http://127.0.0.1:1").unwrap()),
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
        };

        let mut stream = dial_with_env(&target_url(target), &proxies).await.unwrap();
        roundtrip(&mut stream, b"direct despite all_proxy").await;
    }

    #[tokio::test]
    async fn http_proxy_tunnels_with_original_authority() {
        let (proxy, seen_rx) =
            start_connect_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;

        let proxies = ProxyEnv {
            all_proxy: None,
            http_proxy: Some(Url::parse(&format!("http://{proxy}")).unwrap()),
            https_proxy: None,
            no_proxy: None,
        };

        let target = Url::parse("ws://192.0.2.1:9999").unwrap();
        let mut stream = dial_with_env(&target, &proxies).await.unwrap();

        let request_line = timeout(TEST_TIMEOUT, seen_rx).await.unwrap().unwrap();
        assert_eq!(request_line, "CONNECT 192.0.2.1:9999 HTTP/1.1");
        roundtrip(&mut stream, b"through connect").await;
    }

    #[tokio::test]
    async fn wss_target_uses_https_proxy_slot() {
        let (proxy, seen_rx) =
            start_connect_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;

        let proxies = ProxyEnv {
            all_proxy: None,
            http_proxy: None,
            https_proxy: Some(Url::parse(&format!("http://{proxy}")).unwrap()),
            no_proxy: None,
        };

        let target = Url::parse("wss://192.0.2.1:9999").unwrap();
        dial_with_env(&target, &proxies).await.unwrap();

        let request_line = timeout(TEST_TIMEOUT, seen_rx).await.unwrap().unwrap();
        assert_eq!(request_line, "CONNECT 192.0.2.1:9999 HTTP/1.1");
    }

    #[tokio::test]
    async fn proxy_rejection_fails_the_dial() {
        let (proxy, _seen_rx) = start_connect_proxy("HTTP/1.1 403 Forbidden\r\n\r\n").await;

        let proxies = ProxyEnv {
            all_proxy: None,
            http_proxy: Some(Url::parse(&format!("http://{proxy}")).unwrap()),
            https_proxy: None,
            no_proxy: None,
        };

        let target = Url::parse("ws://192.0.2.1:9999").unwrap();
        let result = dial_with_env(&target, &proxies).await;
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("403"), "{message}");
    }

    #[tokio::test]
    async fn eof_after_2xx_status_line_is_success() {
        // Single-use proxy: complete status line, then the stream ends
        // before the blank line.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                head.push(stream.read_u8().await.unwrap());
            }
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n")
                .await
                .unwrap();
        });

        let proxies = ProxyEnv {
            all_proxy: None,
            http_proxy: Some(Url::parse(&format!("http://{proxy}")).unwrap()),
            https_proxy: None,
            no_proxy: None,
        };

        let target = Url::parse("ws://192.0.2.1:9999").unwrap();
        dial_with_env(&target, &proxies).await.unwrap();
    }

    #[tokio::test]
    async fn no_proxy_bypasses_http_proxy() {
        let target = start_echo_server().await;

        let proxies = ProxyEnv {
            all_proxy: None,
            http_proxy: Some(Url::parse("http://127.0.0.1:1").unwrap()),
            https_proxy: None,
            no_proxy: Some("127.0.0.1".to_string()),
        };

        let mut stream = dial_with_env(&target_url(target), &proxies).await.unwrap();
        roundtrip(&mut stream, b"bypassed").await;
    }

    #[test]
    fn no_proxy_matching_rules() {
        let env = ProxyEnv {
            all_proxy: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: Some("example.com, .internal".to_string()),
        };
        assert!(env.bypasses("example.com"));
        assert!(env.bypasses("api.example.com"));
        assert!(env.bypasses("svc.internal"));
        assert!(!env.bypasses("example.org"));
        assert!(!env.bypasses("notexample.com"));
    }

    #[test]
    fn wildcard_no_proxy_bypasses_everything() {
        let env = ProxyEnv {
            all_proxy: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: Some("*".to_string()),
        };
        assert!(env.bypasses("anything.example.com"));
    }
}
