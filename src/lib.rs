//! WebSocket Tunnel Client
//!
//! Listens on a local TCP address and tunnels every accepted connection to a
//! fixed remote WebSocket endpoint, optionally over TLS and through a SOCKS5
//! or HTTP CONNECT proxy discovered from the environment.

pub mod config;
pub mod proxy;
pub mod stream;
pub mod tls;
pub mod tunnel;

// Re-export commonly used types and functions
pub use config::{Config, ListenConfig, TargetConfig, TlsSettings, load_config};
pub use proxy::{ProxyEnv, dial, dial_with_env};
pub use stream::TransportStream;
pub use tls::{CA_BUNDLE_FILE, TlsContext, build_tls_context};
pub use tunnel::{BUFFER_SIZE, TunnelConfig, WS_ORIGIN, connect_upstream, handle_connection, relay};
