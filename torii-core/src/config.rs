//! Server configuration as produced by the external loader.
//!
//! The recognized keys mirror the deployment surface: listener placement,
//! connection-pool sizing, buffer geometry, protocol toggles, content
//! roots and TLS material. Unknown keys are rejected so typos surface at
//! startup instead of silently falling back to defaults.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ServerConfig {
    pub listen_port: u16,
    pub bind_address: String,
    pub initial_user_connection: u32,
    pub max_user_connection: u32,
    /// Width of the send/receive blocks handed to each connection.
    pub buffer_size: usize,
    pub numa_node: Option<u16>,
    #[serde(rename = "enableSSL")]
    pub enable_ssl: bool,
    #[serde(rename = "enableHTTP2")]
    pub enable_http2: bool,
    pub root_path: PathBuf,
    pub index_file_name: String,
    pub temp_file_path: PathBuf,
    pub server_name: String,
    pub private_key_path: Option<PathBuf>,
    pub certificate_path: Option<PathBuf>,
    pub log_level: String,
    pub log_directory: Option<PathBuf>,
    /// Seconds a closed socket waits before its slot re-arms an accept.
    pub time_wait_seconds: u32,
    /// Worker threads per hardware thread.
    pub worker_multiplier: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: 80,
            bind_address: "0.0.0.0".into(),
            initial_user_connection: 128,
            max_user_connection: 1024,
            buffer_size: 128 * 1024,
            numa_node: None,
            enable_ssl: false,
            enable_http2: true,
            root_path: PathBuf::from("."),
            index_file_name: "index.html".into(),
            temp_file_path: std::env::temp_dir(),
            server_name: "torii".into(),
            private_key_path: None,
            certificate_path: None,
            log_level: "info".into(),
            log_directory: None,
            time_wait_seconds: 240,
            worker_multiplier: 1,
        }
    }
}

impl ServerConfig {
    /// Worker thread count for the runtime.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        let hw = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        (hw * self.worker_multiplier.max(1)).max(1)
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        use std::net::ToSocketAddrs as _;
        (self.bind_address.as_str(), self.listen_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unresolvable bind address {}", self.bind_address),
                )
            })
    }
}
