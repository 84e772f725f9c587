// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! Byte transports.
//!
//! A [`Transport`] moves raw bytes and nothing else. [`TcpTransport`] drives
//! a tokio socket (optionally wrapped by rustls) from blocking calls, so the
//! strategies can stay thread-based. Reads and writes take separate locks:
//! one thread may block in `receive` while others `send`.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info};

use crate::config::{TlsConfig, TransportConfig};
use crate::error::TransportError;
use crate::locks::lock;
use crate::tls;

/// Where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// LDAPS: TLS from the first byte
    pub use_tls: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
        }
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "ldaps" } else { "ldap" };
        write!(f, "{}://{}", scheme, self.address())
    }
}

/// Result of one receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// The peer closed the connection gracefully
    Eof,
    /// Nothing arrived within the requested wait
    Idle,
}

/// A single bidirectional byte stream.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Write all of `data` or fail.
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Read at most `max_bytes`. With `wait`, gives up after that long and
    /// returns [`ReadOutcome::Idle`].
    fn receive(&self, max_bytes: usize, wait: Option<Duration>)
    -> Result<ReadOutcome, TransportError>;

    /// Wrap the live stream in TLS.
    ///
    /// No other thread may be inside `receive` while this runs.
    fn start_tls(&self) -> Result<(), TransportError>;

    /// Shut the stream down. Blocked calls on other threads return
    /// [`TransportError::Closed`].
    fn close(&self);

    fn is_tls(&self) -> bool;

    fn endpoint(&self) -> &Endpoint;
}

/// Opens transports. Strategies reconnect through this.
pub trait Connector: Send + Sync + fmt::Debug {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Connects over TCP, with TLS for LDAPS endpoints.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    settings: TransportConfig,
    tls: TlsConfig,
}

impl TcpConnector {
    pub fn new(settings: TransportConfig, tls: TlsConfig) -> Self {
        Self { settings, tls }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = TcpTransport::connect(endpoint, &self.settings, &self.tls)?;
        Ok(Arc::new(transport))
    }
}

/// Plain TCP (ldap://) or TLS (ldaps://, or after StartTLS).
enum LdapStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for LdapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn tls_handshake(
    tcp: TcpStream,
    tls: &TlsConfig,
    host: &str,
) -> Result<LdapStream, TransportError> {
    let config = tls::client_config(tls, host)?;
    let name = tls::server_name(tls, host)?;
    let stream = TlsConnector::from(config)
        .connect(name, tcp)
        .await
        .map_err(|e| TransportError::Tls {
            host: host.to_string(),
            message: e.to_string(),
        })?;
    Ok(LdapStream::Tls(Box::new(stream)))
}

async fn idle_after(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

/// Blocking TCP/TLS transport driven by a private tokio runtime.
pub struct TcpTransport {
    endpoint: Endpoint,
    tls_config: TlsConfig,
    runtime: Runtime,
    reader: Mutex<Option<ReadHalf<LdapStream>>>,
    writer: Mutex<Option<WriteHalf<LdapStream>>>,
    closed: watch::Sender<bool>,
    tls_active: AtomicBool,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("endpoint", &self.endpoint)
            .field("tls_active", &self.is_tls())
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl TcpTransport {
    pub fn connect(
        endpoint: &Endpoint,
        settings: &TransportConfig,
        tls: &TlsConfig,
    ) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ldap-io")
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;

        let address = endpoint.address();
        let timeout = settings.connect_timeout();
        let stream = runtime.block_on(async {
            let tcp = tokio::time::timeout(timeout, TcpStream::connect(&address))
                .await
                .map_err(|_| TransportError::ConnectTimeout {
                    address: address.clone(),
                    timeout,
                })?
                .map_err(|source| TransportError::Connect {
                    address: address.clone(),
                    source,
                })?;
            let _ = tcp.set_nodelay(true);
            if endpoint.use_tls {
                tls_handshake(tcp, tls, &endpoint.host).await
            } else {
                Ok(LdapStream::Tcp(tcp))
            }
        })?;
        debug!(endpoint = %endpoint, "connected");

        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Ok(Self {
            endpoint: endpoint.clone(),
            tls_config: tls.clone(),
            runtime,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
            tls_active: AtomicBool::new(endpoint.use_tls),
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Transport for TcpTransport {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        let mut closed = self.closed.subscribe();
        self.runtime.block_on(async {
            tokio::select! {
                written = async {
                    writer.write_all(data).await?;
                    writer.flush().await
                } => written.map_err(TransportError::Send),
                _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            }
        })
    }

    fn receive(
        &self,
        max_bytes: usize,
        wait: Option<Duration>,
    ) -> Result<ReadOutcome, TransportError> {
        let mut guard = lock(&self.reader);
        let reader = guard.as_mut().ok_or(TransportError::Closed)?;
        let mut closed = self.closed.subscribe();
        let mut buf = vec![0u8; max_bytes.max(1)];

        let read = self.runtime.block_on(async {
            tokio::select! {
                read = reader.read(&mut buf) => read.map(Some).map_err(TransportError::Receive),
                _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
                _ = idle_after(wait) => Ok(None),
            }
        });

        match read {
            Ok(Some(0)) => Ok(ReadOutcome::Eof),
            Ok(Some(n)) => {
                buf.truncate(n);
                Ok(ReadOutcome::Data(buf))
            }
            Ok(None) => Ok(ReadOutcome::Idle),
            Err(err) => {
                if self.is_closed() {
                    guard.take();
                }
                Err(err)
            }
        }
    }

    fn start_tls(&self) -> Result<(), TransportError> {
        if self.is_tls() {
            return Err(TransportError::Tls {
                host: self.endpoint.host.clone(),
                message: "TLS is already active".to_string(),
            });
        }
        let mut reader = lock(&self.reader);
        let mut writer = lock(&self.writer);
        let (Some(read_half), Some(write_half)) = (reader.take(), writer.take()) else {
            return Err(TransportError::Closed);
        };

        let tcp = match read_half.unsplit(write_half) {
            LdapStream::Tcp(tcp) => tcp,
            LdapStream::Tls(_) => {
                return Err(TransportError::Tls {
                    host: self.endpoint.host.clone(),
                    message: "TLS is already active".to_string(),
                });
            }
        };
        let stream = self
            .runtime
            .block_on(tls_handshake(tcp, &self.tls_config, &self.endpoint.host))?;
        let (read_half, write_half) = tokio::io::split(stream);
        *reader = Some(read_half);
        *writer = Some(write_half);
        self.tls_active.store(true, Ordering::SeqCst);
        info!(endpoint = %self.endpoint, "StartTLS negotiated");
        Ok(())
    }

    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Some(mut writer) = lock(&self.writer).take() {
            self.runtime.block_on(async {
                let _ = tokio::time::timeout(Duration::from_secs(1), writer.shutdown()).await;
            });
        }
        // A reader blocked in `receive` drops its half once it wakes
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        debug!(endpoint = %self.endpoint, "closed");
    }

    fn is_tls(&self) -> bool {
        self.tls_active.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
