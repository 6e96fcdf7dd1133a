//! 兩個短暫存在的監聽器：port 80 的 HTTP-01 挑戰回應器，以及在握手時向憑證管理器取憑證的 TLS 監聽器。
//!
//! 每個監聽器都是一個 tokio task，透過 [`ServerHandle`] 等待就緒、要求關閉或直接中止。

use std::{convert::Infallible, future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming, server::conn::http1, service::service_fn, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use rustls::{
    server::{Acceptor, ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{oneshot, watch},
    task::{JoinError, JoinHandle, JoinSet},
    time::{timeout_at, Instant},
};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use crate::{
    challenge::ACME_TLS_ALPN_PROTOCOL,
    manager::{CertificateManager, ClientHelloInfo},
};

/// 監聽器生命週期中的錯誤。
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{name} listener failed to bind {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{name} listener stopped before reporting readiness")]
    NotStarted { name: &'static str },
    #[error("{name} listener did not drain {remaining} connection(s) before the deadline")]
    ShutdownTimeout {
        name: &'static str,
        remaining: usize,
    },
    #[error("{name} listener task overran the shutdown deadline and was aborted")]
    Aborted { name: &'static str },
    #[error("{name} listener task failed: {source}")]
    Task {
        name: &'static str,
        #[source]
        source: JoinError,
    },
}

type Result<T> = std::result::Result<T, ServerError>;

/// 監聽器 task 在截止時間之後仍未結束時，額外等待的時間。
const JOIN_GRACE: Duration = Duration::from_millis(250);

/// accept 失敗（例如 EMFILE）後重試前的等待時間。
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

type Shutdown = watch::Receiver<Option<Instant>>;

/// 執行中監聽器的控制代碼。
#[derive(Debug)]
pub struct ServerHandle {
    name: &'static str,
    ready: Option<oneshot::Receiver<Result<SocketAddr>>>,
    local_addr: Option<SocketAddr>,
    shutdown: watch::Sender<Option<Instant>>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 等待監聽器開始接受連線，回傳實際綁定的位址；綁定失敗時回傳該錯誤。
    pub async fn ready(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }
        let ready = self
            .ready
            .take()
            .ok_or(ServerError::NotStarted { name: self.name })?;
        let addr = ready
            .await
            .map_err(|_| ServerError::NotStarted { name: self.name })??;
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// 停止接受新連線，請現有連線完成目前的請求後關閉，最多等到 `deadline`。
    ///
    /// 截止時仍未結束的連線會被中止並回傳 [`ServerError::ShutdownTimeout`]；
    /// 監聽器 task 本身超過截止時間加上寬限期仍未結束時，會被中止並回傳 [`ServerError::Aborted`]。
    pub async fn shutdown(self, deadline: Instant) -> Result<()> {
        // task 已結束時接收端也已關閉，送出失敗無妨
        let _ = self.shutdown.send(Some(deadline));

        let mut task = self.task;
        match timeout_at(deadline + JOIN_GRACE, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(source)) => Err(ServerError::Task {
                name: self.name,
                source,
            }),
            Err(_) => {
                warn!(listener = self.name, "listener task overran shutdown deadline, aborting");
                task.abort();
                Err(ServerError::Aborted { name: self.name })
            }
        }
    }

    /// 立即中止監聽器與其所有連線，回傳時監聽埠已釋放。
    pub async fn abort(self) {
        debug!(listener = self.name, "aborting listener");
        self.task.abort();
        let _ = self.task.await;
    }
}

/// 在 `addr` 啟動 HTTP-01 挑戰監聽器，所有請求交給 [`CertificateManager::handle_challenge`]。
pub fn spawn_challenge_listener(
    addr: SocketAddr,
    manager: Arc<dyn CertificateManager>,
) -> ServerHandle {
    spawn_listener("challenge", addr, move |stream, peer, shutdown| {
        let manager = manager.clone();
        async move {
            let handler = move |req: &Request<Incoming>| manager.handle_challenge(req.uri().path());
            serve_http(stream, peer, shutdown, handler).await;
        }
    })
}

/// 在 `addr` 啟動 TLS 監聽器。
///
/// 每個連線先讀取 ClientHello，再向憑證管理器取得憑證完成握手；取不到憑證時直接關閉連線。
/// 握手成功後以 HTTP/1.1 回應 200 與空內容。
pub fn spawn_tls_listener(addr: SocketAddr, manager: Arc<dyn CertificateManager>) -> ServerHandle {
    spawn_listener("tls", addr, move |stream, peer, shutdown| {
        let manager = manager.clone();
        async move { serve_tls(stream, peer, shutdown, manager).await }
    })
}

fn spawn_listener<H, F>(name: &'static str, addr: SocketAddr, handler: H) -> ServerHandle
where
    H: Fn(TcpStream, SocketAddr, Shutdown) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(None);
    let task = tokio::spawn(accept_loop(name, addr, ready_tx, shutdown_rx, handler));

    ServerHandle {
        name,
        ready: Some(ready_rx),
        local_addr: None,
        shutdown: shutdown_tx,
        task,
    }
}

async fn accept_loop<H, F>(
    name: &'static str,
    addr: SocketAddr,
    ready: oneshot::Sender<Result<SocketAddr>>,
    mut shutdown: Shutdown,
    handler: H,
) -> Result<()>
where
    H: Fn(TcpStream, SocketAddr, Shutdown) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let bound = TcpListener::bind(addr)
        .await
        .and_then(|listener| Ok((listener.local_addr()?, listener)));
    let (local_addr, listener) = match bound {
        Ok(bound) => bound,
        Err(source) => {
            warn!(listener = name, %addr, error = %source, "failed to bind listener");
            let _ = ready.send(Err(ServerError::Bind { name, addr, source }));
            return Ok(());
        }
    };
    info!(listener = name, addr = %local_addr, "listening");
    let _ = ready.send(Ok(local_addr));

    let mut connections = JoinSet::new();
    let deadline = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                match changed {
                    Ok(()) => {
                        if let Some(deadline) = *shutdown.borrow_and_update() {
                            break deadline;
                        }
                    }
                    // 控制代碼已被丟棄
                    Err(_) => break Instant::now(),
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(listener = name, %peer, "accepted connection");
                    connections.spawn(handler(stream, peer, shutdown.clone()));
                }
                Err(e) => accept_error(name, &e).await,
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    drop(listener);
    info!(listener = name, live = connections.len(), "listener closed, draining connections");

    let drained = timeout_at(deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    match drained {
        Ok(()) => {
            debug!(listener = name, "listener shut down");
            Ok(())
        }
        Err(_) => {
            let remaining = connections.len();
            connections.abort_all();
            Err(ServerError::ShutdownTimeout { name, remaining })
        }
    }
}

/// 記錄 accept 錯誤並稍候再重試，避免持續性錯誤造成忙迴圈。
async fn accept_error(name: &'static str, error: &io::Error) {
    warn!(listener = name, %error, "accept failed");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// 以 HTTP/1.1 服務單一連線；收到關閉訊號後讓 hyper 完成進行中的請求再結束。
async fn serve_http<S, H>(stream: S, peer: SocketAddr, mut shutdown: Shutdown, handler: H)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler(&req)) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut closing = shutdown.borrow().is_some();
    if closing {
        conn.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%peer, error = %e, "connection error");
                }
                break;
            }
            _ = shutdown.changed(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn serve_tls(
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: Shutdown,
    manager: Arc<dyn CertificateManager>,
) {
    let start = match LazyConfigAcceptor::new(Acceptor::default(), stream).await {
        Ok(start) => start,
        Err(e) => {
            debug!(%peer, error = %e, "failed to read ClientHello");
            return;
        }
    };

    let hello = ClientHelloInfo::from_client_hello(&start.client_hello());
    let certified = match manager.get_certificate(&hello).await {
        Ok(certified) => certified,
        Err(e) => {
            warn!(%peer, server_name = ?hello.server_name, error = %e, "rejecting TLS handshake");
            return;
        }
    };

    let acme_tls = hello.is_acme_tls_challenge();
    let config = match server_config(certified, acme_tls) {
        Ok(config) => config,
        Err(e) => {
            warn!(%peer, error = %e, "failed to build TLS configuration");
            return;
        }
    };

    let tls = match start.into_stream(config).await {
        Ok(tls) => tls,
        Err(e) => {
            debug!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    if acme_tls {
        // tls-alpn-01 驗證只需要完成握手
        debug!(%peer, server_name = ?hello.server_name, "completed tls-alpn-01 handshake");
        return;
    }

    debug!(%peer, server_name = ?hello.server_name, "TLS handshake complete");
    serve_http(tls, peer, shutdown, |_req: &Request<Incoming>| {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::OK;
        response
    })
    .await;
}

/// 每次握手固定使用一張憑證的解析器。
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn server_config(
    certified: Arc<CertifiedKey>,
    acme_tls: bool,
) -> std::result::Result<Arc<ServerConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(certified)));
    if acme_tls {
        config.alpn_protocols = vec![ACME_TLS_ALPN_PROTOCOL.to_vec()];
    }
    Ok(Arc::new(config))
}
