use crate::protocol::{
    self, CLIENT_ACK_LEN, ClientHello, HandshakeStatus, SIGNAL_HANDSHAKE, StreamId,
};
use crate::tokens::SecurityTokens;
use procwire_core::{LoopActivity, ProcessError, Result, RunnerConfig, Watcher, WatcherRef};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// The three stdio sockets of one wrapper, indexed by [`StreamId`].
pub type ConnectedSockets = [TcpStream; 3];

struct PendingProcess {
    registration: u64,
    tokens: Arc<SecurityTokens>,
    claimed: [bool; 3],
    sockets: [Option<TcpStream>; 3],
    ready: oneshot::Sender<Result<ConnectedSockets>>,
    // Keeps the accept watcher referenced while this process awaits its sockets.
    _accepting: WatcherRef,
}

struct ConnectorShared {
    token_size: usize,
    registrations: AtomicU64,
    client_timeout: Duration,
    pending: Mutex<HashMap<u32, PendingProcess>>,
}

enum Rejection {
    /// The hello named no pending process; only the client is turned away.
    Client(HandshakeStatus),
    /// The hello implicated a pending process, whose start fails too.
    Process { pid: u32, status: HandshakeStatus },
}

impl ConnectorShared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u32, PendingProcess>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fail(&self, pid: u32, error: ProcessError) {
        if let Some(process) = self.pending().remove(&pid) {
            let _ = process.ready.send(Err(error));
        }
    }

    /// Validates a hello and claims its stream. Returns the server token to send.
    fn claim(&self, hello: &ClientHello) -> std::result::Result<(StreamId, Vec<u8>), Rejection> {
        let mut pending = self.pending();
        let known = pending.contains_key(&hello.pid);
        let reject = |status| {
            if known {
                Rejection::Process {
                    pid: hello.pid,
                    status,
                }
            } else {
                Rejection::Client(status)
            }
        };

        if hello.signal != SIGNAL_HANDSHAKE {
            return Err(reject(HandshakeStatus::SignalUnexpected));
        }

        let stream = StreamId::try_from(hello.stream_id).map_err(reject)?;

        let Some(process) = pending.get_mut(&hello.pid) else {
            return Err(Rejection::Client(HandshakeStatus::InvalidProcessId));
        };

        if process.claimed[stream.index()] {
            return Err(reject(HandshakeStatus::DuplicateStreamId));
        }

        if !process.tokens.verify_client(stream, &hello.token) {
            return Err(reject(HandshakeStatus::InvalidClientToken));
        }

        process.claimed[stream.index()] = true;
        Ok((stream, process.tokens.server(stream).to_vec()))
    }

    /// Stores a confirmed socket; completes the process once all three arrived.
    fn attach(&self, pid: u32, stream: StreamId, socket: TcpStream) -> std::result::Result<(), TcpStream> {
        let mut pending = self.pending();
        let Some(process) = pending.get_mut(&pid) else {
            return Err(socket);
        };

        process.sockets[stream.index()] = Some(socket);
        debug!(wrapper_pid = pid, stream_id = ?stream, "Wrapper socket confirmed");
        if process.sockets.iter().any(Option::is_none) {
            return Ok(());
        }

        if let Some(process) = pending.remove(&pid) {
            let [stdin, stdout, stderr] = process.sockets;
            if let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) {
                let _ = process.ready.send(Ok([stdin, stdout, stderr]));
                debug!(wrapper_pid = pid, "All wrapper sockets connected");
            }
        }
        Ok(())
    }

    async fn handle_client(self: Arc<Self>, mut socket: TcpStream, peer: SocketAddr) {
        let outcome = tokio::time::timeout(self.client_timeout, self.handshake(&mut socket)).await;

        let (pid, stream) = match outcome {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(rejection)) => {
                self.reject(&mut socket, rejection).await;
                return;
            }
            Err(_) => {
                debug!(%peer, "Client handshake timed out");
                return;
            }
        };

        if let Err(mut socket) = self.attach(pid, stream, socket) {
            debug!(wrapper_pid = pid, "Client finished handshake after its process stopped waiting");
            let ack = protocol::encode_server_ack(HandshakeStatus::NoLongerPending, None);
            let _ = socket.write_all(&ack).await;
            let _ = socket.shutdown().await;
        }
    }

    async fn handshake(
        &self,
        socket: &mut TcpStream,
    ) -> std::result::Result<(u32, StreamId), Option<Rejection>> {
        let mut buf = vec![0u8; ClientHello::encoded_len(self.token_size)];
        socket.read_exact(&mut buf).await.map_err(|_| None)?;

        let hello = ClientHello::decode(&buf, self.token_size).ok_or(None)?;
        let (stream, server_token) = self.claim(&hello).map_err(Some)?;

        let ack = protocol::encode_server_ack(HandshakeStatus::Success, Some(&server_token));
        if socket.write_all(&ack).await.is_err() {
            return Err(Some(Rejection::Process {
                pid: hello.pid,
                status: HandshakeStatus::AckWriteError,
            }));
        }

        let mut confirmation = [0u8; CLIENT_ACK_LEN];
        let confirmed = socket.read_exact(&mut confirmation).await.is_ok()
            && protocol::decode_client_ack(confirmation).is_ok();
        if !confirmed {
            return Err(Some(Rejection::Process {
                pid: hello.pid,
                status: HandshakeStatus::AckStatusError,
            }));
        }

        Ok((hello.pid, stream))
    }

    async fn reject(&self, socket: &mut TcpStream, rejection: Option<Rejection>) {
        let Some(rejection) = rejection else {
            debug!("Dropping client that disconnected mid-handshake");
            return;
        };

        let status = match rejection {
            Rejection::Client(status) => {
                warn!(%status, "Rejected wrapper client");
                status
            }
            Rejection::Process { pid, status } => {
                warn!(wrapper_pid = pid, %status, "Rejected wrapper client of pending process");
                self.fail(
                    pid,
                    ProcessError::Handshake(format!("Client handshake failed: {status}")),
                );
                status
            }
        };

        if status != HandshakeStatus::AckWriteError {
            let ack = protocol::encode_server_ack(status, None);
            let _ = socket.write_all(&ack).await;
        }
        let _ = socket.shutdown().await;
    }
}

/// Loopback listener that pairs incoming wrapper sockets with pending processes.
pub struct SocketConnector {
    address: SocketAddr,
    shared: Arc<ConnectorShared>,
    accept_watcher: Watcher,
}

impl SocketConnector {
    /// Binds `127.0.0.1:0`. Must be called inside a tokio runtime.
    pub fn bind(activity: &LoopActivity, config: &RunnerConfig) -> Result<Self> {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let address = listener.local_addr()?;

        let shared = Arc::new(ConnectorShared {
            token_size: config.token_size,
            registrations: AtomicU64::new(0),
            client_timeout: config.client_handshake_timeout(),
            pending: Mutex::new(HashMap::new()),
        });

        let accept_watcher = Watcher::spawn(activity, "wrapper-accept", {
            let shared = shared.clone();
            async move {
                loop {
                    match listener.accept().await {
                        Ok((socket, peer)) => {
                            tokio::spawn(shared.clone().handle_client(socket, peer));
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept wrapper connection");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        });

        info!(%address, "Listening for process wrapper connections");
        Ok(Self {
            address,
            shared,
            accept_watcher,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn token_size(&self) -> usize {
        self.shared.token_size
    }

    /// Number of processes still waiting for their sockets.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn is_accepting_referenced(&self) -> bool {
        self.accept_watcher.is_referenced()
    }

    /// Starts waiting for the sockets of the wrapper with pid `wrapper_pid`.
    pub fn register(&self, wrapper_pid: u32, tokens: Arc<SecurityTokens>) -> PendingConnection {
        let (ready, rx) = oneshot::channel();
        let registration = self.shared.registrations.fetch_add(1, Ordering::Relaxed);
        let process = PendingProcess {
            registration,
            tokens,
            claimed: [false; 3],
            sockets: [None, None, None],
            ready,
            _accepting: self.accept_watcher.reference(),
        };

        if let Some(stale) = self.shared.pending().insert(wrapper_pid, process) {
            let _ = stale.ready.send(Err(ProcessError::Handshake(
                "wrapper pid was registered twice".to_string(),
            )));
        }

        PendingConnection {
            wrapper_pid,
            registration,
            shared: self.shared.clone(),
            rx,
        }
    }
}

impl std::fmt::Debug for SocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnector")
            .field("address", &self.address)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// A registered wrapper awaiting its three sockets.
///
/// Dropping it withdraws the registration, so late clients are answered with
/// `NO_LONGER_PENDING`.
pub struct PendingConnection {
    wrapper_pid: u32,
    registration: u64,
    shared: Arc<ConnectorShared>,
    rx: oneshot::Receiver<Result<ConnectedSockets>>,
}

impl PendingConnection {
    pub fn wrapper_pid(&self) -> u32 {
        self.wrapper_pid
    }

    /// Resolves once all three sockets completed their handshake.
    pub async fn connected(&mut self) -> Result<ConnectedSockets> {
        (&mut self.rx)
            .await
            .unwrap_or_else(|_| Err(ProcessError::Handshake("connector shut down".to_string())))
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        let mut pending = self.shared.pending();
        let owned = pending
            .get(&self.wrapper_pid)
            .is_some_and(|process| process.registration == self.registration);
        if owned {
            pending.remove(&self.wrapper_pid);
        }
    }
}
