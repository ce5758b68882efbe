//! Client connection on tokio.
//!
//! One supervisor task owns the socket. Per connection it runs a send loop
//! (the single consumer of submitted commands) and a receive loop (framer,
//! aggregation and dispatch) side by side; whichever fails first ends the
//! connection. Pending commands then fail with `ConnectionLost`, the
//! framer and aggregator are reset, and the supervisor reconnects after
//! `reconnect_delay`. A separate task sweeps timed-out commands.
//!
//! Each connection has a generation number. Commands carry the generation
//! they were submitted under, so a command queued before a reconnect is
//! never written to the new socket.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use super::command::{Command, EncodedCommand, DEFAULT_OUTGOING_BLOCK_SIZE};
use super::completion::{CommandResult, Completion, CompletionQueue, PendingCompletion, PendingSubscription};
use super::protocol::ReplyDispatcher;
use crate::config::ProtocolVersion;
use crate::error::{ClientError, RespError};
use crate::framing::Framer;
use crate::memory::{BlockPool, CommittedBuffer};
use crate::protocols::resp::aggregate::{AggregatesPool, AggregationStrategy, RespValueVariant};
use crate::protocols::resp::parser::RespScanner;
use crate::protocols::resp::response::{FromResponse, RespPush, RespResponse, RespString};

/// Commands up to this size are copied into one write; larger ones are
/// written segment by segment.
const COALESCE_LIMIT: usize = 64 * 1024;

/// Units taken off the queue per flush cycle.
const MAX_UNITS_PER_FLUSH: usize = 256;

const HANDSHAKE_BLOCK_SIZE: usize = 4096;

/// Connection settings.
#[derive(Clone)]
pub struct ClientOptions {
    pub address: String,
    pub protocol: ProtocolVersion,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    /// Per-command default; `None` waits forever.
    pub command_timeout: Option<Duration>,
    pub timeout_check_interval: Duration,
    pub reconnect_delay: Duration,
    pub incoming_block_size: usize,
    pub outgoing_block_size: usize,
    /// Pushes buffered for the receiver before new ones are dropped.
    pub push_capacity: usize,
    pub pool: BlockPool,
}

impl ClientOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            protocol: ProtocolVersion::default(),
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Some(Duration::from_secs(5)),
            timeout_check_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(500),
            incoming_block_size: 128 * 1024,
            outgoing_block_size: DEFAULT_OUTGOING_BLOCK_SIZE,
            push_capacity: 1024,
            pool: BlockPool::shared(),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("address", &self.address)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("timeout_check_interval", &self.timeout_check_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("incoming_block_size", &self.incoming_block_size)
            .field("outgoing_block_size", &self.outgoing_block_size)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One command on its way to the send loop.
struct Submission {
    name: String,
    buffer: CommittedBuffer,
    sender: Completion,
    deadline: Option<Instant>,
    /// Channels to wait acks for, for `SUBSCRIBE`-family commands.
    subscription: Option<Vec<Bytes>>,
}

/// Submissions written back to back, e.g. a batch.
struct Outgoing {
    generation: u64,
    submissions: Vec<Submission>,
}

struct Shared {
    options: ClientOptions,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    completions: Arc<CompletionQueue>,
    connected: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
}

/// A multiplexed connection to one server.
///
/// Commands from any number of tasks are written in submission order and
/// matched to replies first in, first out.
pub struct Client {
    shared: Arc<Shared>,
    pushes: Mutex<Option<mpsc::Receiver<RespPush>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connect, run the handshake and start the background tasks.
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let stream = open(&options).await?;
        let framer = Framer::new(RespScanner::new(), &options.pool, options.incoming_block_size)?;

        let completions = Arc::new(CompletionQueue::new());
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::channel(options.push_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = ReplyDispatcher::new(Arc::clone(&completions), push_tx);

        info!(address = %options.address, protocol = ?options.protocol, "connected");

        let sweep_every = options.timeout_check_interval;
        let shared = Arc::new(Shared {
            options,
            outgoing: outgoing_tx,
            completions,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&shared),
            stream,
            outgoing_rx,
            framer,
            dispatcher,
            shutdown_rx.clone(),
        ));
        let sweeper = tokio::spawn(sweep_timeouts(
            Arc::clone(&shared.completions),
            sweep_every,
            shutdown_rx,
        ));

        Ok(Self {
            shared,
            pushes: Mutex::new(Some(push_rx)),
            shutdown: shutdown_tx,
            tasks: Mutex::new(vec![supervisor, sweeper]),
        })
    }

    /// Start a command backed by this client's outgoing block settings.
    pub fn command(&self, name: &str) -> Command {
        Command::with_pool(
            &self.shared.options.pool,
            self.shared.options.outgoing_block_size,
            name,
        )
    }

    /// Send `command` and convert its reply to `T`.
    ///
    /// The command is encoded and queued before this returns; the future
    /// only waits for the reply.
    pub fn execute<T>(&self, command: Command) -> impl Future<Output = Result<T, ClientError>> + Send + 'static
    where
        T: FromResponse + Send + 'static,
    {
        let receiver = command
            .commit()
            .map_err(ClientError::from)
            .and_then(|encoded| self.submit_one(encoded));
        async move {
            let response = wait(receiver?).await?;
            T::from_response(response)
        }
    }

    /// Like [`execute`](Self::execute) for an already committed command.
    pub fn execute_encoded<T>(
        &self,
        command: EncodedCommand,
    ) -> impl Future<Output = Result<T, ClientError>> + Send + 'static
    where
        T: FromResponse + Send + 'static,
    {
        let receiver = self.submit_one(command);
        async move {
            let response = wait(receiver?).await?;
            T::from_response(response)
        }
    }

    /// Write `commands` back to back and collect their replies in order.
    ///
    /// The outer error means nothing was sent; inner errors are per command.
    pub fn execute_batch(
        &self,
        commands: Vec<EncodedCommand>,
    ) -> impl Future<Output = Result<Vec<Result<RespResponse, ClientError>>, ClientError>> + Send + 'static {
        let receivers = self.submit(commands);
        async move {
            let receivers = receivers?;
            let mut results = Vec::with_capacity(receivers.len());
            for receiver in receivers {
                results.push(wait(receiver).await);
            }
            Ok(results)
        }
    }

    fn submit_one(&self, command: EncodedCommand) -> Result<oneshot::Receiver<CommandResult>, ClientError> {
        self.submit(vec![command])?
            .into_iter()
            .next()
            .ok_or(ClientError::Closed)
    }

    fn submit(&self, commands: Vec<EncodedCommand>) -> Result<Vec<oneshot::Receiver<CommandResult>>, ClientError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(ClientError::NotConnected);
        }

        let now = Instant::now();
        let generation = self.shared.generation.load(Ordering::Acquire);
        let mut receivers = Vec::with_capacity(commands.len());
        let mut submissions = Vec::with_capacity(commands.len());
        for command in &commands {
            // RESP2 acks arrive as plain arrays that would collide with the reply queue.
            if command.is_subscription() && self.shared.options.protocol == ProtocolVersion::Resp2 {
                return Err(ClientError::RequiresResp3 {
                    command: command.name().to_string(),
                });
            }
        }
        for command in commands {
            let subscription = if command.is_subscription() {
                Some(command.arguments()?.into_iter().skip(1).collect())
            } else {
                None
            };
            // Subscriptions wait for pushes that may take arbitrarily long.
            let deadline = match subscription {
                Some(_) => None,
                None => command
                    .timeout()
                    .or(self.shared.options.command_timeout)
                    .map(|timeout| now + timeout),
            };

            let (sender, receiver) = oneshot::channel();
            submissions.push(Submission {
                name: command.name().to_string(),
                deadline,
                subscription,
                sender,
                buffer: command.into_buffer(),
            });
            receivers.push(receiver);
        }

        self.shared
            .outgoing
            .send(Outgoing {
                generation,
                submissions,
            })
            .map_err(|_| ClientError::Closed)?;
        Ok(receivers)
    }

    /// Receiver for pushes nobody was waiting for (pub/sub messages,
    /// invalidations). Can be taken once.
    pub fn take_push_receiver(&self) -> Option<mpsc::Receiver<RespPush>> {
        lock(&self.pushes).take()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Incremented on every connection loss.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Commands written and waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.completions.len()
    }

    pub fn pool(&self) -> &BlockPool {
        &self.shared.options.pool
    }

    /// Stop the background tasks. Pending commands fail with `Closed`.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "client task failed");
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.shared.options.address)
            .field("connected", &self.is_connected())
            .field("generation", &self.generation())
            .field("pending", &self.pending())
            .finish()
    }
}

async fn wait(receiver: oneshot::Receiver<CommandResult>) -> CommandResult {
    receiver.await.unwrap_or(Err(ClientError::Cancelled))
}

/// Connect, tune the socket and run the handshake.
async fn open(options: &ClientOptions) -> Result<TcpStream, ClientError> {
    let connect = TcpStream::connect(options.address.as_str());
    let mut stream = tokio::time::timeout(options.connect_timeout, connect)
        .await
        .map_err(|_| ClientError::Timeout)??;
    configure_socket(&stream)?;

    let commands = handshake_commands(options)?;
    tokio::time::timeout(options.connect_timeout, handshake(&mut stream, options, commands))
        .await
        .map_err(|_| ClientError::Timeout)??;
    Ok(stream)
}

fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    Ok(())
}

/// `HELLO 3 [AUTH user pass]` for RESP3, `AUTH [user] pass` for RESP2.
fn handshake_commands(options: &ClientOptions) -> Result<Vec<EncodedCommand>, RespError> {
    let command = |name: &str| Command::with_pool(&options.pool, HANDSHAKE_BLOCK_SIZE, name);
    let mut commands = Vec::new();
    match options.protocol {
        ProtocolVersion::Resp3 => {
            let mut hello = command("HELLO").arg("3");
            if let Some(password) = &options.password {
                let username = options.username.as_deref().unwrap_or("default");
                hello = hello.arg("AUTH").arg(username).arg(password);
            }
            commands.push(hello.commit()?);
        }
        ProtocolVersion::Resp2 => {
            if let Some(password) = &options.password {
                let mut auth = command("AUTH");
                if let Some(username) = &options.username {
                    auth = auth.arg(username);
                }
                commands.push(auth.arg(password).commit()?);
            }
        }
    }
    Ok(commands)
}

/// Send each command and read exactly one reply for it.
async fn handshake(
    stream: &mut TcpStream,
    options: &ClientOptions,
    commands: Vec<EncodedCommand>,
) -> Result<(), ClientError> {
    if commands.is_empty() {
        return Ok(());
    }
    let mut framer = Framer::new(RespScanner::new(), &options.pool, HANDSHAKE_BLOCK_SIZE)?;
    let mut strategy = AggregationStrategy::new(AggregatesPool::new());

    for command in commands {
        stream.write_all(&command.buffer().to_vec()).await?;
        let reply = read_reply(stream, &mut framer, &mut strategy).await?;
        if reply.is_error() {
            return Err(ClientError::Server(RespString::new(reply).to_string_lossy()));
        }
        debug!(command = command.name(), "handshake step complete");
    }
    Ok(())
}

async fn read_reply(
    stream: &mut TcpStream,
    framer: &mut Framer<RespScanner>,
    strategy: &mut AggregationStrategy,
) -> Result<RespValueVariant, ClientError> {
    loop {
        let block = framer.receiving_block()?;
        let read = stream.read(block.writable()).await?;
        if read == 0 {
            return Err(ClientError::ConnectionLost(
                "server closed the connection during the handshake".to_string(),
            ));
        }
        block.advance(read);
        for frame in framer.feed()? {
            if let Some(value) = strategy.aggregate(frame)? {
                return Ok(value);
            }
        }
    }
}

/// Owns the socket for the lifetime of the client.
async fn supervise(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    mut framer: Framer<RespScanner>,
    mut dispatcher: ReplyDispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let generation = shared.generation.load(Ordering::Acquire);
        let (reader, writer) = stream.into_split();

        let lost = if *shutdown.borrow() {
            None
        } else {
            tokio::select! {
                result = receive_loop(reader, &mut framer, &mut dispatcher) => result.err(),
                result = send_loop(writer, &mut outgoing, &shared.completions, generation) => result.err(),
                _ = shutdown.changed() => None,
            }
        };

        shared.connected.store(false, Ordering::Release);
        shared.generation.fetch_add(1, Ordering::AcqRel);
        dispatcher.reset();
        if let Err(e) = framer.reset() {
            error!(error = %e, "failed to reset framer");
        }

        let Some(error) = lost else {
            break;
        };
        let reason = error.to_string();
        let failed = shared
            .completions
            .fail_all(generation, || ClientError::ConnectionLost(reason.clone()));
        let rejected = reject_queued(&mut outgoing, || ClientError::ConnectionLost(reason.clone()));
        warn!(generation, pending = failed, queued = rejected, %reason, "connection lost");

        match reconnect(&shared.options, &mut shutdown).await {
            Some(next) => stream = next,
            None => break,
        }
        shared.connected.store(true, Ordering::Release);
        info!(generation = generation + 1, address = %shared.options.address, "reconnected");
    }

    shared.closed.store(true, Ordering::Release);
    outgoing.close();
    let failed = shared.completions.fail_all(u64::MAX, || ClientError::Closed);
    let rejected = reject_queued(&mut outgoing, || ClientError::Closed);
    framer.dispose();
    debug!(pending = failed, queued = rejected, "connection supervisor stopped");
}

async fn reconnect(options: &ClientOptions, shutdown: &mut watch::Receiver<bool>) -> Option<TcpStream> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(options.reconnect_delay) => {}
            _ = shutdown.changed() => return None,
        }
        match open(options).await {
            Ok(stream) => return Some(stream),
            Err(e) => debug!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
}

fn reject_queued(outgoing: &mut mpsc::UnboundedReceiver<Outgoing>, error: impl Fn() -> ClientError) -> usize {
    let mut rejected = 0;
    while let Ok(unit) = outgoing.try_recv() {
        for submission in unit.submissions {
            let _ = submission.sender.send(Err(error()));
            rejected += 1;
        }
    }
    rejected
}

/// Read, frame, aggregate and dispatch until the connection fails.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    framer: &mut Framer<RespScanner>,
    dispatcher: &mut ReplyDispatcher,
) -> Result<(), ClientError> {
    loop {
        let block = framer.receiving_block()?;
        let read = reader.read(block.writable()).await?;
        if read == 0 {
            return Err(ClientError::ConnectionLost(
                "server closed the connection".to_string(),
            ));
        }
        block.advance(read);
        trace!(read, "received");

        let mut ready = framer.feed()?;
        let mut outcome = Ok(());
        for frame in ready.drain() {
            if let Err(e) = dispatcher.handle(frame) {
                outcome = Err(e);
                break;
            }
        }
        framer.recycle(ready);
        outcome?;
    }
}

/// Admit a submission to the wire: register its completion and hand back
/// the bytes, or complete it right away if it should not be sent.
fn admit(submission: Submission, completions: &CompletionQueue, now: Instant, generation: u64, stale: bool) -> Option<CommittedBuffer> {
    let Submission {
        name,
        buffer,
        sender,
        deadline,
        subscription,
    } = submission;

    if stale {
        let _ = sender.send(Err(ClientError::ConnectionLost(
            "connection was reset before the command was sent".to_string(),
        )));
        return None;
    }
    if deadline.map_or(false, |deadline| deadline <= now) {
        debug!(command = %name, "command timed out before it was sent");
        let _ = sender.send(Err(ClientError::Timeout));
        return None;
    }
    if sender.is_closed() {
        trace!(command = %name, "command cancelled before it was sent");
        return None;
    }

    match subscription {
        Some(channels) => completions.push_subscription(PendingSubscription::new(&name, channels, sender, generation)),
        None => completions.push(PendingCompletion::new(name, sender, deadline, generation)),
    }
    Some(buffer)
}

async fn flush_coalesced(writer: &mut OwnedWriteHalf, coalesced: &mut BytesMut) -> std::io::Result<()> {
    if !coalesced.is_empty() {
        writer.write_all(coalesced).await?;
        coalesced.clear();
    }
    Ok(())
}

/// Single consumer of submitted commands. Returns `Ok` once every client
/// handle is gone.
async fn send_loop(
    mut writer: OwnedWriteHalf,
    outgoing: &mut mpsc::UnboundedReceiver<Outgoing>,
    completions: &CompletionQueue,
    generation: u64,
) -> Result<(), ClientError> {
    let mut coalesced = BytesMut::with_capacity(COALESCE_LIMIT);
    let mut units = Vec::new();

    loop {
        let Some(first) = outgoing.recv().await else {
            return Ok(());
        };
        units.push(first);
        while units.len() < MAX_UNITS_PER_FLUSH {
            match outgoing.try_recv() {
                Ok(unit) => units.push(unit),
                Err(_) => break,
            }
        }

        let now = Instant::now();
        let mut written = 0;
        for unit in units.drain(..) {
            let stale = unit.generation < generation;
            for submission in unit.submissions {
                let Some(buffer) = admit(submission, completions, now, generation, stale) else {
                    continue;
                };
                written += 1;
                if buffer.len() > COALESCE_LIMIT {
                    flush_coalesced(&mut writer, &mut coalesced).await?;
                    for segment in buffer.segments() {
                        writer.write_all(segment.as_bytes()).await?;
                    }
                } else {
                    buffer.copy_into(&mut coalesced);
                    if coalesced.len() >= COALESCE_LIMIT {
                        flush_coalesced(&mut writer, &mut coalesced).await?;
                    }
                }
                buffer.free_by_delivery_pipeline();
            }
        }
        flush_coalesced(&mut writer, &mut coalesced).await?;
        writer.flush().await?;
        trace!(written, "flushed");
    }
}

async fn sweep_timeouts(completions: Arc<CompletionQueue>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let expired = completions.expire(Instant::now());
                if expired > 0 {
                    debug!(expired, "expired pending commands");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        (listener, address)
    }

    #[test]
    fn test_handshake_commands() {
        let mut options = ClientOptions::new("unused:0");
        let hello = handshake_commands(&options).unwrap();
        assert_eq!(hello.len(), 1);
        assert_eq!(hello[0].buffer().to_vec(), b"*2\r\n$5\r\nHELLO\r\n$1\r\n3\r\n");

        options.password = Some("pw".to_string());
        let hello = handshake_commands(&options).unwrap();
        assert_eq!(
            hello[0].arguments().unwrap(),
            vec![
                Bytes::from_static(b"HELLO"),
                Bytes::from_static(b"3"),
                Bytes::from_static(b"AUTH"),
                Bytes::from_static(b"default"),
                Bytes::from_static(b"pw"),
            ]
        );

        options.protocol = ProtocolVersion::Resp2;
        options.username = Some("app".to_string());
        let auth = handshake_commands(&options).unwrap();
        assert_eq!(auth[0].buffer().to_vec(), b"*3\r\n$4\r\nAUTH\r\n$3\r\napp\r\n$2\r\npw\r\n");

        options.password = None;
        assert!(handshake_commands(&options).unwrap().is_empty());
    }

    #[test]
    fn test_options_debug_hides_password() {
        let mut options = ClientOptions::new("localhost:6379");
        options.password = Some("hunter2".to_string());
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("localhost:6379"));
    }

    #[tokio::test]
    async fn test_hello_error_fails_connect() {
        let (listener, address) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"-NOPROTO unsupported protocol version\r\n").await.unwrap();
        });

        match Client::connect(ClientOptions::new(address)).await {
            Err(ClientError::Server(message)) => assert!(message.starts_with("NOPROTO")),
            other => panic!("Expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, address) = listener().await;
        drop(listener);
        let mut options = ClientOptions::new(address);
        options.protocol = ProtocolVersion::Resp2;
        assert!(matches!(Client::connect(options).await, Err(ClientError::Io(_))));
    }

    #[tokio::test]
    async fn test_resp2_rejects_subscriptions() {
        let (listener, address) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            socket.write_all(b"+PONG\r\n").await.unwrap();
            let _ = socket.read(&mut buf).await;
        });

        let mut options = ClientOptions::new(address);
        options.protocol = ProtocolVersion::Resp2;
        let client = Client::connect(options).await.unwrap();

        match client.execute::<RespResponse>(client.command("SUBSCRIBE").arg("news")).await {
            Err(ClientError::RequiresResp3 { command }) => assert_eq!(command, "SUBSCRIBE"),
            other => panic!("Expected RequiresResp3, got {other:?}"),
        }
        assert_eq!(client.pending(), 0);

        // Nothing was written for SUBSCRIBE, so PING is the first command on the wire.
        let pong: String = client.execute(client.command("PING")).await.unwrap();
        assert_eq!(pong, "PONG");
        client.close().await;
    }

    #[tokio::test]
    async fn test_round_trip_and_close() {
        let (listener, address) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            // HELLO
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"%1\r\n+proto\r\n:3\r\n").await.unwrap();
            // PING
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            socket.write_all(b"+PONG\r\n").await.unwrap();
            let _ = socket.read(&mut buf).await;
        });

        let client = Client::connect(ClientOptions::new(address)).await.unwrap();
        assert!(client.is_connected());
        let pong: String = client.execute(client.command("PING")).await.unwrap();
        assert_eq!(pong, "PONG");

        client.close().await;
        assert!(!client.is_connected());
        match client.execute::<String>(client.command("PING")).await {
            Err(ClientError::Closed) => {}
            other => panic!("Expected Closed, got {other:?}"),
        }
    }
}
