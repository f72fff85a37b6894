//! QC35 session management.
//!
//! This module owns the connection lifecycle: a cloneable [`Session`]
//! handle fronting an actor task that holds the live link, the shared
//! shutdown flag, and the two unbounded queues (outbound commands, inbound
//! events), plus the reader/writer workers driving the RFCOMM socket.

use std::{
   future::Future,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use smol_str::ToSmolStr;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   select,
   sync::{Notify, mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::rfcomm,
   config::Config,
   error::{Qc35Error, Result},
   event::Event,
   qc35::{parser, protocol::Command},
};

/// Inbox depth for session requests and worker notifications.
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Read buffer size; one RFCOMM read never exceeds this.
const READ_BUF_SIZE: usize = 1024;
/// Bounded wait used by the event stream between closed-flag checks.
const EVENT_POLL: Duration = Duration::from_secs(1);

// === Queues ===

/// Unbounded FIFO queue with a bounded-timeout pop.
///
/// Multi-producer, single-consumer by convention; producers push and
/// notify, the consumer pops with a timeout so it can observe shutdown
/// flags between waits.
pub struct Queue<T> {
   items: SegQueue<T>,
   notify: Notify,
   closed: AtomicBool,
}

impl<T> Queue<T> {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         items: SegQueue::new(),
         notify: Notify::new(),
         closed: AtomicBool::new(false),
      })
   }

   pub fn push(&self, item: T) {
      self.items.push(item);
      self.notify.notify_waiters();
   }

   pub fn pop(&self) -> Option<T> {
      self.items.pop()
   }

   /// Pops the next item, waiting at most `wait` for one to arrive.
   pub async fn pop_timeout(&self, wait: Duration) -> Option<T> {
      if let Some(item) = self.items.pop() {
         return Some(item);
      }
      let notified = self.notify.notified();
      if let Some(item) = self.items.pop() {
         return Some(item);
      }
      let _ = time::timeout(wait, notified).await;
      self.items.pop()
   }

   pub fn clear(&self) {
      while self.items.pop().is_some() {}
   }

   pub fn close(&self) {
      self.closed.store(true, Ordering::Release);
      self.notify.notify_waiters();
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }
}

/// Consumer half of the inbound event queue.
///
/// Yields events in frame-decode order; returns `None` once the session is
/// gone and the queue has drained.
pub struct EventStream {
   queue: Arc<Queue<Event>>,
}

impl EventStream {
   pub async fn recv(&self) -> Option<Event> {
      loop {
         if let Some(event) = self.queue.pop_timeout(EVENT_POLL).await {
            return Some(event);
         }
         if self.queue.is_closed() {
            return None;
         }
      }
   }
}

// === Transport ===

/// Boxed stream halves, so a link can run over any byte stream.
type SocketReader = Box<dyn AsyncRead + Send + Unpin>;
type SocketWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens the byte stream a link runs on.
///
/// The production opener dials RFCOMM; tests substitute an in-memory
/// duplex stream.
trait SocketOpener: Clone + Send + Sync + 'static {
   fn open(
      &self,
      target: Address,
      channel: u8,
      timeout: Duration,
   ) -> impl Future<Output = Result<(SocketReader, SocketWriter)>> + Send;
}

#[derive(Clone)]
struct RfcommOpener;

impl SocketOpener for RfcommOpener {
   async fn open(
      &self,
      target: Address,
      channel: u8,
      timeout: Duration,
   ) -> Result<(SocketReader, SocketWriter)> {
      let (reader, writer) = rfcomm::connect(target, channel, timeout).await?;
      Ok((Box::new(reader), Box::new(writer)))
   }
}

// === Session handle ===

/// Handle to a QC35 session.
///
/// Cheaply cloneable; all mutable state lives in the actor task. Dropping
/// every handle shuts the session down.
#[derive(Clone)]
pub struct Session {
   inbox: mpsc::Sender<SessionRequest>,
   commands: Arc<Queue<Command>>,
}

impl Session {
   /// Creates a session and the event stream its consumer reads from.
   pub fn new(config: Config) -> (Self, EventStream) {
      Self::with_opener(config, RfcommOpener)
   }

   fn with_opener<O: SocketOpener>(config: Config, opener: O) -> (Self, EventStream) {
      let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let events = Queue::new();
      let commands = Queue::new();

      tokio::spawn(
         SessionActor {
            config,
            opener,
            inbox: inbox_rx,
            loopback_tx,
            loopback_rx,
            events: events.clone(),
            commands: commands.clone(),
            state: SessionState::Disconnected,
            generation: 0,
            live: None,
         }
         .run(),
      );

      (
         Self {
            inbox: inbox_tx,
            commands,
         },
         EventStream { queue: events },
      )
   }

   /// Requests a connection to `target`.
   ///
   /// Returns as soon as the request is accepted; the outcome arrives on
   /// the event stream as `Connecting` followed by either the decoded
   /// connect acknowledgement or `Disconnected` with a diagnostic.
   pub async fn connect(&self, target: Address) -> Result<()> {
      self
         .inbox
         .send(SessionRequest::Connect(target))
         .await
         .map_err(|_| Qc35Error::SessionShutdown)
   }

   /// Tears the current link down and waits until both workers have exited.
   pub async fn disconnect(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(SessionRequest::Disconnect(tx))
         .await
         .map_err(|_| Qc35Error::SessionShutdown)?;
      rx.await.map_err(|_| Qc35Error::SessionShutdown)
   }

   /// Queues a command for transmission.
   pub fn submit(&self, command: Command) {
      self.commands.push(command);
   }
}

// === Actor ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
   Disconnected,
   Connecting,
   Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerSide {
   Reader,
   Writer,
}

enum SessionRequest {
   Connect(Address),
   Disconnect(oneshot::Sender<()>),
   SocketOpened(u64, Result<(SocketReader, SocketWriter)>),
   WorkerExited(u64, WorkerSide),
}

/// One generation of workers bound to one socket.
struct LiveLink {
   generation: u64,
   stop: Arc<AtomicBool>,
   reader: JoinHandle<()>,
   writer: JoinHandle<()>,
}

struct SessionActor<O> {
   config: Config,
   opener: O,
   inbox: mpsc::Receiver<SessionRequest>,
   loopback_tx: mpsc::Sender<SessionRequest>,
   loopback_rx: mpsc::Receiver<SessionRequest>,
   events: Arc<Queue<Event>>,
   commands: Arc<Queue<Command>>,
   state: SessionState,
   /// Bumped on every connect attempt and explicit disconnect; stale
   /// socket-open results and worker-exit notices are dropped by it.
   generation: u64,
   live: Option<LiveLink>,
}

impl<O: SocketOpener> SessionActor<O> {
   async fn run(mut self) {
      loop {
         select! {
             req = self.inbox.recv() => {
                 let Some(req) = req else {
                     info!("All session handles dropped, shutting down");
                     break;
                 };
                 self.handle(req).await;
             }
             Some(req) = self.loopback_rx.recv() => {
                 self.handle(req).await;
             }
         }
      }

      if let Some(link) = self.live.take() {
         teardown_link(link).await;
      }
      self.events.close();
   }

   async fn handle(&mut self, req: SessionRequest) {
      match req {
         SessionRequest::Connect(target) => {
            self.handle_connect(target).await;
         },
         SessionRequest::Disconnect(ack) => {
            self.handle_disconnect().await;
            let _ = ack.send(());
         },
         SessionRequest::SocketOpened(generation, result) => {
            self.handle_socket_opened(generation, result);
         },
         SessionRequest::WorkerExited(generation, side) => {
            self.handle_worker_exited(generation, side).await;
         },
      }
   }

   async fn handle_connect(&mut self, target: Address) {
      // A previous generation must be fully gone before a new socket may
      // be installed: signal it, then join both workers.
      if let Some(link) = self.live.take() {
         self.emit(Event::Disconnected(Some("reconnecting".to_smolstr())));
         teardown_link(link).await;
      }

      self.generation += 1;
      let generation = self.generation;
      self.state = SessionState::Connecting;
      self.emit(Event::Connecting);

      info!("Connecting to {target} (generation {generation})");

      // Socket open may block for seconds; run it off the actor so
      // requests keep flowing, and loop the result back.
      let loopback = self.loopback_tx.clone();
      let opener = self.opener.clone();
      let channel = self.config.rfcomm_channel;
      let timeout = self.config.connect_timeout();
      tokio::spawn(async move {
         let result = opener.open(target, channel, timeout).await;
         let _ = loopback
            .send(SessionRequest::SocketOpened(generation, result))
            .await;
      });
   }

   async fn handle_disconnect(&mut self) {
      // Invalidate any in-flight socket open.
      self.generation += 1;

      if let Some(link) = self.live.take() {
         teardown_link(link).await;
         self.emit(Event::Disconnected(None));
      } else if self.state != SessionState::Disconnected {
         self.emit(Event::Disconnected(None));
      }
      self.state = SessionState::Disconnected;
   }

   fn handle_socket_opened(
      &mut self,
      generation: u64,
      result: Result<(SocketReader, SocketWriter)>,
   ) {
      if generation != self.generation || self.state != SessionState::Connecting {
         debug!("Dropping stale socket-open result for generation {generation}");
         return;
      }

      let (sock_reader, sock_writer) = match result {
         Ok(halves) => halves,
         Err(e) => {
            warn!("Socket open failed: {e}");
            self.state = SessionState::Disconnected;
            self.emit(Event::Disconnected(Some(
               format!("connect failed: {e}").into(),
            )));
            return;
         },
      };

      // Commands queued against the previous link are stale.
      self.commands.clear();
      self.commands.push(Command::Connect);

      let stop = Arc::new(AtomicBool::new(false));
      let tuning = LinkTuning::from_config(&self.config);

      let reader = tokio::spawn(reader_worker(
         sock_reader,
         stop.clone(),
         self.commands.clone(),
         self.events.clone(),
         self.loopback_tx.clone(),
         generation,
         tuning,
      ));
      let writer = tokio::spawn(writer_worker(
         sock_writer,
         stop.clone(),
         self.commands.clone(),
         self.events.clone(),
         self.loopback_tx.clone(),
         generation,
         tuning.write_poll,
      ));

      self.live = Some(LiveLink {
         generation,
         stop,
         reader,
         writer,
      });
      // Conceptually connected; the Connected event itself is only emitted
      // once the reader decodes the accessory's connect acknowledgement.
      self.state = SessionState::Connected;
   }

   async fn handle_worker_exited(&mut self, generation: u64, side: WorkerSide) {
      debug!("{side:?} worker exited (generation {generation})");
      let current = self
         .live
         .as_ref()
         .is_some_and(|link| link.generation == generation);
      if !current {
         return;
      }

      // The failing worker already stored the stop flag and emitted the
      // Disconnected diagnostic; reap both handles and settle the state.
      let link = self.live.take().expect("live link checked above");
      teardown_link(link).await;
      self.state = SessionState::Disconnected;
   }

   fn emit(&self, event: Event) {
      debug!("Event: {event:?}");
      self.events.push(event);
   }
}

/// Signals a link's workers and joins both before returning.
async fn teardown_link(link: LiveLink) {
   link.stop.store(true, Ordering::Release);
   if let Err(e) = link.reader.await {
      warn!("Reader worker panicked: {e}");
   }
   if let Err(e) = link.writer.await {
      warn!("Writer worker panicked: {e}");
   }
}

/// Marks the link as stopping; returns true when this caller made the
/// transition and therefore owns the Disconnected report.
fn signal_stop(stop: &AtomicBool) -> bool {
   !stop.swap(true, Ordering::AcqRel)
}

// === Workers ===

#[derive(Debug, Clone, Copy)]
struct LinkTuning {
   read_poll: Duration,
   idle_keepalive_ticks: u32,
   write_poll: Duration,
}

impl LinkTuning {
   fn from_config(config: &Config) -> Self {
      Self {
         read_poll: config.read_poll(),
         idle_keepalive_ticks: config.idle_keepalive_ticks,
         write_poll: config.write_poll(),
      }
   }
}

/// Reader worker: drains socket bytes into events.
///
/// Polls the socket with a bounded wait so the stop flag is observed at
/// least once per interval. While idle for `idle_keepalive_ticks` polls,
/// enqueues one battery/status keepalive pair and starts counting again.
async fn reader_worker<R>(
   mut sock: R,
   stop: Arc<AtomicBool>,
   commands: Arc<Queue<Command>>,
   events: Arc<Queue<Event>>,
   loopback: mpsc::Sender<SessionRequest>,
   generation: u64,
   tuning: LinkTuning,
) where
   R: AsyncRead + Unpin + Send,
{
   let mut buf = [0u8; READ_BUF_SIZE];
   let mut idle_ticks = 0u32;
   let mut saw_connected = false;

   while !stop.load(Ordering::Acquire) {
      match time::timeout(tuning.read_poll, sock.read(&mut buf)).await {
         Err(_) => {
            idle_ticks += 1;
            if idle_ticks >= tuning.idle_keepalive_ticks {
               idle_ticks = 0;
               debug!("Link idle, polling battery and status");
               commands.push(Command::GetBatteryLevel);
               commands.push(Command::GetDeviceStatus);
            }
         },
         Ok(Ok(0)) => {
            if signal_stop(&stop) {
               warn!("Connection closed by peer");
               events.push(Event::Disconnected(Some(
                  "connection closed by peer".to_smolstr(),
               )));
            }
            break;
         },
         Ok(Ok(n)) => {
            idle_ticks = 0;
            debug!("← {}", hex::encode(&buf[..n]));
            for event in parser::drain(&buf[..n]) {
               if matches!(event, Event::Connected(_)) {
                  saw_connected = true;
                  commands.push(Command::GetDeviceStatus);
               }
               if !saw_connected {
                  // Some units start streaming telemetry without ever
                  // acknowledging the connect; keep asking.
                  commands.push(Command::Connect);
               }
               events.push(event);
            }
         },
         Ok(Err(e)) => {
            if signal_stop(&stop) {
               error!("Read failed: {e}");
               events.push(Event::Disconnected(Some(
                  format!("read failed: {e}").into(),
               )));
            }
            break;
         },
      }
   }

   let _ = loopback
      .send(SessionRequest::WorkerExited(generation, WorkerSide::Reader))
      .await;
}

/// Writer worker: drains the outbound queue onto the socket.
///
/// Pops with a bounded wait (1 second by default) so the stop flag is
/// observed between commands. Owns the socket close on exit.
async fn writer_worker<W>(
   mut sock: W,
   stop: Arc<AtomicBool>,
   commands: Arc<Queue<Command>>,
   events: Arc<Queue<Event>>,
   loopback: mpsc::Sender<SessionRequest>,
   generation: u64,
   write_poll: Duration,
) where
   W: AsyncWrite + Unpin + Send,
{
   while !stop.load(Ordering::Acquire) {
      let Some(command) = commands.pop_timeout(write_poll).await else {
         continue;
      };

      debug!("→ {command}: {}", hex::encode(command.bytes()));
      let result = async {
         sock.write_all(command.bytes()).await?;
         sock.flush().await
      }
      .await;

      if let Err(e) = result {
         if signal_stop(&stop) {
            error!("Write failed: {e}");
            events.push(Event::Disconnected(Some(
               format!("write failed: {e}").into(),
            )));
         }
         break;
      }
   }

   if let Err(e) = sock.shutdown().await {
      debug!("Socket close: {e}");
   }
   let _ = loopback
      .send(SessionRequest::WorkerExited(generation, WorkerSide::Writer))
      .await;
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::time::Instant;
   use tokio::io::{AsyncReadExt, DuplexStream, duplex, split};

   const FAST: LinkTuning = LinkTuning {
      read_poll: Duration::from_millis(5),
      idle_keepalive_ticks: 1_000_000, // keepalive disabled
      write_poll: Duration::from_millis(10),
   };

   fn harness() -> (
      Arc<Queue<Command>>,
      Arc<Queue<Event>>,
      mpsc::Sender<SessionRequest>,
      mpsc::Receiver<SessionRequest>,
   ) {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      (Queue::new(), Queue::new(), loopback_tx, loopback_rx)
   }

   async fn next_event(events: &Queue<Event>) -> Event {
      let deadline = Instant::now() + Duration::from_secs(5);
      loop {
         if let Some(ev) = events.pop_timeout(Duration::from_millis(20)).await {
            return ev;
         }
         assert!(Instant::now() < deadline, "timed out waiting for event");
      }
   }

   async fn next_command(commands: &Queue<Command>) -> Command {
      let deadline = Instant::now() + Duration::from_secs(5);
      loop {
         if let Some(cmd) = commands.pop_timeout(Duration::from_millis(20)).await {
            return cmd;
         }
         assert!(Instant::now() < deadline, "timed out waiting for command");
      }
   }

   /// Opener backed by in-memory duplex streams; the far ends queue up for
   /// the test to drive.
   #[derive(Clone)]
   struct DuplexOpener {
      peers: Arc<Queue<DuplexStream>>,
   }

   impl SocketOpener for DuplexOpener {
      async fn open(
         &self,
         _target: Address,
         _channel: u8,
         _timeout: Duration,
      ) -> Result<(SocketReader, SocketWriter)> {
         let (near, far) = duplex(256);
         self.peers.push(far);
         let (reader, writer) = split(near);
         Ok((Box::new(reader), Box::new(writer)))
      }
   }

   fn fast_config() -> Config {
      Config {
         read_poll_ms: 5,
         idle_keepalive_ticks: 1_000_000,
         connect_timeout_secs: 1,
         ..Default::default()
      }
   }

   async fn next_peer(peers: &Queue<DuplexStream>) -> DuplexStream {
      let deadline = Instant::now() + Duration::from_secs(5);
      loop {
         if let Some(peer) = peers.pop_timeout(Duration::from_millis(20)).await {
            return peer;
         }
         assert!(Instant::now() < deadline, "timed out waiting for socket open");
      }
   }

   /// Reads until EOF; only returns once the link's writer has shut the
   /// stream down, i.e. both of its workers are gone.
   async fn drain_to_eof(peer: &mut DuplexStream) {
      let mut sink = [0u8; 64];
      loop {
         if peer.read(&mut sink).await.unwrap() == 0 {
            return;
         }
      }
   }

   #[tokio::test]
   async fn queue_pop_timeout_expires_empty() {
      let queue: Arc<Queue<u8>> = Queue::new();
      assert_eq!(queue.pop_timeout(Duration::from_millis(10)).await, None);
   }

   #[tokio::test]
   async fn queue_push_wakes_waiter() {
      let queue: Arc<Queue<u8>> = Queue::new();
      let waiter = {
         let queue = queue.clone();
         tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(5)).await })
      };
      tokio::task::yield_now().await;
      queue.push(7);
      assert_eq!(waiter.await.unwrap(), Some(7));
   }

   #[tokio::test]
   async fn queue_is_fifo() {
      let queue: Arc<Queue<u8>> = Queue::new();
      queue.push(1);
      queue.push(2);
      queue.push(3);
      assert_eq!(queue.pop(), Some(1));
      assert_eq!(queue.pop(), Some(2));
      assert_eq!(queue.pop(), Some(3));
   }

   #[tokio::test]
   async fn writer_sends_commands_in_order() {
      let (commands, events, loopback_tx, mut loopback_rx) = harness();
      let (near, mut far) = duplex(256);
      let (_near_read, near_write) = split(near);
      let stop = Arc::new(AtomicBool::new(false));

      let handle = tokio::spawn(writer_worker(
         near_write,
         stop.clone(),
         commands.clone(),
         events.clone(),
         loopback_tx,
         1,
         FAST.write_poll,
      ));

      commands.push(Command::NoiseLevelHigh);
      commands.push(Command::GetBatteryLevel);

      let mut wire = vec![0u8; 9];
      far.read_exact(&mut wire).await.unwrap();
      assert_eq!(&wire[..5], Command::NoiseLevelHigh.bytes());
      assert_eq!(&wire[5..], Command::GetBatteryLevel.bytes());

      stop.store(true, Ordering::Release);
      handle.await.unwrap();
      let Some(SessionRequest::WorkerExited(1, WorkerSide::Writer)) = loopback_rx.recv().await
      else {
         panic!("expected writer exit notice");
      };
   }

   #[tokio::test]
   async fn reader_decodes_connect_ack_and_requests_status() {
      let (commands, events, loopback_tx, _loopback_rx) = harness();
      let (near, mut far) = duplex(256);
      let (near_read, _near_write) = split(near);
      let stop = Arc::new(AtomicBool::new(false));

      let handle = tokio::spawn(reader_worker(
         near_read,
         stop.clone(),
         commands.clone(),
         events.clone(),
         loopback_tx,
         1,
         FAST,
      ));

      far.write_all(&[0x00, 0x01, 0x03, 0x05, 49, 46, 48, 46, 52])
         .await
         .unwrap();
      assert_eq!(next_event(&events).await, Event::Connected("1.0.4".into()));
      assert_eq!(next_command(&commands).await, Command::GetDeviceStatus);

      // Connect already acknowledged, so telemetry must not re-enqueue it.
      far.write_all(&[0x02, 0x02, 0x03, 0x01, 80]).await.unwrap();
      assert_eq!(next_event(&events).await, Event::BatteryLevel(80));
      assert!(commands.pop().is_none());

      stop.store(true, Ordering::Release);
      handle.await.unwrap();
   }

   #[tokio::test]
   async fn reader_reenqueues_connect_until_acked() {
      let (commands, events, loopback_tx, _loopback_rx) = harness();
      let (near, mut far) = duplex(256);
      let (near_read, _near_write) = split(near);
      let stop = Arc::new(AtomicBool::new(false));

      let handle = tokio::spawn(reader_worker(
         near_read,
         stop.clone(),
         commands.clone(),
         events.clone(),
         loopback_tx,
         1,
         FAST,
      ));

      // Telemetry before any connect ack.
      far.write_all(&[0x02, 0x02, 0x03, 0x01, 55]).await.unwrap();
      assert_eq!(next_event(&events).await, Event::BatteryLevel(55));
      assert_eq!(next_command(&commands).await, Command::Connect);

      stop.store(true, Ordering::Release);
      handle.await.unwrap();
   }

   #[tokio::test]
   async fn idle_reader_enqueues_one_keepalive_pair_per_period() {
      let (commands, events, loopback_tx, _loopback_rx) = harness();
      let (near, _far) = duplex(256);
      let (near_read, _near_write) = split(near);
      let stop = Arc::new(AtomicBool::new(false));

      let tuning = LinkTuning {
         read_poll: Duration::from_millis(5),
         idle_keepalive_ticks: 3,
         write_poll: Duration::from_millis(10),
      };
      let handle = tokio::spawn(reader_worker(
         near_read,
         stop.clone(),
         commands.clone(),
         events.clone(),
         loopback_tx,
         1,
         tuning,
      ));

      // Each threshold period produces the pair in this exact order.
      assert_eq!(next_command(&commands).await, Command::GetBatteryLevel);
      assert_eq!(next_command(&commands).await, Command::GetDeviceStatus);
      assert_eq!(next_command(&commands).await, Command::GetBatteryLevel);
      assert_eq!(next_command(&commands).await, Command::GetDeviceStatus);

      stop.store(true, Ordering::Release);
      handle.await.unwrap();
   }

   #[tokio::test]
   async fn write_failure_stops_both_workers_with_one_disconnect() {
      let (commands, events, loopback_tx, mut loopback_rx) = harness();
      let (near, far) = duplex(256);
      let (near_read, near_write) = split(near);
      let stop = Arc::new(AtomicBool::new(false));

      let reader = tokio::spawn(reader_worker(
         near_read,
         stop.clone(),
         commands.clone(),
         events.clone(),
         loopback_tx.clone(),
         1,
         FAST,
      ));
      let writer = tokio::spawn(writer_worker(
         near_write,
         stop.clone(),
         commands.clone(),
         events.clone(),
         loopback_tx,
         1,
         FAST.write_poll,
      ));

      // Peer goes away: the next write fails, the reader sees EOF or the
      // stop flag, and exactly one of them reports the disconnect.
      drop(far);
      commands.push(Command::GetDeviceStatus);

      reader.await.unwrap();
      writer.await.unwrap();
      assert!(stop.load(Ordering::Acquire));

      let mut disconnects = 0;
      while let Some(event) = events.pop() {
         if matches!(event, Event::Disconnected(_)) {
            disconnects += 1;
         }
      }
      assert_eq!(disconnects, 1);

      // Both workers reported their exit.
      let mut exits = 0;
      while let Ok(req) = loopback_rx.try_recv() {
         if matches!(req, SessionRequest::WorkerExited(1, _)) {
            exits += 1;
         }
      }
      assert_eq!(exits, 2);
   }

   #[tokio::test]
   async fn teardown_joins_both_workers() {
      let (commands, events, loopback_tx, _loopback_rx) = harness();
      let (near, _far) = duplex(256);
      let (near_read, near_write) = split(near);
      let stop = Arc::new(AtomicBool::new(false));

      let reader = tokio::spawn(reader_worker(
         near_read,
         stop.clone(),
         commands.clone(),
         events.clone(),
         loopback_tx.clone(),
         1,
         FAST,
      ));
      let writer = tokio::spawn(writer_worker(
         near_write,
         stop.clone(),
         commands,
         events,
         loopback_tx,
         1,
         FAST.write_poll,
      ));

      let link = LiveLink {
         generation: 1,
         stop,
         reader,
         writer,
      };
      // Must not hang: both workers observe the flag within one poll.
      time::timeout(Duration::from_secs(5), teardown_link(link))
         .await
         .expect("teardown timed out");
   }

   #[tokio::test]
   async fn reconnect_replaces_the_worker_pair() {
      let peers = Queue::new();
      let (session, events) = Session::with_opener(
         fast_config(),
         DuplexOpener {
            peers: peers.clone(),
         },
      );
      let target = Address([0x04, 0x52, 0xc7, 0x00, 0x11, 0x22]);

      session.connect(target).await.unwrap();
      assert_eq!(events.recv().await, Some(Event::Connecting));

      let mut first = next_peer(&peers).await;
      let mut wire = [0u8; 4];
      first.read_exact(&mut wire).await.unwrap();
      assert_eq!(&wire[..], Command::Connect.bytes());

      first
         .write_all(&[0x00, 0x01, 0x03, 0x05, 49, 46, 48, 46, 52])
         .await
         .unwrap();
      assert_eq!(events.recv().await, Some(Event::Connected("1.0.4".into())));

      // Connect again while the first link is live: the old pair must be
      // signalled and joined before the replacement socket is opened.
      session.connect(target).await.unwrap();
      assert_eq!(
         events.recv().await,
         Some(Event::Disconnected(Some("reconnecting".into())))
      );
      assert_eq!(events.recv().await, Some(Event::Connecting));

      // The departing writer shut the first stream down, so the old peer
      // drains to EOF instead of lingering alongside the new pair.
      drain_to_eof(&mut first).await;

      let mut second = next_peer(&peers).await;
      second.read_exact(&mut wire).await.unwrap();
      assert_eq!(&wire[..], Command::Connect.bytes());

      // The replacement link is fully functional.
      second
         .write_all(&[0x02, 0x02, 0x03, 0x01, 77])
         .await
         .unwrap();
      assert_eq!(events.recv().await, Some(Event::BatteryLevel(77)));
   }

   #[tokio::test]
   async fn disconnect_tears_the_link_down() {
      let peers = Queue::new();
      let (session, events) = Session::with_opener(
         fast_config(),
         DuplexOpener {
            peers: peers.clone(),
         },
      );
      let target = Address([0x04, 0x52, 0xc7, 0x00, 0x11, 0x22]);

      session.connect(target).await.unwrap();
      assert_eq!(events.recv().await, Some(Event::Connecting));

      let mut peer = next_peer(&peers).await;
      let mut wire = [0u8; 4];
      peer.read_exact(&mut wire).await.unwrap();
      assert_eq!(&wire[..], Command::Connect.bytes());

      // Returns only after the actor has joined both workers.
      session.disconnect().await.unwrap();
      assert_eq!(events.recv().await, Some(Event::Disconnected(None)));
      drain_to_eof(&mut peer).await;
   }

   #[tokio::test]
   async fn event_stream_drains_then_ends() {
      let queue = Queue::new();
      let stream = EventStream {
         queue: queue.clone(),
      };
      queue.push(Event::Connecting);
      queue.close();
      assert_eq!(stream.recv().await, Some(Event::Connecting));
      assert_eq!(stream.recv().await, None);
   }
}
