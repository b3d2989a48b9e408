//! Tick-driven lobby relay.
//!
//! Every tick the lobby waits once on its [`PollGroup`], admits new sessions
//! from the listen socket, and relays whatever each session sent to every
//! other session. An optional upstream link to another lobby is opened
//! through the [`AsyncConnector`] and joins the relay like any other session.
//!
//! Each admitted session first receives a plain greeting, `NBLY` followed by
//! a flags byte. Bit 0 set means every later byte in both directions is
//! compressed. The upstream link's greeting is gathered over later ticks and
//! must arrive within the read timeout. A session whose writes stay blocked
//! past the socket's write timeout is dropped.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use nebula_net::{
    AsyncConnector, Connection, ListenSocket, NetError, NetResult, NetworkCounters, NetworkStats,
    OpenConnectionResult, PollGroup, TransportKind, Transferred, update_network_stats,
};

use crate::settings::LobbySettings;

/// First four greeting bytes.
pub const GREETING_MAGIC: [u8; 4] = *b"NBLY";
/// Greeting length: magic plus one flags byte.
pub const GREETING_LEN: usize = 5;
/// Greeting flag: the session is compressed after the greeting.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

const READ_CHUNK: usize = 16 * 1024;
const MAX_READS_PER_TICK: usize = 64;
const STATS_PERIOD: Duration = Duration::from_secs(1);

/// Identifier of a session, unique for the lobby's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What happened during one [`Lobby::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub joined: usize,
    pub left: usize,
    /// Stream bytes read from sessions and fanned out.
    pub relayed_bytes: usize,
}

struct Session {
    id: SessionId,
    conn: Connection,
    upstream: bool,
    closed: bool,
}

/// Upstream connect outcome tagged with the attempt it belongs to.
type LinkResult = (u64, OpenConnectionResult);

/// Upstream connection whose greeting has not fully arrived.
struct PendingLink {
    conn: Connection,
    greeting: [u8; GREETING_LEN],
    filled: usize,
    deadline: Instant,
}

/// The relay. Owned and driven by one thread.
pub struct Lobby {
    settings: LobbySettings,
    listener: ListenSocket,
    group: PollGroup,
    sessions: Vec<Session>,
    next_id: u64,
    connector: AsyncConnector,
    link_tx: Sender<LinkResult>,
    link_rx: Receiver<LinkResult>,
    link_generation: u64,
    link_pending: bool,
    awaiting_greeting: Option<PendingLink>,
    last_link_attempt: Option<Instant>,
    counters: NetworkCounters,
    stats: NetworkStats,
    stats_started: Instant,
    buf: Vec<u8>,
}

impl Lobby {
    /// Bind the listen socket and start the connector pool.
    pub fn new(settings: LobbySettings) -> NetResult<Self> {
        let listener = ListenSocket::open(settings.listen_port, &settings.socket)?;
        let mut group = PollGroup::new(TransportKind::Tcp);
        group.add(&listener);
        let connector = AsyncConnector::new(settings.connector.clone())?;
        let (link_tx, link_rx) = unbounded();

        tracing::info!(
            "Lobby listening on {} (max {} players, compression {})",
            listener.local_addr(),
            settings.max_players,
            if settings.compression { "on" } else { "off" }
        );

        Ok(Self {
            settings,
            listener,
            group,
            sessions: Vec::new(),
            next_id: 1,
            connector,
            link_tx,
            link_rx,
            link_generation: 0,
            link_pending: false,
            awaiting_greeting: None,
            last_link_attempt: None,
            counters: NetworkCounters::new(),
            stats: NetworkStats::default(),
            stats_started: Instant::now(),
            buf: vec![0; READ_CHUNK],
        })
    }

    /// Address the lobby accepts sessions on.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr()
    }

    /// Live sessions, the upstream link included.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether an upstream link is established.
    pub fn has_upstream(&self) -> bool {
        self.sessions.iter().any(|s| s.upstream)
    }

    /// Tick until `stop` is set, pacing ticks to the configured interval.
    pub fn run(&mut self, stop: &AtomicBool) -> NetResult<()> {
        tracing::info!("Lobby running at {:?} per tick", self.settings.tick_interval);
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            let report = self.tick()?;
            if report.joined > 0 || report.left > 0 {
                tracing::debug!(
                    "Tick: {} joined, {} left, {} bytes relayed, {} sessions",
                    report.joined,
                    report.left,
                    report.relayed_bytes,
                    self.sessions.len()
                );
            }
            if let Some(rest) = self.settings.tick_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        tracing::info!(
            "Lobby stopping with {} sessions (last period: {:?})",
            self.sessions.len(),
            self.stats.current
        );
        Ok(())
    }

    /// One relay step: link, wait, admit, relay, reap.
    pub fn tick(&mut self) -> NetResult<TickReport> {
        let mut report = TickReport::default();

        self.maybe_link_upstream();
        self.drain_links();

        if self.group.check_sockets(self.settings.poll_timeout)? > 0
            && self.group.is_set(&self.listener)
        {
            report.joined += self.accept_pending();
        }
        report.joined += self.advance_greeting();
        report.relayed_bytes = self.relay();
        report.left = self.reap();

        if self.stats_started.elapsed() >= STATS_PERIOD {
            update_network_stats(&self.counters, &mut self.stats);
            self.stats_started = Instant::now();
        }
        Ok(report)
    }

    /// Start connecting to an upstream lobby in the background.
    ///
    /// Supersedes any attempt still in flight or awaiting its greeting; its
    /// result is discarded.
    pub fn link_upstream(&mut self, host: &str, port: u16) -> NetResult<()> {
        if let Some(link) = self.awaiting_greeting.take() {
            self.group.remove(&link.conn);
        }
        self.link_generation += 1;
        let generation = self.link_generation;
        let tx = self.link_tx.clone();
        self.last_link_attempt = Some(Instant::now());
        self.connector.open_async(host, port, move |result| {
            let _ = tx.send((generation, result));
        })?;
        self.link_pending = true;
        tracing::info!("Linking to upstream [{host}]:{port}");
        Ok(())
    }

    fn maybe_link_upstream(&mut self) {
        let Some((host, port)) = self.settings.upstream.clone() else {
            return;
        };
        // One attempt per lobby; a lost link is not re-established.
        if self.last_link_attempt.is_some() {
            return;
        }
        if let Err(e) = self.link_upstream(&host, port) {
            tracing::warn!("Cannot start upstream link: {e}");
        }
    }

    fn drain_links(&mut self) {
        while let Ok((generation, result)) = self.link_rx.try_recv() {
            if generation != self.link_generation {
                tracing::debug!("Discarding superseded upstream attempt {generation}");
                continue;
            }
            self.link_pending = false;
            match result {
                Ok(conn) => {
                    // Polled with the sessions so its greeting wakes the tick.
                    self.group.add(&conn);
                    self.awaiting_greeting = Some(PendingLink {
                        conn,
                        greeting: [0; GREETING_LEN],
                        filled: 0,
                        deadline: Instant::now() + self.settings.read_timeout,
                    });
                }
                Err(e) => tracing::warn!("Upstream link failed: {e}"),
            }
        }
    }

    /// Promote the upstream link to a session once its greeting is in.
    fn advance_greeting(&mut self) -> usize {
        let Some(mut link) = self.awaiting_greeting.take() else {
            return 0;
        };
        match self.read_greeting(&mut link) {
            Ok(true) => {
                self.group.remove(&link.conn);
                self.register(link.conn, true);
                1
            }
            Ok(false) => {
                self.awaiting_greeting = Some(link);
                0
            }
            Err(e) => {
                self.group.remove(&link.conn);
                tracing::warn!("Upstream link failed: {e}");
                0
            }
        }
    }

    /// Take whatever part of the greeting has arrived without waiting.
    ///
    /// `Ok(true)` once all of it is in, after following its compression flag.
    fn read_greeting(&self, link: &mut PendingLink) -> NetResult<bool> {
        while link.filled < GREETING_LEN {
            let got = link.conn.read_no_int(&mut link.greeting[link.filled..])?;
            if got.bytes == 0 {
                if link.conn.read_disconnected() {
                    return Err(NetError::Closed);
                }
                if Instant::now() >= link.deadline {
                    return Err(NetError::TimedOut);
                }
                return Ok(false);
            }
            link.filled += got.bytes;
        }

        if link.greeting[..4] != GREETING_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected greeting").into());
        }
        self.counters
            .record_receive(Transferred::new(GREETING_LEN, GREETING_LEN));
        if link.greeting[4] & FLAG_COMPRESSED != 0 {
            link.conn.enable_compression()?;
        }
        Ok(true)
    }

    fn accept_pending(&mut self) -> usize {
        let mut joined = 0;
        loop {
            match self.listener.try_accept() {
                Ok(Some(conn)) => {
                    if self.admit(conn) {
                        joined += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                    break;
                }
            }
        }
        joined
    }

    fn admit(&mut self, mut conn: Connection) -> bool {
        let players = self.sessions.iter().filter(|s| !s.upstream).count();
        if players >= self.settings.max_players {
            tracing::info!("Lobby full, turning away {}", conn.text_address());
            return false;
        }

        let flags = if self.settings.compression { FLAG_COMPRESSED } else { 0 };
        let mut greeting = [0u8; GREETING_LEN];
        greeting[..4].copy_from_slice(&GREETING_MAGIC);
        greeting[4] = flags;

        let greeted = conn.write_all(&greeting).and_then(|sent| {
            self.counters.record_send(sent);
            if self.settings.compression {
                conn.enable_compression()?;
            }
            Ok(())
        });
        if let Err(e) = greeted {
            tracing::warn!("Greeting {} failed: {e}", conn.text_address());
            return false;
        }
        self.register(conn, false);
        true
    }

    fn register(&mut self, conn: Connection, upstream: bool) {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.group.add(&conn);
        tracing::info!(
            "Session {id} joined from {}{}",
            conn.text_address(),
            if upstream { " (upstream)" } else { "" }
        );
        self.sessions.push(Session {
            id,
            conn,
            upstream,
            closed: false,
        });
    }

    fn relay(&mut self) -> usize {
        let mut outgoing: Vec<(SessionId, Vec<u8>)> = Vec::new();

        for session in &mut self.sessions {
            if session.closed
                || !(self.group.is_set(&session.conn) || session.conn.read_ready())
            {
                continue;
            }
            let mut data = Vec::new();
            for _ in 0..MAX_READS_PER_TICK {
                match session.conn.read_no_int(&mut self.buf) {
                    Ok(got) if got.is_empty() => break,
                    Ok(got) => {
                        self.counters.record_receive(got);
                        data.extend_from_slice(&self.buf[..got.bytes]);
                    }
                    Err(e) => {
                        tracing::warn!("Session {} read failed: {e}", session.id);
                        session.closed = true;
                        break;
                    }
                }
            }
            if session.conn.read_disconnected() {
                session.closed = true;
            }
            if !data.is_empty() {
                outgoing.push((session.id, data));
            }
        }

        let mut relayed = 0;
        for (source, data) in &outgoing {
            for session in &mut self.sessions {
                if session.id == *source || session.closed {
                    continue;
                }
                match session.conn.write_all(data) {
                    Ok(sent) => self.counters.record_send(sent),
                    Err(e) => {
                        tracing::warn!("Session {} write failed: {e}", session.id);
                        session.closed = true;
                    }
                }
            }
            relayed += data.len();
        }

        if !outgoing.is_empty() {
            for session in &mut self.sessions {
                if session.closed {
                    continue;
                }
                match session.conn.flush() {
                    Ok(raw) => self.counters.record_send(Transferred::new(0, raw)),
                    Err(e) => {
                        tracing::warn!("Session {} flush failed: {e}", session.id);
                        session.closed = true;
                    }
                }
            }
        }
        relayed
    }

    fn reap(&mut self) -> usize {
        let group = &mut self.group;
        let before = self.sessions.len();
        self.sessions.retain(|session| {
            if !session.closed {
                return true;
            }
            group.remove(&session.conn);
            tracing::info!("Session {} left", session.id);
            false
        });
        before - self.sessions.len()
    }
}

impl Drop for Lobby {
    fn drop(&mut self) {
        self.group.clear();
    }
}
