//! Text inputs: one line in, one utterance out.
//!
//! Both inputs read on threads they own. `stop()` detaches the sink the
//! reader emits into; a stdin reader blocked waiting for a line stays
//! parked and is picked up again by the next `start()`.

use std::io::{self, BufRead, BufReader, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vox_core::{InputPlugin, Params, Result, UtteranceSink, VoxError};

use super::{param_str, param_u64, required};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_millis(200);

type OpenReader = Box<dyn Fn() -> Box<dyn BufRead + Send> + Send>;

/// What the stdin reader thread shares with its plugin.
#[derive(Default)]
struct ReaderSlot {
    /// `None` while stopped.
    sink: Option<UtteranceSink>,
    /// A reader thread exists. At most one ever does.
    alive: bool,
}

/// Reads utterances from standard input, one per line.
pub struct StdinInput {
    slot: Arc<Mutex<ReaderSlot>>,
    open: OpenReader,
}

impl StdinInput {
    pub fn new() -> Self {
        Self::with_source(|| Box::new(BufReader::new(io::stdin())))
    }

    fn with_source(open: impl Fn() -> Box<dyn BufRead + Send> + Send + 'static) -> Self {
        Self {
            slot: Arc::default(),
            open: Box::new(open),
        }
    }
}

impl Default for StdinInput {
    fn default() -> Self {
        Self::new()
    }
}

impl InputPlugin for StdinInput {
    fn start(&mut self, sink: UtteranceSink) -> Result<()> {
        {
            let mut slot = self.slot.lock();
            slot.sink = Some(sink);
            if slot.alive {
                debug!("stdin reader still parked, reusing it");
                return Ok(());
            }
            slot.alive = true;
        }

        let reader = (self.open)();
        let slot = Arc::clone(&self.slot);
        let spawned = thread::Builder::new()
            .name("vox-input-stdin".into())
            .spawn(move || read_stdin(reader, slot));
        if let Err(e) = spawned {
            *self.slot.lock() = ReaderSlot::default();
            return Err(e.into());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.slot.lock().sink = None;
        Ok(())
    }
}

fn read_stdin(reader: Box<dyn BufRead + Send>, slot: Arc<Mutex<ReaderSlot>>) {
    for line in reader.lines() {
        let sink = {
            let mut slot = slot.lock();
            match &slot.sink {
                Some(sink) => sink.clone(),
                None => {
                    // Stopped while we were blocked; this line has no owner.
                    slot.alive = false;
                    debug!("stdin reader exiting after stop");
                    return;
                }
            }
        };
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => {
                sink.emit(line.trim(), None);
            }
            Err(e) => {
                slot.lock().alive = false;
                sink.fail(format!("stdin read failed: {e}"));
                return;
            }
        }
    }
    slot.lock().alive = false;
    info!("stdin closed");
}

/// Accepts TCP connections and reads one UTF-8 utterance per line.
pub struct SocketInput {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl SocketInput {
    /// Params: `port` (required), `host` (default `127.0.0.1`).
    pub fn from_params(params: &Params) -> Result<Self> {
        let port = required(param_u64(params, "port")?, "port")?;
        let port = u16::try_from(port)
            .map_err(|_| VoxError::Configuration(format!("port {port} is out of range")))?;
        let host = param_str(params, "host")?.unwrap_or("127.0.0.1");
        let addr = format!("{host}:{port}")
            .parse()
            .map_err(|e| VoxError::Configuration(format!("invalid socket address: {e}")))?;
        Ok(Self {
            addr,
            running: Arc::new(AtomicBool::new(false)),
            acceptor: None,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl InputPlugin for SocketInput {
    fn start(&mut self, sink: UtteranceSink) -> Result<()> {
        let listener = TcpListener::bind(self.addr)?;
        listener.set_nonblocking(true)?;
        // Port 0 binds an ephemeral port; report the real one.
        self.addr = listener.local_addr()?;
        info!(addr = %self.addr, "socket input listening");

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        self.acceptor = Some(
            thread::Builder::new()
                .name("vox-input-socket".into())
                .spawn(move || accept_loop(listener, sink, running))?,
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        Ok(())
    }
}

fn accept_loop(listener: TcpListener, sink: UtteranceSink, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "socket input connection");
                let sink = sink.clone();
                let running = Arc::clone(&running);
                let spawned = thread::Builder::new()
                    .name(format!("vox-input-conn-{peer}"))
                    .spawn(move || read_lines(stream, sink, running));
                if let Err(e) = spawned {
                    warn!(peer = %peer, error = %e, "could not spawn connection reader");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                sink.fail(format!("accept failed: {e}"));
                return;
            }
        }
    }
}

fn read_lines(stream: TcpStream, sink: UtteranceSink, running: Arc<AtomicBool>) {
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(READ_TIMEOUT)))
    {
        warn!(error = %e, "could not configure connection");
        return;
    }

    let mut reader = BufReader::new(stream);
    // Raw bytes, so a character split across reads is decoded only once the
    // whole line is here.
    let mut line = Vec::new();
    while running.load(Ordering::SeqCst) {
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                // Peer closed; an unterminated last line still counts.
                emit_line(&sink, &mut line);
                break;
            }
            Ok(_) if line.last() != Some(&b'\n') => {}
            Ok(_) => emit_line(&sink, &mut line),
            // Bytes read before the timeout stay in `line`.
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                debug!(error = %e, "connection closed with error");
                break;
            }
        }
    }
}

fn emit_line(sink: &UtteranceSink, line: &mut Vec<u8>) {
    {
        let decoded = String::from_utf8_lossy(line);
        let text = decoded.trim();
        if !text.is_empty() {
            sink.emit(text, None);
        }
    }
    line.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use vox_core::{DispatchEngine, Manifest, Notification, PluginFactory};

    fn params(value: serde_json::Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    /// An engine with no plugins that audits every matched command.
    fn engine() -> DispatchEngine {
        let manifest = Manifest::from_json_str(
            r#"{
                "keyPhrases": ["dexter"],
                "dispatch": {
                    "serviceTimeoutMs": 500,
                    "queue": { "capacity": 16, "overflow": "dropNewest" },
                    "auditCommands": true
                }
            }"#,
        )
        .unwrap();
        DispatchEngine::from_manifest(&manifest, &PluginFactory::new()).unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    /// Stand-in for a terminal: blocks until the test writes a chunk.
    struct Terminal {
        chunks: crossbeam_channel::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for Terminal {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.chunks.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    #[test]
    fn stdin_restart_reuses_the_parked_reader() {
        let (typed, chunks) = crossbeam_channel::unbounded::<Vec<u8>>();
        let opens = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&opens);
        let mut input = StdinInput::with_source(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Box::new(BufReader::new(Terminal {
                chunks: chunks.clone(),
                pending: Vec::new(),
            }))
        });
        let engine = engine();
        let accepted = || engine.diagnostics_snapshot().utterances_accepted;

        input.start(engine.utterance_sink("input/stdin#0")).unwrap();
        typed.send(b"dexter one\n".to_vec()).unwrap();
        assert!(wait_until(|| accepted() == 1));

        // The reader is blocked on the next line; restarting must not add a
        // second one.
        input.stop().unwrap();
        input.start(engine.utterance_sink("input/stdin#0")).unwrap();
        typed.send(b"dexter two\n".to_vec()).unwrap();
        assert!(wait_until(|| accepted() == 2));
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        // A line arriving while stopped is dropped and retires the reader.
        input.stop().unwrap();
        typed.send(b"dexter lost\n".to_vec()).unwrap();
        assert!(wait_until(|| !input.slot.lock().alive));
        input.start(engine.utterance_sink("input/stdin#0")).unwrap();
        typed.send(b"dexter three\n".to_vec()).unwrap();
        assert!(wait_until(|| accepted() == 3));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        input.stop().unwrap();
    }

    #[test]
    fn socket_reassembles_a_character_split_across_reads() {
        let engine = engine();
        let mut audit = engine.subscribe();
        engine.start().unwrap();

        let mut input = SocketInput::from_params(&params(json!({ "port": 0 }))).unwrap();
        input.start(engine.utterance_sink("input/socket#0")).unwrap();
        let mut conn = TcpStream::connect(input.addr()).unwrap();

        // "é" is C3 A9; the reader times out between the two halves.
        conn.write_all(b"dexter caf\xC3").unwrap();
        conn.flush().unwrap();
        thread::sleep(READ_TIMEOUT * 2 + Duration::from_millis(50));
        conn.write_all(b"\xA9\ndexter again\n").unwrap();
        conn.flush().unwrap();

        let mut commands = Vec::new();
        assert!(wait_until(|| {
            while let Ok(n) = audit.try_recv() {
                if let Notification::Command(cmd) = n {
                    commands.push(cmd.text.clone());
                }
            }
            commands.len() >= 2
        }));
        assert_eq!(commands, vec!["café", "again"]);

        input.stop().unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn socket_requires_a_valid_port() {
        assert!(matches!(
            SocketInput::from_params(&params(json!({}))),
            Err(VoxError::Configuration(_))
        ));
        assert!(SocketInput::from_params(&params(json!({ "port": 70000 }))).is_err());
        assert!(SocketInput::from_params(&params(json!({ "port": "8008" }))).is_err());

        let input = SocketInput::from_params(&params(json!({ "port": 8008 }))).unwrap();
        assert_eq!(input.addr().to_string(), "127.0.0.1:8008");
    }

    #[test]
    fn socket_host_is_configurable() {
        let input =
            SocketInput::from_params(&params(json!({ "port": 9000, "host": "0.0.0.0" }))).unwrap();
        assert_eq!(input.addr().to_string(), "0.0.0.0:9000");
    }
}
