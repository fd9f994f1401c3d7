//! An in-process server speaking enough RESP for the cache library:
//! strings and list commands, pub/sub, RESP3 tracking pushes, and the
//! write-plus-publish scripts executed atomically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub struct MockRedis {
    addr: String,
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    db: Mutex<HashMap<String, Entry>>,
    conns: Mutex<Vec<Arc<ConnState>>>,
    next_id: AtomicI64,
}

#[derive(Clone)]
enum Entry {
    Str(Vec<u8>),
    List(Vec<String>),
}

enum Frame {
    Data(Vec<u8>),
    Close,
}

struct ConnState {
    id: i64,
    tx: mpsc::UnboundedSender<Frame>,
    channels: Mutex<HashSet<String>>,
    resp3: Mutex<bool>,
    tracking: Mutex<bool>,
    tracked: Mutex<HashSet<String>>,
}

impl MockRedis {
    pub async fn start() -> MockRedis {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(State::default());
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_conn(stream, Arc::clone(&accept_state)));
            }
        });
        MockRedis { addr, state }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Tears down every pub/sub connection, forcing subscribers to
    /// reconnect.
    #[allow(dead_code)]
    pub fn kill_subscribers(&self) {
        for conn in self.state.conns.lock().unwrap().iter() {
            if !conn.channels.lock().unwrap().is_empty() {
                let _ = conn.tx.send(Frame::Close);
            }
        }
    }

    /// Raw server-side value of a string key.
    #[allow(dead_code)]
    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        match self.state.db.lock().unwrap().get(key) {
            Some(Entry::Str(val)) => Some(val.clone()),
            _ => None,
        }
    }
}

/// Polls `predicate` until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn handle_conn(stream: TcpStream, state: Arc<State>) {
    stream.set_nodelay(true).ok();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let id = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let conn = Arc::new(ConnState {
        id,
        tx,
        channels: Mutex::new(HashSet::new()),
        resp3: Mutex::new(false),
        tracking: Mutex::new(false),
        tracked: Mutex::new(HashSet::new()),
    });
    state.conns.lock().unwrap().push(Arc::clone(&conn));

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::Data(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Frame::Close => return,
            }
        }
    });

    while let Ok(Some(args)) = read_command(&mut reader).await {
        let reply = dispatch(&state, &conn, args);
        if conn.tx.send(Frame::Data(reply)).is_err() {
            break;
        }
    }
    writer.abort();
    state.conns.lock().unwrap().retain(|c| c.id != id);
}

async fn read_command(
    reader: &mut BufReader<OwnedReadHalf>,
) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let mut header = String::new();
    if reader.read_line(&mut header).await? == 0 {
        return Ok(None);
    }
    let header = header.trim_end();
    let count: usize = header
        .strip_prefix('*')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad array header"))?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_line = String::new();
        if reader.read_line(&mut len_line).await? == 0 {
            return Ok(None);
        }
        let len: usize = len_line
            .trim_end()
            .strip_prefix('$')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad bulk header")
            })?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(data);
    }
    Ok(Some(args))
}

fn simple(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

fn error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

fn int(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

fn array(frames: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", frames.len()).into_bytes();
    for frame in frames {
        out.extend_from_slice(&frame);
    }
    out
}

fn message_frame(channel: &str, payload: &[u8]) -> Vec<u8> {
    array(vec![
        bulk(b"message"),
        bulk(channel.as_bytes()),
        bulk(payload),
    ])
}

fn invalidate_push(key: &str) -> Vec<u8> {
    let mut out = b">2\r\n".to_vec();
    out.extend_from_slice(&bulk(b"invalidate"));
    out.extend_from_slice(&array(vec![bulk(key.as_bytes())]));
    out
}

fn publish(state: &State, channel: &str, payload: &[u8]) -> i64 {
    let mut receivers = 0;
    for conn in state.conns.lock().unwrap().iter() {
        if conn.channels.lock().unwrap().contains(channel) {
            let _ = conn.tx.send(Frame::Data(message_frame(channel, payload)));
            receivers += 1;
        }
    }
    receivers
}

/// Pushes an `invalidate` frame to every tracking connection that has
/// read `key` since it last heard about it.
fn invalidate_trackers(state: &State, key: &str) {
    for conn in state.conns.lock().unwrap().iter() {
        if *conn.tracking.lock().unwrap() && conn.tracked.lock().unwrap().remove(key) {
            let _ = conn.tx.send(Frame::Data(invalidate_push(key)));
        }
    }
}

fn set_str(state: &State, key: &str, val: Vec<u8>) {
    state
        .db
        .lock()
        .unwrap()
        .insert(key.to_string(), Entry::Str(val));
    invalidate_trackers(state, key);
}

fn del_key(state: &State, key: &str) -> bool {
    let existed = state.db.lock().unwrap().remove(key).is_some();
    invalidate_trackers(state, key);
    existed
}

fn utf8(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

fn dispatch(state: &State, conn: &ConnState, args: Vec<Vec<u8>>) -> Vec<u8> {
    if args.is_empty() {
        return error("ERR empty command");
    }
    let name = args[0].to_ascii_uppercase();
    match name.as_slice() {
        b"PING" => simple("PONG"),
        b"AUTH" => simple("OK"),
        b"HELLO" => {
            *conn.resp3.lock().unwrap() = true;
            format!("%1\r\n$2\r\nid\r\n:{}\r\n", conn.id).into_bytes()
        }
        b"CLIENT" => match args.get(1).map(|a| a.to_ascii_uppercase()) {
            Some(sub) if sub == b"ID" => int(conn.id),
            Some(sub) if sub == b"TRACKING" => {
                if *conn.resp3.lock().unwrap() {
                    *conn.tracking.lock().unwrap() = true;
                }
                simple("OK")
            }
            _ => error("ERR unknown CLIENT subcommand"),
        },
        b"SUBSCRIBE" => {
            let channel = utf8(&args[1]);
            let mut channels = conn.channels.lock().unwrap();
            channels.insert(channel.clone());
            let count = channels.len() as i64;
            array(vec![
                bulk(b"subscribe"),
                bulk(channel.as_bytes()),
                int(count),
            ])
        }
        b"PUBLISH" => int(publish(state, &utf8(&args[1]), &args[2])),
        b"GET" => {
            let key = utf8(&args[1]);
            if *conn.tracking.lock().unwrap() {
                conn.tracked.lock().unwrap().insert(key.clone());
            }
            match state.db.lock().unwrap().get(&key) {
                Some(Entry::Str(val)) => bulk(val),
                Some(Entry::List(_)) => error("WRONGTYPE not a string"),
                None => nil(),
            }
        }
        b"SET" => {
            set_str(state, &utf8(&args[1]), args[2].clone());
            simple("OK")
        }
        b"DEL" => {
            let mut removed = 0;
            for key in &args[1..] {
                if del_key(state, &utf8(key)) {
                    removed += 1;
                }
            }
            int(removed)
        }
        b"APPEND" => {
            let key = utf8(&args[1]);
            let mut db = state.db.lock().unwrap();
            let entry = db.entry(key.clone()).or_insert(Entry::Str(Vec::new()));
            let len = match entry {
                Entry::Str(val) => {
                    val.extend_from_slice(&args[2]);
                    val.len()
                }
                Entry::List(_) => return error("WRONGTYPE not a string"),
            };
            drop(db);
            invalidate_trackers(state, &key);
            int(len as i64)
        }
        b"MSET" => {
            for pair in args[1..].chunks(2) {
                set_str(state, &utf8(&pair[0]), pair[1].clone());
            }
            simple("OK")
        }
        b"MGET" => {
            let db = state.db.lock().unwrap();
            let frames = args[1..]
                .iter()
                .map(|key| match db.get(&utf8(key)) {
                    Some(Entry::Str(val)) => bulk(val),
                    _ => nil(),
                })
                .collect();
            array(frames)
        }
        b"RPUSH" => int(rpush(state, &utf8(&args[1]), utf8(&args[2]))),
        b"LPOP" => match lpop(state, &utf8(&args[1])) {
            Some(val) => bulk(val.as_bytes()),
            None => nil(),
        },
        b"LRANGE" => {
            let key = utf8(&args[1]);
            let start: i64 = utf8(&args[2]).parse().unwrap_or(0);
            let stop: i64 = utf8(&args[3]).parse().unwrap_or(-1);
            let db = state.db.lock().unwrap();
            let items = match db.get(&key) {
                Some(Entry::List(items)) => items.clone(),
                _ => Vec::new(),
            };
            let len = items.len() as i64;
            let resolve = |idx: i64| -> i64 {
                if idx < 0 {
                    (len + idx).max(0)
                } else {
                    idx.min(len)
                }
            };
            let (start, stop) = (resolve(start), resolve(stop));
            let frames = items
                .into_iter()
                .enumerate()
                .filter(|(i, _)| (*i as i64) >= start && (*i as i64) <= stop)
                .map(|(_, item)| bulk(item.as_bytes()))
                .collect();
            array(frames)
        }
        b"EVALSHA" => error("NOSCRIPT No matching script. Please use EVAL."),
        b"EVAL" => eval_script(state, args),
        _ => error("ERR unknown command"),
    }
}

fn rpush(state: &State, key: &str, val: String) -> i64 {
    let mut db = state.db.lock().unwrap();
    let entry = db
        .entry(key.to_string())
        .or_insert(Entry::List(Vec::new()));
    match entry {
        Entry::List(items) => {
            items.push(val);
            items.len() as i64
        }
        Entry::Str(_) => 0,
    }
}

fn lpop(state: &State, key: &str) -> Option<String> {
    let mut db = state.db.lock().unwrap();
    match db.get_mut(key) {
        Some(Entry::List(items)) if !items.is_empty() => Some(items.remove(0)),
        _ => None,
    }
}

/// Emulates the library's write-plus-publish scripts; each runs
/// atomically under the state locks, like the server would.
fn eval_script(state: &State, args: Vec<Vec<u8>>) -> Vec<u8> {
    let body = utf8(&args[1]);
    let nkeys: usize = utf8(&args[2]).parse().unwrap_or(0);
    let keys: Vec<String> = args[3..3 + nkeys].iter().map(|k| utf8(k)).collect();
    let argv: Vec<Vec<u8>> = args[3 + nkeys..].to_vec();

    if body.contains("rimcu:list") {
        if body.contains("RPUSH") {
            rpush(state, &keys[0], utf8(&argv[0]));
            publish(state, "rimcu:list", &argv[1]);
            bulk(b"OK")
        } else {
            let popped = lpop(state, &keys[0]);
            publish(state, "rimcu:list", &argv[0]);
            match popped {
                Some(val) => bulk(val.as_bytes()),
                None => nil(),
            }
        }
    } else if body.contains("setex") {
        set_str(state, &keys[0], argv[1].clone());
        publish(state, "rimcu:strings", &argv[2]);
        bulk(b"OK")
    } else if body.contains("#KEYS") {
        let n = keys.len();
        for (i, key) in keys.iter().enumerate() {
            set_str(state, key, argv[i].clone());
        }
        for i in 0..n {
            publish(state, "rimcu:strings", &argv[n + i]);
        }
        bulk(b"OK")
    } else if body.contains("'del'") {
        del_key(state, &keys[0]);
        publish(state, "rimcu:strings", &argv[0]);
        bulk(b"1")
    } else if body.contains("append") {
        {
            let mut db = state.db.lock().unwrap();
            let entry = db
                .entry(keys[0].clone())
                .or_insert(Entry::Str(Vec::new()));
            if let Entry::Str(val) = entry {
                val.extend_from_slice(&argv[0]);
            }
        }
        invalidate_trackers(state, &keys[0]);
        publish(state, "rimcu:strings", &argv[1]);
        bulk(b"OK")
    } else {
        error("ERR unsupported script")
    }
}
