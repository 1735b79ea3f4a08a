//! In-process server speaking enough of the protocol to drive the client end to end: strings,
//! hashes, sets, MULTI/EXEC/WATCH and the SCAN family.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use glob_match::glob_match;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use rustdis_client::codec::FrameCodec;
use rustdis_client::{Client, Config, Frame};

#[derive(Clone)]
enum Value {
    Str(Bytes),
    Hash(BTreeMap<Bytes, Bytes>),
    Set(BTreeSet<Bytes>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
        }
    }
}

#[derive(Default)]
struct Db {
    keys: BTreeMap<Bytes, Value>,
    // Bumped on every write, WATCH compares them at EXEC time.
    versions: HashMap<Bytes, u64>,
}

impl Db {
    fn touch(&mut self, key: &Bytes) {
        *self.versions.entry(key.clone()).or_default() += 1;
    }

    fn version(&self, key: &Bytes) -> u64 {
        self.versions.get(key).copied().unwrap_or_default()
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
}

impl MockServer {
    pub async fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let db = Arc::new(Mutex::new(Db::default()));

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(handle_connection(socket, db.clone()));
            }
        });

        MockServer { addr }
    }

    pub fn config(&self, max_size: usize) -> Config {
        let mut config = Config::new("127.0.0.1", self.addr.port());
        config.pool.max_size = max_size;
        config.pool.wait_timeout = Duration::from_millis(200);
        config.response_timeout = Some(Duration::from_secs(5));
        config
    }

    pub fn client(&self, max_size: usize) -> Client {
        Client::new(self.config(max_size))
    }
}

#[derive(Default)]
struct Session {
    queued: Option<Vec<Vec<Bytes>>>,
    queue_error: bool,
    watched: Vec<(Bytes, u64)>,
}

async fn handle_connection(stream: TcpStream, db: Arc<Mutex<Db>>) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    let mut session = Session::default();

    while let Some(Ok(frame)) = framed.next().await {
        let args: Vec<Bytes> = frame
            .into_array()
            .unwrap_or_default()
            .into_iter()
            .filter_map(Frame::into_bytes)
            .collect();

        let reply = session.dispatch(args, &db);

        if framed.get_mut().write_all(&reply.serialize()).await.is_err() {
            break;
        }
    }
}

fn name_of(args: &[Bytes]) -> String {
    args.first()
        .map(|name| String::from_utf8_lossy(name).to_uppercase())
        .unwrap_or_default()
}

fn ok() -> Frame {
    Frame::Simple("OK".to_string())
}

fn err(message: &str) -> Frame {
    Frame::Error(message.to_string())
}

fn wrong_type() -> Frame {
    err("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn check_arity(name: &str, argc: usize) -> Result<(), Frame> {
    let min = match name {
        "PING" | "FLUSHDB" | "HELLO" => 1,
        "GET" | "DEL" | "EXISTS" | "INCR" | "TYPE" | "SCAN" => 2,
        "SET" | "HGET" | "SADD" | "HSCAN" | "SSCAN" => 3,
        "HSET" => 4,
        _ => return Err(err(&format!("ERR unknown command '{}'", name))),
    };

    if argc < min {
        return Err(err(&format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_lowercase()
        )));
    }
    Ok(())
}

impl Session {
    fn dispatch(&mut self, args: Vec<Bytes>, db: &Mutex<Db>) -> Frame {
        let name = name_of(&args);

        match name.as_str() {
            "MULTI" => {
                if self.queued.is_some() {
                    return err("ERR MULTI calls can not be nested");
                }
                self.queued = Some(Vec::new());
                ok()
            }
            "EXEC" => {
                let Some(queued) = self.queued.take() else {
                    return err("ERR EXEC without MULTI");
                };
                let watched = std::mem::take(&mut self.watched);
                if std::mem::take(&mut self.queue_error) {
                    return err("EXECABORT Transaction discarded because of previous errors.");
                }

                let mut db = db.lock().unwrap();
                if watched.iter().any(|(key, version)| db.version(key) != *version) {
                    return Frame::NullArray;
                }
                Frame::Array(queued.iter().map(|cmd| execute(&mut db, cmd)).collect())
            }
            "DISCARD" => {
                if self.queued.take().is_none() {
                    return err("ERR DISCARD without MULTI");
                }
                self.watched.clear();
                self.queue_error = false;
                ok()
            }
            "WATCH" => {
                if self.queued.is_some() {
                    return err("ERR WATCH inside MULTI is not allowed");
                }
                let db = db.lock().unwrap();
                for key in &args[1..] {
                    self.watched.push((key.clone(), db.version(key)));
                }
                ok()
            }
            "UNWATCH" => {
                self.watched.clear();
                ok()
            }
            _ => {
                if let Err(reply) = check_arity(&name, args.len()) {
                    if self.queued.is_some() {
                        self.queue_error = true;
                    }
                    return reply;
                }

                match &mut self.queued {
                    Some(queued) => {
                        queued.push(args);
                        Frame::Simple("QUEUED".to_string())
                    }
                    None => execute(&mut db.lock().unwrap(), &args),
                }
            }
        }
    }
}

fn execute(db: &mut Db, args: &[Bytes]) -> Frame {
    let name = name_of(args);

    match (name.as_str(), &args[1..]) {
        ("PING", _) => Frame::Simple("PONG".to_string()),
        ("HELLO", _) => Frame::Map(vec![
            (Frame::Bulk(Bytes::from("server")), Frame::Bulk(Bytes::from("mock"))),
            (Frame::Bulk(Bytes::from("proto")), Frame::Integer(3)),
        ]),
        ("GET", [key]) => match db.keys.get(key) {
            None => Frame::NullBulk,
            Some(Value::Str(value)) => Frame::Bulk(value.clone()),
            Some(_) => wrong_type(),
        },
        ("SET", [key, value, ..]) => {
            db.keys.insert(key.clone(), Value::Str(value.clone()));
            db.touch(key);
            ok()
        }
        ("DEL", keys) => {
            let mut removed = 0;
            for key in keys {
                if db.keys.remove(key).is_some() {
                    db.touch(key);
                    removed += 1;
                }
            }
            Frame::Integer(removed)
        }
        ("EXISTS", keys) => {
            Frame::Integer(keys.iter().filter(|key| db.keys.contains_key(*key)).count() as i64)
        }
        ("TYPE", [key]) => Frame::Simple(
            db.keys
                .get(key)
                .map(Value::type_name)
                .unwrap_or("none")
                .to_string(),
        ),
        ("INCR", [key]) => {
            let current = match db.keys.get(key) {
                None => 0,
                Some(Value::Str(value)) => match std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                {
                    Some(n) => n,
                    None => return err("ERR value is not an integer or out of range"),
                },
                Some(_) => return wrong_type(),
            };
            let next = current + 1;
            db.keys
                .insert(key.clone(), Value::Str(Bytes::from(next.to_string())));
            db.touch(key);
            Frame::Integer(next)
        }
        ("HSET", [key, pairs @ ..]) if pairs.len() % 2 == 0 => {
            let entry = db
                .keys
                .entry(key.clone())
                .or_insert_with(|| Value::Hash(BTreeMap::new()));
            let Value::Hash(hash) = entry else {
                return wrong_type();
            };
            let mut added = 0;
            for pair in pairs.chunks(2) {
                if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                    added += 1;
                }
            }
            db.touch(key);
            Frame::Integer(added)
        }
        ("HGET", [key, field]) => match db.keys.get(key) {
            None => Frame::NullBulk,
            Some(Value::Hash(hash)) => hash
                .get(field)
                .map(|value| Frame::Bulk(value.clone()))
                .unwrap_or(Frame::NullBulk),
            Some(_) => wrong_type(),
        },
        ("SADD", [key, members @ ..]) => {
            let entry = db
                .keys
                .entry(key.clone())
                .or_insert_with(|| Value::Set(BTreeSet::new()));
            let Value::Set(set) = entry else {
                return wrong_type();
            };
            let added = members
                .iter()
                .filter(|member| set.insert((*member).clone()))
                .count();
            db.touch(key);
            Frame::Integer(added as i64)
        }
        ("FLUSHDB", _) => {
            let keys: Vec<Bytes> = db.keys.keys().cloned().collect();
            for key in &keys {
                db.touch(key);
            }
            db.keys.clear();
            ok()
        }
        ("SCAN", [cursor, options @ ..]) => {
            let options = match ScanArgs::parse(options) {
                Ok(options) => options,
                Err(reply) => return reply,
            };
            let entries = db
                .keys
                .iter()
                .filter(|(_, value)| {
                    options
                        .type_
                        .as_deref()
                        .map_or(true, |type_| value.type_name() == type_)
                })
                .map(|(key, _)| (key.clone(), vec![key.clone()]))
                .collect();
            scan_page(entries, cursor, &options)
        }
        ("HSCAN", [key, cursor, options @ ..]) => {
            let options = match ScanArgs::parse(options) {
                Ok(options) => options,
                Err(reply) => return reply,
            };
            let entries = match db.keys.get(key) {
                None => Vec::new(),
                Some(Value::Hash(hash)) => hash
                    .iter()
                    .map(|(field, value)| (field.clone(), vec![field.clone(), value.clone()]))
                    .collect(),
                Some(_) => return wrong_type(),
            };
            scan_page(entries, cursor, &options)
        }
        ("SSCAN", [key, cursor, options @ ..]) => {
            let options = match ScanArgs::parse(options) {
                Ok(options) => options,
                Err(reply) => return reply,
            };
            let entries = match db.keys.get(key) {
                None => Vec::new(),
                Some(Value::Set(set)) => set
                    .iter()
                    .map(|member| (member.clone(), vec![member.clone()]))
                    .collect(),
                Some(_) => return wrong_type(),
            };
            scan_page(entries, cursor, &options)
        }
        _ => err("ERR syntax error"),
    }
}

#[derive(Default)]
struct ScanArgs {
    pattern: Option<String>,
    count: usize,
    type_: Option<String>,
}

impl ScanArgs {
    fn parse(options: &[Bytes]) -> Result<ScanArgs, Frame> {
        let mut args = ScanArgs {
            count: 10,
            ..ScanArgs::default()
        };

        for pair in options.chunks(2) {
            let [option, value] = pair else {
                return Err(err("ERR syntax error"));
            };
            let value = String::from_utf8_lossy(value).to_string();

            match String::from_utf8_lossy(option).to_uppercase().as_str() {
                "MATCH" => args.pattern = Some(value),
                "COUNT" => match value.parse() {
                    Ok(count) if count > 0 => args.count = count,
                    _ => return Err(err("ERR value is not an integer or out of range")),
                },
                "TYPE" => args.type_ = Some(value),
                _ => return Err(err("ERR syntax error")),
            }
        }

        Ok(args)
    }
}

/// The cursor is the index of the next entry in key order. MATCH filters a page after it is
/// selected, so pages may come back short or empty.
fn scan_page(entries: Vec<(Bytes, Vec<Bytes>)>, cursor: &Bytes, options: &ScanArgs) -> Frame {
    let Some(start) = std::str::from_utf8(cursor)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
    else {
        return err("ERR invalid cursor");
    };

    let start = start.min(entries.len());
    let end = (start + options.count).min(entries.len());
    let next = if end >= entries.len() { 0 } else { end };

    let items = entries[start..end]
        .iter()
        .filter(|(name, _)| match &options.pattern {
            Some(pattern) => glob_match(pattern, &String::from_utf8_lossy(name)),
            None => true,
        })
        .flat_map(|(_, items)| items.iter().cloned().map(Frame::Bulk))
        .collect();

    Frame::Array(vec![
        Frame::Bulk(Bytes::from(next.to_string())),
        Frame::Array(items),
    ])
}
