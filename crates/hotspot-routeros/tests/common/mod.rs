// In-process RouterOS API server for integration tests.
//
// Understands `/login`, `<menu>/print` with `?key=value` filters, `add`,
// `set` and `remove`. Tables are plain attribute maps keyed by menu path.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hotspot_routeros::protocol::{read_sentence, write_sentence};
use hotspot_routeros::{PoolConfig, RouterCredentials, RouterOsClient, RouterOsPool, TransportConfig};
use secrecy::SecretString;
use tokio::net::TcpListener;

pub const PASSWORD: &str = "s3cret";
pub const MANAGED_PREFIX: &str = "authorized";

#[derive(Default)]
pub struct FakeState {
    pub tables: HashMap<String, Vec<BTreeMap<String, String>>>,
    pub commands: Vec<String>,
    pub logins: usize,
    next_id: u32,
}

#[derive(Clone)]
pub struct FakeRouter {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeRouter {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(FakeState::default()));
        state.lock().unwrap().tables.insert(
            "/system/identity".into(),
            vec![BTreeMap::from([("name".to_owned(), "hs-gw".to_owned())])],
        );

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    while let Ok(words) = read_sentence(&mut stream).await {
                        if words.is_empty() {
                            continue;
                        }
                        let replies = respond(&state, &words);
                        for reply in replies {
                            if write_sentence(&mut stream, &reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self { addr, state }
    }

    pub fn seed(&self, menu: &str, attrs: &[(&str, &str)]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("*{:X}", state.next_id);
        let mut row: BTreeMap<String, String> = attrs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        row.insert(".id".into(), id.clone());
        state.tables.entry(menu.to_owned()).or_default().push(row);
        id
    }

    pub fn rows(&self, menu: &str) -> Vec<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(menu)
            .cloned()
            .unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(
            TransportConfig {
                host: self.addr.ip().to_string(),
                port: Some(self.addr.port()),
                ..TransportConfig::default()
            },
            RouterCredentials {
                username: "api".into(),
                password: SecretString::from(PASSWORD.to_owned()),
            },
        )
    }

    pub fn client(&self) -> RouterOsClient {
        RouterOsClient::new(Arc::new(RouterOsPool::new(self.pool_config())), MANAGED_PREFIX)
    }
}

fn trap(message: &str) -> Vec<Vec<String>> {
    vec![
        vec!["!trap".into(), format!("=message={message}")],
        vec!["!done".into()],
    ]
}

fn respond(state: &Mutex<FakeState>, words: &[String]) -> Vec<Vec<String>> {
    let mut state = state.lock().unwrap();
    let path = words[0].clone();
    state.commands.push(path.clone());

    let mut attrs = BTreeMap::new();
    let mut queries = Vec::new();
    for word in &words[1..] {
        if let Some(rest) = word.strip_prefix('=') {
            let (k, v) = rest.split_once('=').unwrap_or((rest, ""));
            attrs.insert(k.to_owned(), v.to_owned());
        } else if let Some(rest) = word.strip_prefix('?') {
            let (k, v) = rest.split_once('=').unwrap_or((rest, ""));
            queries.push((k.to_owned(), v.to_owned()));
        }
    }

    if path == "/login" {
        state.logins += 1;
        return if attrs.get("password").map(String::as_str) == Some(PASSWORD) {
            vec![vec!["!done".into()]]
        } else {
            trap("invalid user name or password (6)")
        };
    }

    let Some((menu, action)) = path.rsplit_once('/') else {
        return trap("no such command");
    };
    let menu = menu.to_owned();

    match action {
        "print" => {
            let rows = state.tables.get(&menu).cloned().unwrap_or_default();
            let mut out: Vec<Vec<String>> = rows
                .into_iter()
                .filter(|row| {
                    queries
                        .iter()
                        .all(|(k, v)| row.get(k).map(String::as_str) == Some(v.as_str()))
                })
                .map(|row| {
                    let mut sentence = vec!["!re".to_owned()];
                    sentence.extend(row.iter().map(|(k, v)| format!("={k}={v}")));
                    sentence
                })
                .collect();
            out.push(vec!["!done".into()]);
            out
        }
        "add" => {
            state.next_id += 1;
            let id = format!("*{:X}", state.next_id);
            let mut row = attrs;
            row.insert(".id".into(), id.clone());
            state.tables.entry(menu).or_default().push(row);
            vec![vec!["!done".into(), format!("=ret={id}")]]
        }
        "set" => {
            let Some(id) = attrs.remove(".id") else {
                return trap("missing .id");
            };
            let table = state.tables.entry(menu).or_default();
            match table.iter_mut().find(|r| r.get(".id") == Some(&id)) {
                Some(row) => {
                    row.extend(attrs);
                    vec![vec!["!done".into()]]
                }
                None => trap("no such item"),
            }
        }
        "remove" => {
            let Some(id) = attrs.get(".id").cloned() else {
                return trap("missing .id");
            };
            let table = state.tables.entry(menu).or_default();
            let before = table.len();
            table.retain(|r| r.get(".id") != Some(&id));
            if table.len() == before {
                trap("no such item")
            } else {
                vec![vec!["!done".into()]]
            }
        }
        _ => trap("no such command"),
    }
}
