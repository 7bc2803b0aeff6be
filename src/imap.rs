//! Read-only IMAP provider
//!
//! Speaks just enough IMAP4rev1 over TLS for incremental ingestion: LOGIN,
//! EXAMINE, UID SEARCH, UID FETCH and LOGOUT. Messages are fetched with
//! `BODY.PEEK[]` on an EXAMINEd folder so nothing is ever flagged.
//!
//! The socket is blocking; every call runs on the blocking pool behind a
//! mutex, so concurrent fetches are serialized on the one connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use once_cell::sync::Lazy;
use regex::Regex;
use rustls::pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::MailboxConfig;
use crate::error::{Result, SyncError};
use crate::mailbox::{Delta, DeltaQuery, MailboxConnector, MailboxSession};
use crate::models::{Marker, Message, MessageSummary};

/// UIDs per summary FETCH command
const FETCH_CHUNK: usize = 200;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

static UID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bUID (\d+)").unwrap());
static INTERNALDATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"INTERNALDATE "([^"]+)""#).unwrap());
static UIDVALIDITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[UIDVALIDITY (\d+)\]").unwrap());
static BLANK_LINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static HTML_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap());
static HTML_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

fn network(e: std::io::Error) -> SyncError {
    SyncError::NetworkError(format!("IMAP I/O failed: {}", e))
}

/// One untagged server response, with any literals it carried
#[derive(Debug, Clone, Default)]
struct Response {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Tagged completion of a command
#[derive(Debug)]
struct Completion {
    ok: bool,
    message: String,
    untagged: Vec<Response>,
}

/// A protocol session over any byte stream
pub struct ImapConnection<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapConnection<S> {
    /// Wrap a connected stream and consume the server greeting
    pub fn open(stream: S) -> Result<Self> {
        let mut conn = Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        };
        let greeting = conn.read_response()?;
        if greeting.text.starts_with("* BYE") {
            return Err(SyncError::NetworkError(format!(
                "IMAP server refused connection: {}",
                greeting.text
            )));
        }
        if !greeting.text.starts_with("* OK") && !greeting.text.starts_with("* PREAUTH") {
            return Err(SyncError::ProtocolError(format!(
                "unexpected greeting: {}",
                greeting.text
            )));
        }
        Ok(conn)
    }

    fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf).map_err(network)?;
        if n == 0 {
            return Err(SyncError::NetworkError(
                "IMAP connection closed by server".to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }

    /// Read one logical response, pulling in literals by exact byte count
    fn read_response(&mut self) -> Result<Response> {
        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            let literal = literal_len(&line);
            response.text.push_str(&line);
            match literal {
                Some(len) => {
                    let mut buf = vec![0u8; len];
                    self.stream.read_exact(&mut buf).map_err(network)?;
                    response.literals.push(buf);
                }
                None => return Ok(response),
            }
        }
    }

    fn run(&mut self, command: &str) -> Result<Completion> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let verb = command.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        debug!("IMAP > {} {}", tag, verb);

        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{} {}\r\n", tag, command).as_bytes())
            .map_err(network)?;
        stream.flush().map_err(network)?;

        let prefix = format!("{} ", tag);
        let mut untagged = Vec::new();
        loop {
            let response = self.read_response()?;
            if let Some(status) = response.text.strip_prefix(&prefix) {
                let (state, message) = status.split_once(' ').unwrap_or((status, ""));
                let ok = state.eq_ignore_ascii_case("OK");
                if !ok {
                    debug!("IMAP < {} {} {}", tag, state, message);
                }
                return Ok(Completion {
                    ok,
                    message: message.to_string(),
                    untagged,
                });
            }
            if response.text.starts_with('*') {
                untagged.push(response);
            }
        }
    }

    fn run_ok(&mut self, command: &str) -> Result<Vec<Response>> {
        let completion = self.run(command)?;
        if !completion.ok {
            let verb = command.split_whitespace().next().unwrap_or(command);
            return Err(SyncError::ProtocolError(format!(
                "{} failed: {}",
                verb, completion.message
            )));
        }
        Ok(completion.untagged)
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let completion = self.run(&format!("LOGIN {} {}", quote(user), quote(password)))?;
        if !completion.ok {
            return Err(SyncError::AuthError(format!(
                "IMAP login rejected for {}: {}",
                user, completion.message
            )));
        }
        Ok(())
    }

    /// Open the folder read-only and return its UIDVALIDITY
    pub fn examine(&mut self, folder: &str) -> Result<u32> {
        let untagged = self.run_ok(&format!("EXAMINE {}", quote(folder)))?;
        untagged
            .iter()
            .find_map(|r| {
                UIDVALIDITY_RE
                    .captures(&r.text)
                    .and_then(|c| c[1].parse::<u32>().ok())
            })
            .ok_or_else(|| {
                SyncError::ProtocolError(format!("EXAMINE {} returned no UIDVALIDITY", folder))
            })
    }

    pub fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>> {
        let untagged = self.run_ok(&format!("UID SEARCH {}", criteria))?;
        let mut uids: Vec<u32> = untagged
            .iter()
            .filter_map(|r| r.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|uid| uid.parse().ok())
            .collect();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    /// UID and INTERNALDATE for each uid, ordered by uid
    pub fn fetch_summaries(&mut self, uids: &[u32]) -> Result<Vec<(u32, Option<DateTime<Utc>>)>> {
        let mut summaries = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(FETCH_CHUNK) {
            let set = chunk
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let untagged = self.run_ok(&format!("UID FETCH {} (UID INTERNALDATE)", set))?;
            for response in untagged.iter().filter(|r| r.text.contains("FETCH (")) {
                if let Some(uid) = response_uid(&response.text) {
                    summaries.push((uid, response_internal_date(&response.text)));
                }
            }
        }
        summaries.sort_by_key(|(uid, _)| *uid);
        summaries.dedup_by_key(|(uid, _)| *uid);
        Ok(summaries)
    }

    /// Raw RFC 5322 bytes and INTERNALDATE of one message, None if it is gone
    pub fn fetch_raw(&mut self, uid: u32) -> Result<Option<(Vec<u8>, Option<DateTime<Utc>>)>> {
        let untagged =
            self.run_ok(&format!("UID FETCH {} (UID INTERNALDATE BODY.PEEK[])", uid))?;
        Ok(untagged
            .into_iter()
            .filter(|r| r.text.contains("FETCH (") && response_uid(&r.text) == Some(uid))
            .find_map(|mut r| {
                let date = response_internal_date(&r.text);
                r.literals.pop().map(|raw| (raw, date))
            }))
    }

    pub fn logout(&mut self) -> Result<()> {
        // The server closes the connection after BYE; a failed read here is fine
        match self.run("LOGOUT") {
            Ok(_) | Err(SyncError::NetworkError(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Byte count of a trailing `{n}` literal marker
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].trim_end_matches('+').parse().ok()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn response_uid(text: &str) -> Option<u32> {
    UID_RE.captures(text).and_then(|c| c[1].parse().ok())
}

fn response_internal_date(text: &str) -> Option<DateTime<Utc>> {
    INTERNALDATE_RE
        .captures(text)
        .and_then(|c| parse_internal_date(&c[1]))
}

/// Parse an IMAP INTERNALDATE such as `17-Jul-1996 02:44:25 -0700`
pub fn parse_internal_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// IMAP SEARCH date, e.g. `01-Mar-2024`
pub fn search_date(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%d-%b-%Y").to_string()
}

/// Normalise line endings and collapse runs of blank lines
pub fn normalize_body(body: &str) -> String {
    let body = body.replace("\r\n", "\n");
    BLANK_LINES_RE
        .replace_all(&body, "\n\n")
        .trim()
        .to_string()
}

fn strip_html(html: &str) -> String {
    let without_blocks = HTML_BLOCK_RE.replace_all(html, "");
    let text = HTML_TAG_RE.replace_all(&without_blocks, "");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Build a [`Message`] from raw RFC 5322 bytes
pub fn parse_message(
    marker: Marker,
    raw: &[u8],
    internal_date: Option<DateTime<Utc>>,
) -> Result<Message> {
    let parsed = MessageParser::default().parse(raw).ok_or_else(|| {
        SyncError::InvalidMessageFormat(format!("message {} is not valid RFC 5322", marker))
    })?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .map(|addr| match (addr.name(), addr.address()) {
            (Some(name), Some(address)) if !name.trim().is_empty() => {
                format!("{} <{}>", name.trim(), address)
            }
            (_, Some(address)) => address.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        })
        .unwrap_or_default();

    let subject = parsed.subject().unwrap_or("(no subject)").trim().to_string();

    let received_at = internal_date
        .or_else(|| {
            parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        })
        .unwrap_or_else(Utc::now);

    let body = match parsed.body_text(0) {
        Some(text) => text.to_string(),
        None => parsed
            .body_html(0)
            .map(|html| strip_html(&html))
            .unwrap_or_default(),
    };

    let id = Message::fingerprint(parsed.message_id(), &sender, &subject, &received_at);

    Ok(Message {
        marker,
        id,
        sender,
        subject,
        body: normalize_body(&body),
        received_at,
    })
}

/// Opens a fresh byte stream to the server
pub type Dialer<S> = Arc<dyn Fn() -> Result<S> + Send + Sync>;

/// Login and folder used for every (re)connection
pub struct Credentials {
    pub user: String,
    pub password: SecretString,
    pub folder: String,
}

/// Greeting, LOGIN and EXAMINE on a freshly dialed stream
fn handshake<S: Read + Write>(stream: S, credentials: &Credentials) -> Result<(ImapConnection<S>, u32)> {
    let mut conn = ImapConnection::open(stream)?;
    conn.login(&credentials.user, credentials.password.expose_secret())?;
    let uid_validity = conn.examine(&credentials.folder)?;
    Ok((conn, uid_validity))
}

/// An examined folder
///
/// A connection that failed with an I/O error is dropped, since its read
/// buffer may hold half a response. The next command dials again and
/// re-EXAMINEs the folder, provided UIDVALIDITY has not changed meanwhile.
pub struct ImapSession<S: Read + Write + Send + 'static> {
    conn: Arc<Mutex<Option<ImapConnection<S>>>>,
    dialer: Dialer<S>,
    credentials: Arc<Credentials>,
    uid_validity: u32,
}

impl<S: Read + Write + Send + 'static> ImapSession<S> {
    pub fn establish(dialer: Dialer<S>, credentials: Credentials) -> Result<Self> {
        let (conn, uid_validity) = handshake(dialer()?, &credentials)?;
        info!("Examined {} (UIDVALIDITY {})", credentials.folder, uid_validity);
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            dialer,
            credentials: Arc::new(credentials),
            uid_validity,
        })
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapConnection<S>) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let dialer = Arc::clone(&self.dialer);
        let credentials = Arc::clone(&self.credentials);
        let uid_validity = self.uid_validity;

        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| SyncError::ProtocolError("IMAP connection poisoned".to_string()))?;

            let mut active = match guard.take() {
                Some(active) => active,
                None => {
                    warn!("IMAP connection lost, reconnecting");
                    let (fresh, current) = handshake(dialer()?, &credentials)?;
                    if current != uid_validity {
                        return Err(SyncError::ProtocolError(format!(
                            "UIDVALIDITY changed from {} to {} during the session",
                            uid_validity, current
                        )));
                    }
                    fresh
                }
            };

            let result = f(&mut active);
            match &result {
                Err(SyncError::NetworkError(e)) => debug!("Dropping IMAP connection: {}", e),
                _ => *guard = Some(active),
            }
            result
        })
        .await
        .map_err(|e| SyncError::Unknown(format!("IMAP task failed: {}", e)))?
    }
}

#[async_trait]
impl<S: Read + Write + Send + 'static> MailboxSession for ImapSession<S> {
    async fn list_since(&self, query: &DeltaQuery) -> Result<Delta> {
        let uid_validity = self.uid_validity;
        let (criteria, floor) = match query {
            DeltaQuery::After(Some(marker)) if marker.uid_validity != uid_validity => {
                // Marker belongs to an old epoch; its uids mean nothing here
                warn!(
                    "UIDVALIDITY changed from {} to {}",
                    marker.uid_validity, uid_validity
                );
                return Ok(Delta {
                    uid_validity,
                    messages: Vec::new(),
                });
            }
            DeltaQuery::After(Some(marker)) => match marker.uid.checked_add(1) {
                Some(next) => (format!("UID {}:*", next), Some(marker.uid)),
                None => {
                    return Ok(Delta {
                        uid_validity,
                        messages: Vec::new(),
                    })
                }
            },
            DeltaQuery::After(None) => ("ALL".to_string(), None),
            DeltaQuery::Since(since) => (format!("SINCE {}", search_date(since)), None),
        };

        let summaries = self
            .with_conn(move |conn| {
                let mut uids = conn.uid_search(&criteria)?;
                // `n:*` always matches the newest message, even when its uid is <= n
                if let Some(floor) = floor {
                    uids.retain(|uid| *uid > floor);
                }
                if uids.is_empty() {
                    return Ok(Vec::new());
                }
                conn.fetch_summaries(&uids)
            })
            .await?;

        let messages = summaries
            .into_iter()
            .map(|(uid, date)| MessageSummary {
                marker: Marker::new(uid_validity, uid),
                received_at: date.unwrap_or_else(Utc::now),
            })
            .collect();

        Ok(Delta {
            uid_validity,
            messages,
        })
    }

    async fn fetch(&self, marker: Marker) -> Result<Message> {
        if marker.uid_validity != self.uid_validity {
            return Err(SyncError::MessageNotFound(format!(
                "{} is from another UIDVALIDITY epoch",
                marker
            )));
        }

        let fetched = self
            .with_conn(move |conn| conn.fetch_raw(marker.uid))
            .await?;
        let (raw, internal_date) = fetched
            .ok_or_else(|| SyncError::MessageNotFound(format!("uid {}", marker)))?;

        debug!("Fetched {} ({} bytes)", marker, raw.len());
        parse_message(marker, &raw, internal_date)
    }

    async fn logout(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let active = conn.lock().ok().and_then(|mut guard| guard.take());
            match active {
                Some(mut active) => active.logout(),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| SyncError::Unknown(format!("IMAP task failed: {}", e)))?
    }
}

/// Connects to the configured server over TLS
pub struct ImapConnector {
    config: MailboxConfig,
    password: SecretString,
}

impl ImapConnector {
    pub fn new(config: MailboxConfig, password: SecretString) -> Self {
        Self { config, password }
    }
}

/// Process-wide rustls provider, falling back to the platform default
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    if let Some(provider) = rustls::crypto::CryptoProvider::get_default() {
        return Arc::clone(provider);
    }

    #[cfg(not(windows))]
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(windows)]
    let provider = rustls::crypto::ring::default_provider();

    Arc::new(provider)
}

fn connect_tls(config: &MailboxConfig) -> Result<TlsStream> {
    let host = config.imap_server.as_str();
    let addrs = (host, config.imap_port)
        .to_socket_addrs()
        .map_err(|e| SyncError::NetworkError(format!("cannot resolve {}: {}", host, e)))?;

    let mut last_error = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let tcp = tcp.ok_or_else(|| {
        SyncError::NetworkError(format!(
            "cannot connect to {}:{}: {}",
            host,
            config.imap_port,
            last_error.map_or_else(|| "no addresses".to_string(), |e| e.to_string())
        ))
    })?;
    tcp.set_read_timeout(Some(config.io_timeout())).map_err(network)?;
    tcp.set_write_timeout(Some(config.io_timeout())).map_err(network)?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| SyncError::NetworkError(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| SyncError::ConfigError(format!("invalid IMAP server name {}: {}", host, e)))?;
    let conn = rustls::ClientConnection::new(Arc::new(tls_config), server_name)
        .map_err(|e| SyncError::NetworkError(format!("TLS setup failed: {}", e)))?;

    Ok(rustls::StreamOwned::new(conn, tcp))
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>> {
        let config = self.config.clone();
        let credentials = Credentials {
            user: config.address.clone(),
            password: SecretString::from(self.password.expose_secret().to_string()),
            folder: config.folder.clone(),
        };

        info!(
            "Connecting to {}:{} as {}",
            config.imap_server, config.imap_port, config.address
        );
        let session = tokio::time::timeout(
            config.connect_timeout() + config.io_timeout(),
            tokio::task::spawn_blocking(move || {
                let dialer: Dialer<TlsStream> = Arc::new(move || connect_tls(&config));
                ImapSession::establish(dialer, credentials)
            }),
        )
        .await
        .map_err(|_| SyncError::NetworkError("IMAP connect timed out".to_string()))?
        .map_err(|e| SyncError::Unknown(format!("IMAP connect task failed: {}", e)))??;

        Ok(Box::new(session))
    }
}
