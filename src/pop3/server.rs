//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Graphgate.
//
// Graphgate is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Graphgate is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even the  implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Graphgate. If not, see <http://www.gnu.org/licenses/>.

//! The POP3 session engine.
//!
//! AUTHORIZATION binds the session to an allowlisted mailbox (USER/PASS or
//! SASL, with STLS available beforehand), at which point the engine takes
//! one listing of the mailbox's source folder and freezes it for the whole
//! session. TRANSACTION serves STAT/LIST/UIDL/RETR/TOP from that listing
//! and a per-session fetch cache; DELE and RSET only flip session-local
//! marks. All mailbox mutation happens in UPDATE, after QUIT: marked
//! messages are marked read and, when the mailbox says so, deleted. A
//! dropped connection therefore leaves the mailbox untouched.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::rc::Rc;
use std::str;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::mpsc;

use super::{syntax::Command, MailStore};
use crate::graph::client::MessageMeta;
use crate::support::{
    async_io::ServerIo,
    error::Error,
    log_prefix::LogPrefix,
    system_config::{GatewayConfig, Mailbox},
};

const MAX_LINE: usize = 1024;
const MAX_AUTH_FAILURES: u32 = 3;
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub async fn serve_pop3<S: MailStore>(
    io: ServerIo,
    config: Rc<GatewayConfig>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<Rc<SslAcceptor>>,
    store: Rc<S>,
    local_host_name: String,
) -> Result<(), Error> {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);

    let mut server = Server {
        io: BufStream::new(io),
        log_prefix,
        ssl_acceptor,
        config,
        store,
        local_host_name,
        deadline_tx,
        quit: false,
        username: None,
        auth_failures: 0,
        transaction: None,
    };

    tokio::select! {
        r = server.run() => r,
        _ = idle_timer(deadline_rx) => {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Connection idle timer expired",
            )))
        },
    }
}

struct Transaction {
    mailbox: Mailbox,
    listing: Vec<MessageMeta>,
    /// RETR/TOP cache, one fetch per message per session.
    cache: HashMap<usize, Rc<Vec<u8>>>,
    /// 0-based indices marked by DELE.
    deleted: BTreeSet<usize>,
    /// 0-based indices successfully RETRieved.
    fetched: BTreeSet<usize>,
}

struct Server<S> {
    io: BufStream<ServerIo>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<Rc<SslAcceptor>>,
    config: Rc<GatewayConfig>,
    store: Rc<S>,
    local_host_name: String,

    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,
    /// Pending USER argument (AUTHORIZATION only).
    username: Option<String>,
    auth_failures: u32,
    /// Present once the session reaches TRANSACTION.
    transaction: Option<Transaction>,
}

impl<S: MailStore> Server<S> {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_line(&format!(
            "+OK {} POP3 {} {} ready",
            self.local_host_name,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        ))
        .await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let Some(line) = self.read_line(buffer).await? else {
            self.send_line("-ERR line too long").await?;
            return Ok(());
        };

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(()) => {
                let mut debug_line = line.as_str();
                if let Some((ix, _)) = debug_line.char_indices().nth(64) {
                    debug_line = &debug_line[..ix];
                }
                warn!(
                    "{} Received bad command {debug_line:?}",
                    self.log_prefix,
                );
                self.send_line("-ERR unknown command").await?;
                return Ok(());
            },
        };

        match command {
            Command::Capa => self.cmd_capa().await,
            Command::Stls => self.cmd_stls().await,
            Command::User(name) => self.cmd_user(name).await,
            Command::Pass(password) => self.cmd_pass(password).await,
            Command::Auth(mechanism, initial) => {
                self.cmd_auth(mechanism, initial).await
            },
            Command::Stat => self.cmd_stat().await,
            Command::List(number) => self.cmd_list(number).await,
            Command::Uidl(number) => self.cmd_uidl(number).await,
            Command::Retr(number) => self.cmd_retr(number).await,
            Command::Top(number, lines) => self.cmd_top(number, lines).await,
            Command::Dele(number) => self.cmd_dele(number).await,
            Command::Rset => self.cmd_rset().await,
            Command::Noop => self.send_line("+OK").await,
            Command::Quit => self.cmd_quit().await,
        }
    }

    async fn cmd_capa(&mut self) -> Result<(), Error> {
        self.send_line("+OK capability list follows").await?;
        self.send_line("USER").await?;
        self.send_line("SASL PLAIN LOGIN").await?;
        self.send_line("UIDL").await?;
        self.send_line("TOP").await?;
        if self.ssl_acceptor.is_some() && !self.io.get_ref().is_ssl() {
            self.send_line("STLS").await?;
        }
        self.send_line(concat!(
            "IMPLEMENTATION ",
            env!("CARGO_PKG_NAME"),
            " ",
            env!("CARGO_PKG_VERSION"),
        ))
        .await?;
        self.send_line(".").await
    }

    async fn cmd_stls(&mut self) -> Result<(), Error> {
        if self.transaction.is_some() {
            return self
                .send_line("-ERR STLS only permitted before authentication")
                .await;
        }
        if self.io.get_ref().is_ssl() {
            return self.send_line("-ERR already using TLS").await;
        }
        let Some(acceptor) = self.ssl_acceptor.take() else {
            return self.send_line("-ERR TLS not configured").await;
        };

        self.send_line("+OK begin TLS negotiation").await?;
        info!("{} Start TLS handshake", self.log_prefix);
        // RFC 2595: the upgrade voids everything learned in cleartext.
        self.username = None;
        self.log_prefix.clear_user();
        self.io.get_mut().ssl_accept(&acceptor).await?;
        info!("{} TLS handshake completed", self.log_prefix);
        Ok(())
    }

    async fn cmd_user(&mut self, name: String) -> Result<(), Error> {
        if self.transaction.is_some() {
            return self.send_line("-ERR already authenticated").await;
        }
        self.username = Some(name);
        self.send_line("+OK send PASS").await
    }

    async fn cmd_pass(&mut self, password: String) -> Result<(), Error> {
        if self.transaction.is_some() {
            return self.send_line("-ERR already authenticated").await;
        }
        let Some(username) = self.username.take() else {
            return self.send_line("-ERR send USER first").await;
        };
        self.try_login(&username, &password).await
    }

    async fn cmd_auth(
        &mut self,
        mechanism: Option<String>,
        initial: Option<String>,
    ) -> Result<(), Error> {
        if self.transaction.is_some() {
            return self.send_line("-ERR already authenticated").await;
        }

        let Some(mechanism) = mechanism else {
            // Bare AUTH lists the supported mechanisms.
            self.send_line("+OK").await?;
            self.send_line("PLAIN").await?;
            self.send_line("LOGIN").await?;
            return self.send_line(".").await;
        };

        let credentials = if mechanism.eq_ignore_ascii_case("PLAIN") {
            let data = match initial {
                Some(data) => data,
                None => {
                    let Some(data) = self.sasl_challenge("").await? else {
                        return Ok(());
                    };
                    data
                },
            };
            decode_plain(&data)
        } else if mechanism.eq_ignore_ascii_case("LOGIN") {
            let username_b64 = match initial {
                Some(data) => data,
                None => {
                    // "Username:"
                    let Some(data) =
                        self.sasl_challenge("VXNlcm5hbWU6").await?
                    else {
                        return Ok(());
                    };
                    data
                },
            };
            // "Password:"
            let Some(password_b64) =
                self.sasl_challenge("UGFzc3dvcmQ6").await?
            else {
                return Ok(());
            };
            decode_b64(&username_b64)
                .zip(decode_b64(&password_b64))
        } else {
            return self.send_line("-ERR unsupported AUTH mechanism").await;
        };

        let Some((username, password)) = credentials else {
            return self.send_line("-ERR malformed AUTH exchange").await;
        };
        self.try_login(&username, &password).await
    }

    /// Send a `+ ` SASL challenge and read the continuation line.
    ///
    /// Returns `None` with a response sent if the client aborted.
    async fn sasl_challenge(
        &mut self,
        prompt: &str,
    ) -> Result<Option<String>, Error> {
        self.send_line(&format!("+ {prompt}")).await?;
        let mut buffer = Vec::new();
        let Some(line) = self.read_line(&mut buffer).await? else {
            self.send_line("-ERR line too long").await?;
            return Ok(None);
        };
        if "*" == line {
            self.send_line("-ERR AUTH aborted").await?;
            return Ok(None);
        }
        Ok(Some(line))
    }

    async fn try_login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        let Some(mailbox) =
            self.config.authenticate(username, password).cloned()
        else {
            warn!(
                "{} Rejected credentials for {username:?}",
                self.log_prefix,
            );
            self.auth_failures += 1;
            if self.auth_failures >= MAX_AUTH_FAILURES {
                self.send_line("-ERR [AUTH] too many failed attempts")
                    .await?;
                self.quit = true;
                return Ok(());
            }
            return self.send_line("-ERR [AUTH] invalid credentials").await;
        };

        // The session listing is taken once and frozen; new arrivals show
        // up on the next connection.
        let listing = match self
            .store
            .list(&mailbox.username, &mailbox.folder)
            .await
        {
            Ok(listing) => listing,
            Err(e) => {
                error!(
                    "{} Unable to list {}/{}: {e}",
                    self.log_prefix, mailbox.username, mailbox.folder,
                );
                return self
                    .send_line("-ERR [SYS/TEMP] unable to open mailbox")
                    .await;
            },
        };

        info!(
            "{} Authenticated {}; {} message(s) in {}",
            self.log_prefix,
            mailbox.username,
            listing.len(),
            mailbox.folder,
        );
        self.log_prefix.set_user(mailbox.username.clone());
        let count = listing.len();
        self.transaction = Some(Transaction {
            mailbox,
            listing,
            cache: HashMap::new(),
            deleted: BTreeSet::new(),
            fetched: BTreeSet::new(),
        });
        self.send_line(&format!("+OK mailbox locked, {count} message(s)"))
            .await
    }

    fn txn(&mut self) -> Option<&mut Transaction> {
        self.transaction.as_mut()
    }

    /// Resolve a 1-based message number to a live 0-based index.
    fn resolve(&self, number: usize) -> Option<usize> {
        let txn = self.transaction.as_ref()?;
        let idx = number.checked_sub(1)?;
        if idx < txn.listing.len() && !txn.deleted.contains(&idx) {
            Some(idx)
        } else {
            None
        }
    }

    async fn cmd_stat(&mut self) -> Result<(), Error> {
        if self.transaction.is_none() {
            return self.send_line("-ERR not authenticated").await;
        }
        let txn = self.transaction.as_ref().unwrap();
        let (count, size) = txn
            .listing
            .iter()
            .enumerate()
            .filter(|&(ix, _)| !txn.deleted.contains(&ix))
            .fold((0u64, 0u64), |(count, size), (_, m)| {
                (count + 1, size + m.size)
            });
        self.send_line(&format!("+OK {count} {size}")).await
    }

    async fn cmd_list(&mut self, number: Option<usize>) -> Result<(), Error> {
        if self.transaction.is_none() {
            return self.send_line("-ERR not authenticated").await;
        }

        if let Some(number) = number {
            let Some(idx) = self.resolve(number) else {
                return self.send_line("-ERR no such message").await;
            };
            let size = self.transaction.as_ref().unwrap().listing[idx].size;
            return self.send_line(&format!("+OK {number} {size}")).await;
        }

        let rows: Vec<String> = {
            let txn = self.transaction.as_ref().unwrap();
            txn.listing
                .iter()
                .enumerate()
                .filter(|&(ix, _)| !txn.deleted.contains(&ix))
                .map(|(ix, m)| format!("{} {}", ix + 1, m.size))
                .collect()
        };
        self.send_line(&format!("+OK {} message(s)", rows.len())).await?;
        for row in rows {
            self.send_line(&row).await?;
        }
        self.send_line(".").await
    }

    async fn cmd_uidl(&mut self, number: Option<usize>) -> Result<(), Error> {
        if self.transaction.is_none() {
            return self.send_line("-ERR not authenticated").await;
        }

        if let Some(number) = number {
            let Some(idx) = self.resolve(number) else {
                return self.send_line("-ERR no such message").await;
            };
            let id = self.transaction.as_ref().unwrap().listing[idx]
                .id
                .clone();
            return self.send_line(&format!("+OK {number} {id}")).await;
        }

        let rows: Vec<String> = {
            let txn = self.transaction.as_ref().unwrap();
            txn.listing
                .iter()
                .enumerate()
                .filter(|&(ix, _)| !txn.deleted.contains(&ix))
                .map(|(ix, m)| format!("{} {}", ix + 1, m.id))
                .collect()
        };
        self.send_line("+OK unique-id listing follows").await?;
        for row in rows {
            self.send_line(&row).await?;
        }
        self.send_line(".").await
    }

    /// Fetch (or reuse) the raw MIME for a live index.
    async fn fetch_cached(
        &mut self,
        idx: usize,
    ) -> Result<Rc<Vec<u8>>, Error> {
        let (mailbox, id, cached) = {
            let txn = self.transaction.as_ref().unwrap();
            (
                txn.mailbox.username.clone(),
                txn.listing[idx].id.clone(),
                txn.cache.get(&idx).cloned(),
            )
        };
        if let Some(raw) = cached {
            return Ok(raw);
        }

        let raw = Rc::new(self.store.fetch(&mailbox, &id).await?);
        self.txn()
            .unwrap()
            .cache
            .insert(idx, Rc::clone(&raw));
        Ok(raw)
    }

    async fn cmd_retr(&mut self, number: usize) -> Result<(), Error> {
        if self.transaction.is_none() {
            return self.send_line("-ERR not authenticated").await;
        }
        let Some(idx) = self.resolve(number) else {
            return self.send_line("-ERR no such message").await;
        };

        match self.fetch_cached(idx).await {
            Ok(raw) => {
                self.send_line("+OK message follows").await?;
                write_multiline(&mut self.io, &raw).await?;
                self.io.flush().await?;
                self.txn().unwrap().fetched.insert(idx);
                Ok(())
            },
            Err(e) => {
                error!(
                    "{} RETR {number} failed: {e}",
                    self.log_prefix,
                );
                self.send_line("-ERR [SYS/TEMP] unable to fetch message")
                    .await
            },
        }
    }

    async fn cmd_top(
        &mut self,
        number: usize,
        lines: usize,
    ) -> Result<(), Error> {
        if self.transaction.is_none() {
            return self.send_line("-ERR not authenticated").await;
        }
        let Some(idx) = self.resolve(number) else {
            return self.send_line("-ERR no such message").await;
        };

        match self.fetch_cached(idx).await {
            Ok(raw) => {
                let head = top_of_message(&raw, lines);
                self.send_line("+OK top of message follows").await?;
                write_multiline(&mut self.io, &head).await?;
                self.io.flush().await?;
                Ok(())
            },
            Err(e) => {
                error!("{} TOP {number} failed: {e}", self.log_prefix);
                self.send_line("-ERR [SYS/TEMP] unable to fetch message")
                    .await
            },
        }
    }

    async fn cmd_dele(&mut self, number: usize) -> Result<(), Error> {
        if self.transaction.is_none() {
            return self.send_line("-ERR not authenticated").await;
        }
        let Some(idx) = self.resolve(number) else {
            return self.send_line("-ERR no such message").await;
        };
        self.txn().unwrap().deleted.insert(idx);
        self.send_line(&format!("+OK message {number} deleted")).await
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        if self.transaction.is_none() {
            return self.send_line("-ERR not authenticated").await;
        }
        self.txn().unwrap().deleted.clear();
        self.send_line("+OK").await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        if let Some(txn) = self.transaction.take() {
            self.update(txn).await;
        }
        self.send_line("+OK bye").await
    }

    /// The UPDATE phase: the only place the upstream mailbox is mutated.
    ///
    /// Failures are logged but do not fail the session; the client has
    /// already committed.
    async fn update(&mut self, txn: Transaction) {
        for &idx in &txn.deleted {
            let id = &txn.listing[idx].id;
            if let Err(e) =
                self.store.mark_read(&txn.mailbox.username, id).await
            {
                warn!(
                    "{} UPDATE: mark_read {id} failed: {e}",
                    self.log_prefix,
                );
            }
            if txn.mailbox.delete_after_fetch {
                match self.store.delete(&txn.mailbox.username, id).await {
                    Ok(()) => {
                        info!("{} Deleted message {id}", self.log_prefix)
                    },
                    Err(e) => warn!(
                        "{} UPDATE: delete {id} failed: {e}",
                        self.log_prefix,
                    ),
                }
            }
        }

        if txn.mailbox.mark_read {
            for &idx in txn.fetched.difference(&txn.deleted) {
                let id = &txn.listing[idx].id;
                if let Err(e) =
                    self.store.mark_read(&txn.mailbox.username, id).await
                {
                    warn!(
                        "{} UPDATE: mark_read {id} failed: {e}",
                        self.log_prefix,
                    );
                }
            }
        }
    }

    /// Read one command line. `Ok(None)` means the line was overlong and
    /// has been consumed.
    async fn read_line(
        &mut self,
        buffer: &mut Vec<u8>,
    ) -> Result<Option<String>, Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + IDLE_TIMEOUT)
            .await;
        buffer.clear();

        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }
                return Ok(None);
            }
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached within command",
            )));
        }

        let _ = buffer.pop();
        if Some(&b'\r') == buffer.last() {
            let _ = buffer.pop();
        }

        Ok(Some(String::from_utf8_lossy(buffer).into_owned()))
    }

    async fn send_line(&mut self, line: &str) -> Result<(), Error> {
        self.io.write_all(line.as_bytes()).await?;
        self.io.write_all(b"\r\n").await?;
        // Multiline responses end with the lone dot; everything else is a
        // single line. Flushing per line is cheap at POP3 volumes except
        // in RETR, which writes the body directly.
        if !line.starts_with(|c: char| c.is_ascii_digit()) {
            self.io.flush().await?;
        }
        Ok(())
    }
}

fn decode_b64(data: &str) -> Option<String> {
    base64::decode(data)
        .ok()
        .and_then(|d| String::from_utf8(d).ok())
}

/// Decode an RFC 4616 PLAIN response into (authcid, password).
fn decode_plain(data: &str) -> Option<(String, String)> {
    let decoded = decode_b64(data)?;
    let mut parts = decoded.split('\x00');
    let (authzid, authcid, password) =
        (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    if !authzid.is_empty() && authzid != authcid {
        return None;
    }
    Some((authcid.to_owned(), password.to_owned()))
}

/// Write a multiline payload with dot stuffing and the terminating lone
/// dot, normalising line endings to CRLF.
async fn write_multiline(
    io: &mut (impl tokio::io::AsyncWrite + Unpin),
    data: &[u8],
) -> Result<(), Error> {
    let mut rest = data;
    while !rest.is_empty() {
        let (line, remainder) = match memchr::memchr(b'\n', rest) {
            Some(eol) => (&rest[..eol], &rest[eol + 1..]),
            None => (rest, &rest[rest.len()..]),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.starts_with(b".") {
            io.write_all(b".").await?;
        }
        io.write_all(line).await?;
        io.write_all(b"\r\n").await?;
        rest = remainder;
    }
    io.write_all(b".\r\n").await?;
    Ok(())
}

/// Extract the header block plus the first `lines` body lines, for TOP.
fn top_of_message(raw: &[u8], lines: usize) -> Vec<u8> {
    let mut out = Vec::<u8>::new();
    let mut rest = raw;
    let mut in_body = false;
    let mut body_lines = 0usize;

    while !rest.is_empty() {
        let (line, remainder) = match memchr::memchr(b'\n', rest) {
            Some(eol) => (&rest[..=eol], &rest[eol + 1..]),
            None => (rest, &rest[rest.len()..]),
        };

        if in_body {
            if body_lines >= lines {
                break;
            }
            body_lines += 1;
        }
        out.extend_from_slice(line);
        if !in_body {
            let trimmed = line
                .strip_suffix(b"\n")
                .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
                .unwrap_or(line);
            if trimmed.is_empty() {
                in_body = true;
            }
        }
        rest = remainder;
    }

    out
}

// Runs until either the deadline channel is closed or the current deadline
// has expired. Used to force-close idle connections.
async fn idle_timer(mut deadline_rx: mpsc::Receiver<Instant>) {
    let mut deadline = Instant::now() + Duration::from_secs(30);

    loop {
        match tokio::time::timeout_at(deadline.into(), deadline_rx.recv()).await
        {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    struct MemoryStore {
        messages: Vec<(String, Vec<u8>)>,
        marked_read: RefCell<Vec<String>>,
        deleted: RefCell<Vec<String>>,
    }

    impl MemoryStore {
        fn with_messages(messages: Vec<(&str, &[u8])>) -> Rc<Self> {
            Rc::new(Self {
                messages: messages
                    .into_iter()
                    .map(|(id, raw)| (id.to_owned(), raw.to_vec()))
                    .collect(),
                marked_read: RefCell::new(Vec::new()),
                deleted: RefCell::new(Vec::new()),
            })
        }
    }

    impl MailStore for MemoryStore {
        async fn list(
            &self,
            _mailbox: &str,
            _folder: &str,
        ) -> Result<Vec<MessageMeta>, Error> {
            Ok(self
                .messages
                .iter()
                .map(|&(ref id, ref raw)| MessageMeta {
                    id: id.clone(),
                    size: raw.len() as u64,
                })
                .collect())
        }

        async fn fetch(
            &self,
            _mailbox: &str,
            id: &str,
        ) -> Result<Vec<u8>, Error> {
            self.messages
                .iter()
                .find(|&&(ref mid, _)| mid == id)
                .map(|&(_, ref raw)| raw.clone())
                .ok_or_else(|| {
                    Error::GraphPermanent {
                        status: 404,
                        message: "gone".to_owned(),
                    }
                })
        }

        async fn mark_read(
            &self,
            _mailbox: &str,
            id: &str,
        ) -> Result<(), Error> {
            self.marked_read.borrow_mut().push(id.to_owned());
            Ok(())
        }

        async fn delete(&self, _mailbox: &str, id: &str) -> Result<(), Error> {
            self.deleted.borrow_mut().push(id.to_owned());
            Ok(())
        }
    }

    fn test_config(
        mark_read: bool,
        delete_after_fetch: bool,
    ) -> Rc<GatewayConfig> {
        let hash = argon2::hash_encoded(
            b"secret",
            b"0123456789abcdef",
            &argon2::Config::default(),
        )
        .unwrap();
        Rc::new(
            serde_json::from_value(serde_json::json!({
                "user": "admin@t.onmicrosoft.com",
                "client_id": "c",
                "tenant_id": "t",
                "pop3_port": 10110,
                "mailboxes": [{
                    "username": "alerts@t.onmicrosoft.com",
                    "password": hash,
                    "mark_read": mark_read,
                    "delete_after_fetch": delete_after_fetch,
                }],
                "queue_dir": "/tmp/q",
                "token_path": "/tmp/t.enc",
            }))
            .unwrap(),
        )
    }

    struct Session {
        client: tokio::io::DuplexStream,
        read_buffer: Vec<u8>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl Session {
        fn start(
            store: Rc<MemoryStore>,
            config: Rc<GatewayConfig>,
        ) -> Self {
            crate::init_test_log();
            let (client, server) = tokio::io::duplex(1 << 16);
            let io = ServerIo::new_duplex(server);
            let handle = tokio::task::spawn_local(async move {
                let _ = serve_pop3(
                    io,
                    config,
                    LogPrefix::new("test".to_owned()),
                    None,
                    store,
                    "gateway.test".to_owned(),
                )
                .await;
            });
            Self {
                client,
                read_buffer: Vec::new(),
                handle,
            }
        }

        async fn send(&mut self, line: &str) {
            self.client.write_all(line.as_bytes()).await.unwrap();
            self.client.write_all(b"\r\n").await.unwrap();
        }

        async fn reply(&mut self) -> String {
            loop {
                if let Some(eol) =
                    self.read_buffer.iter().position(|&b| b'\n' == b)
                {
                    let line: Vec<u8> =
                        self.read_buffer.drain(..=eol).collect();
                    return String::from_utf8(line)
                        .unwrap()
                        .trim_end()
                        .to_owned();
                }

                let mut chunk = [0u8; 1024];
                let n = self.client.read(&mut chunk).await.unwrap();
                assert!(0 != n, "connection closed while awaiting reply");
                self.read_buffer.extend_from_slice(&chunk[..n]);
            }
        }

        async fn expect(&mut self, prefix: &str) {
            let line = self.reply().await;
            assert!(
                line.starts_with(prefix),
                "expected {prefix:?}, got {line:?}",
            );
        }

        /// Read the lines of a multiline response up to the lone dot.
        async fn multiline(&mut self) -> Vec<String> {
            let mut rows = Vec::new();
            loop {
                let line = self.reply().await;
                if "." == line {
                    return rows;
                }
                rows.push(line);
            }
        }

        async fn login(&mut self) {
            self.expect("+OK").await;
            self.send("USER alerts@t.onmicrosoft.com").await;
            self.expect("+OK").await;
            self.send("PASS secret").await;
            self.expect("+OK").await;
        }
    }

    fn run_local<F: std::future::Future<Output = ()>>(f: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        tokio::task::LocalSet::new().block_on(&rt, f);
    }

    fn two_messages() -> Rc<MemoryStore> {
        MemoryStore::with_messages(vec![
            ("msg-one", b"Subject: a\r\n\r\nfirst\r\n".as_slice()),
            (
                "msg-two",
                b"Subject: b\r\n\r\n.starts with dot\r\nmore\r\n".as_slice(),
            ),
        ])
    }

    #[test]
    fn stat_list_uidl() {
        run_local(async {
            let store = two_messages();
            let mut session =
                Session::start(store, test_config(false, false));
            session.login().await;

            session.send("STAT").await;
            session.expect("+OK 2 59").await;

            session.send("LIST").await;
            session.expect("+OK").await;
            assert_eq!(
                vec!["1 21".to_owned(), "2 38".to_owned()],
                session.multiline().await,
            );

            session.send("UIDL").await;
            session.expect("+OK").await;
            assert_eq!(
                vec!["1 msg-one".to_owned(), "2 msg-two".to_owned()],
                session.multiline().await,
            );

            session.send("LIST 2").await;
            session.expect("+OK 2 38").await;
            session.send("UIDL 9").await;
            session.expect("-ERR").await;
        });
    }

    #[test]
    fn retr_streams_with_dot_stuffing() {
        run_local(async {
            let store = two_messages();
            let mut session =
                Session::start(store, test_config(false, false));
            session.login().await;

            session.send("RETR 2").await;
            session.expect("+OK").await;
            assert_eq!(
                vec![
                    "Subject: b".to_owned(),
                    String::new(),
                    // The stuffed dot is visible on the wire...
                    "..starts with dot".to_owned(),
                    "more".to_owned(),
                ],
                session.multiline().await,
            );
        });
    }

    #[test]
    fn top_returns_headers_and_n_lines() {
        run_local(async {
            let store = two_messages();
            let mut session =
                Session::start(store, test_config(false, false));
            session.login().await;

            session.send("TOP 2 1").await;
            session.expect("+OK").await;
            assert_eq!(
                vec![
                    "Subject: b".to_owned(),
                    String::new(),
                    "..starts with dot".to_owned(),
                ],
                session.multiline().await,
            );
        });
    }

    #[test]
    fn dele_applies_only_on_quit() {
        run_local(async {
            let store = two_messages();
            let mut session = Session::start(
                Rc::clone(&store),
                test_config(false, true),
            );
            session.login().await;

            session.send("DELE 1").await;
            session.expect("+OK").await;

            // Marked messages vanish from listings but keep indices
            // stable.
            session.send("STAT").await;
            session.expect("+OK 1 38").await;
            session.send("LIST").await;
            session.expect("+OK").await;
            assert_eq!(vec!["2 38".to_owned()], session.multiline().await);
            session.send("RETR 1").await;
            session.expect("-ERR").await;

            // Nothing has been touched upstream yet.
            assert!(store.deleted.borrow().is_empty());

            session.send("QUIT").await;
            session.expect("+OK").await;
            let _ = session.handle.await;

            assert_eq!(vec!["msg-one".to_owned()], *store.deleted.borrow());
            assert_eq!(
                vec!["msg-one".to_owned()],
                *store.marked_read.borrow(),
            );
        });
    }

    #[test]
    fn rset_clears_marks() {
        run_local(async {
            let store = two_messages();
            let mut session = Session::start(
                Rc::clone(&store),
                test_config(false, true),
            );
            session.login().await;

            session.send("DELE 1").await;
            session.expect("+OK").await;
            session.send("RSET").await;
            session.expect("+OK").await;
            session.send("QUIT").await;
            session.expect("+OK").await;
            let _ = session.handle.await;

            assert!(store.deleted.borrow().is_empty());
            assert!(store.marked_read.borrow().is_empty());
        });
    }

    #[test]
    fn dropped_connection_leaves_mailbox_unchanged() {
        run_local(async {
            let store = two_messages();
            let mut session = Session::start(
                Rc::clone(&store),
                test_config(true, true),
            );
            session.login().await;

            session.send("RETR 1").await;
            session.expect("+OK").await;
            let _ = session.multiline().await;
            session.send("DELE 2").await;
            session.expect("+OK").await;

            // Drop without QUIT.
            let Session { client, handle, .. } = session;
            drop(client);
            let _ = handle.await;

            assert!(store.deleted.borrow().is_empty());
            assert!(store.marked_read.borrow().is_empty());
        });
    }

    #[test]
    fn mark_read_flag_applies_to_fetched_messages() {
        run_local(async {
            let store = two_messages();
            let mut session = Session::start(
                Rc::clone(&store),
                test_config(true, false),
            );
            session.login().await;

            session.send("RETR 1").await;
            session.expect("+OK").await;
            let _ = session.multiline().await;
            session.send("QUIT").await;
            session.expect("+OK").await;
            let _ = session.handle.await;

            assert_eq!(
                vec!["msg-one".to_owned()],
                *store.marked_read.borrow(),
            );
            assert!(store.deleted.borrow().is_empty());
        });
    }

    #[test]
    fn auth_plain_and_login() {
        run_local(async {
            let store = two_messages();
            let mut session = Session::start(
                Rc::clone(&store),
                test_config(false, false),
            );
            session.expect("+OK").await;

            session.send("AUTH").await;
            session.expect("+OK").await;
            assert_eq!(
                vec!["PLAIN".to_owned(), "LOGIN".to_owned()],
                session.multiline().await,
            );

            let initial =
                base64::encode(b"\0alerts@t.onmicrosoft.com\0secret");
            session.send(&format!("AUTH PLAIN {initial}")).await;
            session.expect("+OK").await;

            session.send("STAT").await;
            session.expect("+OK 2").await;
        });
    }

    #[test]
    fn auth_login_challenges() {
        run_local(async {
            let store = two_messages();
            let mut session =
                Session::start(store, test_config(false, false));
            session.expect("+OK").await;

            session.send("AUTH LOGIN").await;
            session.expect("+ VXNlcm5hbWU6").await;
            session
                .send(&base64::encode(b"alerts@t.onmicrosoft.com"))
                .await;
            session.expect("+ UGFzc3dvcmQ6").await;
            session.send(&base64::encode(b"secret")).await;
            session.expect("+OK").await;
        });
    }

    #[test]
    fn three_auth_failures_close() {
        run_local(async {
            let store = two_messages();
            let mut session =
                Session::start(store, test_config(false, false));
            session.expect("+OK").await;

            for _ in 0..2 {
                session.send("USER alerts@t.onmicrosoft.com").await;
                session.expect("+OK").await;
                session.send("PASS wrong").await;
                session.expect("-ERR [AUTH]").await;
            }
            session.send("USER alerts@t.onmicrosoft.com").await;
            session.expect("+OK").await;
            session.send("PASS wrong").await;
            session.expect("-ERR [AUTH] too many").await;
            let _ = session.handle.await;
        });
    }

    #[test]
    fn stls_without_material() {
        run_local(async {
            let store = two_messages();
            let mut session =
                Session::start(store, test_config(false, false));
            session.expect("+OK").await;
            session.send("STLS").await;
            session.expect("-ERR TLS not configured").await;

            session.send("CAPA").await;
            session.expect("+OK").await;
            let capa = session.multiline().await;
            assert!(capa.contains(&"UIDL".to_owned()));
            assert!(capa.contains(&"TOP".to_owned()));
            assert!(!capa.iter().any(|c| "STLS" == c));
        });
    }

    #[test]
    fn commands_require_authentication() {
        run_local(async {
            let store = two_messages();
            let mut session =
                Session::start(store, test_config(false, false));
            session.expect("+OK").await;
            session.send("STAT").await;
            session.expect("-ERR not authenticated").await;
            session.send("RETR 1").await;
            session.expect("-ERR not authenticated").await;
        });
    }

    #[test]
    fn top_of_message_extraction() {
        let raw = b"H: v\r\n\r\nb1\r\nb2\r\nb3\r\n";
        assert_eq!(b"H: v\r\n\r\n".to_vec(), top_of_message(raw, 0));
        assert_eq!(b"H: v\r\n\r\nb1\r\n".to_vec(), top_of_message(raw, 1));
        assert_eq!(raw.to_vec(), top_of_message(raw, 9));
    }
}
