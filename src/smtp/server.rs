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

//! The protocol half of the SMTP session engine: line discipline, reply
//! formatting, the command state machine, AUTH exchanges, STARTTLS, and
//! the DATA body reader. All policy decisions live on the other side of
//! the bridge in the submission service.

use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::str;
use std::task;
use std::time::{Duration, Instant};

use log::{info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufStream, DuplexStream,
};
use tokio::sync::{mpsc, oneshot};

use super::{bridge::*, codes::*, syntax::*};
use crate::support::{
    async_io::ServerIo, error::Error, log_prefix::LogPrefix,
};

pub(super) struct Service {
    /// Ceiling on the size of a message accepted over DATA.
    pub(super) max_message_size: u64,
    pub(super) send_request: mpsc::Sender<Request>,
}

struct Server {
    io: BufStream<ServerIo>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<Rc<SslAcceptor>>,
    service: Service,
    local_host_name: String,

    ineffective_commands: u32,
    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,
    has_helo: bool,
    has_auth: bool,
    auth_failures: u32,
    has_mail_from: bool,
    recipients: u32,
}

pub(super) async fn run(
    io: ServerIo,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<Rc<SslAcceptor>>,
    service: Service,
    local_host_name: String,
) -> Result<(), Error> {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);

    let mut server = Server {
        io: BufStream::new(io),
        log_prefix,
        ssl_acceptor,
        service,
        local_host_name,

        ineffective_commands: 0,
        deadline_tx,
        quit: false,
        has_helo: false,
        has_auth: false,
        auth_failures: 0,
        has_mail_from: false,
        recipients: 0,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

macro_rules! require {
    ($this:expr, $($fns:ident = $arg:expr),*) => {
        $(if let Some(r) = $this.$fns($arg).await { return r; })*
    };
}

const MAX_LINE: usize = 1024;
/// RFC 5321 line cap within DATA: 998 octets plus CRLF.
const MAX_DATA_LINE: u64 = 1000;
const MAX_AUTH_FAILURES: u32 = 3;
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DATA_TIMEOUT: Duration = Duration::from_secs(10 * 60);

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_greeting().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
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
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::OtherProtocolStatus)),
                    Cow::Borrowed("Command line too long"),
                )
                .await?;

                // Skip the rest of the line
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        self.ineffective_commands += 1;
        if self.ineffective_commands > 30 {
            warn!(
                "{} Terminating connection after too many non-mail commands",
                self.log_prefix,
            );
            self.send_response(
                Final,
                pc::ServiceClosing,
                None,
                Cow::Borrowed("Too many commands issued without sending mail"),
            )
            .await?;
            self.quit = true;
            return Ok(());
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let command_line = &buffer[..buffer.len() - line_ending_len];
        if command_line.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        let command_line = match str::from_utf8(command_line) {
            Ok(s) => s,
            Err(_) => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::OtherProtocolStatus)),
                    Cow::Borrowed("Malformed UTF-8"),
                )
                .await?;
                return Ok(());
            },
        };

        let command = match command_line.parse::<Command>() {
            Ok(c) => c,
            Err(_) => {
                let mut debug_line = command_line;
                if let Some((truncate_len, _)) =
                    debug_line.char_indices().nth(64)
                {
                    debug_line = &debug_line[..truncate_len];
                }

                warn!(
                    "{} Received bad command {debug_line:?}",
                    self.log_prefix
                );

                if looks_like_known_command(command_line) {
                    self.send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommandArguments)),
                        Cow::Borrowed("Unknown command syntax"),
                    )
                    .await?;
                } else {
                    self.send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommand)),
                        Cow::Borrowed("Unrecognised command"),
                    )
                    .await?;
                }

                return Ok(());
            },
        };

        match command {
            Command::Helo(command, origin) => {
                self.cmd_helo(command, origin).await
            },
            Command::Auth(mechanism, data) => {
                self.cmd_auth(mechanism, data).await
            },
            Command::MailFrom(email, size, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_mail_from(email, size).await
            },
            Command::Recipient(email, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_recipient(email).await
            },
            Command::Data => self.cmd_data().await,
            Command::Reset => self.cmd_reset().await,
            Command::Verify => self.cmd_verify().await,
            Command::Expand => self.cmd_expand().await,
            Command::Help => self.cmd_help().await,
            Command::Noop => self.cmd_noop().await,
            Command::Quit => self.cmd_quit().await,
            Command::StartTls => self.cmd_start_tls().await,
            Command::Http => {
                warn!(
                    "{} Remote is speaking HTTP, closing connection",
                    self.log_prefix,
                );
                self.quit = true;
                Ok(())
            },
        }
    }

    async fn cmd_helo(
        &mut self,
        command: String,
        origin: String,
    ) -> Result<(), Error> {
        let extended = !"HELO".eq_ignore_ascii_case(&command);
        info!("{} SMTP {command} from {origin}", self.log_prefix);

        if !self
            .service_request(RequestPayload::Helo(HeloRequest {
                command,
                host: origin.clone(),
                tls: self.io.get_ref().ssl_string(),
            }))
            .await?
        {
            return Ok(());
        }

        self.send_response(
            Delayable.or_final(!extended),
            pc::Ok,
            None,
            Cow::Owned(format!(
                "{} salutations, {}",
                self.local_host_name, origin
            )),
        )
        .await?;
        self.has_helo = true;

        if extended {
            let mut extensions = vec![
                Cow::Borrowed("8BITMIME"),
                Cow::Borrowed("AUTH PLAIN LOGIN"),
                Cow::Borrowed("ENHANCEDSTATUSCODES"),
                Cow::Borrowed("PIPELINING"),
                Cow::Owned(format!(
                    "SIZE {}",
                    self.service.max_message_size
                )),
                Cow::Borrowed("SMTPUTF8"),
            ];
            // RFC 3207 requires not offering STARTTLS after TLS has been
            // negotiated.
            if self.ssl_acceptor.is_some() && !self.io.get_ref().is_ssl() {
                extensions.push(Cow::Borrowed("STARTTLS"));
            }
            extensions.push(Cow::Borrowed("HELP"));

            let last = extensions.len() - 1;
            for (ix, ext) in extensions.into_iter().enumerate() {
                self.send_response(
                    Delayable.or_final(ix == last),
                    pc::Ok,
                    None,
                    ext,
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        data: Option<String>,
    ) -> Result<(), Error> {
        require!(self, need_helo = true, need_mail_from = false);

        if self.has_auth {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    None,
                    Cow::Borrowed("Already authenticated"),
                )
                .await;
        }

        let credentials = if mechanism.eq_ignore_ascii_case("PLAIN") {
            self.auth_plain(data).await?
        } else if mechanism.eq_ignore_ascii_case("LOGIN") {
            self.auth_login(data).await?
        } else {
            warn!(
                "{} Rejected attempt to auth with method {mechanism:?}",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    pc::CommandParameterNotImplemented,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("Unsupported AUTH mechanism"),
                )
                .await;
        };

        let Some((username, password)) = credentials else {
            // A response describing the failed exchange has been sent.
            return Ok(());
        };

        if self
            .service_request(RequestPayload::Auth(AuthRequest {
                username,
                password,
            }))
            .await?
        {
            self.has_auth = true;
            self.auth_failures = 0;

            self.send_response(
                Final,
                pc::AuthenticationSucceeded,
                Some((cc::Success, sc::OtherSecurity)),
                Cow::Borrowed("OK"),
            )
            .await?;
        } else {
            self.auth_failures += 1;
            if self.auth_failures >= MAX_AUTH_FAILURES {
                warn!(
                    "{} Closing connection after {} failed AUTH attempts",
                    self.log_prefix, self.auth_failures,
                );
                self.send_response(
                    Final,
                    pc::ServiceNotAvailableClosing,
                    Some((cc::TempFail, sc::OtherSecurity)),
                    Cow::Borrowed("Too many authentication failures"),
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Run the RFC 4954 PLAIN exchange, returning the decoded credentials
    /// or `None` if a response has already been sent.
    async fn auth_plain(
        &mut self,
        data: Option<String>,
    ) -> Result<Option<(String, String)>, Error> {
        let data = match data {
            Some(data) if data != "=" => data,
            _ => {
                let Some(data) = self.auth_challenge("").await? else {
                    return Ok(None);
                };
                data
            },
        };

        let Some(decoded) = base64::decode(&data)
            .ok()
            .and_then(|d| String::from_utf8(d).ok())
        else {
            self.send_response(
                Final,
                pc::CommandSyntaxError,
                Some((cc::PermFail, sc::SyntaxError)),
                Cow::Borrowed("Invalid base64"),
            )
            .await?;
            return Ok(None);
        };

        // RFC 4616: <authzid>NUL<authcid>NUL<password>, authzid optional
        // if it matches authcid.
        let mut parts = decoded.split('\x00');
        let (Some(authorise), Some(authenticate), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            self.send_response(
                Final,
                pc::CommandSyntaxError,
                Some((cc::PermFail, sc::SyntaxError)),
                Cow::Borrowed("Invalid auth syntax"),
            )
            .await?;
            return Ok(None);
        };

        if !authorise.is_empty() && authorise != authenticate {
            self.send_response(
                Final,
                pc::AuthenticationCredentialsInvalid,
                Some((cc::PermFail, sc::AuthenticationCredentialsInvalid)),
                Cow::Borrowed("authorise-id must match authenticate-id"),
            )
            .await?;
            return Ok(None);
        }

        Ok(Some((authenticate.to_owned(), password.to_owned())))
    }

    /// Run the AUTH LOGIN challenge sequence.
    async fn auth_login(
        &mut self,
        data: Option<String>,
    ) -> Result<Option<(String, String)>, Error> {
        let username_b64 = match data {
            Some(data) => data,
            None => {
                // "Username:"
                let Some(data) =
                    self.auth_challenge("VXNlcm5hbWU6").await?
                else {
                    return Ok(None);
                };
                data
            },
        };
        // "Password:"
        let Some(password_b64) = self.auth_challenge("UGFzc3dvcmQ6").await?
        else {
            return Ok(None);
        };

        let decoded = (
            base64::decode(&username_b64)
                .ok()
                .and_then(|d| String::from_utf8(d).ok()),
            base64::decode(&password_b64)
                .ok()
                .and_then(|d| String::from_utf8(d).ok()),
        );
        let (Some(username), Some(password)) = decoded else {
            self.send_response(
                Final,
                pc::CommandSyntaxError,
                Some((cc::PermFail, sc::SyntaxError)),
                Cow::Borrowed("Invalid base64"),
            )
            .await?;
            return Ok(None);
        };

        Ok(Some((username, password)))
    }

    /// Send a 334 challenge and read the client's continuation line.
    ///
    /// Returns `None` (with a response sent) if the client aborted the
    /// exchange or sent an overlong line.
    async fn auth_challenge(
        &mut self,
        prompt: &str,
    ) -> Result<Option<String>, Error> {
        self.send_response(
            Final,
            pc::ServerChallenge,
            None,
            Cow::Borrowed(prompt),
        )
        .await?;

        let mut buffer = Vec::new();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut buffer)
            .await?;

        if !buffer.ends_with(b"\n") {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                Some((cc::PermFail, sc::SyntaxError)),
                Cow::Borrowed("Authentication line too long"),
            )
            .await?;
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "Authentication line too long",
            )));
        }

        let _ = buffer.pop();
        if Some(&b'\r') == buffer.last() {
            let _ = buffer.pop();
        }

        let line = String::from_utf8_lossy(&buffer).into_owned();
        if "*" == line {
            self.send_response(
                Final,
                pc::ParameterSyntaxError,
                None,
                Cow::Borrowed("SASL aborted"),
            )
            .await?;
            return Ok(None);
        }

        Ok(Some(line))
    }

    async fn cmd_mail_from(
        &mut self,
        return_path: String,
        approx_size: Option<u64>,
    ) -> Result<(), Error> {
        require!(self, need_helo = true, need_mail_from = false);
        if !self.has_auth {
            return self
                .send_response(
                    Final,
                    pc::AuthenticationRequired,
                    Some((cc::PermFail, sc::OtherSecurity)),
                    Cow::Borrowed("Authentication required"),
                )
                .await;
        }

        if approx_size.unwrap_or(0) > self.service.max_message_size {
            return self
                .send_response(
                    Final,
                    pc::ExceededStorageAllocation,
                    Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
                    Cow::Owned(format!(
                        "Maximum message size is {} bytes",
                        self.service.max_message_size,
                    )),
                )
                .await;
        }

        if !self
            .service_request(RequestPayload::Mail(MailRequest {
                from: return_path,
            }))
            .await?
        {
            return Ok(());
        }

        info!("{} Start mail transaction", self.log_prefix);
        self.ineffective_commands = 0;
        self.has_mail_from = true;
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_recipient(
        &mut self,
        forward_path: String,
    ) -> Result<(), Error> {
        require!(self, need_helo = true, need_mail_from = true);

        if !self
            .service_request(RequestPayload::Recipient(RecipientRequest {
                to: forward_path,
            }))
            .await?
        {
            return Ok(());
        }

        self.ineffective_commands = 0;
        self.recipients += 1;
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::DestinationAddressValid)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        require!(
            self,
            need_helo = true,
            need_mail_from = true,
            need_recipients = true
        );

        let (data_in, data_out) = tokio::io::duplex(4096);
        let (result_tx, result_rx) = oneshot::channel();
        if !self
            .service_request(RequestPayload::Data(DataRequest {
                data: data_in,
                result: result_rx,
            }))
            .await?
        {
            return Ok(());
        }

        self.ineffective_commands = 0;
        self.send_response(
            Final,
            pc::StartMailInput,
            None,
            Cow::Borrowed("Go ahead"),
        )
        .await?;

        info!("{} Begin data transfer", self.log_prefix);
        let _ = self
            .deadline_tx
            .send(Instant::now() + DATA_TIMEOUT)
            .await;

        let mut data_out = DiscardOnError(data_out);
        let status = copy_data_body(
            &mut data_out,
            &mut self.io,
            self.service.max_message_size,
        )
        .await?;
        drop(data_out);

        self.has_mail_from = false;
        self.recipients = 0;

        match status {
            DataBody::Complete { size } => {
                info!(
                    "{} Data transfer complete ({size} bytes)",
                    self.log_prefix,
                );
                let (response_tx, response_rx) = oneshot::channel();
                let response = if result_tx.send(response_tx).is_ok() {
                    response_rx.await.ok()
                } else {
                    None
                };

                match response {
                    Some(Ok(())) => {
                        self.send_response(
                            Final,
                            pc::Ok,
                            Some((cc::Success, sc::Undefined)),
                            Cow::Borrowed("OK"),
                        )
                        .await
                    },
                    Some(Err(response)) => {
                        self.send_response(
                            Final,
                            response.0,
                            response.1,
                            response.2,
                        )
                        .await
                    },
                    None => {
                        self.send_response(
                            Final,
                            pc::ServiceNotAvailableClosing,
                            Some((cc::TempFail, sc::OtherMailSystem)),
                            Cow::Borrowed("Internal server error"),
                        )
                        .await
                    },
                }
            },
            DataBody::TooBig => {
                drop(result_tx);
                warn!("{} Message data over size limit", self.log_prefix);
                self.send_response(
                    Final,
                    pc::ExceededStorageAllocation,
                    Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
                    Cow::Owned(format!(
                        "Maximum message size is {} bytes",
                        self.service.max_message_size,
                    )),
                )
                .await
            },
            DataBody::TooLong => {
                drop(result_tx);
                warn!("{} Overlong line in message data", self.log_prefix);
                self.send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::OtherProtocolStatus)),
                    Cow::Borrowed("Line too long in message data"),
                )
                .await
            },
        }
    }

    async fn cmd_reset(&mut self) -> Result<(), Error> {
        self.has_mail_from = false;
        self.recipients = 0;
        if self.service_request(RequestPayload::Reset).await? {
            self.send_response(
                Final,
                pc::Ok,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("OK"),
            )
            .await?;
        }

        Ok(())
    }

    async fn cmd_verify(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::CannotVerify,
            Some((cc::Success, sc::OtherSecurity)),
            Cow::Borrowed("VRFY not supported"),
        )
        .await
    }

    async fn cmd_expand(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::CommandNotImplemented,
            Some((cc::PermFail, sc::InvalidCommand)),
            Cow::Borrowed("There are no mailing lists here"),
        )
        .await
    }

    async fn cmd_help(&mut self) -> Result<(), Error> {
        self.send_response(
            Delayable,
            pc::SystemStatus,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("This is a mail gateway for a Microsoft 365 tenant."),
        )
        .await?;
        self.send_response(
            Final,
            pc::SystemStatus,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("End of HELP"),
        )
        .await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let _ = self
            .send_response(
                Final,
                pc::ServiceClosing,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("Bye"),
            )
            .await;
        Ok(())
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        require!(
            self,
            need_helo = true,
            need_tls = false,
            need_mail_from = false
        );

        if self.ssl_acceptor.is_none() {
            self.send_response(
                Final,
                pc::TlsNotAvailable,
                None,
                Cow::Borrowed("TLS not configured"),
            )
            .await?;
            return Ok(());
        }

        self.send_response(
            Final,
            pc::ServiceReady,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("Switching to TLS"),
        )
        .await?;

        info!("{} Start TLS handshake", self.log_prefix);

        // RFC 3207: the upgrade resets all protocol state, and a fresh
        // EHLO and AUTH are required.
        self.has_helo = false;
        self.has_auth = false;
        self.log_prefix.clear_user();
        self.io
            .get_mut()
            .ssl_accept(&self.ssl_acceptor.take().unwrap())
            .await?;

        info!("{} TLS handshake completed", self.log_prefix);

        Ok(())
    }

    async fn need_helo(&mut self, present: bool) -> Option<Result<(), Error>> {
        self.check_need(
            self.has_helo,
            present,
            "Already got HELO",
            "Still waiting for HELO",
        )
        .await
    }

    async fn need_mail_from(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.has_mail_from,
            present,
            "Already got MAIL FROM",
            "Still waiting for MAIL FROM",
        )
        .await
    }

    async fn need_recipients(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.recipients > 0,
            present,
            "Already have recipients",
            "No recipients",
        )
        .await
    }

    async fn need_tls(&mut self, present: bool) -> Option<Result<(), Error>> {
        self.check_need(
            self.io.get_ref().is_ssl(),
            present,
            "Already using TLS",
            "Not using TLS",
        )
        .await
    }

    async fn check_need(
        &mut self,
        current_status: bool,
        desired_status: bool,
        message_if_already_present: &str,
        message_if_missing: &str,
    ) -> Option<Result<(), Error>> {
        if current_status != desired_status {
            Some(
                self.send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed(if current_status {
                        message_if_already_present
                    } else {
                        message_if_missing
                    }),
                )
                .await,
            )
        } else {
            None
        }
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::ServiceReady,
            None,
            Cow::Owned(format!(
                "{} {} {} {} ready",
                self.local_host_name,
                if self.io.get_ref().is_ssl() {
                    "ESMTPS"
                } else {
                    "ESMTP"
                },
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            )),
        )
        .await
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        primary_code: PrimaryCode,
        secondary_code: Option<(ClassCode, SubjectCode)>,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        if primary_code == pc::ServiceClosing
            || primary_code == pc::ServiceNotAvailableClosing
        {
            self.quit = true;
        }

        let mut s = String::new();
        let _ = write!(s, "{}{}", primary_code as u16, kind.indicator());
        if let Some((class, subject)) = secondary_code {
            let subject = subject as u16;
            let _ = write!(
                s,
                "{}.{}.{} ",
                class as u8,
                subject / 10,
                subject % 10
            );
        }

        let _ = write!(s, "{}\r\n", quip);

        self.io.write_all(s.as_bytes()).await?;
        match kind {
            Final => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }

    /// Send `payload` as a request to the service, and wait for the
    /// service's response.
    ///
    /// If an error occurs or the service rejects the request, the response
    /// produced by the service is sent and `false` is returned. Otherwise,
    /// nothing is sent to the client and `true` is returned.
    async fn service_request(
        &mut self,
        payload: RequestPayload,
    ) -> Result<bool, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .service
            .send_request
            .send(Request {
                payload,
                respond: response_tx,
            })
            .await
            .is_err()
        {
            return self.service_worker_vanished().await;
        }

        let Ok(result) = response_rx.await else {
            return self.service_worker_vanished().await;
        };

        if let Err(e) = result {
            self.send_response(Final, e.0, e.1, e.2).await?;
            return Ok(false);
        }

        Ok(true)
    }

    async fn service_worker_vanished(&mut self) -> Result<bool, Error> {
        log::error!("{} [BUG] Service worker disappeared", self.log_prefix);
        self.send_response(
            Final,
            pc::ServiceNotAvailableClosing,
            Some((cc::TempFail, sc::OtherMailSystem)),
            Cow::Borrowed("Internal server error"),
        )
        .await?;
        Ok(false)
    }
}

/// The result of consuming a DATA body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataBody {
    Complete { size: u64 },
    /// A line exceeded the RFC 5321 cap.
    TooLong,
    /// The accumulated size exceeded the configured limit.
    TooBig,
}

/// Copy a DATA payload from `src` to `dst` up to and including the
/// `<CRLF>.<CRLF>` terminator, removing dot stuffing and normalising bare
/// LF line endings to CRLF.
///
/// On an overlong line or size overflow the rest of the payload through
/// the terminator is consumed and discarded so the session can continue.
async fn copy_data_body(
    dst: &mut (impl AsyncWrite + Unpin),
    src: &mut (impl AsyncBufRead + Unpin),
    max_size: u64,
) -> Result<DataBody, Error> {
    let mut buffer = Vec::<u8>::new();
    let mut size = 0u64;
    let mut start_of_line = true;

    loop {
        buffer.clear();
        (&mut *src)
            .take(MAX_DATA_LINE)
            .read_until(b'\n', &mut buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_DATA_LINE as usize {
                drain_data_body(src).await?;
                return Ok(DataBody::TooLong);
            }
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            )));
        }

        if start_of_line && (b".\r\n" == &buffer[..] || b".\n" == &buffer[..])
        {
            return Ok(DataBody::Complete { size });
        }

        let mut line: &[u8] = &buffer;
        if start_of_line && line.starts_with(b".") {
            // Remove the stuffing dot.
            line = &line[1..];
        }

        // Fragments of an overlong-but-legal line (those under the cap
        // arrive whole) would be corrupted by CRLF normalisation, but such
        // lines are already rejected above, so every buffer here either
        // ends a line or is mid-line without a newline at all.
        let normalised: Cow<'_, [u8]> = if line.ends_with(b"\n")
            && !line.ends_with(b"\r\n")
        {
            let mut owned = line[..line.len() - 1].to_vec();
            owned.extend_from_slice(b"\r\n");
            Cow::Owned(owned)
        } else {
            Cow::Borrowed(line)
        };

        size += normalised.len() as u64;
        if size > max_size {
            drain_data_body(src).await?;
            return Ok(DataBody::TooBig);
        }

        dst.write_all(&normalised).await?;
        start_of_line = buffer.ends_with(b"\n");
    }
}

/// Consume and discard the remainder of a DATA payload through its
/// terminator.
async fn drain_data_body(
    src: &mut (impl AsyncBufRead + Unpin),
) -> Result<(), Error> {
    let mut buffer = Vec::<u8>::new();
    let mut start_of_line = false;
    loop {
        buffer.clear();
        (&mut *src)
            .take(MAX_DATA_LINE)
            .read_until(b'\n', &mut buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            )));
        }

        if start_of_line && (b".\r\n" == &buffer[..] || b".\n" == &buffer[..])
        {
            return Ok(());
        }
        start_of_line = buffer.ends_with(b"\n");
    }
}

/// Wraps `DuplexStream` to silently succeed and consume all data on any
/// error, so a dead service does not sever the client session mid-DATA.
struct DiscardOnError(DuplexStream);

impl AsyncWrite for DiscardOnError {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        match Pin::new(&mut self.get_mut().0).poll_write(ctx, buf) {
            task::Poll::Ready(Err(_)) => task::Poll::Ready(Ok(buf.len())),
            poll => poll,
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        match Pin::new(&mut self.get_mut().0).poll_flush(ctx) {
            task::Poll::Ready(Err(_)) => task::Poll::Ready(Ok(())),
            poll => poll,
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(ctx)
    }
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
    use proptest::prelude::*;

    use super::*;

    fn copy_data_body_sync(
        stuffed: &[u8],
        max_size: u64,
    ) -> (Result<DataBody, Error>, Vec<u8>) {
        let mut decoded = Vec::<u8>::new();
        let mut reader = tokio::io::BufReader::new(stuffed);
        let result = futures::executor::block_on(copy_data_body(
            &mut decoded,
            &mut reader,
            max_size,
        ));
        (result, decoded)
    }

    #[test]
    fn data_body_basic() {
        let (result, decoded) =
            copy_data_body_sync(b"hello\r\nworld\r\n.\r\n", 1 << 20);
        assert!(matches!(result, Ok(DataBody::Complete { size: 14 })));
        assert_eq!(b"hello\r\nworld\r\n".to_vec(), decoded);
    }

    #[test]
    fn data_body_unstuffs_dots() {
        let (result, decoded) =
            copy_data_body_sync(b"..leading\r\n.\r\n", 1 << 20);
        assert!(matches!(result, Ok(DataBody::Complete { .. })));
        assert_eq!(b".leading\r\n".to_vec(), decoded);
    }

    #[test]
    fn data_body_normalises_bare_lf() {
        let (result, decoded) = copy_data_body_sync(b"a\nb\r\n.\n", 1 << 20);
        assert!(matches!(result, Ok(DataBody::Complete { .. })));
        assert_eq!(b"a\r\nb\r\n".to_vec(), decoded);
    }

    #[test]
    fn data_body_mid_line_dot_is_content() {
        let (result, decoded) =
            copy_data_body_sync(b"a. b\r\n.\r\n", 1 << 20);
        assert!(matches!(result, Ok(DataBody::Complete { .. })));
        assert_eq!(b"a. b\r\n".to_vec(), decoded);
    }

    #[test]
    fn data_body_size_cap() {
        let (result, _) =
            copy_data_body_sync(b"0123456789\r\nmore\r\n.\r\n", 8);
        assert!(matches!(result, Ok(DataBody::TooBig)));
    }

    #[test]
    fn data_body_line_cap() {
        let mut stuffed = vec![b'x'; 1200];
        stuffed.extend_from_slice(b"\r\nafter\r\n.\r\n");
        let (result, _) = copy_data_body_sync(&stuffed, 1 << 20);
        assert!(matches!(result, Ok(DataBody::TooLong)));
    }

    #[test]
    fn data_body_eof_is_an_error() {
        let (result, _) = copy_data_body_sync(b"no terminator\r\n", 1 << 20);
        assert!(matches!(result, Err(Error::Io(..))));
    }

    proptest! {
        #[test]
        fn dot_stuffing_round_trips(
            content in "[x.\r\n]{0,100}\r\n",
        ) {
            // Client-side stuffing per RFC 5321, applied after bare LFs
            // too since the engine treats those as line endings.
            let mut stuffed = content.replace("\n.", "\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\r\n");

            let (result, decoded) =
                copy_data_body_sync(stuffed.as_bytes(), 1 << 20);
            let is_complete = matches!(result, Ok(DataBody::Complete { .. }));
            prop_assert!(is_complete);
            // The engine normalises bare LF to CRLF.
            let expected = content.replace("\r\n", "\n").replace('\n', "\r\n");
            prop_assert_eq!(expected.into_bytes(), decoded);
        }
    }
}
