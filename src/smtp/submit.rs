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

//! The service half of the SMTP session engine: allowlist authentication,
//! submission policy, and dispatch of accepted messages to Graph or the
//! queue.

use std::borrow::Cow;
use std::rc::Rc;

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::{io::AsyncReadExt, sync::mpsc};

use super::{bridge::*, codes::*, syntax};
use crate::graph::{client::GraphClient, reach::ReachHandle};
use crate::spool::Spool;
use crate::support::{
    async_io::ServerIo,
    error::{Error, ErrorClass},
    log_prefix::LogPrefix,
    system_config::{GatewayConfig, Mailbox},
};

const MAX_RECIPIENTS: usize = 50;

/// What became of an accepted message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Delivered to Graph inline.
    Sent,
    /// Durably queued for the flusher.
    Queued,
    /// Rejected; the client gets this reply.
    Refused(SmtpResponse<'static>),
}

/// The submission seam between the SMTP service and the Graph/queue pair,
/// mockable in tests.
pub trait Dispatch {
    async fn dispatch(
        &self,
        sender: &str,
        recipients: &[String],
        mime: &[u8],
    ) -> DispatchOutcome;
}

/// The production dispatcher: send inline while Graph is reachable,
/// enqueue on transient trouble or while unreachable, refuse on permanent
/// errors.
pub struct GraphDispatch {
    pub graph: Rc<GraphClient>,
    pub spool: Rc<Spool>,
    pub reach: ReachHandle,
}

impl Dispatch for GraphDispatch {
    async fn dispatch(
        &self,
        sender: &str,
        recipients: &[String],
        mime: &[u8],
    ) -> DispatchOutcome {
        if self.reach.is_reachable() {
            match self.graph.send_mail(sender, mime).await {
                Ok(()) => return DispatchOutcome::Sent,
                Err(e) if ErrorClass::Permanent == e.class() => {
                    warn!("Graph refused message from {sender}: {e}");
                    return DispatchOutcome::Refused(map_permanent(&e));
                },
                Err(e) => {
                    warn!(
                        "Graph did not take message from {sender} ({e}); \
                         queueing it",
                    );
                },
            }
        }

        match self.spool.enqueue(
            sender.to_owned(),
            recipients.to_owned(),
            mime,
        ) {
            Ok(path) => {
                info!(
                    "Queued message from {sender} as {}",
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                );
                DispatchOutcome::Queued
            },
            Err(e) => {
                error!("Unable to queue message from {sender}: {e}");
                DispatchOutcome::Refused(SmtpResponse(
                    pc::ActionNotTakenTemporary,
                    Some((cc::TempFail, sc::OtherMailSystem)),
                    Cow::Borrowed("Unable to queue message"),
                ))
            },
        }
    }
}

/// Map a permanent Graph error onto a conservative SMTP reply.
fn map_permanent(e: &Error) -> SmtpResponse<'static> {
    match *e {
        Error::GraphPermanent { status: 413, .. } => SmtpResponse(
            pc::ExceededStorageAllocation,
            Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
            Cow::Borrowed("Message too large for the upstream service"),
        ),
        Error::GraphPermanent { ref message, .. }
            if message.contains("Denied")
                || message.contains("denied")
                || message.contains("NotAuthorized") =>
        {
            SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Borrowed("Upstream service refused this sender"),
            )
        },
        _ => SmtpResponse(
            pc::TransactionFailed,
            Some((cc::PermFail, sc::OtherMailSystem)),
            Cow::Borrowed("Upstream service rejected the message"),
        ),
    }
}

/// Serve one SMTP session over `io`.
pub async fn serve_smtp<D: Dispatch>(
    io: ServerIo,
    config: Rc<GatewayConfig>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<Rc<SslAcceptor>>,
    dispatch: Rc<D>,
    local_host_name: String,
) -> Result<(), Error> {
    let (request_tx, request_rx) = mpsc::channel(1);
    let server_service = super::server::Service {
        max_message_size: config.attachment_limit_bytes(),
        send_request: request_tx,
    };

    let mut service = SubmitService {
        log_prefix: log_prefix.clone(),
        config,
        request_in: request_rx,
        dispatch,
        mailbox: None,
        return_path: String::new(),
        tls: None,
    };

    tokio::join![
        super::server::run(
            io,
            log_prefix,
            ssl_acceptor,
            server_service,
            local_host_name,
        ),
        service.run(),
    ]
    .0
}

struct SubmitService<D> {
    log_prefix: LogPrefix,
    config: Rc<GatewayConfig>,
    request_in: mpsc::Receiver<Request>,
    dispatch: Rc<D>,

    mailbox: Option<Mailbox>,
    return_path: String,
    /// The TLS description from the most recent HELO, used to observe
    /// the cleartext-to-TLS transition.
    tls: Option<String>,
}

impl<D: Dispatch> SubmitService<D> {
    async fn run(&mut self) {
        loop {
            let Some(request) = self.request_in.recv().await else {
                return;
            };

            match request.payload {
                RequestPayload::Helo(req) => {
                    self.req_helo(req);
                    let _ = request.respond.send(Ok(()));
                },

                RequestPayload::Reset => {
                    self.return_path.clear();
                    let _ = request.respond.send(Ok(()));
                },

                RequestPayload::Auth(req) => {
                    let response = self.req_auth(req);
                    let _ = request.respond.send(response);
                },

                RequestPayload::Recipient(_) | RequestPayload::Data(_) => {
                    let _ = request
                        .respond
                        .send(Err(SmtpResponse::internal_sequence_error()));
                },

                RequestPayload::Mail(mail_request) => {
                    let result = self.req_mail(mail_request);
                    let ok = result.is_ok();
                    let _ = request.respond.send(result);
                    if ok {
                        self.handle_mail_transaction().await;
                    }

                    self.return_path.clear();
                },
            }
        }
    }

    /// The HELO following a STARTTLS upgrade voids everything learned in
    /// cleartext; the service drops its own authentication state rather
    /// than trusting the protocol half to gate for it.
    fn req_helo(&mut self, req: HeloRequest) {
        if req.tls.is_some() && self.tls.is_none() {
            if self.mailbox.is_some() {
                info!(
                    "{} Dropping pre-TLS authentication state",
                    self.log_prefix,
                );
            }
            self.mailbox = None;
            self.return_path.clear();
            self.log_prefix.clear_user();
        }
        self.tls = req.tls;
    }

    fn req_auth(
        &mut self,
        req: AuthRequest,
    ) -> Result<(), SmtpResponse<'static>> {
        match self.config.authenticate(&req.username, &req.password) {
            Some(mailbox) => {
                info!("{} Authenticated {}", self.log_prefix, req.username);
                self.log_prefix.set_user(mailbox.username.clone());
                self.mailbox = Some(mailbox.clone());
                Ok(())
            },
            None => {
                warn!(
                    "{} Rejected credentials for {:?}",
                    self.log_prefix, req.username,
                );
                Err(SmtpResponse(
                    pc::AuthenticationCredentialsInvalid,
                    Some((cc::PermFail, sc::AuthenticationCredentialsInvalid)),
                    Cow::Borrowed("Authentication credentials invalid"),
                ))
            },
        }
    }

    fn req_mail(
        &mut self,
        req: MailRequest,
    ) -> Result<(), SmtpResponse<'static>> {
        let Some(ref mailbox) = self.mailbox else {
            return Err(SmtpResponse(
                pc::AuthenticationRequired,
                Some((cc::PermFail, sc::OtherSecurity)),
                Cow::Borrowed("Must log in before sending mail"),
            ));
        };

        if !syntax::addresses_equivalent(&req.from, &mailbox.username) {
            warn!(
                "{} MAIL FROM {:?} does not match authenticated mailbox {}",
                self.log_prefix, req.from, mailbox.username,
            );
            return Err(SmtpResponse(
                pc::MailboxNameNotAllowed,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Borrowed(
                    "MAIL FROM must match the authenticated mailbox",
                ),
            ));
        }

        self.return_path = req.from;
        Ok(())
    }

    fn req_recipient(
        &self,
        recipients: &[String],
        req: &RecipientRequest,
    ) -> Result<(), SmtpResponse<'static>> {
        if recipients.len() >= MAX_RECIPIENTS {
            return Err(SmtpResponse(
                pc::ActionNotTakenTemporary,
                Some((cc::TempFail, sc::TooManyRecipients)),
                Cow::Borrowed("Too many recipients"),
            ));
        }

        let Some((_, domain)) = syntax::split_address(&req.to) else {
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::BadDestinationMailboxAddressSyntax)),
                Cow::Borrowed("Recipient must be a full email address"),
            ));
        };

        if !self.config.domain_allowed(domain) {
            warn!(
                "{} Denied recipient domain {domain:?}",
                self.log_prefix,
            );
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Borrowed("Recipient domain not allowed"),
            ));
        }

        Ok(())
    }

    async fn handle_mail_transaction(&mut self) {
        let mut recipients = Vec::<String>::new();

        let data = loop {
            let Some(request) = self.request_in.recv().await else {
                return;
            };

            match request.payload {
                RequestPayload::Reset => {
                    let _ = request.respond.send(Ok(()));
                    return;
                },

                RequestPayload::Recipient(recipient) => {
                    match self.req_recipient(&recipients, &recipient) {
                        Ok(()) => {
                            // Silently ignore duplicate recipients.
                            if !recipients.contains(&recipient.to) {
                                recipients.push(recipient.to);
                            }
                            let _ = request.respond.send(Ok(()));
                        },
                        Err(response) => {
                            let _ = request.respond.send(Err(response));
                        },
                    }
                },

                RequestPayload::Data(data) => {
                    let _ = request.respond.send(Ok(()));
                    break data;
                },

                RequestPayload::Helo(_)
                | RequestPayload::Auth(_)
                | RequestPayload::Mail(_) => {
                    let _ = request
                        .respond
                        .send(Err(SmtpResponse::internal_sequence_error()));
                    return;
                },
            }
        };

        let mut mime = Vec::<u8>::new();
        let mut stream = data.data;
        if let Err(e) = stream.read_to_end(&mut mime).await {
            error!("{} Reading message body failed: {e}", self.log_prefix);
            return;
        }
        drop(stream);

        // The server only hands over a responder when the body arrived
        // intact; otherwise the transaction was abandoned.
        let Ok(responder) = data.result.await else {
            info!(
                "{} Transaction abandoned after {} bytes",
                self.log_prefix,
                mime.len(),
            );
            return;
        };

        let sender = self.return_path.clone();
        info!(
            "{} Dispatching {} bytes from {} to {} recipient(s)",
            self.log_prefix,
            mime.len(),
            sender,
            recipients.len(),
        );

        let result = match self
            .dispatch
            .dispatch(&sender, &recipients, &mime)
            .await
        {
            DispatchOutcome::Sent | DispatchOutcome::Queued => Ok(()),
            DispatchOutcome::Refused(response) => Err(response),
        };
        let _ = responder.send(result);
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    struct MockDispatch {
        outcome: RefCell<Vec<DispatchOutcome>>,
        calls: RefCell<Vec<(String, Vec<String>, Vec<u8>)>>,
    }

    impl MockDispatch {
        fn answering(outcome: Vec<DispatchOutcome>) -> Rc<Self> {
            Rc::new(Self {
                outcome: RefCell::new(outcome),
                calls: RefCell::new(Vec::new()),
            })
        }
    }

    impl Dispatch for MockDispatch {
        async fn dispatch(
            &self,
            sender: &str,
            recipients: &[String],
            mime: &[u8],
        ) -> DispatchOutcome {
            self.calls.borrow_mut().push((
                sender.to_owned(),
                recipients.to_vec(),
                mime.to_vec(),
            ));
            if self.outcome.borrow().is_empty() {
                DispatchOutcome::Sent
            } else {
                self.outcome.borrow_mut().remove(0)
            }
        }
    }

    fn test_config() -> Rc<GatewayConfig> {
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
                "smtp_port": 10025,
                "mailboxes": [{
                    "username": "alerts@t.onmicrosoft.com",
                    "password": hash,
                }],
                "allowed_domains": ["example.com"],
                "queue_dir": "/tmp/q",
                "token_path": "/tmp/t.enc",
            }))
            .unwrap(),
        )
    }

    struct Session {
        client: tokio::io::DuplexStream,
        read_buffer: Vec<u8>,
    }

    impl Session {
        fn start(dispatch: Rc<MockDispatch>) -> Self {
            crate::init_test_log();
            let (client, server) = tokio::io::duplex(1 << 16);
            let io = ServerIo::new_duplex(server);
            tokio::task::spawn_local(async move {
                let _ = serve_smtp(
                    io,
                    test_config(),
                    LogPrefix::new("test".to_owned()),
                    None,
                    dispatch,
                    "gateway.test".to_owned(),
                )
                .await;
            });
            Self {
                client,
                read_buffer: Vec::new(),
            }
        }

        async fn send(&mut self, line: &str) {
            self.client.write_all(line.as_bytes()).await.unwrap();
            self.client.write_all(b"\r\n").await.unwrap();
        }

        /// Read one reply line.
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

        /// Read reply lines through the final (no-hyphen) one.
        async fn reply_all(&mut self) -> String {
            let mut last;
            loop {
                last = self.reply().await;
                if last.len() < 4 || '-' != last.as_bytes()[3] as char {
                    return last;
                }
            }
        }

        async fn expect(&mut self, prefix: &str) {
            let line = self.reply_all().await;
            assert!(
                line.starts_with(prefix),
                "expected {prefix:?}, got {line:?}",
            );
        }

        async fn authenticate(&mut self) {
            // "\0alerts@t.onmicrosoft.com\0secret"
            let initial = base64::encode(b"\0alerts@t.onmicrosoft.com\0secret");
            self.send(&format!("AUTH PLAIN {initial}")).await;
            self.expect("235").await;
        }
    }

    fn run_local<F: std::future::Future<Output = ()>>(f: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        tokio::task::LocalSet::new().block_on(&rt, f);
    }

    #[test]
    fn full_submission_online() {
        run_local(async {
            let dispatch = MockDispatch::answering(vec![]);
            let mut session = Session::start(Rc::clone(&dispatch));

            session.expect("220").await;
            session.send("EHLO printer.local").await;
            session.expect("250").await;
            session.authenticate().await;
            session
                .send("MAIL FROM:<alerts@t.onmicrosoft.com>")
                .await;
            session.expect("250").await;
            session.send("RCPT TO:<ops@example.com>").await;
            session.expect("250").await;
            session.send("DATA").await;
            session.expect("354").await;
            session.send("Subject: hi").await;
            session.send("").await;
            session.send("..dot line").await;
            session.send("body").await;
            session.send(".").await;
            session.expect("250").await;
            session.send("QUIT").await;
            session.expect("221").await;

            let calls = dispatch.calls.borrow();
            assert_eq!(1, calls.len());
            assert_eq!("alerts@t.onmicrosoft.com", calls[0].0);
            assert_eq!(vec!["ops@example.com".to_owned()], calls[0].1);
            assert_eq!(
                b"Subject: hi\r\n\r\n.dot line\r\nbody\r\n".to_vec(),
                calls[0].2,
            );
        });
    }

    #[test]
    fn auth_login_challenge_flow() {
        run_local(async {
            let dispatch = MockDispatch::answering(vec![]);
            let mut session = Session::start(dispatch);

            session.expect("220").await;
            session.send("EHLO x").await;
            session.expect("250").await;
            session.send("AUTH LOGIN").await;
            session.expect("334 VXNlcm5hbWU6").await;
            session
                .send(&base64::encode(b"alerts@t.onmicrosoft.com"))
                .await;
            session.expect("334 UGFzc3dvcmQ6").await;
            session.send(&base64::encode(b"secret")).await;
            session.expect("235").await;
        });
    }

    #[test]
    fn mail_requires_auth() {
        run_local(async {
            let dispatch = MockDispatch::answering(vec![]);
            let mut session = Session::start(dispatch);

            session.expect("220").await;
            session.send("EHLO x").await;
            session.expect("250").await;
            session.send("MAIL FROM:<alerts@t.onmicrosoft.com>").await;
            session.expect("530").await;
        });
    }

    #[test]
    fn mail_from_must_match_authenticated_mailbox() {
        run_local(async {
            let dispatch = MockDispatch::answering(vec![]);
            let mut session = Session::start(dispatch);

            session.expect("220").await;
            session.send("EHLO x").await;
            session.expect("250").await;
            session.authenticate().await;
            session.send("MAIL FROM:<other@t.onmicrosoft.com>").await;
            session.expect("553").await;

            // Case differences are fine.
            session.send("MAIL FROM:<ALERTS@T.ONMICROSOFT.COM>").await;
            session.expect("250").await;
        });
    }

    #[test]
    fn recipient_domain_allowlist() {
        run_local(async {
            let dispatch = MockDispatch::answering(vec![]);
            let mut session = Session::start(Rc::clone(&dispatch));

            session.expect("220").await;
            session.send("EHLO x").await;
            session.expect("250").await;
            session.authenticate().await;
            session.send("MAIL FROM:<alerts@t.onmicrosoft.com>").await;
            session.expect("250").await;
            session.send("RCPT TO:<ops@evil.com>").await;
            session.expect("550").await;
            session.send("RCPT TO:<ops@example.com>").await;
            session.expect("250").await;

            // The denied recipient never reaches dispatch.
            session.send("DATA").await;
            session.expect("354").await;
            session.send(".").await;
            session.expect("250").await;
            assert_eq!(
                vec!["ops@example.com".to_owned()],
                dispatch.calls.borrow()[0].1,
            );
        });
    }

    #[test]
    fn queued_submission_still_gets_250() {
        run_local(async {
            let dispatch =
                MockDispatch::answering(vec![DispatchOutcome::Queued]);
            let mut session = Session::start(dispatch);

            session.expect("220").await;
            session.send("EHLO x").await;
            session.expect("250").await;
            session.authenticate().await;
            session.send("MAIL FROM:<alerts@t.onmicrosoft.com>").await;
            session.expect("250").await;
            session.send("RCPT TO:<ops@example.com>").await;
            session.expect("250").await;
            session.send("DATA").await;
            session.expect("354").await;
            session.send(".").await;
            session.expect("250").await;
        });
    }

    #[test]
    fn permanent_failure_maps_to_5xx() {
        run_local(async {
            let dispatch = MockDispatch::answering(vec![
                DispatchOutcome::Refused(map_permanent(
                    &Error::GraphPermanent {
                        status: 413,
                        message: "too big".to_owned(),
                    },
                )),
            ]);
            let mut session = Session::start(dispatch);

            session.expect("220").await;
            session.send("EHLO x").await;
            session.expect("250").await;
            session.authenticate().await;
            session.send("MAIL FROM:<alerts@t.onmicrosoft.com>").await;
            session.expect("250").await;
            session.send("RCPT TO:<ops@example.com>").await;
            session.expect("250").await;
            session.send("DATA").await;
            session.expect("354").await;
            session.send(".").await;
            session.expect("552").await;
        });
    }

    #[test]
    fn three_auth_failures_close_the_connection() {
        run_local(async {
            let dispatch = MockDispatch::answering(vec![]);
            let mut session = Session::start(dispatch);

            session.expect("220").await;
            session.send("EHLO x").await;
            session.expect("250").await;

            let bad = base64::encode(b"\0alerts@t.onmicrosoft.com\0wrong");
            session.send(&format!("AUTH PLAIN {bad}")).await;
            session.expect("535").await;
            session.send(&format!("AUTH PLAIN {bad}")).await;
            session.expect("535").await;
            session.send(&format!("AUTH PLAIN {bad}")).await;
            session.expect("535").await;
            session.expect("421").await;
        });
    }

    #[test]
    fn starttls_unavailable_without_material() {
        run_local(async {
            let dispatch = MockDispatch::answering(vec![]);
            let mut session = Session::start(dispatch);

            session.expect("220").await;
            session.send("EHLO x").await;
            session.expect("250").await;
            session.send("STARTTLS").await;
            session.expect("454").await;
        });
    }

    #[test]
    fn starttls_helo_drops_service_auth_state() {
        // Drives the service actor directly: the protocol half's own
        // has_auth gate must not be the only thing enforcing re-AUTH
        // after a TLS upgrade.
        run_local(async {
            let (request_tx, request_rx) = mpsc::channel(1);
            let mut service = SubmitService {
                log_prefix: LogPrefix::new("test".to_owned()),
                config: test_config(),
                request_in: request_rx,
                dispatch: MockDispatch::answering(vec![]),
                mailbox: None,
                return_path: String::new(),
                tls: None,
            };
            tokio::task::spawn_local(async move { service.run().await });

            async fn ask(
                request_tx: &mpsc::Sender<Request>,
                payload: RequestPayload,
            ) -> Result<(), SmtpResponse<'static>> {
                let (respond, response) = tokio::sync::oneshot::channel();
                request_tx
                    .send(Request { payload, respond })
                    .await
                    .unwrap();
                response.await.unwrap()
            }

            fn helo(tls: Option<&str>) -> RequestPayload {
                RequestPayload::Helo(HeloRequest {
                    command: "EHLO".to_owned(),
                    host: "printer.local".to_owned(),
                    tls: tls.map(str::to_owned),
                })
            }

            ask(&request_tx, helo(None)).await.unwrap();
            ask(
                &request_tx,
                RequestPayload::Auth(AuthRequest {
                    username: "alerts@t.onmicrosoft.com".to_owned(),
                    password: "secret".to_owned(),
                }),
            )
            .await
            .unwrap();

            // A repeated cleartext EHLO keeps the authentication.
            ask(&request_tx, helo(None)).await.unwrap();
            ask(
                &request_tx,
                RequestPayload::Mail(MailRequest {
                    from: "alerts@t.onmicrosoft.com".to_owned(),
                }),
            )
            .await
            .unwrap();
            ask(&request_tx, RequestPayload::Reset).await.unwrap();

            // The EHLO after a STARTTLS upgrade does not.
            ask(&request_tx, helo(Some("TLSv1.3:TLS_AES_128_GCM_SHA256")))
                .await
                .unwrap();
            let denied = ask(
                &request_tx,
                RequestPayload::Mail(MailRequest {
                    from: "alerts@t.onmicrosoft.com".to_owned(),
                }),
            )
            .await
            .unwrap_err();
            assert_eq!(pc::AuthenticationRequired, denied.0);
        });
    }

    #[test]
    fn vrfy_always_252() {
        run_local(async {
            let dispatch = MockDispatch::answering(vec![]);
            let mut session = Session::start(dispatch);

            session.expect("220").await;
            session.send("EHLO x").await;
            session.expect("250").await;
            session.send("VRFY somebody").await;
            session.expect("252").await;
        });
    }
}
