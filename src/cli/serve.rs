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

//! The listener supervisor.
//!
//! Binds the configured SMTP/SMTPS/POP3/POP3S ports, accepts connections,
//! and runs each session as an independent task on a single-threaded
//! runtime, alongside the reachability watcher, the queue flusher, and a
//! periodic token-refresh tick. Shutdown (SIGINT/SIGTERM) stops the
//! background tasks and listeners first, then drains live sessions for up
//! to thirty seconds.

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::main::{EXIT_AUTH_REQUIRED, EXIT_CONFIG, EXIT_GRAPH, EXIT_OK};
use crate::graph::{client::GraphClient, reach::Watcher};
use crate::smtp::submit::{serve_smtp, GraphDispatch};
use crate::pop3::server::serve_pop3;
use crate::spool::{flush::Flusher, RecentLog, Spool};
use crate::support::{
    async_io::ServerIo,
    error::{Error, ErrorClass},
    log_prefix::LogPrefix,
    system_config::{GatewayConfig, TlsConfig},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_WINDOW: Duration = Duration::from_secs(30);
const TOKEN_REFRESH_TICK: Duration = Duration::from_secs(30 * 60);
const FLUSHER_RESTART_CAP: Duration = Duration::from_secs(60);

pub fn serve(config: GatewayConfig) -> i32 {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, serve_impl(config))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Proto {
    Smtp,
    Pop3,
}

impl Proto {
    fn name(self, implicit_tls: bool) -> &'static str {
        match (self, implicit_tls) {
            (Proto::Smtp, false) => "smtp",
            (Proto::Smtp, true) => "smtps",
            (Proto::Pop3, false) => "pop3",
            (Proto::Pop3, true) => "pop3s",
        }
    }
}

#[derive(Clone)]
struct SessionEnv {
    config: Rc<GatewayConfig>,
    graph: Rc<GraphClient>,
    dispatch: Rc<GraphDispatch>,
    acceptor: Option<Rc<SslAcceptor>>,
    host_name: Rc<String>,
    active: Rc<Cell<usize>>,
}

async fn serve_impl(config: GatewayConfig) -> i32 {
    let config = Rc::new(config);

    let graph = match super::main::open_graph(&config) {
        Ok(graph) => Rc::new(graph),
        Err(code) => return code,
    };

    match graph.ensure_token().await {
        Ok(()) => info!("Stored tokens are usable"),
        Err(e) if ErrorClass::Auth == e.class() => {
            eprintln!(
                "graphgate: {e}\nRun `graphgate login` to authenticate."
            );
            return EXIT_AUTH_REQUIRED;
        },
        Err(e) if ErrorClass::Retryable == e.class() => {
            warn!("Graph is not reachable yet ({e}); starting offline");
        },
        Err(e) => {
            error!("Unrecoverable Graph error during startup: {e}");
            return EXIT_GRAPH;
        },
    }

    let acceptor = match config.tls {
        Some(ref tls) => match create_ssl_acceptor(tls) {
            Ok(acceptor) => Some(Rc::new(acceptor)),
            Err(e) => {
                eprintln!("graphgate: cannot load TLS material: {e}");
                return EXIT_CONFIG;
            },
        },
        None => None,
    };

    let spool = match Spool::new(config.queue_dir().to_owned()) {
        Ok(spool) => Rc::new(spool),
        Err(e) => {
            eprintln!(
                "graphgate: cannot open queue directory {}: {e}",
                config.queue_dir().display(),
            );
            return EXIT_CONFIG;
        },
    };
    if let Err(e) = spool.recover() {
        error!("Queue recovery failed: {e}");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (watcher, reach) = Watcher::new(Rc::clone(&graph));
    tokio::task::spawn_local(watcher.run(shutdown_rx.clone()));

    tokio::task::spawn_local(run_flusher(
        Rc::clone(&spool),
        Rc::clone(&graph),
        reach.clone(),
        shutdown_rx.clone(),
    ));

    tokio::task::spawn_local(token_refresh_tick(
        Rc::clone(&graph),
        reach.clone(),
        shutdown_rx.clone(),
    ));

    let env = SessionEnv {
        config: Rc::clone(&config),
        graph: Rc::clone(&graph),
        dispatch: Rc::new(GraphDispatch {
            graph: Rc::clone(&graph),
            spool: Rc::clone(&spool),
            reach: reach.clone(),
        }),
        acceptor,
        host_name: Rc::new(host_name()),
        active: Rc::new(Cell::new(0)),
    };

    let listeners = [
        (Proto::Smtp, false, config.smtp_port),
        (Proto::Smtp, true, config.smtps_port),
        (Proto::Pop3, false, config.pop3_port),
        (Proto::Pop3, true, config.pop3s_port),
    ];
    for (proto, implicit_tls, port) in listeners {
        let Some(port) = port else { continue };
        let listener =
            match TcpListener::bind((config.bind.as_str(), port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    eprintln!(
                        "graphgate: cannot bind {} port {}:{port}: {e}",
                        proto.name(implicit_tls),
                        config.bind,
                    );
                    return EXIT_CONFIG;
                },
            };
        info!(
            "Listening for {} on {}:{port}",
            proto.name(implicit_tls),
            config.bind,
        );
        tokio::task::spawn_local(accept_loop(
            listener,
            proto,
            implicit_tls,
            env.clone(),
            shutdown_rx.clone(),
        ));
    }

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received; draining sessions");
    let _ = shutdown_tx.send(true);

    let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
    while env.active.get() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if env.active.get() > 0 {
        warn!(
            "Dropping {} session(s) still active after the drain window",
            env.active.get(),
        );
    }

    info!("Shutdown complete");
    EXIT_OK
}

/// Run the queue flusher, restarting it with capped exponential backoff if
/// it ever crashes.
async fn run_flusher(
    spool: Rc<Spool>,
    graph: Rc<GraphClient>,
    reach: crate::graph::reach::ReachHandle,
    shutdown: watch::Receiver<bool>,
) {
    let mut restart_delay = Duration::from_secs(1);
    loop {
        if *shutdown.borrow() {
            return;
        }

        let recent = match RecentLog::load(spool.dir()) {
            Ok(recent) => recent,
            Err(e) => {
                error!("Cannot load the recent-sent log: {e}");
                tokio::time::sleep(restart_delay).await;
                restart_delay = (restart_delay * 2).min(FLUSHER_RESTART_CAP);
                continue;
            },
        };

        let flusher = Flusher::new(
            Rc::clone(&spool),
            Rc::clone(&graph),
            reach.clone(),
            recent,
        );
        match tokio::task::spawn_local(flusher.run(shutdown.clone())).await {
            // A clean return only happens on shutdown.
            Ok(()) => return,
            Err(e) => {
                error!(
                    "Queue flusher crashed ({e}); restarting in {}s",
                    restart_delay.as_secs(),
                );
                tokio::time::sleep(restart_delay).await;
                restart_delay = (restart_delay * 2).min(FLUSHER_RESTART_CAP);
            },
        }
    }
}

/// Keep the access token warm so sessions rarely pay for a refresh
/// inline.
async fn token_refresh_tick(
    graph: Rc<GraphClient>,
    reach: crate::graph::reach::ReachHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(TOKEN_REFRESH_TICK) => {},
            _ = shutdown.changed() => return,
        }
        if reach.is_reachable() {
            if let Err(e) = graph.ensure_token().await {
                warn!("Background token refresh failed: {e}");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    proto: Proto,
    implicit_tls: bool,
    env: SessionEnv,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((sock, peer)) => {
                    let env = env.clone();
                    tokio::task::spawn_local(async move {
                        let _guard = SessionGuard::enter(&env);
                        run_session(env, proto, implicit_tls, sock, peer)
                            .await;
                    });
                },
                Err(e) => {
                    warn!(
                        "Accept failed on {}: {e}",
                        proto.name(implicit_tls),
                    );
                    tokio::time::sleep(Duration::from_millis(100)).await;
                },
            },
        }
    }
}

async fn run_session(
    env: SessionEnv,
    proto: Proto,
    implicit_tls: bool,
    sock: TcpStream,
    peer: SocketAddr,
) {
    let log_prefix =
        LogPrefix::new(format!("{}:{peer}", proto.name(implicit_tls)));
    info!("{log_prefix} Connection established");

    let _ = sock.set_nodelay(true);
    let mut io = ServerIo::new_socket(sock);

    if implicit_tls {
        let acceptor = env
            .acceptor
            .as_ref()
            .expect("implicit-TLS listener without TLS material");
        match tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            io.ssl_accept(acceptor),
        )
        .await
        {
            Ok(Ok(())) => info!("{log_prefix} TLS handshake succeeded"),
            Ok(Err(e)) => {
                warn!("{log_prefix} TLS handshake failed: {e}");
                return;
            },
            Err(_) => {
                warn!("{log_prefix} TLS handshake timed out");
                return;
            },
        }
    }

    // STARTTLS/STLS is only offered on cleartext listeners.
    let starttls_acceptor = if implicit_tls {
        None
    } else {
        env.acceptor.clone()
    };

    let result = match proto {
        Proto::Smtp => {
            serve_smtp(
                io,
                Rc::clone(&env.config),
                log_prefix.clone(),
                starttls_acceptor,
                Rc::clone(&env.dispatch),
                env.host_name.as_ref().clone(),
            )
            .await
        },
        Proto::Pop3 => {
            serve_pop3(
                io,
                Rc::clone(&env.config),
                log_prefix.clone(),
                starttls_acceptor,
                Rc::clone(&env.graph),
                env.host_name.as_ref().clone(),
            )
            .await
        },
    };

    match result {
        Ok(()) => info!("{log_prefix} Normal client disconnect"),
        Err(e) => warn!("{log_prefix} Abnormal client disconnect: {e}"),
    }
}

struct SessionGuard {
    active: Rc<Cell<usize>>,
}

impl SessionGuard {
    fn enter(env: &SessionEnv) -> Self {
        env.active.set(env.active.get() + 1);
        Self {
            active: Rc::clone(&env.active),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.set(self.active.get() - 1);
    }
}

fn create_ssl_acceptor(tls: &TlsConfig) -> Result<SslAcceptor, Error> {
    let mut acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    acceptor.set_private_key_file(&tls.key, SslFiletype::PEM)?;
    acceptor.set_certificate_chain_file(&tls.cert)?;
    acceptor.check_private_key()?;
    Ok(acceptor.build())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).ok();
    let term_signal = async move {
        match term {
            Some(ref mut term) => {
                term.recv().await;
            },
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term_signal => {},
    }
}

fn host_name() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_owned())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}
