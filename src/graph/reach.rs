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

//! The reachability watcher.
//!
//! One task probes the Graph endpoint every minute and publishes
//! reachable/unreachable over a watch channel. Subscribers (the queue
//! flusher, SMTP dispatch) read the current value cheaply; the flusher
//! additionally wakes on the unreachable→reachable edge.

use std::rc::Rc;
use std::time::{Duration, Instant};

use log::info;
use tokio::sync::watch;

use super::client::GraphClient;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Read side of the reachability state.
#[derive(Clone)]
pub struct ReachHandle {
    rx: watch::Receiver<bool>,
}

impl ReachHandle {
    pub fn is_reachable(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the state changes; used by the flusher to wake on the
    /// reachable edge.
    pub async fn changed(&mut self) {
        // An error means the watcher is gone, at which point the state is
        // frozen; treat it as "no further changes".
        let _ = self.rx.changed().await;
    }

    #[cfg(test)]
    pub fn fixed(reachable: bool) -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(reachable);
        (tx, Self { rx })
    }
}

pub struct Watcher {
    graph: Rc<GraphClient>,
    tx: watch::Sender<bool>,
}

impl Watcher {
    /// Create the watcher. The initial state is unreachable until the
    /// first probe completes.
    pub fn new(graph: Rc<GraphClient>) -> (Self, ReachHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { graph, tx }, ReachHandle { rx })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let started = Instant::now();
        loop {
            let up = self.graph.probe().await;
            self.tx.send_if_modified(|state| {
                if *state != up {
                    info!(
                        "Graph became {} at +{}s",
                        if up { "reachable" } else { "unreachable" },
                        started.elapsed().as_secs(),
                    );
                    *state = up;
                    true
                } else {
                    false
                }
            });

            tokio::select! {
                _ = tokio::time::sleep(PROBE_INTERVAL) => {},
                _ = shutdown.changed() => return,
            }
        }
    }
}
