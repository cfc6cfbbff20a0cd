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

//! The background queue flusher.
//!
//! Runs while Graph is reachable and sleeps otherwise, waking immediately
//! on the reachable edge or when SMTP enqueues something new. Entries are
//! submitted strictly in enqueue order with exactly one in flight, which
//! keeps recovery trivial: there is never more than one `*.sending` file
//! to reason about.

use std::fs;
use std::rc::Rc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;

use super::{fingerprint, read_entry, RecentLog, Spool};
use crate::graph::{client::GraphClient, reach::ReachHandle};
use crate::support::error::{Error, ErrorClass};

/// Backoff cap between attempts for one entry.
const BACKOFF_CAP: Duration = Duration::from_secs(900);
/// Pause after an internal (filesystem) error before rescanning.
const INTERNAL_ERROR_PAUSE: Duration = Duration::from_secs(5);
/// Pause while authorisation is broken. A dead refresh token still
/// counts as "reachable" to the probe, so the flusher pauses itself and
/// periodically looks again in case an operator has re-run the login.
const REAUTH_PAUSE: Duration = Duration::from_secs(15 * 60);

/// What a single pass over the queue head did.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending.
    Empty,
    /// The head entry was delivered to Graph.
    Delivered,
    /// The head entry was a duplicate of something already delivered.
    Discarded,
    /// The head entry failed permanently and was parked under `failed/`.
    Failed,
    /// The head entry failed transiently; wait this long before the next
    /// pass.
    Backoff(Duration),
    /// Graph rejected our credentials outright; flushing pauses until an
    /// operator completes an interactive re-login.
    AuthRequired,
}

/// The submission seam, mockable in tests.
pub trait MailSender {
    async fn send(&self, from: &str, mime: &[u8]) -> Result<(), Error>;
}

impl MailSender for GraphClient {
    async fn send(&self, from: &str, mime: &[u8]) -> Result<(), Error> {
        self.send_mail(from, mime).await
    }
}

pub struct Flusher<S> {
    spool: Rc<Spool>,
    sender: Rc<S>,
    reach: ReachHandle,
    recent: RecentLog,
}

impl<S: MailSender> Flusher<S> {
    pub fn new(
        spool: Rc<Spool>,
        sender: Rc<S>,
        reach: ReachHandle,
        recent: RecentLog,
    ) -> Self {
        Self {
            spool,
            sender,
            reach,
            recent,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            if !self.reach.is_reachable() {
                tokio::select! {
                    _ = self.reach.changed() => {},
                    _ = shutdown.changed() => return,
                }
                continue;
            }

            match self.flush_one().await {
                Ok(FlushOutcome::Empty) => {
                    tokio::select! {
                        _ = self.spool.wait_enqueued() => {},
                        _ = self.reach.changed() => {},
                        _ = shutdown.changed() => return,
                    }
                },
                Ok(FlushOutcome::Backoff(delay)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {},
                        _ = shutdown.changed() => return,
                    }
                },
                Ok(FlushOutcome::AuthRequired) => {
                    tokio::select! {
                        _ = tokio::time::sleep(REAUTH_PAUSE) => {},
                        _ = shutdown.changed() => return,
                    }
                },
                Ok(_) => {},
                Err(e) => {
                    error!("Queue flush error: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(INTERNAL_ERROR_PAUSE) => {},
                        _ = shutdown.changed() => return,
                    }
                },
            }
        }
    }

    /// Submit the head of the queue, if any.
    pub async fn flush_one(&mut self) -> Result<FlushOutcome, Error> {
        let Some(path) = self.spool.scan()?.into_iter().next() else {
            return Ok(FlushOutcome::Empty);
        };

        let sending = self.spool.mark_sending(&path)?;
        let mut entry = match read_entry(&sending) {
            Ok(entry) => entry,
            Err(e) => {
                // The entry cannot even be parsed; park the raw bytes so
                // nothing is silently dropped.
                warn!(
                    "Queue entry {} is unreadable ({e}); moving to failed/",
                    sending.display(),
                );
                let name = sending
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("entry");
                fs::rename(
                    &sending,
                    self.spool.dir().join("failed").join(format!("{name}.msg")),
                )?;
                return Ok(FlushOutcome::Failed);
            },
        };

        let fp = fingerprint(
            &entry.header.sender,
            &entry.header.recipients,
            &entry.mime,
        );
        if self.recent.contains(&fp) {
            info!(
                "Discarding already-delivered queue entry {} ({fp})",
                sending.display(),
            );
            self.spool.remove(&sending)?;
            return Ok(FlushOutcome::Discarded);
        }

        match self.sender.send(&entry.header.sender, &entry.mime).await {
            Ok(()) => {
                self.recent.record(fp);
                self.spool.remove(&sending)?;
                info!(
                    "Flushed queued message from {} to {} recipient(s)",
                    entry.header.sender,
                    entry.header.recipients.len(),
                );
                Ok(FlushOutcome::Delivered)
            },
            Err(e) if ErrorClass::Permanent == e.class() => {
                error!(
                    "Queued message from {} failed permanently: {e}",
                    entry.header.sender,
                );
                entry.header.last_error = Some(e.to_string());
                self.spool.fail(&sending, &entry)?;
                Ok(FlushOutcome::Failed)
            },
            Err(e) if ErrorClass::Auth == e.class() => {
                // Not the entry's fault, so its attempt count stays put;
                // the whole queue is blocked until someone re-runs the
                // interactive login.
                error!(
                    "Queue flushing is blocked by an authorisation \
                     failure ({e}); run `graphgate login` to restore \
                     access",
                );
                entry.header.last_error =
                    Some(format!("re-login required: {e}"));
                self.spool.requeue(&sending, &entry)?;
                Ok(FlushOutcome::AuthRequired)
            },
            Err(e) => {
                entry.header.attempts += 1;
                entry.header.last_error = Some(e.to_string());
                let delay = backoff_delay(entry.header.attempts);
                warn!(
                    "Queued message from {} not delivered (attempt {}): \
                     {e}; next try in {}s",
                    entry.header.sender,
                    entry.header.attempts,
                    delay.as_secs(),
                );
                self.spool.requeue(&sending, &entry)?;
                Ok(FlushOutcome::Backoff(delay))
            },
        }
    }
}

/// Exponential backoff: 2ⁿ seconds, capped at 15 minutes.
pub fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_secs(1u64 << attempts.min(10)).min(BACKOFF_CAP)
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use tempfile::TempDir;

    use super::*;
    use crate::graph::reach::ReachHandle;

    struct MockSender {
        sent: RefCell<Vec<(String, Vec<u8>)>>,
        responses: RefCell<Vec<Result<(), Error>>>,
    }

    impl MockSender {
        fn answering(responses: Vec<Result<(), Error>>) -> Rc<Self> {
            Rc::new(Self {
                sent: RefCell::new(Vec::new()),
                responses: RefCell::new(responses),
            })
        }
    }

    impl MailSender for MockSender {
        async fn send(&self, from: &str, mime: &[u8]) -> Result<(), Error> {
            self.sent
                .borrow_mut()
                .push((from.to_owned(), mime.to_vec()));
            if self.responses.borrow().is_empty() {
                Ok(())
            } else {
                self.responses.borrow_mut().remove(0)
            }
        }
    }

    fn flusher(
        dir: &TempDir,
        sender: Rc<MockSender>,
    ) -> (Rc<Spool>, Flusher<MockSender>) {
        crate::init_test_log();
        let spool = Rc::new(Spool::new(dir.path().to_owned()).unwrap());
        // The sender side may drop; the handle keeps reading the last
        // value, which is all flush_one consults.
        let (_tx, reach) = ReachHandle::fixed(true);
        let recent = RecentLog::load(dir.path()).unwrap();
        (
            Rc::clone(&spool),
            Flusher::new(spool, sender, reach, recent),
        )
    }

    #[tokio::test]
    async fn flushes_in_enqueue_order() {
        let dir = TempDir::new().unwrap();
        let sender = MockSender::answering(vec![]);
        let (spool, mut flusher) = flusher(&dir, Rc::clone(&sender));

        spool
            .enqueue("a@b.com".to_owned(), vec!["x@y.com".to_owned()], b"one")
            .unwrap();
        spool
            .enqueue("a@b.com".to_owned(), vec!["x@y.com".to_owned()], b"two")
            .unwrap();

        assert_eq!(FlushOutcome::Delivered, flusher.flush_one().await.unwrap());
        assert_eq!(FlushOutcome::Delivered, flusher.flush_one().await.unwrap());
        assert_eq!(FlushOutcome::Empty, flusher.flush_one().await.unwrap());

        let sent = sender.sent.borrow();
        assert_eq!(2, sent.len());
        assert_eq!(b"one".to_vec(), sent[0].1);
        assert_eq!(b"two".to_vec(), sent[1].1);
        assert!(spool.scan().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_entry_discarded_without_send() {
        let dir = TempDir::new().unwrap();
        let sender = MockSender::answering(vec![]);
        let (spool, mut flusher) = flusher(&dir, Rc::clone(&sender));

        spool
            .enqueue("a@b.com".to_owned(), vec!["x@y.com".to_owned()], b"dup")
            .unwrap();
        assert_eq!(FlushOutcome::Delivered, flusher.flush_one().await.unwrap());

        // The same content re-enqueued, as after a crash between Graph
        // accepting and the file being removed.
        spool
            .enqueue("a@b.com".to_owned(), vec!["x@y.com".to_owned()], b"dup")
            .unwrap();
        assert_eq!(FlushOutcome::Discarded, flusher.flush_one().await.unwrap());
        assert_eq!(1, sender.sent.borrow().len());
        assert!(spool.scan().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff() {
        let dir = TempDir::new().unwrap();
        let sender = MockSender::answering(vec![Err(Error::GraphRetryable {
            status: 503,
            message: "down".to_owned(),
        })]);
        let (spool, mut flusher) = flusher(&dir, Rc::clone(&sender));

        spool
            .enqueue("a@b.com".to_owned(), vec!["x@y.com".to_owned()], b"m")
            .unwrap();
        assert_eq!(
            FlushOutcome::Backoff(Duration::from_secs(2)),
            flusher.flush_one().await.unwrap(),
        );

        let pending = spool.scan().unwrap();
        assert_eq!(1, pending.len());
        let entry = read_entry(&pending[0]).unwrap();
        assert_eq!(1, entry.header.attempts);
        assert!(entry.header.last_error.unwrap().contains("503"));

        // The retry delivers.
        assert_eq!(FlushOutcome::Delivered, flusher.flush_one().await.unwrap());
        assert_eq!(2, sender.sent.borrow().len());
    }

    #[tokio::test]
    async fn auth_failure_pauses_without_burning_attempts() {
        let dir = TempDir::new().unwrap();
        let sender =
            MockSender::answering(vec![Err(Error::LoginRequired)]);
        let (spool, mut flusher) = flusher(&dir, Rc::clone(&sender));

        spool
            .enqueue("a@b.com".to_owned(), vec!["x@y.com".to_owned()], b"m")
            .unwrap();
        assert_eq!(
            FlushOutcome::AuthRequired,
            flusher.flush_one().await.unwrap(),
        );

        // The entry is back in the queue, not charged an attempt, and
        // marked as blocked on a re-login.
        let pending = spool.scan().unwrap();
        assert_eq!(1, pending.len());
        let entry = read_entry(&pending[0]).unwrap();
        assert_eq!(0, entry.header.attempts);
        assert!(entry
            .header
            .last_error
            .unwrap()
            .contains("re-login required"));

        // Once the operator has logged back in, the same entry delivers.
        assert_eq!(FlushOutcome::Delivered, flusher.flush_one().await.unwrap());
        assert_eq!(2, sender.sent.borrow().len());
    }

    #[tokio::test]
    async fn permanent_failure_parks_entry() {
        let dir = TempDir::new().unwrap();
        let sender = MockSender::answering(vec![Err(Error::GraphPermanent {
            status: 413,
            message: "too big".to_owned(),
        })]);
        let (spool, mut flusher) = flusher(&dir, Rc::clone(&sender));

        spool
            .enqueue("a@b.com".to_owned(), vec!["x@y.com".to_owned()], b"m")
            .unwrap();
        assert_eq!(FlushOutcome::Failed, flusher.flush_one().await.unwrap());
        assert!(spool.scan().unwrap().is_empty());
        assert_eq!(
            1,
            std::fs::read_dir(dir.path().join("failed")).unwrap().count(),
        );
    }

    #[test]
    fn backoff_caps_at_fifteen_minutes() {
        assert_eq!(Duration::from_secs(2), backoff_delay(1));
        assert_eq!(Duration::from_secs(256), backoff_delay(8));
        assert_eq!(Duration::from_secs(900), backoff_delay(10));
        assert_eq!(Duration::from_secs(900), backoff_delay(30));
    }
}
