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

//! The "bridge" between the SMTP protocol server and the submission
//! service.
//!
//! The server and the service are modelled as separate actors so each can
//! be a single async function, with the message body streamed between them
//! rather than buffered twice.
//!
//! Data passed from the server to the service are "requests", and data
//! passed the other way are "responses".

use std::borrow::Cow;

use tokio::sync::oneshot;

use super::codes::*;

/// An SMTP response, excluding the continuation/final distinction.
#[derive(Clone, Debug)]
pub struct SmtpResponse<'a>(
    pub PrimaryCode,
    pub Option<(ClassCode, SubjectCode)>,
    pub Cow<'a, str>,
);

impl SmtpResponse<'static> {
    /// Generates a response for a sequence error which the server should
    /// have prevented.
    #[cfg(not(test))]
    pub fn internal_sequence_error() -> Self {
        Self(
            pc::BadSequenceOfCommands,
            Some((cc::PermFail, sc::InvalidCommand)),
            Cow::Borrowed("Unexpected command"),
        )
    }

    #[cfg(test)]
    pub fn internal_sequence_error() -> Self {
        panic!("Unexpected command")
    }
}

pub struct Request {
    pub payload: RequestPayload,
    /// The channel on which the primary response is sent.
    pub respond: oneshot::Sender<Result<(), SmtpResponse<'static>>>,
}

pub enum RequestPayload {
    Helo(HeloRequest),
    Auth(AuthRequest),
    Mail(MailRequest),
    Recipient(RecipientRequest),
    Data(DataRequest),
    Reset,
}

/// The HELO/EHLO command.
///
/// This occurs twice on a connection where the remote host uses STARTTLS,
/// and the service drops any authentication state when it does.
pub struct HeloRequest {
    pub command: String,
    pub host: String,
    pub tls: Option<String>,
}

/// A decoded AUTH exchange, whichever mechanism carried it.
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

/// A `MAIL FROM` command.
pub struct MailRequest {
    pub from: String,
}

/// An `RCPT TO` command.
pub struct RecipientRequest {
    pub to: String,
}

/// The start of the message data.
///
/// Upon receiving `DataRequest`, the service immediately indicates on the
/// request's `respond` channel whether it wishes to accept a transfer. It
/// then consumes `data` until EOF.
///
/// Once the server has streamed the whole body, it sends a sender over
/// `result`, on which the service must deliver the final verdict for the
/// transaction. If the server instead aborted the transfer (oversize,
/// malformed lines), it drops `result` and the service discards what it
/// buffered.
pub struct DataRequest {
    pub data: tokio::io::DuplexStream,
    pub result: oneshot::Receiver<
        oneshot::Sender<Result<(), SmtpResponse<'static>>>,
    >,
}
