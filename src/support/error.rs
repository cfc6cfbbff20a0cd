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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("No stored credentials; interactive login is required")]
    LoginRequired,
    #[error("Device authorisation timed out")]
    DeviceCodeTimedOut,
    #[error("Device authorisation failed: {0}")]
    DeviceCodeFailed(String),
    #[error("Graph authorisation failed even after a token refresh: {0}")]
    GraphAuth(String),
    #[error("Graph temporary failure ({status}): {message}")]
    GraphRetryable { status: u16, message: String },
    #[error("Graph permanent failure ({status}): {message}")]
    GraphPermanent { status: u16, message: String },
    #[error("Malformed MIME message: {0}")]
    BadMime(&'static str),
    #[error("Malformed queue entry")]
    BadQueueEntry,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// How a failed Graph operation is to be treated by its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; the operation may be retried later (enqueue, back off).
    Retryable,
    /// Authorisation is broken; operations stay blocked until a re-login.
    Auth,
    /// The request itself is unacceptable and will never succeed.
    Permanent,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match *self {
            Error::GraphRetryable { .. } | Error::Http(..) | Error::Io(..) => {
                ErrorClass::Retryable
            },
            Error::GraphAuth(..) | Error::LoginRequired => ErrorClass::Auth,
            _ => ErrorClass::Permanent,
        }
    }
}
