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

pub mod server;
pub mod syntax;

use crate::graph::client::MessageMeta;
use crate::support::error::Error;

/// The mailbox operations the POP3 engine needs; the Graph client is the
/// production implementation.
pub trait MailStore {
    async fn list(
        &self,
        mailbox: &str,
        folder: &str,
    ) -> Result<Vec<MessageMeta>, Error>;
    async fn fetch(&self, mailbox: &str, id: &str) -> Result<Vec<u8>, Error>;
    async fn mark_read(&self, mailbox: &str, id: &str) -> Result<(), Error>;
    async fn delete(&self, mailbox: &str, id: &str) -> Result<(), Error>;
}
