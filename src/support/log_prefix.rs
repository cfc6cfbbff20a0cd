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

use std::fmt;
use std::rc::Rc;
use std::cell::RefCell;

/// Tracks text included at the start of every log statement for a
/// connection.
///
/// Clones of a `LogPrefix` share the same underlying data, so the service
/// half of a session can set the user and have it show up in lines logged
/// by the protocol half.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Clone)]
struct Inner {
    protocol: String,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                protocol,
                user: None,
            })),
        }
    }

    pub fn set_user(&self, user: String) {
        self.inner.borrow_mut().user = Some(user);
    }

    pub fn clear_user(&self) {
        self.inner.borrow_mut().user = None;
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        write!(f, "{}", inner.protocol)?;
        if let Some(ref user) = inner.user {
            write!(f, "[{user}]")?;
        }
        Ok(())
    }
}
