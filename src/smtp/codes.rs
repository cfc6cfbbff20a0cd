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

//! Response codes from RFC 5321/4954, and extended response codes from
//! RFC 1893.
//!
//! The module is designed to be wildcard-imported, and defines submodules
//! with short names for accessing the enum values in a consistent way.
#![allow(dead_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    SystemStatus = 211,
    ServiceReady = 220,
    ServiceClosing = 221,
    AuthenticationSucceeded = 235,
    Ok = 250,
    CannotVerify = 252,
    ServerChallenge = 334,
    StartMailInput = 354,
    ServiceNotAvailableClosing = 421,
    ActionNotTakenTemporary = 450,
    TlsNotAvailable = 454,
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    CommandParameterNotImplemented = 504,
    AuthenticationRequired = 530,
    AuthenticationCredentialsInvalid = 535,
    ActionNotTakenPermanent = 550,
    ExceededStorageAllocation = 552,
    MailboxNameNotAllowed = 553,
    TransactionFailed = 554,
}

pub mod pc {
    pub use super::PrimaryCode::*;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClassCode {
    Success = 2,
    TempFail = 4,
    PermFail = 5,
}

pub mod cc {
    pub use super::ClassCode::*;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SubjectCode {
    Undefined = 0,
    BadDestinationMailboxAddressSyntax = 13,
    DestinationAddressValid = 15,
    BadSenderMailboxAddressSyntax = 17,
    MessageLengthExceedsLimit = 23,
    OtherMailSystem = 30,
    SystemNotAcceptingNetworkMessages = 32,
    OtherProtocolStatus = 50,
    InvalidCommand = 51,
    SyntaxError = 52,
    TooManyRecipients = 53,
    InvalidCommandArguments = 54,
    OtherSecurity = 70,
    DeliveryNotAuthorised = 71,
    AuthenticationCredentialsInvalid = 78,
}

pub mod sc {
    pub use super::SubjectCode::*;
}
