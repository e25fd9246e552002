//-
// Copyright (c) 2024, 2025, Jason Lingle
//
// This file is part of Smtpin.
//
// Smtpin is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Smtpin is distributed  in the hope that it  will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty  of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Smtpin. If not, see <http://www.gnu.org/licenses/>.

//! Response codes from RFC 5321 and enhanced status codes from RFC 3463,
//! plus the `SmtpResponse` bundle the policy layer hands back to the
//! session.
//!
//! The module is designed to be wildcard-imported, and defines submodules
//! with short names for accessing the enum values in a consistent way.
#![allow(dead_code)]

use std::borrow::Cow;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    HelpMessage = 214,
    ServiceReady = 220,
    ServiceClosing = 221,
    Ok = 250,
    CannotVerify = 252,
    StartMailInput = 354,
    ServiceNotAvailableClosing = 421,
    ActionNotTakenTemporary = 450,
    ActionAborted = 451,
    // Also used for "too many recipients"
    InsufficientStorage = 452,
    AuthenticationFailure = 454,
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    ActionNotTakenPermanent = 550,
    ExceededStorageAllocation = 552,
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

/// Subject+detail of the enhanced status code, encoded as
/// `subject * 10 + detail` for one-digit details and `subject * 100 +
/// detail` for two-digit details (values >= 100).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum SubjectCode {
    Undefined = 0,
    OtherAddressStatus = 10,
    BadDestinationMailboxAddress = 11,
    DestinationAddressValid = 15,
    BadSenderMailboxAddressSyntax = 17,
    BadSenderSystemAddress = 18,
    MessageLengthExceedsLimit = 23,
    OtherMailSystem = 30,
    MailSystemFull = 31,
    SystemNotAcceptingNetworkMessages = 32,
    MessageTooBigForSystem = 34,
    SystemIncorrectlyConfigured = 35,
    BadConnection = 42,
    OtherProtocolStatus = 50,
    InvalidCommand = 51,
    SyntaxError = 52,
    TooManyRecipients = 53,
    InvalidCommandArguments = 54,
    BareLineFeed = 611,
    OtherSecurity = 70,
    DeliveryNotAuthorised = 71,
    SecurityFeaturesNotSupported = 74,
    SpfValidationFailure = 723,
}

pub mod sc {
    pub use super::SubjectCode::*;
}

/// An SMTP response, excluding the continuation/final distinction.
#[derive(Clone, Debug)]
pub struct SmtpResponse<'a>(
    pub PrimaryCode,
    pub Option<(ClassCode, SubjectCode)>,
    pub Cow<'a, str>,
);

impl SmtpResponse<'_> {
    /// Whether the session must be torn down after this response is sent.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.0,
            pc::ServiceClosing | pc::ServiceNotAvailableClosing,
        )
    }
}

impl fmt::Display for SmtpResponse<'_> {
    /// Formats the response body after the code+indicator, i.e. the
    /// enhanced status code (if any) and the text.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some((class, subject)) = self.1 {
            let subject = subject as u16;
            let split = if subject >= 100 { 100 } else { 10 };
            write!(
                f,
                "{}.{}.{} ",
                class as u8,
                subject / split,
                subject % split,
            )?;
        }
        write!(f, "{}", self.2)
    }
}
