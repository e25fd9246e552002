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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text included at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data, so the identity
/// the peer eventually claims in HELO/EHLO shows up in log lines emitted by
/// code that was handed the prefix earlier.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    protocol: String,
    peer: Option<String>,
    helo: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                peer: None,
                helo: None,
            })),
        }
    }

    /// Sets the peer address, as from `getpeername()`.
    pub fn set_peer(&self, peer: String) {
        self.inner.lock().unwrap().peer = Some(peer);
    }

    /// Sets the identity the peer claimed in HELO/EHLO.
    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.protocol)?;
        if let Some(ref peer) = inner.peer {
            write!(f, "[{}", peer)?;
            if let Some(ref helo) = inner.helo {
                write!(f, " {}", helo)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}
