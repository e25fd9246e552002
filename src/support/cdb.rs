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

//! Read-only access to DJB "constant databases".
//!
//! <https://cr.yp.to/cdb/cdb.html>
//!
//! The policy lists (`white`, `black`, `ip-white`, `ip-black`,
//! `accept_domains`, `bad_recipients`, `bad_senders`, `two-level-tlds`,
//! `three-level-tlds`) are cdb files maintained outside this program with
//! `cdbmake`. Only membership matters to us; values are ignored.
//!
//! A session opens each database for the duration of one predicate call, so
//! list updates are picked up by the next connection with no signalling. The
//! files are at most a few hundred kilobytes, so the whole file is read
//! rather than mapped.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

/// The 256 (pos, len) slot-table pointers at the start of every cdb.
const HEADER_LEN: usize = 2048;

pub struct Cdb {
    data: Vec<u8>,
}

impl Cdb {
    /// Opens the database with the given short name under `dir`.
    ///
    /// Returns `None` if the file does not exist or cannot be read; the
    /// caller decides whether an absent list means "accept" or "reject".
    pub fn open(dir: &Path, name: &str) -> Option<Self> {
        let mut path = PathBuf::from(dir);
        path.push(format!("{}.cdb", name));

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                return None;
            },
            Err(e) => {
                warn!("can't read {}: {}", path.display(), e);
                return None;
            },
        };

        if data.len() < HEADER_LEN {
            warn!("{} is not a cdb file", path.display());
            return None;
        }

        Some(Self { data })
    }

    /// Whether `key` is present.
    pub fn lookup(&self, key: &str) -> bool {
        self.lookup_bytes(key.as_bytes())
    }

    fn lookup_bytes(&self, key: &[u8]) -> bool {
        let h = hash(key);
        let table = (h as usize & 0xFF) * 8;
        let tpos = self.u32at(table) as usize;
        let tslots = self.u32at(table + 4) as usize;
        if 0 == tslots {
            return false;
        }

        let start = (h as usize >> 8) % tslots;
        for i in 0..tslots {
            let slot = tpos + 8 * ((start + i) % tslots);
            let Some(rh) = self.try_u32at(slot) else {
                return false;
            };
            let Some(rpos) = self.try_u32at(slot + 4) else {
                return false;
            };
            if 0 == rpos {
                return false;
            }
            if rh != h {
                continue;
            }

            let rpos = rpos as usize;
            let Some(klen) = self.try_u32at(rpos) else {
                return false;
            };
            let kstart = rpos + 8;
            let kend = kstart + klen as usize;
            if kend <= self.data.len() && &self.data[kstart..kend] == key {
                return true;
            }
        }

        false
    }

    fn u32at(&self, off: usize) -> u32 {
        self.try_u32at(off).unwrap_or(0)
    }

    fn try_u32at(&self, off: usize) -> Option<u32> {
        self.data
            .get(off..off + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// The cdb hash: h starts at 5381; h = ((h << 5) + h) ^ c.
fn hash(key: &[u8]) -> u32 {
    let mut h = 5381u32;
    for &c in key {
        h = (h << 5).wrapping_add(h) ^ u32::from(c);
    }
    h
}

/// Looks `domain` up in both its ASCII and (when distinct) UTF-8 forms.
pub fn lookup_domain(cdb: &Cdb, domain: &crate::smtp::syntax::Domain) -> bool {
    if domain.is_empty() {
        return false;
    }
    if cdb.lookup(domain.ascii()) {
        return true;
    }
    domain.is_unicode() && cdb.lookup(domain.utf8())
}

/// Minimal cdb creation, only for building test fixtures.
#[cfg(test)]
pub struct CdbWriter {
    keys: Vec<Vec<u8>>,
}

#[cfg(test)]
impl CdbWriter {
    pub fn new() -> Self {
        Self { keys: Vec::new() }
    }

    pub fn add(&mut self, key: &str) {
        self.keys.push(key.as_bytes().to_vec());
    }

    pub fn write_to(&self, path: &Path) {
        let mut body = Vec::<u8>::new();
        // (hash, file offset) of each record
        let mut pointers = Vec::<(u32, u32)>::new();

        for key in &self.keys {
            let pos = (HEADER_LEN + body.len()) as u32;
            pointers.push((hash(key), pos));
            body.extend_from_slice(&(key.len() as u32).to_le_bytes());
            body.extend_from_slice(&0u32.to_le_bytes());
            body.extend_from_slice(key);
        }

        let mut header = Vec::<u8>::with_capacity(HEADER_LEN);
        let mut tables = Vec::<u8>::new();
        for t in 0..256u32 {
            let entries = pointers
                .iter()
                .filter(|&&(h, _)| h & 0xFF == t)
                .copied()
                .collect::<Vec<_>>();
            let nslots = entries.len() * 2;
            let tpos = HEADER_LEN + body.len() + tables.len();

            header.extend_from_slice(&(tpos as u32).to_le_bytes());
            header.extend_from_slice(&(nslots as u32).to_le_bytes());

            let mut slots = vec![(0u32, 0u32); nslots];
            for &(h, pos) in &entries {
                let mut slot = (h as usize >> 8) % nslots;
                while slots[slot].1 != 0 {
                    slot = (slot + 1) % nslots;
                }
                slots[slot] = (h, pos);
            }
            for (h, pos) in slots {
                tables.extend_from_slice(&h.to_le_bytes());
                tables.extend_from_slice(&pos.to_le_bytes());
            }
        }

        let mut file = header;
        file.extend_from_slice(&body);
        file.extend_from_slice(&tables);
        fs::write(path, file).unwrap();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_and_probe() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut writer = CdbWriter::new();
        writer.add("example.com");
        writer.add("192.0.2.25");
        writer.add("xn--caf-dma.example");
        writer.write_to(&dir.path().join("white.cdb"));

        let cdb = Cdb::open(dir.path(), "white").unwrap();
        assert!(cdb.lookup("example.com"));
        assert!(cdb.lookup("192.0.2.25"));
        assert!(cdb.lookup("xn--caf-dma.example"));
        assert!(!cdb.lookup("example.org"));
        assert!(!cdb.lookup(""));
    }

    #[test]
    fn empty_database() {
        let dir = tempfile::TempDir::new().unwrap();
        CdbWriter::new().write_to(&dir.path().join("accept_domains.cdb"));

        let cdb = Cdb::open(dir.path(), "accept_domains").unwrap();
        assert!(!cdb.lookup("example.com"));
    }

    #[test]
    fn missing_database() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Cdb::open(dir.path(), "no-such-list").is_none());
    }

    #[test]
    fn many_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut writer = CdbWriter::new();
        for i in 0..500 {
            writer.add(&format!("host{}.example", i));
        }
        writer.write_to(&dir.path().join("big.cdb"));

        let cdb = Cdb::open(dir.path(), "big").unwrap();
        for i in 0..500 {
            assert!(cdb.lookup(&format!("host{}.example", i)), "key {}", i);
        }
        assert!(!cdb.lookup("host500.example"));
    }
}
