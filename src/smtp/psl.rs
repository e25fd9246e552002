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

//! The "public suffix list".
//!
//! The data is the list Mozilla maintains:
//! https://github.com/publicsuffix/list
//!
//! `public_suffix_list.dat` is read from the configuration directory when
//! the process starts. Since one process serves one connection, a list
//! update is picked up by the next connection with no signalling. A missing
//! list degrades to the "every TLD is a public suffix" default rule rather
//! than failing the session.
//!
//! `registered_domain` implements the standard algorithm: the prevailing
//! rule is the exception rule if any matches, else the longest match, else
//! the default rule `*`; the registered (organisational) domain is the
//! public suffix plus one more label. A name which *is* a public suffix has
//! no registered domain.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use log::warn;

use crate::support::dns;

#[derive(Default, Debug)]
pub struct PublicSuffixList {
    root: Node,
}

#[derive(Default, Debug)]
struct Node {
    children: HashMap<String, Node>,
    /// A normal rule ends at this node.
    is_suffix: bool,
    /// A `*.` rule hangs below this node.
    wildcard: bool,
    /// Labels excluded from `wildcard` by `!` rules.
    exceptions: HashSet<String>,
}

impl PublicSuffixList {
    /// Loads `public_suffix_list.dat` from `dir`.
    ///
    /// A missing or unreadable file yields the empty list (default rule
    /// only).
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("public_suffix_list.dat");
        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                warn!(
                    "can't read {}, falling back to default rule: {}",
                    path.display(),
                    e,
                );
                Self::default()
            },
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut list = Self::default();

        for line in text.lines() {
            // Everything after whitespace is comment-adjacent junk.
            let line = line.split_whitespace().next().unwrap_or("");
            if line.is_empty() || line.starts_with("//") {
                continue;
            }

            let (rule, kind) = if let Some(rest) = line.strip_prefix('!') {
                (rest, RuleKind::Exception)
            } else if let Some(rest) = line.strip_prefix("*.") {
                (rest, RuleKind::Wildcard)
            } else {
                (line, RuleKind::Normal)
            };

            let ascii = if rule.is_ascii() {
                rule.to_lowercase()
            } else {
                match dns::Name::from_utf8(rule) {
                    Ok(name) => dns::name_str(&name),
                    Err(_) => continue,
                }
            };

            list.insert(&ascii, kind);
        }

        list
    }

    fn insert(&mut self, rule: &str, kind: RuleKind) {
        let mut labels = rule.rsplit('.');

        let leftmost_for_exception = if RuleKind::Exception == kind {
            // `!a.b.c` attaches "a" to the node for "b.c".
            rule.split('.').next().map(str::to_owned)
        } else {
            None
        };

        let mut node = &mut self.root;
        let walk_count = if leftmost_for_exception.is_some() {
            rule.split('.').count() - 1
        } else {
            rule.split('.').count()
        };

        for _ in 0..walk_count {
            let label = labels.next().expect("label count mismatch");
            node = node.children.entry(label.to_owned()).or_default();
        }

        match kind {
            RuleKind::Normal => node.is_suffix = true,
            RuleKind::Wildcard => node.wildcard = true,
            RuleKind::Exception => {
                node.exceptions
                    .insert(leftmost_for_exception.expect("checked above"));
            },
        }
    }

    /// The registered (organisational) domain of `domain`, which must be in
    /// lowercased ASCII form.
    ///
    /// Returns `None` when `domain` is itself a public suffix (or empty).
    pub fn registered_domain(&self, domain: &str) -> Option<String> {
        if domain.is_empty() {
            return None;
        }

        let labels = domain.rsplit('.').collect::<Vec<_>>();

        let mut longest = 0usize;
        let mut exception = None::<usize>;
        let mut node = &self.root;

        for (i, &label) in labels.iter().enumerate() {
            let depth = i + 1;

            if node.wildcard {
                if node.exceptions.contains(label) {
                    exception = Some(depth);
                } else {
                    longest = longest.max(depth);
                }
            }

            match node.children.get(label) {
                Some(child) => {
                    if child.is_suffix {
                        longest = longest.max(depth);
                    }
                    node = child;
                },
                None => break,
            }
        }

        // The exception rule always prevails; its public suffix is the rule
        // with its leftmost label removed. Otherwise the longest match,
        // falling back to the default rule `*`.
        let suffix_len = match exception {
            Some(depth) => depth - 1,
            None => longest.max(1),
        };

        if labels.len() <= suffix_len {
            return None;
        }

        // Keeping k labels means cutting just after the k-th dot from the
        // right, if there is one.
        let keep = suffix_len + 1;
        let start = domain
            .match_indices('.')
            .rev()
            .nth(keep - 1)
            .map(|(ix, _)| ix + 1)
            .unwrap_or(0);
        Some(domain[start..].to_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RuleKind {
    Normal,
    Wildcard,
    Exception,
}
