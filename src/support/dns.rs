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

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::rc::{Rc, Weak};

pub use hickory_resolver::Name;

pub type Resolver = hickory_resolver::AsyncResolver<
    hickory_resolver::name_server::GenericConnector<
        hickory_resolver::name_server::TokioRuntimeProvider,
    >,
>;

/// A cache of DNS records shared by the policy predicates and the SPF
/// evaluator.
///
/// Callers create entries in the `New` status as they discover the need for
/// them; `spawn_lookups` turns `New` entries into in-flight tasks on the
/// contextual `LocalSet` and the tasks update the entries as answers come
/// back. With no resolver configured (hermetic tests), `New` entries resolve
/// immediately to `Error`, so a test exercises exactly the records it
/// preloaded.
///
/// When the `Cache` is dropped, in-flight tasks are cancelled. The tasks
/// hold only a `Weak` reference back to the cache.
#[derive(Debug)]
pub struct Cache {
    pub a: CacheMap<Vec<Ipv4Addr>>,
    pub aaaa: CacheMap<Vec<Ipv6Addr>>,
    pub txt: CacheMap<Vec<Rc<str>>>,
    pub mx: CacheMap<Vec<Rc<Name>>>,
    pub ptr: HashMap<IpAddr, Entry<Vec<Rc<Name>>>>,

    notify: Rc<tokio::sync::Notify>,
    in_flight_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            a: Default::default(),
            aaaa: Default::default(),
            txt: Default::default(),
            mx: Default::default(),
            ptr: Default::default(),

            notify: Rc::new(tokio::sync::Notify::new()),
            in_flight_tasks: Default::default(),
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        for task in &self.in_flight_tasks {
            task.abort();
        }
    }
}

// Association lists instead of hash maps: <Name as Hash> allocates heavily,
// and a single session only ever queries a handful of names.
pub type CacheMap<T> = Vec<(Rc<Name>, Entry<T>)>;

#[derive(Debug)]
pub enum Entry<T> {
    /// The query succeeded, and these are its results.
    Ok(T),
    /// The query succeeded and returned no results.
    NotFound,
    /// The query failed.
    Error,
    /// The query is in-flight.
    Pending,
    /// The need for this query was newly discovered.
    New,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheError {
    NotFound,
    Error,
    NotReady,
}

/// Looks `name` up in one of the cache maps.
///
/// If `name` is not present at all, it is added in the `New` status and
/// `NotReady` is returned.
pub fn look_up<'a, T>(
    cache: &'a mut CacheMap<T>,
    name: &Name,
) -> Result<&'a T, CacheError> {
    // Work around https://github.com/rust-lang/rust/issues/54663
    let position = cache.iter().position(|e| &*e.0 == name);
    if let Some(position) = position {
        match cache[position].1 {
            Entry::Ok(ref v) => Ok(v),
            Entry::NotFound => Err(CacheError::NotFound),
            Entry::Error => Err(CacheError::Error),
            Entry::Pending | Entry::New => Err(CacheError::NotReady),
        }
    } else {
        cache.push((Rc::new(name.clone()), Entry::New));
        Err(CacheError::NotReady)
    }
}

pub fn look_up_ptr(
    cache: &mut HashMap<IpAddr, Entry<Vec<Rc<Name>>>>,
    ip: IpAddr,
) -> Result<&'_ [Rc<Name>], CacheError> {
    match *cache.entry(ip).or_insert(Entry::New) {
        Entry::Ok(ref v) => Ok(v),
        Entry::NotFound => Err(CacheError::NotFound),
        Entry::Error => Err(CacheError::Error),
        Entry::Pending | Entry::New => Err(CacheError::NotReady),
    }
}

/// Repeatedly evaluates `look_up` against the cache, kicking off lookups and
/// waiting for progress, until it produces something other than `NotReady`.
pub async fn wait_for<T, F: FnMut(&mut Cache) -> Result<T, CacheError>>(
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    mut look_up: F,
) -> Result<T, CacheError> {
    loop {
        let result = look_up(&mut cache.borrow_mut());
        if !matches!(result, Err(CacheError::NotReady)) {
            return result;
        }

        spawn_lookups(cache, resolver);

        if resolver.is_none() {
            // The lookup was just resolved to `Error` synchronously.
            continue;
        }

        wait_for_progress(cache).await;
    }
}

/// Wait for any lookup in the DNS cache to complete.
///
/// There must have been no await points between the check which found the
/// required name to be `NotReady` and this call.
async fn wait_for_progress(cache: &RefCell<Cache>) {
    let notify = Rc::clone(&cache.borrow().notify);
    notify.notified().await
}

/// Whether an A record exists for `name` — the DNSBL/URIBL probe. Returns
/// the addresses so the caller can ignore sentinel values.
pub async fn lookup_a(
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    name: &Name,
) -> Result<Vec<Ipv4Addr>, CacheError> {
    wait_for(cache, resolver, |cache| {
        look_up(&mut cache.a, name).cloned()
    })
    .await
}

pub async fn lookup_aaaa(
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    name: &Name,
) -> Result<Vec<Ipv6Addr>, CacheError> {
    wait_for(cache, resolver, |cache| {
        look_up(&mut cache.aaaa, name).cloned()
    })
    .await
}

pub async fn lookup_txt(
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    name: &Name,
) -> Result<Vec<Rc<str>>, CacheError> {
    wait_for(cache, resolver, |cache| {
        look_up(&mut cache.txt, name).cloned()
    })
    .await
}

pub async fn lookup_mx(
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    name: &Name,
) -> Result<Vec<Rc<Name>>, CacheError> {
    wait_for(cache, resolver, |cache| {
        look_up(&mut cache.mx, name).cloned()
    })
    .await
}

/// Forward-confirmed reverse DNS.
///
/// Fetches the PTR names for `ip`, then keeps only those whose forward
/// A/AAAA lookup includes `ip` again. The result is sorted by name length
/// (short to long) then lexicographically, with duplicates removed.
pub async fn fcrdns(
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    ip: IpAddr,
) -> Vec<Rc<Name>> {
    let ptrs = match wait_for(cache, resolver, |cache| {
        look_up_ptr(&mut cache.ptr, ip).map(<[_]>::to_vec)
    })
    .await
    {
        Ok(ptrs) => ptrs,
        Err(_) => return Vec::new(),
    };

    let mut confirmed = Vec::<Rc<Name>>::new();
    for name in ptrs {
        let forward = match ip {
            IpAddr::V4(v4) => wait_for(cache, resolver, |cache| {
                look_up(&mut cache.a, &name).cloned()
            })
            .await
            .map(|addrs| addrs.contains(&v4)),
            IpAddr::V6(v6) => wait_for(cache, resolver, |cache| {
                look_up(&mut cache.aaaa, &name).cloned()
            })
            .await
            .map(|addrs| addrs.contains(&v6)),
        };

        if let Ok(true) = forward {
            confirmed.push(name);
        }
    }

    confirmed.sort_by(|a, b| {
        let a = name_str(a);
        let b = name_str(b);
        a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
    });
    confirmed.dedup();
    confirmed
}

/// The lowercased ASCII form of a name, without the trailing dot.
pub fn name_str(name: &Name) -> String {
    let mut s = name.to_ascii().to_lowercase();
    while s.ends_with('.') {
        s.pop();
    }
    s
}

/// Start lookups for any `New` entries.
///
/// Tasks are spawned in the contextual `LocalSet`. If `resolver` is `None`,
/// all new entries resolve immediately to `Error`.
pub fn spawn_lookups(
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
) {
    let mut cache_mut = cache.borrow_mut();
    let cache_mut = &mut *cache_mut;

    cache_mut.in_flight_tasks.retain(|t| !t.is_finished());

    spawn_map_lookups(
        &mut cache_mut.a,
        &mut cache_mut.in_flight_tasks,
        cache,
        resolver,
        |resolver, name| async move {
            resolver
                .ipv4_lookup(name)
                .await
                .map(|r| r.iter().map(|a| a.0).collect::<Vec<_>>())
        },
        |d| &mut d.a,
    );
    spawn_map_lookups(
        &mut cache_mut.aaaa,
        &mut cache_mut.in_flight_tasks,
        cache,
        resolver,
        |resolver, name| async move {
            resolver
                .ipv6_lookup(name)
                .await
                .map(|r| r.iter().map(|a| a.0).collect::<Vec<_>>())
        },
        |d| &mut d.aaaa,
    );
    spawn_map_lookups(
        &mut cache_mut.mx,
        &mut cache_mut.in_flight_tasks,
        cache,
        resolver,
        |resolver, name| async move {
            resolver.mx_lookup(name).await.map(|r| {
                r.iter()
                    .map(|n| Rc::new(n.exchange().clone()))
                    .collect::<Vec<_>>()
            })
        },
        |d| &mut d.mx,
    );
    spawn_map_lookups(
        &mut cache_mut.txt,
        &mut cache_mut.in_flight_tasks,
        cache,
        resolver,
        |resolver, name| async move {
            resolver.txt_lookup(name).await.map(|r| {
                r.iter()
                    .map(|parts| {
                        let len = parts.iter().map(|p| p.len()).sum();
                        let mut combined = Vec::with_capacity(len);
                        for part in parts.iter() {
                            combined.extend_from_slice(part);
                        }

                        String::from_utf8_lossy(&combined).into_owned().into()
                    })
                    .collect::<Vec<_>>()
            })
        },
        |d| &mut d.txt,
    );

    for (&ip, entry) in &mut cache_mut.ptr {
        if !matches!(*entry, Entry::New) {
            continue;
        }

        let Some(resolver) = resolver else {
            *entry = Entry::Error;
            continue;
        };

        *entry = Entry::Pending;

        let cache = Rc::downgrade(cache);
        let resolver = Rc::clone(resolver);
        cache_mut
            .in_flight_tasks
            .push(tokio::task::spawn_local(async move {
                let new_entry =
                    to_entry(resolver.reverse_lookup(ip).await.map(|rev| {
                        rev.iter()
                            .map(|n| Rc::new(n.0.clone()))
                            .collect::<Vec<_>>()
                    }));

                let Some(cache) = Weak::upgrade(&cache) else {
                    return;
                };

                let mut cache = cache.borrow_mut();
                cache.ptr.insert(ip, new_entry);
                cache.notify.notify_waiters();
            }));
    }
}

fn spawn_map_lookups<T, R, F, A>(
    map: &mut CacheMap<T>,
    tasks: &mut Vec<tokio::task::JoinHandle<()>>,
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    run: F,
    access: A,
) where
    R: Future<Output = Result<T, hickory_resolver::error::ResolveError>>
        + 'static,
    F: FnOnce(Rc<Resolver>, Name) -> R + Clone + 'static,
    A: FnOnce(&mut Cache) -> &mut CacheMap<T> + Clone + 'static,
{
    for entry in map {
        if !matches!(entry.1, Entry::New) {
            continue;
        }

        let Some(resolver) = resolver else {
            entry.1 = Entry::Error;
            continue;
        };

        entry.1 = Entry::Pending;

        let run = run.clone();
        let access = access.clone();
        let cache = Rc::downgrade(cache);
        let resolver = Rc::clone(resolver);
        let name = Rc::clone(&entry.0);
        tasks.push(tokio::task::spawn_local(async move {
            let mut name_clone = (*name).clone();
            name_clone.set_fqdn(true);
            let new_entry = to_entry(run(resolver, name_clone).await);

            let Some(cache) = Weak::upgrade(&cache) else {
                return;
            };
            let mut cache = cache.borrow_mut();
            for entry in access(&mut cache) {
                if name == entry.0 {
                    entry.1 = new_entry;
                    break;
                }
            }
            cache.notify.notify_waiters();
        }));
    }
}

fn to_entry<T>(
    r: Result<T, hickory_resolver::error::ResolveError>,
) -> Entry<T> {
    use hickory_resolver::error::ResolveErrorKind as Rek;

    match r {
        Ok(v) => Entry::Ok(v),
        Err(e) => match *e.kind() {
            Rek::NoRecordsFound { .. } => Entry::NotFound,
            _ => Entry::Error,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    fn run_local<F: Future>(f: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        rt.block_on(local.run_until(f))
    }

    #[test]
    fn preloaded_cache_is_authoritative() {
        run_local(async {
            let cache = Rc::new(RefCell::new(Cache::default()));
            cache.borrow_mut().a.push((
                Rc::new(name("mail.example.com")),
                Entry::Ok(vec!["192.0.2.3".parse().unwrap()]),
            ));

            let addrs =
                lookup_a(&cache, None, &name("mail.example.com")).await;
            assert_eq!(
                Ok(vec!["192.0.2.3".parse::<Ipv4Addr>().unwrap()]),
                addrs,
            );

            // Anything not preloaded fails rather than hanging.
            assert_eq!(
                Err(CacheError::Error),
                lookup_a(&cache, None, &name("other.example.com")).await,
            );
        });
    }

    #[test]
    fn fcrdns_confirms_and_orders() {
        run_local(async {
            let ip: IpAddr = "192.0.2.3".parse().unwrap();
            let cache = Rc::new(RefCell::new(Cache::default()));
            {
                let mut c = cache.borrow_mut();
                c.ptr.insert(
                    ip,
                    Entry::Ok(vec![
                        Rc::new(name("zz.example.com.")),
                        Rc::new(name("mail.example.com.")),
                        Rc::new(name("mx.example.com.")),
                        Rc::new(name("mx.example.com.")),
                        Rc::new(name("liar.example.com.")),
                    ]),
                );
                for confirmed in
                    ["zz.example.com.", "mail.example.com.", "mx.example.com."]
                {
                    c.a.push((
                        Rc::new(name(confirmed)),
                        Entry::Ok(vec!["192.0.2.3".parse().unwrap()]),
                    ));
                }
                // The liar's A record points elsewhere.
                c.a.push((
                    Rc::new(name("liar.example.com.")),
                    Entry::Ok(vec!["198.51.100.1".parse().unwrap()]),
                ));
            }

            let names = fcrdns(&cache, None, ip).await;
            let names =
                names.iter().map(|n| name_str(n)).collect::<Vec<_>>();
            // Short before long, ties lexicographic, duplicates gone.
            assert_eq!(
                vec![
                    "mx.example.com".to_owned(),
                    "zz.example.com".to_owned(),
                    "mail.example.com".to_owned(),
                ],
                names,
            );
        });
    }

    #[test]
    fn fcrdns_no_ptr() {
        run_local(async {
            let cache = Rc::new(RefCell::new(Cache::default()));
            let names =
                fcrdns(&cache, None, "192.0.2.99".parse().unwrap()).await;
            assert!(names.is_empty());
        });
    }
}
