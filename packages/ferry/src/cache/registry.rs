//! The server→[`CacheEntry`] registry: construction, alias resolution, and
//! lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::instrument;

use crate::config::Config;
use crate::error::{CONFIG_ERROR, EEXIST, Error};
use crate::tempreg::TempRegistry;
use crate::url::{Transport, Url};

use super::entry::CacheEntry;

#[derive(Default)]
struct Entries {
    order: Vec<CacheEntry>,
    index: HashMap<String, usize>,
}

/// A server→cache-entry registry.
///
/// Created once per process after config load and never destroyed. New
/// entries may be added throughout setup but never removed; the one
/// in-flight mutation allowed after setup is flipping a single entry's
/// `writeback` flag (see [`CacheEntry::flags`][super::entry::CacheEntry]).
///
/// This type does not itself enforce mutual exclusion across concurrent
/// *processes* sharing the same on-disk cache directory — that's the job
/// of an external lock-directory mechanism the caller is expected to hold
/// before touching `base_url.path`.
pub struct Cache {
    pub name: String,
    pub base_url: Url,
    entries: RwLock<Entries>,
    /// Outstanding temp dirs created by [`crate::cache::ops::fetch_file_path`]'s
    /// fallback path, drained on orderly shutdown.
    pub temp: TempRegistry,
}

/// A read-only view of a [`CacheEntry`] borrowed out of a [`Cache`].
///
/// Exists because entries live behind a `RwLock<Vec<_>>`: this wraps the
/// read guard so callers can treat the return value of [`Cache::by_server`]
/// like an ordinary reference.
pub struct EntryRef<'a> {
    guard: std::sync::RwLockReadGuard<'a, Entries>,
    index: usize,
}

impl<'a> std::ops::Deref for EntryRef<'a> {
    type Target = CacheEntry;

    fn deref(&self) -> &CacheEntry {
        &self.guard.order[self.index]
    }
}

/// Fields describing a new entry's caching policy; either supplied
/// directly or inherited from an alias target.
#[derive(Debug, Clone, Default)]
pub struct NewEntryFlags {
    pub cachable: bool,
    pub cache: bool,
    pub islocal: Option<bool>,
    pub writeback: bool,
    pub push_permissions: Option<String>,
    pub try_hardlink: bool,
}

impl Cache {
    /// Create an empty cache rooted at `base_url`, which must be a `file`
    /// URL.
    pub fn new(name: impl Into<String>, base_url: Url) -> Result<Self, Error> {
        if base_url.transport != Transport::File {
            return Err(
                Error::new(format!("cache base URL must use the file transport, got {}", base_url.transport))
                    .with_code(CONFIG_ERROR),
            );
        }
        Ok(Self {
            name: name.into(),
            base_url,
            entries: RwLock::new(Entries::default()),
            temp: TempRegistry::new(),
        })
    }

    /// Add a directly-specified entry: `remote_url` and `flags` are given
    /// outright, and the cache path (if caching) is synthesized under this
    /// cache's base.
    #[instrument(skip(self, flags), fields(cache = %self.name, server))]
    pub fn new_entry(&self, server: impl Into<String>, remote_url: Url, flags: NewEntryFlags) -> Result<(), Error> {
        let server = server.into();
        let islocal = flags.islocal.unwrap_or(remote_url.transport == Transport::File);
        let cache = flags.cachable && flags.cache;
        let cache_url = cache.then(|| self.base_url.join(&server));

        let entry = CacheEntry::new(
            server.clone(),
            remote_url,
            cache_url,
            flags.cachable,
            cache,
            islocal,
            flags.writeback,
            flags.push_permissions,
            flags.try_hardlink,
        );

        self.insert(server, entry)
    }

    /// Add an alias entry: resolves `alias_server`'s `remote_url`/`cache_url`
    /// joined with `alias_location`, inheriting its flags.
    #[instrument(skip(self), fields(cache = %self.name, server, alias_server, alias_location))]
    pub fn new_alias_entry(&self, server: impl Into<String>, alias_server: &str, alias_location: &str) -> Result<(), Error> {
        let server = server.into();
        let alias = self
            .by_server(alias_server)
            .ok_or_else(|| Error::new(format!("alias target server not found: {alias_server}")).with_code(crate::error::ENOENT))?;

        let remote_url = alias.remote_url.join(alias_location);
        let cache_url = alias.cache_url.as_ref().map(|base| base.join(alias_location));
        let entry = CacheEntry::new(
            server.clone(),
            remote_url,
            cache_url,
            alias.flags.cachable,
            alias.flags.cache,
            alias.flags.islocal,
            alias.flags.writeback(),
            alias.flags.push_permissions.clone(),
            alias.flags.try_hardlink,
        );
        drop(alias);

        self.insert(server, entry)
    }

    fn insert(&self, server: String, entry: CacheEntry) -> Result<(), Error> {
        let mut entries = self.entries.write().expect("cache entries lock poisoned");
        if entries.index.contains_key(&server) {
            return Err(Error::new(format!("duplicate server name: {server}")).with_code(EEXIST));
        }
        let index = entries.order.len();
        entries.order.push(entry);
        entries.index.insert(server, index);
        Ok(())
    }

    /// O(1) lookup by server name.
    pub fn by_server(&self, server: &str) -> Option<EntryRef<'_>> {
        let guard = self.entries.read().expect("cache entries lock poisoned");
        let index = *guard.index.get(server)?;
        Some(EntryRef { guard, index })
    }

    /// Linear scan by remote or cache URL; ties are broken by insertion
    /// order (the order entries were added in).
    pub fn by_url(&self, url: &Url) -> Option<EntryRef<'_>> {
        let guard = self.entries.read().expect("cache entries lock poisoned");
        let index = guard
            .order
            .iter()
            .position(|entry| &entry.remote_url == url || entry.cache_url.as_ref() == Some(url))?;
        Some(EntryRef { guard, index })
    }

    /// The number of registered entries. Exposed mainly for tests.
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache entries lock poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An `--writeback`/`--no-writeback <server>` override buffered before the
/// `Cache` exists, drained by [`apply_delayed_opts`] once it does.
///
/// Draining is one-shot: a drained registry is left empty, matching the
/// "consumed" sentinel in the original design.
#[derive(Debug, Clone)]
pub struct DelayedOption {
    pub server: String,
    pub writeback: bool,
}

/// Expand `%u` in `cfg.cache.path`, derive the cache base URL, and add one
/// entry per configured server.
#[instrument(skip(config))]
pub fn setup_cache(config: &Config) -> Result<Cache, Error> {
    let base_url = Url::parse(format!("file://{}", config.cache.path))?;
    let cache = Cache::new("default", base_url)?;

    for (name, server) in &config.server {
        let remote_url = Url::parse(&server.url)?;
        let flags = NewEntryFlags {
            cachable: server.cachable,
            cache: server.cache.unwrap_or(config.cache.enabled),
            islocal: server.islocal,
            writeback: server.writeback.unwrap_or(false),
            push_permissions: server.push_permissions.clone(),
            try_hardlink: true,
        };
        cache.new_entry(name.clone(), remote_url, flags)?;

        for alias in &server.alias {
            cache.new_alias_entry(alias.clone(), name, "")?;
        }
    }

    Ok(cache)
}

/// Add the two fixed-name entries the build tool expects to always exist:
/// the project root itself, and a "project storage" alias rooted under the
/// `projects` server.
#[instrument(skip(cache))]
pub fn setup_cache_local(cache: &Cache, project_root: &str, project_location: &str) -> Result<(), Error> {
    let root_url = Url::parse(format!("file://{project_root}"))?;
    cache.new_entry(
        "project",
        root_url,
        NewEntryFlags {
            cachable: false,
            cache: false,
            islocal: Some(true),
            writeback: true,
            push_permissions: None,
            try_hardlink: true,
        },
    )?;

    if cache.by_server("projects").is_some() {
        cache.new_alias_entry("proj-storage", "projects", project_location)?;
    }

    Ok(())
}

/// Drain buffered `--writeback`/`--no-writeback` overrides into the now
/// constructed `Cache`. Unknown server names are silently ignored (the CLI
/// may have buffered an override for a server the config doesn't define).
#[instrument(skip(cache, opts))]
pub fn setup_cache_apply_opts(cache: &Cache, opts: Vec<DelayedOption>) {
    for opt in opts {
        if let Some(entry) = cache.by_server(&opt.server) {
            entry.flags.set_writeback(opt.writeback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn cache() -> Cache {
        Cache::new("test", Url::parse("file:///tmp/c").unwrap()).unwrap()
    }

    #[test]
    fn direct_entry_gets_cache_url_under_base_when_cache_enabled() {
        let c = cache();
        c.new_entry(
            "s1",
            Url::parse("https://example/repo").unwrap(),
            NewEntryFlags {
                cachable: true,
                cache: true,
                islocal: None,
                writeback: false,
                push_permissions: None,
                try_hardlink: true,
            },
        )
        .unwrap();

        let entry = c.by_server("s1").unwrap();
        pretty_assert_eq!(entry.cache_url.as_ref().unwrap().to_string(), "file:///tmp/c/s1");
        assert!(!entry.flags.islocal);
    }

    #[test]
    fn uncachable_server_forces_cache_off_regardless_of_request() {
        let c = cache();
        c.new_entry(
            "s1",
            Url::parse("https://example/repo").unwrap(),
            NewEntryFlags {
                cachable: false,
                cache: true,
                islocal: None,
                writeback: false,
                push_permissions: None,
                try_hardlink: true,
            },
        )
        .unwrap();

        let entry = c.by_server("s1").unwrap();
        assert!(!entry.flags.cache);
        assert!(entry.cache_url.is_none());
    }

    #[test]
    fn islocal_defaults_to_true_only_for_file_transport() {
        let c = cache();
        c.new_entry(
            "local",
            Url::parse("file:///srv/data").unwrap(),
            NewEntryFlags::default(),
        )
        .unwrap();
        c.new_entry(
            "remote",
            Url::parse("ssh://host/data").unwrap(),
            NewEntryFlags::default(),
        )
        .unwrap();

        assert!(c.by_server("local").unwrap().flags.islocal);
        assert!(!c.by_server("remote").unwrap().flags.islocal);
    }

    #[test]
    fn duplicate_server_name_is_rejected() {
        let c = cache();
        c.new_entry("s1", Url::parse("file:///a").unwrap(), NewEntryFlags::default())
            .unwrap();
        let err = c
            .new_entry("s1", Url::parse("file:///b").unwrap(), NewEntryFlags::default())
            .unwrap_err();
        assert_eq!(err.code(), Some(EEXIST));
    }

    #[test]
    fn alias_expansion_joins_remote_and_cache_urls() {
        let c = cache();
        c.new_entry(
            "projects",
            Url::parse("ssh://h/p").unwrap(),
            NewEntryFlags {
                cachable: true,
                cache: true,
                islocal: None,
                writeback: false,
                push_permissions: None,
                try_hardlink: true,
            },
        )
        .unwrap();
        c.new_alias_entry("proj-storage", "projects", "sub/dir").unwrap();

        let entry = c.by_server("proj-storage").unwrap();
        pretty_assert_eq!(entry.remote_url.to_string(), "ssh://h/p/sub/dir");
        pretty_assert_eq!(entry.cache_url.as_ref().unwrap().to_string(), "file:///tmp/c/projects/sub/dir");
    }

    #[test]
    fn by_url_breaks_ties_by_insertion_order() {
        let c = cache();
        let url = Url::parse("file:///shared").unwrap();
        c.new_entry(
            "first",
            url.clone(),
            NewEntryFlags {
                cachable: false,
                cache: false,
                islocal: None,
                writeback: false,
                push_permissions: None,
                try_hardlink: true,
            },
        )
        .unwrap();
        c.new_entry(
            "second",
            url.clone(),
            NewEntryFlags {
                cachable: false,
                cache: false,
                islocal: None,
                writeback: false,
                push_permissions: None,
                try_hardlink: true,
            },
        )
        .unwrap();

        pretty_assert_eq!(c.by_url(&url).unwrap().server, "first");
    }

    #[test]
    fn set_writeback_via_delayed_option() {
        let c = cache();
        c.new_entry("s1", Url::parse("file:///a").unwrap(), NewEntryFlags::default())
            .unwrap();
        setup_cache_apply_opts(
            &c,
            vec![DelayedOption {
                server: "s1".into(),
                writeback: true,
            }],
        );
        assert!(c.by_server("s1").unwrap().flags.writeback());
    }
}
