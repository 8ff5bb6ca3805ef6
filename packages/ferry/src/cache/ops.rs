//! The cache-coordinated fetch/push protocol: composing [`super::registry`]'s
//! policy with [`crate::transport`]'s bytes.

use std::path::{Path, PathBuf};

use tap::Tap;
use tracing::{instrument, trace};

use crate::error::{ENOENT, Error};
use crate::tools::ToolRegistry;
use crate::transport;
use crate::url::Transport as UrlTransport;

use super::entry::Flags;
use super::registry::Cache;

fn entry_or_not_found<'a>(cache: &'a Cache, server: &str) -> Result<super::registry::EntryRef<'a>, Error> {
    cache
        .by_server(server)
        .ok_or_else(|| Error::new(format!("no cache entry for server: {server}")).with_code(ENOENT))
}

fn dirname(location: &str) -> &str {
    Path::new(location).parent().and_then(|p| p.to_str()).unwrap_or("")
}

fn basename(location: &str) -> &str {
    Path::new(location).file_name().and_then(|n| n.to_str()).unwrap_or(location)
}

/// Whether `location` is already present in the local cache for `server`.
///
/// Fails with [`ENOENT`] if the server isn't registered or caching isn't
/// enabled for it.
#[instrument(skip(cache))]
pub async fn file_in_cache(cache: &Cache, server: &str, location: &str) -> Result<bool, Error> {
    let entry = entry_or_not_found(cache, server)?;
    if !entry.flags.cache {
        return Err(Error::new(format!("caching is not enabled for server: {server}")).with_code(ENOENT));
    }
    let cache_url = entry
        .cache_url
        .as_ref()
        .expect("cache_url is set iff flags.cache is true, per CacheEntry's invariant");
    let path = cache_url.join(location).to_file_path(Some(UrlTransport::File), false)?;
    Ok(tokio::fs::metadata(path)
        .await
        .is_ok()
        .tap(|present| trace!(server, location, present, "checked cache presence")))
}

/// Whether `location` is already present on the local filesystem for
/// `server`, treating `server`'s remote as if it were local.
///
/// Fails with [`ENOENT`] if `islocal` isn't enabled or the remote isn't a
/// `file` transport.
#[instrument(skip(cache))]
pub async fn file_is_local(cache: &Cache, server: &str, location: &str) -> Result<bool, Error> {
    let entry = entry_or_not_found(cache, server)?;
    if !entry.flags.islocal || entry.remote_url.transport != UrlTransport::File {
        return Err(Error::new(format!("server is not local: {server}")).with_code(ENOENT));
    }
    let path = entry
        .remote_url
        .join(location)
        .to_file_path(Some(UrlTransport::File), false)?;
    Ok(tokio::fs::metadata(path).await.is_ok())
}

/// Ensure `location` is present in the local cache for `server`, fetching
/// it from the remote if necessary.
///
/// A no-op if already cached and `flags.refresh` is unset. With
/// `flags.check_only`, never fetches: a present file is success, a missing
/// one is an error.
#[instrument(skip(cache, tools))]
pub async fn cache_file(cache: &Cache, tools: &ToolRegistry, server: &str, location: &str, flags: &Flags) -> Result<(), Error> {
    let entry = entry_or_not_found(cache, server)?;
    if !entry.resolved_cache(flags) {
        return Err(Error::new(format!("caching is not enabled for server: {server}")).with_code(ENOENT));
    }

    let already_cached = file_in_cache(cache, server, location).await?;

    if already_cached && !flags.refresh {
        return Ok(());
    }
    if flags.check_only {
        return if already_cached {
            Ok(())
        } else {
            Err(Error::new(format!("{location} is not present in the cache for server {server}")).with_code(ENOENT))
        };
    }

    let cache_url = cache.base_url.join(server);
    let dest_dir_url = cache_url.join(dirname(location));
    let dest_dir: PathBuf = dest_dir_url.to_file_path(Some(UrlTransport::File), false)?.into();

    transport::fetch_file(tools, &entry.remote_url, location, &dest_dir, None).await
}

/// Fetch `location` from `server` into `dest_dir/dest_name`, going through
/// the cache when caching is enabled for `server`.
#[instrument(skip(cache, tools))]
pub async fn fetch_file(
    cache: &Cache,
    tools: &ToolRegistry,
    server: &str,
    location: &str,
    dest_dir: &Path,
    dest_name: Option<&str>,
    flags: &Flags,
) -> Result<(), Error> {
    let entry = entry_or_not_found(cache, server)?;

    if entry.resolved_cache(flags) {
        cache_file(cache, tools, server, location, flags).await?;
        let cache_url = cache.base_url.join(server);
        transport::fetch_file(tools, &cache_url, location, dest_dir, dest_name).await
    } else {
        transport::fetch_file(tools, &entry.remote_url, location, dest_dir, dest_name).await
    }
}

/// The resolved path of `server`'s copy of `location`, fetching it if
/// necessary, in preference order: cache, then a local server's own
/// filesystem, then a temp directory as a last resort.
///
/// Returns `(path, is_temp)`; when `is_temp` is true, the caller is
/// responsible for removing the returned directory (or letting
/// [`crate::cache::Cache::temp`]'s shutdown drain handle it).
#[instrument(skip(cache, tools))]
pub async fn fetch_file_path(
    cache: &Cache,
    tools: &ToolRegistry,
    server: &str,
    location: &str,
    flags: &Flags,
) -> Result<(PathBuf, bool), Error> {
    let entry = entry_or_not_found(cache, server)?;

    if entry.resolved_cache(flags) {
        cache_file(cache, tools, server, location, flags).await?;
        let cache_url = cache.base_url.join(server);
        let path = cache_url.join(location).to_file_path(Some(UrlTransport::File), false)?;
        return Ok((PathBuf::from(path), false));
    }

    if entry.resolved_islocal(flags) && entry.remote_url.transport == UrlTransport::File {
        let path = entry
            .remote_url
            .join(location)
            .to_file_path(Some(UrlTransport::File), false)?;
        return Ok((PathBuf::from(path), false));
    }

    let tmp = cache
        .temp
        .mktempdir(std::env::temp_dir().as_path(), "ferry-fetch-")?;
    let tmp_dir = tmp.path().to_path_buf();
    transport::fetch_file(tools, &entry.remote_url, location, &tmp_dir, None).await?;
    std::mem::forget(tmp); // ownership now lives in `cache.temp` until drained
    Ok((tmp_dir.join(basename(location)), true))
}

/// Push `source_file` to `server`'s copy of `location`, and, if caching is
/// enabled, to the cache too — with writeback then gating whether that
/// cache copy also propagates back to the origin.
#[instrument(skip(cache, tools))]
pub async fn push_file(
    cache: &Cache,
    tools: &ToolRegistry,
    source_file: &Path,
    server: &str,
    location: &str,
    flags: &Flags,
) -> Result<(), Error> {
    let entry = entry_or_not_found(cache, server)?;

    if entry.resolved_cache(flags) {
        let cache_url = cache.base_url.join(server);
        transport::push_file(tools, source_file, &cache_url, location, None, entry.flags.try_hardlink).await?;
        writeback(cache, tools, server, location, flags).await
    } else {
        transport::push_file(
            tools,
            source_file,
            &entry.remote_url,
            location,
            entry.flags.push_permissions.as_deref(),
            false,
        )
        .await
    }
}

/// Push the cache's copy of `location` back to `server`'s origin, if
/// writeback resolves to enabled for this call.
#[instrument(skip(cache, tools))]
pub async fn writeback(cache: &Cache, tools: &ToolRegistry, server: &str, location: &str, flags: &Flags) -> Result<(), Error> {
    let entry = entry_or_not_found(cache, server)?;
    if !entry.resolved_writeback(flags) {
        return Ok(());
    }

    let cache_url = cache.base_url.join(server);
    let local_path: PathBuf = cache_url.join(location).to_file_path(Some(UrlTransport::File), false)?.into();

    transport::push_file(
        tools,
        &local_path,
        &entry.remote_url,
        location,
        entry.flags.push_permissions.as_deref(),
        false,
    )
    .await
}

/// Whether `location` is present for `server`, preferring the cache when
/// enabled and deferring to a direct transport check otherwise.
#[instrument(skip(cache, tools))]
pub async fn file_exists(cache: &Cache, tools: &ToolRegistry, server: &str, location: &str, flags: &Flags) -> Result<bool, Error> {
    let entry = entry_or_not_found(cache, server)?;

    if entry.resolved_cache(flags) && file_in_cache(cache, server, location).await? {
        return Ok(true);
    }

    transport::file_exists(tools, &entry.remote_url, location).await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use crate::tools::ToolRegistry;
    use crate::url::Url;

    use super::super::registry::NewEntryFlags;
    use super::*;

    fn local_cache() -> (Cache, tempfile::TempDir, tempfile::TempDir) {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin_dir = tempfile::tempdir().unwrap();
        let cache = Cache::new("test", Url::parse(format!("file://{}", cache_dir.path().display())).unwrap()).unwrap();
        cache
            .new_entry(
                "origin",
                Url::parse(format!("file://{}", origin_dir.path().display())).unwrap(),
                NewEntryFlags {
                    cachable: true,
                    cache: true,
                    islocal: None,
                    writeback: false,
                    push_permissions: None,
                    try_hardlink: false,
                },
            )
            .unwrap();
        (cache, cache_dir, origin_dir)
    }

    #[tokio::test]
    async fn missing_server_is_enoent() {
        let cache = Cache::new("test", Url::parse("file:///tmp/c").unwrap()).unwrap();
        let err = file_in_cache(&cache, "ghost", "x").await.unwrap_err();
        assert_eq!(err.code(), Some(ENOENT));
    }

    #[tokio::test]
    async fn file_in_cache_reflects_presence_of_cache_copy() {
        let (cache, cache_dir, _origin) = local_cache();
        pretty_assert_eq!(file_in_cache(&cache, "origin", "a.txt").await.unwrap(), false);

        let cache_entry_dir = cache_dir.path().join("origin");
        std::fs::create_dir_all(&cache_entry_dir).unwrap();
        std::fs::write(cache_entry_dir.join("a.txt"), b"hi").unwrap();

        pretty_assert_eq!(file_in_cache(&cache, "origin", "a.txt").await.unwrap(), true);
    }

    #[tokio::test]
    async fn file_is_local_reports_enoent_when_islocal_is_false() {
        let (cache, _cache_dir, _origin) = local_cache();
        cache
            .new_entry(
                "remote",
                Url::parse("https://example.com/repo").unwrap(),
                NewEntryFlags {
                    cachable: true,
                    cache: false,
                    islocal: Some(false),
                    writeback: false,
                    push_permissions: None,
                    try_hardlink: false,
                },
            )
            .unwrap();
        let err = file_is_local(&cache, "remote", "a.txt").await.unwrap_err();
        assert_eq!(err.code(), Some(ENOENT));
    }

    #[tokio::test]
    async fn writeback_is_noop_when_resolved_disabled() {
        let (cache, _cache_dir, _origin) = local_cache();
        let tools = ToolRegistry::new();
        // The entry was created with writeback: false and no call override,
        // so this must return without attempting a transport operation
        // (which would fail: no tools are registered).
        writeback(&cache, &tools, "origin", "a.txt", &Flags::default()).await.unwrap();
    }

    #[tokio::test]
    async fn cache_file_check_only_fails_when_absent() {
        let (cache, _cache_dir, _origin) = local_cache();
        let tools = ToolRegistry::new();
        let flags = Flags {
            check_only: true,
            ..Flags::default()
        };
        let err = cache_file(&cache, &tools, "origin", "a.txt", &flags).await.unwrap_err();
        assert_eq!(err.code(), Some(ENOENT));
    }

    #[tokio::test]
    async fn cache_file_check_only_succeeds_when_already_cached() {
        let (cache, cache_dir, _origin) = local_cache();
        let cache_entry_dir = cache_dir.path().join("origin");
        std::fs::create_dir_all(&cache_entry_dir).unwrap();
        std::fs::write(cache_entry_dir.join("a.txt"), b"hi").unwrap();

        let tools = ToolRegistry::new();
        let flags = Flags {
            check_only: true,
            ..Flags::default()
        };
        cache_file(&cache, &tools, "origin", "a.txt", &flags).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_file_path_uses_cache_path_when_cache_enabled() {
        let (cache, cache_dir, _origin) = local_cache();
        let cache_entry_dir = cache_dir.path().join("origin");
        std::fs::create_dir_all(&cache_entry_dir).unwrap();
        std::fs::write(cache_entry_dir.join("a.txt"), b"hi").unwrap();

        let tools = ToolRegistry::new();
        let (path, is_temp) = fetch_file_path(&cache, &tools, "origin", "a.txt", &Flags::default()).await.unwrap();
        assert!(!is_temp);
        pretty_assert_eq!(path, cache_entry_dir.join("a.txt"));
    }

    #[tokio::test]
    async fn fetch_file_path_falls_back_to_local_filesystem_when_cache_disabled() {
        let (cache, _cache_dir, origin_dir) = local_cache();
        std::fs::write(origin_dir.path().join("a.txt"), b"hi").unwrap();

        let tools = ToolRegistry::new();
        let flags = Flags {
            cache: Some(false),
            ..Flags::default()
        };
        let (path, is_temp) = fetch_file_path(&cache, &tools, "origin", "a.txt", &flags).await.unwrap();
        assert!(!is_temp);
        pretty_assert_eq!(path, origin_dir.path().join("a.txt"));
    }
}
