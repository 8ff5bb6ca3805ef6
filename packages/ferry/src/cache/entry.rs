//! [`CacheEntry`] and the per-call flag override record, plus the
//! three-valued flag-resolution rules that tie them together.

use std::sync::RwLock;

use crate::url::Url;

/// The caching policy attached to a [`CacheEntry`] at construction time.
///
/// `writeback` is the one field that can change after construction (via
/// [`CacheEntry::set_writeback`]); everything else is fixed for the
/// entry's lifetime, matching the "immutable after creation except for
/// `flags.writeback`" invariant.
#[derive(Debug)]
pub struct CacheEntryFlags {
    pub cachable: bool,
    pub cache: bool,
    pub islocal: bool,
    writeback: RwLock<bool>,
    pub push_permissions: Option<String>,
    pub try_hardlink: bool,
}

impl CacheEntryFlags {
    pub fn writeback(&self) -> bool {
        *self.writeback.read().expect("writeback flag lock poisoned")
    }

    pub fn set_writeback(&self, value: bool) {
        *self.writeback.write().expect("writeback flag lock poisoned") = value;
    }
}

/// Per-call overrides for [`crate::cache::ops`] functions.
///
/// `cache`/`islocal`/`writeback` are three-valued (`None` means "defer to
/// the entry"); see [`resolve_cache`]/[`resolve_islocal`]/[`resolve_writeback`]
/// for the merge rule. `refresh` and `check_only` only apply to
/// [`crate::cache::ops::cache_file`] and have no entry-level counterpart.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub cache: Option<bool>,
    pub islocal: Option<bool>,
    pub writeback: Option<bool>,
    pub refresh: bool,
    pub check_only: bool,
}

/// `cache`/`islocal` resolution: per-call `true` forces on, per-call
/// `false` forces off, absence defers to the entry.
pub fn resolve_cache(entry_value: bool, call_value: Option<bool>) -> bool {
    call_value == Some(true) || (entry_value && call_value != Some(false))
}

/// Same merge rule as [`resolve_cache`]; kept as a distinct name because
/// `islocal` and `cache` resolve independently even though the formula is
/// identical.
pub fn resolve_islocal(entry_value: bool, call_value: Option<bool>) -> bool {
    resolve_cache(entry_value, call_value)
}

/// `writeback` resolution: enabled unless the call explicitly disables it,
/// or the entry defaults to disabled and the call doesn't explicitly
/// re-enable it.
pub fn resolve_writeback(entry_value: bool, call_value: Option<bool>) -> bool {
    let call_disables = call_value == Some(false);
    let entry_disables_without_override = !entry_value && call_value != Some(true);
    !call_disables && !entry_disables_without_override
}

/// A single server's cache/transport policy.
///
/// Fields other than `flags.writeback` are set once at construction (via
/// [`crate::cache::Cache::new_entry`]) and never change afterward.
#[derive(Debug)]
pub struct CacheEntry {
    pub server: String,
    pub remote_url: Url,
    /// Set iff `flags.cache` is true at creation time.
    pub cache_url: Option<Url>,
    pub flags: CacheEntryFlags,
}

impl CacheEntry {
    pub(crate) fn new(
        server: String,
        remote_url: Url,
        cache_url: Option<Url>,
        cachable: bool,
        cache: bool,
        islocal: bool,
        writeback: bool,
        push_permissions: Option<String>,
        try_hardlink: bool,
    ) -> Self {
        Self {
            server,
            remote_url,
            cache_url,
            flags: CacheEntryFlags {
                cachable,
                cache,
                islocal,
                writeback: RwLock::new(writeback),
                push_permissions,
                try_hardlink,
            },
        }
    }

    pub fn resolved_cache(&self, call: &Flags) -> bool {
        resolve_cache(self.flags.cache, call.cache)
    }

    pub fn resolved_islocal(&self, call: &Flags) -> bool {
        resolve_islocal(self.flags.islocal, call.islocal)
    }

    pub fn resolved_writeback(&self, call: &Flags) -> bool {
        resolve_writeback(self.flags.writeback(), call.writeback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    // cache/islocal: true iff f=true OR (entry=true AND f != false)
    #[test_case(true, Some(true), true; "entry_true_call_true")]
    #[test_case(true, Some(false), false; "entry_true_call_false")]
    #[test_case(true, None, true; "entry_true_call_absent")]
    #[test_case(false, Some(true), true; "entry_false_call_true")]
    #[test_case(false, Some(false), false; "entry_false_call_false")]
    #[test_case(false, None, false; "entry_false_call_absent")]
    fn cache_resolution_matches_truth_table(entry: bool, call: Option<bool>, expected: bool) {
        assert_eq!(resolve_cache(entry, call), expected);
        assert_eq!(resolve_islocal(entry, call), expected);
    }

    // writeback: true iff NOT(f=false OR (entry=false AND f != true))
    #[test_case(true, Some(true), true; "entry_true_call_true")]
    #[test_case(true, Some(false), false; "entry_true_call_false")]
    #[test_case(true, None, true; "entry_true_call_absent")]
    #[test_case(false, Some(true), true; "entry_false_call_true")]
    #[test_case(false, Some(false), false; "entry_false_call_false")]
    #[test_case(false, None, false; "entry_false_call_absent")]
    fn writeback_resolution_matches_truth_table(entry: bool, call: Option<bool>, expected: bool) {
        assert_eq!(resolve_writeback(entry, call), expected);
    }

    #[test]
    fn set_writeback_is_the_only_legal_mutation() {
        let entry = CacheEntry::new(
            "s1".into(),
            Url::parse("file:///src").unwrap(),
            None,
            true,
            false,
            true,
            false,
            None,
            false,
        );
        assert!(!entry.flags.writeback());
        entry.flags.set_writeback(true);
        assert!(entry.flags.writeback());
    }
}
