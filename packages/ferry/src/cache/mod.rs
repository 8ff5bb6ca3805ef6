//! Cache policy ([`entry`], [`registry`]) and the operations built on top of
//! it ([`ops`]).

pub mod entry;
pub mod ops;
pub mod registry;

pub use entry::{CacheEntry, CacheEntryFlags, Flags, resolve_cache, resolve_islocal, resolve_writeback};
pub use ops::{cache_file, fetch_file, fetch_file_path, file_exists, file_in_cache, file_is_local, push_file, writeback};
pub use registry::{Cache, DelayedOption, EntryRef, NewEntryFlags, setup_cache, setup_cache_apply_opts, setup_cache_local};
