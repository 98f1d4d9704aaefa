//! In-memory indices for containers and images.
//!
//! The container cache is the personality's fast path for name, id, and
//! id-prefix resolution; the image cache additionally persists itself to the
//! port-layer key-value store so image metadata survives restarts.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod container;
mod image;
mod trie;

pub use container::{CacheEntry, ContainerCache};
pub use image::{ImageCache, ImageConfig, ImageDefaults, IMAGE_CACHE_KEY};
pub use trie::{IdTrie, PrefixLookup};
