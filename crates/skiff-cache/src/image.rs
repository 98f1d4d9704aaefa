//! Image metadata index, persisted to the port-layer KV store.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_error::{EngineError, Result};
use skiff_portlayer::KvStore;
use tracing::{debug, warn};

use crate::trie::{IdTrie, PrefixLookup};

/// KV key the serialized cache lives under.
pub const IMAGE_CACHE_KEY: &str = "images";

const DEFAULT_TAG: &str = "latest";
const DIGEST_PREFIX: &str = "sha256:";

/// Container defaults carried by an image and applied at create time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageDefaults {
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    /// Anonymous volume destinations declared by the image.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Cached image metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Content-addressed id, canonically stored with the `sha256:` prefix.
    pub image_id: String,
    pub layer_id: String,
    /// Repository-qualified name without tag.
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub digests: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
    pub size: i64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub config: ImageDefaults,
}

/// Persisted shape. The prefix trie is rebuilt from `CacheByID` on load.
#[derive(Serialize, Deserialize, Default)]
struct Persisted {
    #[serde(rename = "CacheByID")]
    by_id: HashMap<String, ImageConfig>,
    #[serde(rename = "CacheByName")]
    by_name: HashMap<String, ImageConfig>,
}

struct Inner {
    by_id: HashMap<String, ImageConfig>,
    by_name: HashMap<String, ImageConfig>,
    trie: IdTrie,
}

/// In-memory image index keyed by id, reference, and short-id prefix.
pub struct ImageCache {
    inner: RwLock<Inner>,
}

fn canonical_id(id: &str) -> String {
    if id.starts_with(DIGEST_PREFIX) {
        id.to_string()
    } else {
        format!("{DIGEST_PREFIX}{id}")
    }
}

fn raw_id(id: &str) -> &str {
    id.strip_prefix(DIGEST_PREFIX).unwrap_or(id)
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                trie: IdTrie::new(),
            }),
        }
    }

    /// Indexes an image by canonical id and by each `name:tag` reference.
    pub fn add(&self, image: ImageConfig) {
        let mut inner = self.inner.write().expect("image cache lock poisoned");
        let id = canonical_id(&image.image_id);
        inner.trie.insert(raw_id(&id));
        if image.tags.is_empty() {
            inner.by_name.insert(image.name.clone(), image.clone());
        }
        for tag in &image.tags {
            inner
                .by_name
                .insert(format!("{}:{tag}", image.name), image.clone());
        }
        let mut image = image;
        image.image_id = id.clone();
        inner.by_id.insert(id, image);
    }

    /// Resolves an id, digest, reference, or short-id prefix.
    ///
    /// Untagged references fall back to `:latest`, and the error message
    /// names the imputed tag so users see what was actually looked up.
    pub fn get(&self, key: &str) -> Result<ImageConfig> {
        let inner = self.inner.read().expect("image cache lock poisoned");
        if key.starts_with(DIGEST_PREFIX) {
            return inner
                .by_id
                .get(key)
                .cloned()
                .ok_or_else(|| EngineError::no_such_image(key));
        }
        if let Some(image) = inner.by_id.get(&canonical_id(key)) {
            return Ok(image.clone());
        }
        if let PrefixLookup::Unique(id) = inner.trie.lookup(key) {
            if let Some(image) = inner.by_id.get(&canonical_id(&id)) {
                return Ok(image.clone());
            }
        }
        if let Some(image) = inner.by_name.get(key) {
            return Ok(image.clone());
        }
        if key.contains(':') {
            return Err(EngineError::no_such_image(key));
        }
        let tagged = format!("{key}:{DEFAULT_TAG}");
        inner
            .by_name
            .get(&tagged)
            .cloned()
            .ok_or_else(|| EngineError::no_such_image(tagged))
    }

    /// Removes an image and its references. Returns the evicted config.
    pub fn delete(&self, key: &str) -> Option<ImageConfig> {
        let mut inner = self.inner.write().expect("image cache lock poisoned");
        let id = canonical_id(key);
        let image = inner.by_id.remove(&id)?;
        inner.trie.remove(raw_id(&id));
        inner
            .by_name
            .retain(|_, candidate| canonical_id(&candidate.image_id) != id);
        Some(image)
    }

    /// Snapshot of all cached images.
    pub fn list(&self) -> Vec<ImageConfig> {
        let inner = self.inner.read().expect("image cache lock poisoned");
        inner.by_id.values().cloned().collect()
    }

    /// Writes the cache to the KV store. Best-effort: failures are logged
    /// and never fail the operation that triggered the save.
    pub async fn save(&self, kv: &dyn KvStore) {
        let payload = {
            let inner = self.inner.read().expect("image cache lock poisoned");
            let persisted = Persisted {
                by_id: inner.by_id.clone(),
                by_name: inner.by_name.clone(),
            };
            match serde_json::to_string(&persisted) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to serialize image cache: {}", e);
                    return;
                }
            }
        };
        if let Err(e) = kv.kv_put(IMAGE_CACHE_KEY, &payload).await {
            warn!("failed to persist image cache: {}", e);
        }
    }

    /// Rehydrates the cache from the KV store. An absent key is a fresh
    /// install, not an error.
    pub async fn load(&self, kv: &dyn KvStore) -> Result<()> {
        let Some(payload) = kv.kv_get(IMAGE_CACHE_KEY).await? else {
            debug!("no persisted image cache");
            return Ok(());
        };
        let persisted: Persisted = serde_json::from_str(&payload)
            .map_err(|e| EngineError::internal(format!("decoding image cache: {e}")))?;
        let mut inner = self.inner.write().expect("image cache lock poisoned");
        inner.trie = IdTrie::new();
        for id in persisted.by_id.keys() {
            inner.trie.insert(raw_id(id));
        }
        inner.by_id = persisted.by_id;
        inner.by_name = persisted.by_name;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn image(id: &str, name: &str, tags: &[&str]) -> ImageConfig {
        ImageConfig {
            image_id: id.to_string(),
            layer_id: format!("layer-{id}"),
            name: name.to_string(),
            tags: tags.iter().map(ToString::to_string).collect(),
            digests: Vec::new(),
            parent: None,
            size: 1024,
            created: Utc::now(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: ImageDefaults::default(),
        }
    }

    struct MapKv {
        entries: Mutex<HashMap<String, String>>,
    }

    impl MapKv {
        fn new() -> Self {
            Self {
                entries: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl KvStore for MapKv {
        async fn kv_get(&self, key: &str) -> skiff_error::Result<Option<String>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn kv_put(&self, key: &str, value: &str) -> skiff_error::Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    #[test]
    fn ids_are_normalized_with_digest_prefix() {
        let cache = ImageCache::new();
        cache.add(image("deadbeef01", "busybox", &["latest"]));

        let by_raw = cache.get("deadbeef01").unwrap();
        assert_eq!(by_raw.image_id, "sha256:deadbeef01");
        let by_digest = cache.get("sha256:deadbeef01").unwrap();
        assert_eq!(by_digest.image_id, by_raw.image_id);
    }

    #[test]
    fn short_prefix_and_reference_lookup() {
        let cache = ImageCache::new();
        cache.add(image("deadbeef01", "busybox", &["latest", "1.36"]));

        assert_eq!(cache.get("dead").unwrap().name, "busybox");
        assert_eq!(cache.get("busybox:1.36").unwrap().name, "busybox");
        assert_eq!(cache.get("busybox").unwrap().name, "busybox");
    }

    #[test]
    fn untagged_miss_imputes_latest_in_message() {
        let cache = ImageCache::new();
        let err = cache.get("alpine").unwrap_err();
        assert_eq!(err.to_string(), "No such image: alpine:latest");
    }

    #[test]
    fn delete_drops_references() {
        let cache = ImageCache::new();
        cache.add(image("deadbeef01", "busybox", &["latest"]));
        cache.delete("deadbeef01").unwrap();
        assert!(cache.get("busybox:latest").is_err());
        assert!(cache.get("dead").is_err());
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let kv = MapKv::new();
        let cache = ImageCache::new();
        cache.add(image("deadbeef01", "busybox", &["latest"]));
        cache.save(&kv).await;

        let restored = ImageCache::new();
        restored.load(&kv).await.unwrap();
        assert_eq!(restored.get("dead").unwrap().name, "busybox");
        assert_eq!(restored.get("busybox:latest").unwrap().size, 1024);
    }

    #[tokio::test]
    async fn load_with_no_persisted_state_is_ok() {
        let kv = MapKv::new();
        let cache = ImageCache::new();
        cache.load(&kv).await.unwrap();
        assert!(cache.list().is_empty());
    }
}
