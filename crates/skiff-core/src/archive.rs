//! Tar fan-in/fan-out across container mounts.
//!
//! Archives never cross the personality intact: each tar entry is routed to
//! the device backing the deepest mount covering its path, and exports are
//! stitched back together from one stream per covered device. Entry bodies
//! pass through verbatim; only headers are parsed, and only for the entry
//! name and size.

use std::sync::Arc;

use chrono::Utc;
use skiff_error::{EngineError, Result};
use skiff_portlayer::PortLayer;
use skiff_portlayer::models::PathStat;
use skiff_portlayer::stream::{ByteReader, ByteWriter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::container::Container;
use crate::filter::{
    Direction, FilterSpec, is_strict_child, join_path, normalize_path, relative_path,
};
use crate::pathtrie::PathTrie;

/// Image store holding container scratch layers.
pub const CONTAINER_STORE: &str = "container";
/// Store holding named and anonymous volumes.
pub const VOLUME_STORE: &str = "volume";

const TAR_BLOCK: usize = 512;
const TAR_TRAILER: [u8; 2 * TAR_BLOCK] = [0; 2 * TAR_BLOCK];

/// Synthesized mode for a mount-destination directory: Go's `os.ModeDir`
/// bit plus conventional permissions, matching what clients expect in the
/// path-stat header.
const DIR_MODE: u32 = (1 << 31) | 0o755;

/// Store and device addressing the filesystem behind one mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub store: String,
    pub device: String,
}

/// Routing table for a container: the root filesystem (the container's
/// scratch device) plus every volume mount.
fn mount_table(container: &Container) -> Vec<(String, DeviceRef)> {
    let mut table = vec![(
        "/".to_string(),
        DeviceRef {
            store: CONTAINER_STORE.to_string(),
            device: container.id.clone(),
        },
    )];
    for mount in &container.mounts {
        table.push((
            normalize_path(&mount.destination),
            DeviceRef {
                store: VOLUME_STORE.to_string(),
                device: mount.name.clone(),
            },
        ));
    }
    table
}

struct ImportSlot {
    device: DeviceRef,
    filter: FilterSpec,
    stream: Option<(ByteWriter, JoinHandle<Result<()>>)>,
}

/// Write side of an archive import.
///
/// Holds one lazily-opened import stream per mount that can receive entries
/// under the destination path. Streams open on first dispatch, so a mount
/// no entry lands on never sees an RPC.
pub struct ArchiveWriterMap {
    portlayer: Arc<dyn PortLayer>,
    dest: String,
    trie: PathTrie<ImportSlot>,
}

impl ArchiveWriterMap {
    #[must_use]
    pub fn new(portlayer: Arc<dyn PortLayer>, container: &Container, dest_path: &str) -> Self {
        let dest = normalize_path(dest_path);
        let mut trie = PathTrie::new();
        for (destination, device) in mount_table(container) {
            let covers = destination == dest || is_strict_child(&dest, &destination);
            let nested = is_strict_child(&destination, &dest);
            if !covers && !nested {
                continue;
            }
            let filter = FilterSpec::for_mount(&dest, &destination, Direction::CopyTo);
            trie.insert(
                &destination,
                ImportSlot {
                    device,
                    filter,
                    stream: None,
                },
            );
        }
        Self {
            portlayer,
            dest,
            trie,
        }
    }

    /// The slot for one tar entry: deepest mount covering
    /// `join(dest, asset_name)`, its stream opened if this is the first
    /// entry routed there.
    async fn slot_for(&mut self, asset: &str) -> Result<&mut ImportSlot> {
        let target = join_path(&self.dest, asset);
        let key = self
            .trie
            .deepest_prefix(&target)
            .ok_or_else(|| EngineError::internal(format!("no device backs {target}")))?;
        let portlayer = Arc::clone(&self.portlayer);
        let slot = self.trie.get_mut(&key).expect("key came from trie walk");
        if slot.stream.is_none() {
            let encoded = slot.filter.encode()?;
            debug!(mount = %key, store = %slot.device.store, device = %slot.device.device,
                "opening import stream");
            let stream = portlayer
                .import_archive(&slot.device.store, &slot.device.device, &encoded)
                .await?;
            slot.stream = Some(stream);
        }
        Ok(slot)
    }

    /// Finishes every opened stream: tar trailer, shutdown, then the RPC
    /// outcome. The first failure is surfaced after all streams are closed.
    pub async fn close(mut self) -> Result<()> {
        let mut first_err = None;
        for key in self.trie.keys() {
            let Some(slot) = self.trie.get_mut(&key) else {
                continue;
            };
            let Some((mut writer, task)) = slot.stream.take() else {
                continue;
            };
            let outcome: Result<()> = async {
                writer.write_all(&TAR_TRAILER).await?;
                writer.shutdown().await?;
                drop(writer);
                task.await
                    .map_err(|e| EngineError::internal(format!("import stream task: {e}")))?
            }
            .await;
            if let Err(e) = outcome {
                warn!(mount = %key, "import stream failed to close: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Splits a tar stream on entry boundaries and routes each entry, header
/// and body verbatim, to its mount's import stream.
pub async fn import_tar<R>(map: &mut ArchiveWriterMap, mut tar_stream: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; TAR_BLOCK];
    loop {
        if !read_block(&mut tar_stream, &mut header).await? {
            break;
        }
        if header.iter().all(|b| *b == 0) {
            // First trailer block; the routed streams get their own
            // trailers at close.
            break;
        }
        let parsed = tar::Header::from_byte_slice(&header);
        let name = String::from_utf8_lossy(&parsed.path_bytes()).into_owned();
        let size = parsed
            .entry_size()
            .map_err(|e| EngineError::bad_request(format!("malformed tar header {name}: {e}")))?;
        let padded = size.div_ceil(TAR_BLOCK as u64) * TAR_BLOCK as u64;

        let slot = map.slot_for(&name).await?;
        let (writer, _) = slot.stream.as_mut().expect("stream opened by slot_for");
        writer.write_all(&header).await?;
        copy_exact(&mut tar_stream, writer, padded).await?;
    }
    Ok(())
}

/// Reads one full tar block. `Ok(false)` means clean EOF on an entry
/// boundary; EOF inside a block is an error.
async fn read_block<R>(reader: &mut R, block: &mut [u8; TAR_BLOCK]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < TAR_BLOCK {
        let n = reader.read(&mut block[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(EngineError::bad_request("truncated tar header"));
        }
        filled += n;
    }
    Ok(true)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, mut remaining: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0_u8; 8192];
    while remaining > 0 {
        let want = usize::try_from(remaining.min(buf.len() as u64)).expect("bounded by buf len");
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(EngineError::bad_request("truncated tar entry"));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// One per-device read in an export fan-out.
#[derive(Debug, Clone)]
pub struct ExportSource {
    pub mount: String,
    pub device: DeviceRef,
    pub filter: FilterSpec,
}

/// Plans the reads for an export of `source_path`: the deepest mount
/// covering the path first (the primary), then every mount rooted under
/// it. Each outer mount excludes the regions owned by inner mounts so
/// overlapping paths appear exactly once.
#[must_use]
pub fn plan_export(container: &Container, source_path: &str) -> Vec<ExportSource> {
    let path = normalize_path(source_path);
    let mut trie = PathTrie::new();
    for (destination, device) in mount_table(container) {
        trie.insert(&destination, device);
    }

    let mut selected: Vec<(String, DeviceRef)> = Vec::new();
    if let Some(primary) = trie.deepest_prefix(&path) {
        let device = trie.get(&primary).cloned().expect("key came from trie walk");
        selected.push((primary, device));
    }
    trie.visit_subtree(&path, |key, device| {
        if selected.iter().all(|(k, _)| k != key) {
            selected.push((key.to_string(), device.clone()));
        }
    });

    selected
        .iter()
        .map(|(dest, device)| {
            let mut filter = FilterSpec::for_mount(&path, dest, Direction::CopyFrom);
            for (other, _) in &selected {
                if is_strict_child(other, dest) {
                    filter.exclude(relative_path(dest, other));
                }
            }
            ExportSource {
                mount: dest.clone(),
                device: device.clone(),
                filter,
            }
        })
        .collect()
}

/// Streams an export as a single tar: the planned per-device streams are
/// opened in turn, concatenated, and capped with one trailer. Devices
/// holding nothing under the path are skipped.
#[must_use]
pub fn export_tar(portlayer: Arc<dyn PortLayer>, sources: Vec<ExportSource>) -> ByteReader {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        for source in sources {
            let encoded = match source.filter.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(mount = %source.mount, "dropping export: {e}");
                    return;
                }
            };
            match portlayer
                .export_archive(&source.device.store, &source.device.device, true, &encoded)
                .await
            {
                Ok(mut stream) => {
                    if let Err(e) = tokio::io::copy(&mut stream, &mut server).await {
                        warn!(mount = %source.mount, "export stream failed: {e}");
                        return;
                    }
                }
                Err(e) if e.is_not_found() => {
                    debug!(mount = %source.mount, "nothing to export");
                }
                Err(e) => {
                    warn!(mount = %source.mount, "export failed: {e}");
                    return;
                }
            }
        }
        let _ = server.write_all(&TAR_TRAILER).await;
        let _ = server.shutdown().await;
    });
    Box::new(client)
}

/// Stats a path inside the container.
///
/// A path landing exactly on a mount destination is answered locally as a
/// directory; the mount root exists by definition even when its device is
/// offline. Everything else is delegated to the device behind the deepest
/// covering mount.
pub async fn stat(
    portlayer: &Arc<dyn PortLayer>,
    container: &Container,
    path: &str,
) -> Result<PathStat> {
    let path = normalize_path(path);
    let mut trie = PathTrie::new();
    for (destination, device) in mount_table(container) {
        trie.insert(&destination, device);
    }

    if trie.get(&path).is_some() {
        let name = path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("/")
            .to_string();
        return Ok(PathStat {
            name,
            mode: DIR_MODE,
            size: 4096,
            mtime: Utc::now(),
            link_target: String::new(),
        });
    }

    let mount = trie
        .deepest_prefix(&path)
        .ok_or_else(|| EngineError::internal(format!("no device backs {path}")))?;
    let device = trie.get(&mount).cloned().expect("key came from trie walk");
    let filter = FilterSpec::for_mount(&path, &mount, Direction::CopyFrom);
    portlayer
        .stat_path(&device.store, &device.device, &filter.encode()?)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakePortLayer, test_container};
    use tokio::io::AsyncReadExt;

    fn tar_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[tokio::test]
    async fn import_routes_entries_to_the_deepest_mount() {
        let fake = FakePortLayer::new();
        let container = test_container("c1", "web", &[("volA", "/mnt/A"), ("volAB", "/mnt/A/AB")]);
        let tar_bytes = tar_of(&[
            ("file.txt", b"top level"),
            ("AB/inner.txt", b"nested"),
        ]);

        let portlayer: Arc<dyn PortLayer> = fake.clone();
        let mut map = ArchiveWriterMap::new(portlayer, &container, "/mnt/A");
        import_tar(&mut map, std::io::Cursor::new(tar_bytes))
            .await
            .unwrap();
        map.close().await.unwrap();

        let imports = fake.imports.lock().unwrap();
        let (filter_a, bytes_a) = imports.get("volA").expect("volA stream opened");
        assert_eq!(entry_names(bytes_a), vec!["file.txt"]);
        let spec = FilterSpec::decode(filter_a).unwrap();
        assert!(spec.primary);
        assert_eq!(spec.strip_path, "");

        let (filter_ab, bytes_ab) = imports.get("volAB").expect("volAB stream opened");
        assert_eq!(entry_names(bytes_ab), vec!["AB/inner.txt"]);
        let spec = FilterSpec::decode(filter_ab).unwrap();
        assert!(!spec.primary);
        assert_eq!(spec.strip_path, "AB");

        // Nothing routed to the scratch device, so no stream was opened.
        assert!(!imports.contains_key("c1"));
    }

    #[tokio::test]
    async fn import_without_matching_entries_opens_no_streams() {
        let fake = FakePortLayer::new();
        let container = test_container("c1", "web", &[]);
        let portlayer: Arc<dyn PortLayer> = fake.clone();
        let mut map = ArchiveWriterMap::new(portlayer, &container, "/etc");
        import_tar(&mut map, std::io::Cursor::new(tar_of(&[])))
            .await
            .unwrap();
        map.close().await.unwrap();
        assert!(fake.imports.lock().unwrap().is_empty());
    }

    #[test]
    fn export_plan_reads_primary_first_and_excludes_nested_regions() {
        let container = test_container("c1", "web", &[("volA", "/mnt/A"), ("volAB", "/mnt/A/AB")]);

        let sources = plan_export(&container, "/mnt/A");
        let mounts: Vec<&str> = sources.iter().map(|s| s.mount.as_str()).collect();
        assert_eq!(mounts, vec!["/mnt/A", "/mnt/A/AB"]);
        assert!(sources[0].filter.primary);
        assert!(sources[0].filter.exclusions.contains("AB"));
        assert!(sources[1].filter.exclusions.is_empty());

        // Exporting the root covers every device, scratch layer first.
        let sources = plan_export(&container, "/");
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].device.device, "c1");
        assert!(sources[0].filter.exclusions.contains("mnt/A"));
        assert!(sources[0].filter.exclusions.contains("mnt/A/AB"));
    }

    #[test]
    fn export_plan_under_one_mount_has_a_single_source() {
        let container = test_container("c1", "web", &[("volA", "/mnt/A")]);
        let sources = plan_export(&container, "/mnt/A/sub/dir");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].mount, "/mnt/A");
        assert_eq!(sources[0].filter.strip_path, "sub/dir");
    }

    #[tokio::test]
    async fn export_concatenates_streams_and_appends_the_trailer() {
        let fake = FakePortLayer::new();
        fake.exports
            .lock()
            .unwrap()
            .insert("volA".to_string(), b"AAAA".to_vec());
        fake.exports
            .lock()
            .unwrap()
            .insert("volAB".to_string(), b"BB".to_vec());

        let container = test_container("c1", "web", &[("volA", "/mnt/A"), ("volAB", "/mnt/A/AB")]);
        let sources = plan_export(&container, "/mnt/A");
        let portlayer: Arc<dyn PortLayer> = fake.clone();
        let mut reader = export_tar(portlayer, sources);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(&out[..6], b"AAAABB");
        assert_eq!(out.len(), 6 + TAR_TRAILER.len());
        assert!(out[6..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn export_skips_devices_with_nothing_under_the_path() {
        let fake = FakePortLayer::new();
        fake.exports
            .lock()
            .unwrap()
            .insert("volA".to_string(), b"AAAA".to_vec());
        // volAB has no seeded bytes, so its export reports not-found.

        let container = test_container("c1", "web", &[("volA", "/mnt/A"), ("volAB", "/mnt/A/AB")]);
        let sources = plan_export(&container, "/mnt/A");
        let portlayer: Arc<dyn PortLayer> = fake.clone();
        let mut reader = export_tar(portlayer, sources);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(&out[..4], b"AAAA");
        assert_eq!(out.len(), 4 + TAR_TRAILER.len());
    }

    #[tokio::test]
    async fn stat_synthesizes_mount_destinations() {
        let fake = FakePortLayer::new();
        let container = test_container("c1", "web", &[("volA", "/mnt/A")]);
        let portlayer: Arc<dyn PortLayer> = fake.clone();

        let stat_result = stat(&portlayer, &container, "/mnt/A").await.unwrap();
        assert_eq!(stat_result.name, "A");
        assert_eq!(stat_result.size, 4096);
        assert_eq!(stat_result.mode & (1 << 31), 1 << 31);
        // Synthesized locally, no RPC.
        assert!(!fake.call_log().contains(&"stat_path".to_string()));

        let stat_result = stat(&portlayer, &container, "/mnt/A/file").await.unwrap();
        assert_eq!(stat_result.size, 42);
        assert!(fake.call_log().contains(&"stat_path".to_string()));
    }
}
