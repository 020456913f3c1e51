// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Inventory of the files shipped by each locally stored image, read from a
//! content-addressed blob store (one file per digest, named by its hex
//! value). This is a debugging aid and is never run by the scan cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, trace};
use serde::Deserialize;

use crate::errors::ScanError;
use crate::fs::SubDirFs;

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DIGEST_PREFIX: &str = "sha256:";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Image configs embed the full build history and can get large.
const MAX_CONFIG_FILE_SIZE: u64 = 8 * 1024 * 1024;

/// Image name -> every path found in its layers.
pub type ImageInventory = BTreeMap<String, BTreeSet<String>>;

#[derive(Deserialize, Debug, Default)]
struct Descriptor {
    #[serde(default)]
    digest: String,
}

#[derive(Deserialize, Debug, Default)]
struct Manifest {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    #[serde(default)]
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Deserialize, Debug, Default)]
struct ImageConfig {
    #[serde(default)]
    container_config: ContainerConfig,
}

#[derive(Deserialize, Debug, Default)]
struct ContainerConfig {
    #[serde(rename = "Image", default)]
    image: String,
}

fn blob_name(digest: &str) -> Option<&str> {
    digest
        .strip_prefix(DIGEST_PREFIX)
        .filter(|name| !name.is_empty())
}

fn is_gzip(blobs: &SubDirFs, name: &str) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut reader = blobs.open(name)?.into_stream()?;
    match reader.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Reads a blob as a schema 2 manifest. Compressed blobs, other JSON
/// documents and unreadable blobs yield `None`.
fn read_manifest(blobs: &SubDirFs, name: &str) -> Option<Manifest> {
    match is_gzip(blobs, name) {
        Ok(false) => {}
        Ok(true) => return None,
        Err(e) => {
            debug!("could not read blob {name}: {e}");
            return None;
        }
    }

    let manifest: Manifest = blobs.read_document(name, None).ok()?;
    (manifest.media_type == MANIFEST_MEDIA_TYPE).then_some(manifest)
}

/// Collects the entry names of a gzip-compressed tar layer. Reading stops at
/// the first malformed entry.
fn layer_entries(blobs: &SubDirFs, name: &str, entries: &mut BTreeSet<String>) -> io::Result<()> {
    let file = blobs.open(name)?.into_stream()?;
    let mut archive = tar::Archive::new(GzDecoder::new(io::BufReader::new(file)));

    let archive_entries = match archive.entries() {
        Ok(archive_entries) => archive_entries,
        Err(e) => {
            debug!("layer {name} is not a tar archive: {e}");
            return Ok(());
        }
    };
    for entry in archive_entries {
        match entry {
            Ok(entry) => {
                entries.insert(String::from_utf8_lossy(&entry.path_bytes()).into_owned());
            }
            Err(e) => {
                trace!("stopped reading layer {name}: {e}");
                break;
            }
        }
    }
    Ok(())
}

/// Builds the file inventory of one image from its config digest and layer
/// digests. Returns `None` if the image has no name or any of its blobs is
/// missing.
fn image_files(
    blobs: &SubDirFs,
    config_blob: &str,
    layers: &[String],
) -> Option<(String, BTreeSet<String>)> {
    let config: ImageConfig = match blobs.read_document(config_blob, Some(MAX_CONFIG_FILE_SIZE)) {
        Ok(config) => config,
        Err(e) => {
            debug!("skipping image config {config_blob}: {e:?}");
            return None;
        }
    };
    let image = config.container_config.image;
    if image.is_empty() {
        return None;
    }

    let mut files = BTreeSet::new();
    for layer in layers {
        if let Err(e) = layer_entries(blobs, layer, &mut files) {
            debug!("skipping image {image}, layer {layer} unavailable: {e}");
            return None;
        }
    }
    Some((image, files))
}

/// Scans the blob store at `store_root` and returns the files of every image
/// described by a manifest. Images sharing a name are merged.
pub fn build_inventory<P: AsRef<Path>>(store_root: P) -> Result<ImageInventory, ScanError> {
    let store_root = store_root.as_ref();
    let store_error = |source| ScanError::ImageStore {
        path: store_root.to_path_buf(),
        source,
    };

    let mut names: Vec<String> = fs::read_dir(store_root)
        .map_err(store_error)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    let blobs = SubDirFs::new(store_root).map_err(store_error)?;

    // config blob -> layer blobs, first manifest wins
    let mut images: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in &names {
        let Some(manifest) = read_manifest(&blobs, name) else {
            continue;
        };
        let Some(config) = blob_name(&manifest.config.digest) else {
            continue;
        };
        let layers: Option<Vec<String>> = manifest
            .layers
            .iter()
            .map(|layer| blob_name(&layer.digest).map(str::to_string))
            .collect();
        let Some(layers) = layers else {
            debug!("manifest {name} has a malformed layer digest");
            continue;
        };
        images.entry(config.to_string()).or_insert(layers);
    }

    let mut inventory = ImageInventory::new();
    for (config, layers) in &images {
        if let Some((image, files)) = image_files(&blobs, config, layers) {
            inventory.entry(image).or_default().extend(files);
        }
    }
    Ok(inventory)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    fn layer_blob(files: &[&str]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for file in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, file, io::empty()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn manifest(config: &str, layers: &[&str]) -> String {
        let layers: Vec<serde_json::Value> = layers
            .iter()
            .map(|layer| serde_json::json!({"digest": format!("sha256:{layer}")}))
            .collect();
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {"digest": format!("sha256:{config}")},
            "layers": layers,
        })
        .to_string()
    }

    fn image_config(image: &str) -> String {
        serde_json::json!({"container_config": {"Image": image}}).to_string()
    }

    struct Store {
        dir: TempDir,
    }

    impl Store {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn put(&self, name: &str, content: impl AsRef<[u8]>) {
            fs::write(self.dir.path().join(name), content).unwrap();
        }
    }

    #[test]
    fn test_build_inventory() {
        let store = Store::new();
        store.put("m1", manifest("c1", &["l1", "l2"]));
        store.put("c1", image_config("nginx:1.25"));
        store.put("l1", layer_blob(&["bin/sh", "etc/passwd"]));
        store.put("l2", layer_blob(&["etc/nginx/nginx.conf", "etc/passwd"]));

        let inventory = build_inventory(store.dir.path()).unwrap();
        assert_eq!(inventory.len(), 1);
        let files: Vec<&str> = inventory["nginx:1.25"].iter().map(String::as_str).collect();
        assert_eq!(files, vec!["bin/sh", "etc/nginx/nginx.conf", "etc/passwd"]);
    }

    #[test]
    fn test_skips_images_with_missing_blobs() {
        let store = Store::new();
        store.put("m1", manifest("c1", &["l1", "gone"]));
        store.put("c1", image_config("redis:7"));
        store.put("l1", layer_blob(&["bin/sh"]));

        store.put("m2", manifest("nocfg", &["l1"]));

        store.put("m3", manifest("c3", &["l1"]));
        store.put("c3", image_config(""));

        assert!(build_inventory(store.dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_ignores_other_blobs() {
        let store = Store::new();
        store.put(
            "index",
            r#"{"mediaType": "application/vnd.oci.image.index.v1+json", "manifests": []}"#,
        );
        store.put("garbage", "not json at all");
        store.put("empty", "");
        store.put("l1", layer_blob(&["bin/sh"]));

        assert!(build_inventory(store.dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_store_is_an_error() {
        let store = Store::new();
        assert!(matches!(
            build_inventory(store.dir.path().join("sha256")),
            Err(ScanError::ImageStore { .. })
        ));
    }

    #[test]
    fn test_blob_name() {
        assert_eq!(blob_name("sha256:abc"), Some("abc"));
        assert_eq!(blob_name("sha256:"), None);
        assert_eq!(blob_name("md5:abc"), None);
    }
}
