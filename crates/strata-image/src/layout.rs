//! Fetcher for OCI image layouts on local disk.
//!
//! Locators look like `oci:///var/images/busybox` and point at a directory
//! holding `index.json` and `blobs/<algorithm>/<hex>`. The first manifest of
//! the index is used.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use strata_common::error::{Result, StrataError};
use strata_common::types::{ImageConfig, ImageLocator, LayerDigest};

use crate::fetcher::{BlobStream, Fetcher, Streamer};

/// Locator scheme served by [`LayoutFetcher`].
pub const LAYOUT_SCHEME: &str = "oci";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Deserialize)]
struct Index {
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    media_type: Option<String>,
    digest: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// Computes the chain IDs of a diff ID sequence, base first.
///
/// The base layer's chain ID is its diff ID; every other one is the SHA-256
/// of `"<parent chain ID> <diff ID>"`.
#[must_use]
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = match chain.last() {
            None => diff_id.clone(),
            Some(parent) => {
                let digest = Sha256::digest(format!("{parent} {diff_id}").as_bytes());
                format!("sha256:{digest:x}")
            }
        };
        chain.push(next);
    }
    chain
}

/// Pairs blob IDs with diff IDs into a root-to-leaf digest chain.
///
/// # Errors
///
/// Returns `StrataError::InvalidImage` if the two lists differ in length.
pub fn layer_digests(image: &str, blob_ids: &[String], diff_ids: &[String]) -> Result<Vec<LayerDigest>> {
    if blob_ids.len() != diff_ids.len() {
        return Err(StrataError::InvalidImage {
            image: image.to_string(),
            message: format!(
                "manifest lists {} layers but config lists {} diff ids",
                blob_ids.len(),
                diff_ids.len()
            ),
        });
    }
    let chain = chain_ids(diff_ids);
    let mut parent = String::new();
    let mut digests = Vec::with_capacity(chain.len());
    for ((blob_id, diff_id), chain_id) in blob_ids.iter().zip(diff_ids).zip(chain) {
        digests.push(LayerDigest {
            blob_id: blob_id.clone(),
            diff_id: diff_id.clone(),
            chain_id: chain_id.clone(),
            parent_chain_id: std::mem::replace(&mut parent, chain_id),
        });
    }
    Ok(digests)
}

/// Resolves `algorithm:hex` to its path under `<layout>/blobs`.
fn blob_path(layout: &Path, digest: &str) -> Result<PathBuf> {
    let invalid = || StrataError::InvalidImage {
        image: layout.display().to_string(),
        message: format!("malformed digest `{digest}`"),
    };
    let (algorithm, hex) = digest.split_once(':').ok_or_else(invalid)?;
    let valid = !algorithm.is_empty()
        && algorithm.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && !hex.is_empty()
        && hex.chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(invalid());
    }
    Ok(layout.join("blobs").join(algorithm).join(hex))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<(T, Vec<u8>)> {
    let bytes = std::fs::read(path).map_err(|e| StrataError::io(path, e))?;
    let value = serde_json::from_slice(&bytes)?;
    Ok((value, bytes))
}

/// Reads images from OCI layout directories.
#[derive(Debug, Clone, Default)]
pub struct LayoutFetcher;

impl LayoutFetcher {
    /// Creates a fetcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn layout_dir(locator: &ImageLocator) -> Result<PathBuf> {
        if locator.scheme() != LAYOUT_SCHEME {
            return Err(StrataError::InvalidLocator {
                locator: locator.to_string(),
                reason: format!("unsupported scheme `{}`", locator.scheme()),
            });
        }
        let dir = PathBuf::from(locator.reference());
        if !dir.is_dir() {
            return Err(StrataError::NotFound {
                kind: "image layout",
                id: dir.display().to_string(),
            });
        }
        Ok(dir)
    }
}

impl Fetcher for LayoutFetcher {
    fn layers_digest(&self, locator: &ImageLocator) -> Result<(Vec<LayerDigest>, ImageConfig)> {
        let dir = Self::layout_dir(locator)?;
        let image = locator.to_string();

        let (index, _): (Index, _) = read_json(&dir.join("index.json"))?;
        let manifest_desc = index.manifests.first().ok_or_else(|| StrataError::InvalidImage {
            image: image.clone(),
            message: "index lists no manifest".into(),
        })?;
        if let Some(media_type) = &manifest_desc.media_type {
            if media_type.ends_with("image.index.v1+json") || media_type.ends_with("manifest.list.v2+json") {
                return Err(StrataError::InvalidImage {
                    image,
                    message: format!("nested index `{media_type}` is not supported"),
                });
            }
        }

        let (manifest, _): (Manifest, _) = read_json(&blob_path(&dir, &manifest_desc.digest)?)?;
        let (config, config_bytes): (ImageConfig, _) =
            read_json(&blob_path(&dir, &manifest.config.digest)?)?;
        if let Some(hex) = manifest.config.digest.strip_prefix("sha256:") {
            let actual = format!("{:x}", Sha256::digest(&config_bytes));
            if actual != hex {
                return Err(StrataError::InvalidImage {
                    image,
                    message: format!(
                        "config digest mismatch: expected sha256:{hex}, got sha256:{actual}"
                    ),
                });
            }
        }

        let blob_ids: Vec<String> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
        let digests = layer_digests(&image, &blob_ids, &config.rootfs.diff_ids)?;
        tracing::debug!(image = %locator, layers = digests.len(), "resolved image layout");
        Ok((digests, config))
    }

    fn streamer(&self, locator: &ImageLocator) -> Result<Box<dyn Streamer>> {
        Ok(Box::new(LayoutStreamer {
            dir: Self::layout_dir(locator)?,
        }))
    }
}

/// Streams blobs out of one OCI layout, transparently gunzipping them.
#[derive(Debug)]
pub struct LayoutStreamer {
    dir: PathBuf,
}

impl Streamer for LayoutStreamer {
    fn stream(&self, blob_id: &str) -> Result<BlobStream> {
        let path = blob_path(&self.dir, blob_id)?;
        let file = File::open(&path).map_err(|e| StrataError::io(&path, e))?;
        let size = file
            .metadata()
            .map_err(|e| StrataError::io(&path, e))?
            .len();

        let mut reader = BufReader::new(file);
        let head = reader.fill_buf().map_err(|e| StrataError::io(&path, e))?;
        let is_gzip = head.starts_with(&GZIP_MAGIC);
        tracing::debug!(blob = blob_id, size, gzip = is_gzip, "streaming blob");

        if is_gzip {
            Ok((Box::new(flate2::read::GzDecoder::new(reader)), size))
        } else {
            Ok((Box::new(reader), size))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    fn write_blob(layout: &Path, bytes: &[u8]) -> String {
        let hex = format!("{:x}", Sha256::digest(bytes));
        let dir = layout.join("blobs/sha256");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join(&hex), bytes).expect("write");
        format!("sha256:{hex}")
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(bytes).expect("gzip");
        encoder.finish().expect("gzip")
    }

    /// Builds a layout with two raw "layers" and returns its directory.
    fn build_layout(dir: &Path) -> (Vec<String>, Vec<String>) {
        let layers = [b"layer one".to_vec(), gzip(b"layer two")];
        let blob_ids: Vec<String> = layers.iter().map(|l| write_blob(dir, l)).collect();
        let diff_ids = ids(&["sha256:aaaa", "sha256:bbbb"]);
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
        });
        let config_id = write_blob(dir, config.to_string().as_bytes());
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": config_id},
            "layers": blob_ids.iter().map(|d| serde_json::json!({"digest": d})).collect::<Vec<_>>(),
        });
        let manifest_id = write_blob(dir, manifest.to_string().as_bytes());
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": manifest_id}],
        });
        std::fs::write(dir.join("index.json"), index.to_string()).expect("write index");
        (blob_ids, diff_ids)
    }

    fn locator(dir: &Path) -> ImageLocator {
        ImageLocator::parse(&format!("oci://{}", dir.display())).expect("locator")
    }

    #[test]
    fn chain_ids_follow_oci_rule() {
        let chain = chain_ids(&ids(&["sha256:a", "sha256:b"]));
        assert_eq!(chain[0], "sha256:a");
        let expected = format!("sha256:{:x}", Sha256::digest(b"sha256:a sha256:b"));
        assert_eq!(chain[1], expected);
        assert!(chain_ids(&[]).is_empty());
    }

    #[test]
    fn layer_digests_link_parents() {
        let digests =
            layer_digests("img", &ids(&["b1", "b2", "b3"]), &ids(&["d1", "d2", "d3"])).expect("digests");
        assert_eq!(digests[0].parent_chain_id, "");
        assert_eq!(digests[1].parent_chain_id, digests[0].chain_id);
        assert_eq!(digests[2].parent_chain_id, digests[1].chain_id);
        assert_eq!(digests[2].blob_id, "b3");
    }

    #[test]
    fn layer_digests_rejects_length_mismatch() {
        assert!(matches!(
            layer_digests("img", &ids(&["b1"]), &ids(&["d1", "d2"])),
            Err(StrataError::InvalidImage { .. })
        ));
    }

    #[test]
    fn blob_path_rejects_traversal() {
        let layout = Path::new("/layout");
        assert!(blob_path(layout, "sha256:../../etc").is_err());
        assert!(blob_path(layout, "nodigest").is_err());
        assert_eq!(
            blob_path(layout, "sha256:abc123").expect("path"),
            Path::new("/layout/blobs/sha256/abc123")
        );
    }

    #[test]
    fn layers_digest_reads_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (blob_ids, diff_ids) = build_layout(dir.path());

        let (digests, config) = LayoutFetcher::new()
            .layers_digest(&locator(dir.path()))
            .expect("layers");
        assert_eq!(digests.len(), 2);
        assert_eq!(digests[0].blob_id, blob_ids[0]);
        assert_eq!(digests[1].diff_id, diff_ids[1]);
        assert_eq!(digests[0].chain_id, diff_ids[0]);
        assert_eq!(config.os.as_deref(), Some("linux"));
    }

    #[test]
    fn streamer_decompresses_gzip_blobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (blob_ids, _) = build_layout(dir.path());
        let streamer = LayoutFetcher::new()
            .streamer(&locator(dir.path()))
            .expect("streamer");

        let (mut plain, size) = streamer.stream(&blob_ids[0]).expect("stream");
        let mut out = String::new();
        let _ = plain.read_to_string(&mut out).expect("read");
        assert_eq!(out, "layer one");
        assert_eq!(size, 9);

        let (mut gz, _) = streamer.stream(&blob_ids[1]).expect("stream");
        let mut out = String::new();
        let _ = gz.read_to_string(&mut out).expect("read");
        assert_eq!(out, "layer two");
    }

    #[test]
    fn unsupported_scheme_is_invalid_locator() {
        let locator = ImageLocator::parse("docker:///library/busybox").expect("locator");
        assert!(matches!(
            LayoutFetcher::new().layers_digest(&locator),
            Err(StrataError::InvalidLocator { .. })
        ));
    }

    #[test]
    fn missing_layout_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            LayoutFetcher::new().layers_digest(&locator(&dir.path().join("nope"))),
            Err(StrataError::NotFound { .. })
        ));
    }

    #[test]
    fn tampered_config_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = build_layout(dir.path());
        let (index, _): (Index, _) = read_json(&dir.path().join("index.json")).expect("index");
        let (manifest, _): (Manifest, _) =
            read_json(&blob_path(dir.path(), &index.manifests[0].digest).expect("path")).expect("manifest");
        let config_path = blob_path(dir.path(), &manifest.config.digest).expect("path");
        std::fs::write(&config_path, r#"{"rootfs":{"type":"layers","diff_ids":[]}}"#).expect("write");

        assert!(matches!(
            LayoutFetcher::new().layers_digest(&locator(dir.path())),
            Err(StrataError::InvalidImage { .. })
        ));
    }
}
