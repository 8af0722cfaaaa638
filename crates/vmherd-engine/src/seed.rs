//! Cloud-init seed image synthesis (NoCloud datasource).
//!
//! Two backends behind one trait: the `cloud-localds` tool when it is
//! on PATH, otherwise an in-process FAT volume labeled `CIDATA`. Both
//! produce a small image file the launcher mounts as a readonly disk.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::debug;

use vmherd_core::cloudinit::synthesize_meta_data;

/// Input to a seed build. Document strings are passed through
/// verbatim; an empty `meta_data` is synthesized from the instance id
/// and hostname so every seed carries a stable identity.
#[derive(Debug, Clone, Default)]
pub struct SeedSpec {
    pub instance_id: String,
    pub hostname: String,
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

impl SeedSpec {
    /// The meta-data document actually written into the seed.
    fn effective_meta_data(&self) -> String {
        if self.meta_data.is_empty() {
            synthesize_meta_data(&self.instance_id, &self.hostname)
        } else {
            self.meta_data.clone()
        }
    }
}

/// Builds a seed image at `dest`. Idempotent per VM: rebuilding over
/// an existing file replaces it.
#[async_trait]
pub trait SeedBuilder: Send + Sync {
    async fn build(&self, spec: &SeedSpec, dest: &Path) -> Result<()>;
}

/// Default backend selection: `cloud-localds` when installed,
/// in-process FAT volume otherwise.
pub struct DefaultSeedBuilder {
    cloud_localds: Option<PathBuf>,
}

impl DefaultSeedBuilder {
    pub fn new() -> Self {
        let cloud_localds = which::which("cloud-localds").ok();
        if let Some(tool) = &cloud_localds {
            debug!(tool = %tool.display(), "seed builder using cloud-localds");
        }
        Self { cloud_localds }
    }
}

impl Default for DefaultSeedBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SeedBuilder for DefaultSeedBuilder {
    async fn build(&self, spec: &SeedSpec, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating seed dir {}", parent.display()))?;
        }
        match &self.cloud_localds {
            Some(tool) => build_with_cloud_localds(tool, spec, dest).await,
            None => {
                let spec = spec.clone();
                let dest = dest.to_path_buf();
                tokio::task::spawn_blocking(move || build_fat_seed(&spec, &dest))
                    .await
                    .context("seed build task panicked")?
            }
        }
    }
}

/// Always uses the in-process FAT backend, regardless of what is on
/// PATH. Deterministic, so the fixed choice for tests.
pub struct FatSeedBuilder;

#[async_trait]
impl SeedBuilder for FatSeedBuilder {
    async fn build(&self, spec: &SeedSpec, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating seed dir {}", parent.display()))?;
        }
        let spec = spec.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || build_fat_seed(&spec, &dest))
            .await
            .context("seed build task panicked")?
    }
}

/// Drive the external `cloud-localds` tool.
async fn build_with_cloud_localds(tool: &Path, spec: &SeedSpec, dest: &Path) -> Result<()> {
    let staging = tempfile::tempdir().context("creating seed staging dir")?;
    let user_path = staging.path().join("user-data");
    let meta_path = staging.path().join("meta-data");
    std::fs::write(&user_path, &spec.user_data)?;
    std::fs::write(&meta_path, spec.effective_meta_data())?;

    let mut cmd = tokio::process::Command::new(tool);
    if !spec.network_config.is_empty() {
        let net_path = staging.path().join("network-config");
        std::fs::write(&net_path, &spec.network_config)?;
        cmd.arg(format!("--network-config={}", net_path.display()));
    }
    cmd.arg(dest).arg(&user_path).arg(&meta_path);

    let output = cmd.output().await.context("spawning cloud-localds")?;
    if !output.status.success() {
        bail!(
            "cloud-localds failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

// Leave room for FAT metadata on top of the documents.
const FAT_OVERHEAD: u64 = 64 * 1024;
const MIN_IMAGE_SIZE: u64 = 1024 * 1024;

/// In-process fallback: a FAT volume labeled `CIDATA` holding the
/// NoCloud documents at its root.
pub fn build_fat_seed(spec: &SeedSpec, dest: &Path) -> Result<()> {
    let meta_data = spec.effective_meta_data();
    let payload_len =
        (spec.user_data.len() + meta_data.len() + spec.network_config.len()) as u64;
    let image_len = (payload_len + FAT_OVERHEAD)
        .next_power_of_two()
        .max(MIN_IMAGE_SIZE);

    let mut img = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(dest)
        .with_context(|| format!("creating seed image {}", dest.display()))?;
    img.set_len(image_len)?;

    fatfs::format_volume(
        &mut img,
        fatfs::FormatVolumeOptions::new().volume_label(*b"CIDATA     "),
    )
    .context("formatting seed volume")?;

    let fs = fatfs::FileSystem::new(&mut img, fatfs::FsOptions::new())
        .context("opening seed volume")?;
    let root = fs.root_dir();

    root.create_file("user-data")?.write_all(spec.user_data.as_bytes())?;
    root.create_file("meta-data")?.write_all(meta_data.as_bytes())?;
    if !spec.network_config.is_empty() {
        root.create_file("network-config")?
            .write_all(spec.network_config.as_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    fn open_rw(path: &Path) -> std::fs::File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .unwrap()
    }

    fn spec() -> SeedSpec {
        SeedSpec {
            instance_id: "vmherd-7".into(),
            hostname: "web-1".into(),
            user_data: "#cloud-config\npackages: [curl]\n".into(),
            meta_data: String::new(),
            network_config: "version: 2\n".into(),
        }
    }

    #[test]
    fn test_meta_data_synthesized_when_empty() {
        let s = spec();
        assert_eq!(
            s.effective_meta_data(),
            "instance-id: vmherd-7\nlocal-hostname: web-1\n"
        );
        let explicit = SeedSpec {
            meta_data: "instance-id: custom\n".into(),
            ..spec()
        };
        assert_eq!(explicit.effective_meta_data(), "instance-id: custom\n");
    }

    #[test]
    fn test_fat_seed_contains_documents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("seed.img");
        build_fat_seed(&spec(), &dest).unwrap();

        let mut img = open_rw(&dest);
        let fs = fatfs::FileSystem::new(&mut img, fatfs::FsOptions::new()).unwrap();
        let root = fs.root_dir();
        let mut user_data = String::new();
        root.open_file("user-data")
            .unwrap()
            .read_to_string(&mut user_data)
            .unwrap();
        assert_eq!(user_data, spec().user_data);
        let mut meta = String::new();
        root.open_file("meta-data")
            .unwrap()
            .read_to_string(&mut meta)
            .unwrap();
        assert!(meta.contains("local-hostname: web-1"));
        assert!(root.open_file("network-config").is_ok());
    }

    #[test]
    fn test_fat_seed_rebuild_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("seed.img");
        build_fat_seed(&spec(), &dest).unwrap();
        let mut second = spec();
        second.user_data = "#cloud-config\n".into();
        second.network_config.clear();
        build_fat_seed(&second, &dest).unwrap();

        let mut img = open_rw(&dest);
        let fs = fatfs::FileSystem::new(&mut img, fatfs::FsOptions::new()).unwrap();
        let root = fs.root_dir();
        let mut user_data = String::new();
        root.open_file("user-data")
            .unwrap()
            .read_to_string(&mut user_data)
            .unwrap();
        assert_eq!(user_data, "#cloud-config\n");
        assert!(root.open_file("network-config").is_err());
    }
}
