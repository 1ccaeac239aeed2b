//! Singularity/Apptainer Images
//!
//! Container images are pulled once into the singularity prefix and
//! reused by every job naming the same image URL.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, error, info};

use crate::error::{Error, Result};

/// Local image file for a container URL.
pub fn image_path(url: &str, prefix: &Path) -> PathBuf {
    let name: String = url
        .trim_start_matches("docker://")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    prefix.join(format!("{}.simg", name))
}

fn source_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("docker://{}", url)
    }
}

/// Pulls an image unless it is already present.
pub fn pull(url: &str, prefix: &Path, dryrun: bool) -> Result<PathBuf> {
    let path = image_path(url, prefix);
    if path.exists() {
        debug!("Image {} already present", url);
        return Ok(path);
    }
    if dryrun {
        info!("Would pull singularity image {}", url);
        return Ok(path);
    }

    info!("Pulling singularity image {}", url);
    fs::create_dir_all(prefix)?;
    let output = Command::new("singularity")
        .arg("pull")
        .arg("--name")
        .arg(&path)
        .arg(source_url(url))
        .output()?;

    if output.status.success() {
        Ok(path)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Failed to pull image {}: {}", url, stderr);
        Err(Error::workflow(format!("Failed to pull singularity image {}", url)))
    }
}

/// Command running `program` inside `image` with `workdir` bound as home.
pub fn exec_command(image: &Path, workdir: &Path, program: &str) -> Command {
    let mut cmd = Command::new("singularity");
    cmd.arg("exec")
        .arg("--home")
        .arg(workdir)
        .arg(image)
        .arg(program);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_image_path_is_sanitized() {
        let path = image_path("docker://biocontainers/bwa:0.7.17", Path::new("/images"));
        assert_eq!(path, PathBuf::from("/images/biocontainers_bwa_0.7.17.simg"));
    }

    #[test]
    fn test_source_url_defaults_to_docker() {
        assert_eq!(source_url("ubuntu:22.04"), "docker://ubuntu:22.04");
        assert_eq!(source_url("library://alpine"), "library://alpine");
    }

    #[test]
    fn test_pull_reuses_existing_image() {
        let dir = TempDir::new().unwrap();
        let path = image_path("ubuntu:22.04", dir.path());
        fs::write(&path, "image").unwrap();
        assert_eq!(pull("ubuntu:22.04", dir.path(), false).unwrap(), path);
    }

    #[test]
    fn test_pull_dryrun() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("images");
        pull("ubuntu:22.04", &prefix, true).unwrap();
        assert!(!prefix.exists());
    }
}
