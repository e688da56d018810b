//! Workspace bundles: deterministic archives of a workspace plus its workflow script.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tar::{EntryType, Header};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{SchedError, SchedResult};

/// A packed workspace ready to be staged to the cluster.
///
/// The digest and size are computed once when the archive is written and
/// never change afterwards.
#[derive(Debug, Clone)]
pub struct WorkspaceBundle {
    id: String,
    local_path: PathBuf,
    digest: String,
    size: u64,
    remote_path: Option<String>,
}

impl WorkspaceBundle {
    /// Pack `workspace_dir` into `<staging_dir>/<id>.tar.gz`.
    ///
    /// The workspace lands under `<id>/` inside the archive. The optional
    /// workflow script is added at the archive root under its given name.
    pub fn pack(
        id: &str,
        workspace_dir: &Path,
        workflow_script: Option<(&str, &Path)>,
        staging_dir: &Path,
    ) -> SchedResult<Self> {
        if !workspace_dir.is_dir() {
            return Err(SchedError::WorkspaceNotFound(format!(
                "{} is not a directory",
                workspace_dir.display()
            )));
        }
        std::fs::create_dir_all(staging_dir)?;

        let archive_path = staging_dir.join(format!("{id}.tar.gz"));
        let partial = staging_dir.join(format!("{id}.tar.gz.partial"));

        if let Err(e) = write_archive(&partial, id, workspace_dir, workflow_script) {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, &archive_path)?;

        let bundle = Self::from_archive(id, &archive_path)?;
        debug!(
            "Packed workspace {} into {} ({} bytes, sha256 {})",
            id,
            archive_path.display(),
            bundle.size,
            bundle.digest
        );
        Ok(bundle)
    }

    /// Wrap an existing archive, computing its digest.
    pub fn from_archive(id: &str, archive_path: &Path) -> SchedResult<Self> {
        let size = std::fs::metadata(archive_path)?.len();
        let digest = file_digest(archive_path)?;
        Ok(Self {
            id: id.to_string(),
            local_path: archive_path.to_path_buf(),
            digest,
            size,
            remote_path: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// SHA-256 of the archive, lowercase hex.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Archive file name, e.g. `ws-1.tar.gz`.
    pub fn file_name(&self) -> String {
        format!("{}.tar.gz", self.id)
    }

    /// Remote path once staged.
    pub fn remote_path(&self) -> Option<&str> {
        self.remote_path.as_deref()
    }

    pub(crate) fn set_staged(&mut self, remote_path: String) {
        self.remote_path = Some(remote_path);
    }
}

fn write_archive(
    path: &Path,
    id: &str,
    workspace_dir: &Path,
    workflow_script: Option<(&str, &Path)>,
) -> SchedResult<()> {
    let file = File::create(path)?;
    // GzEncoder writes a zero mtime into the gzip header.
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_dir(&mut builder, Path::new(id))?;
    for entry in WalkDir::new(workspace_dir)
        .min_depth(1)
        .sort_by_file_name()
        .follow_links(false)
    {
        let entry = entry.map_err(|e| io::Error::other(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(workspace_dir)
            .map_err(|e| SchedError::Internal(e.to_string()))?;
        let name = Path::new(id).join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            append_dir(&mut builder, &name)?;
        } else if file_type.is_file() {
            append_file(&mut builder, &name, entry.path(), executable(&entry)?)?;
        } else {
            warn!("Skipping non-regular file {}", entry.path().display());
        }
    }

    if let Some((name, script)) = workflow_script {
        append_file(&mut builder, Path::new(name), script, false)?;
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(())
}

fn normalized_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &Path) -> SchedResult<()> {
    let mut header = normalized_header(EntryType::Directory, 0o755, 0);
    builder.append_data(&mut header, name, io::empty())?;
    Ok(())
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &Path,
    source: &Path,
    executable: bool,
) -> SchedResult<()> {
    let file = File::open(source)?;
    let size = file.metadata()?.len();
    let mode = if executable { 0o755 } else { 0o644 };
    let mut header = normalized_header(EntryType::Regular, mode, size);
    builder.append_data(&mut header, name, BufReader::new(file))?;
    Ok(())
}

#[cfg(unix)]
fn executable(entry: &walkdir::DirEntry) -> SchedResult<bool> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = entry.metadata().map_err(|e| io::Error::other(e.to_string()))?;
    Ok(metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn executable(_entry: &walkdir::DirEntry) -> SchedResult<bool> {
    Ok(false)
}

/// SHA-256 of a local file, lowercase hex.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract a `.tar.gz` archive into `dest`.
pub fn unpack_archive(archive: &Path, dest: &Path) -> SchedResult<()> {
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_mtime(false);
    archive.unpack(dest)?;
    Ok(())
}
