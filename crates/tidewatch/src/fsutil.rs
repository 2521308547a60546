use eyre::Context as _;
use std::{
    fs::{self, OpenOptions},
    io::Write as _,
    path::Path,
};

fn is_symlink(p: &Path) -> eyre::Result<bool> {
    let md = fs::symlink_metadata(p).with_context(|| format!("stat {}", p.display()))?;
    Ok(md.file_type().is_symlink())
}

/// Create `dir` if needed. An existing symlink or non-directory at that path is an error.
pub fn ensure_dir(dir: &Path) -> eyre::Result<()> {
    if !dir.exists() {
        return fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()));
    }
    if is_symlink(dir)? {
        eyre::bail!("refusing to use symlinked directory: {}", dir.display());
    }
    if !dir.is_dir() {
        eyre::bail!("expected directory at {}", dir.display());
    }
    Ok(())
}

/// Write through a fresh temp file in the same directory, then rename over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> eyre::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("missing parent for {}", path.display()))?;
    ensure_dir(parent)?;
    if path.exists() && is_symlink(path)? {
        eyre::bail!("refusing to write to symlink: {}", path.display());
    }

    let base = path.file_name().and_then(|s| s.to_str()).unwrap_or("file");
    let tmp = parent.join(format!(".{base}.tmp.{:016x}", rand::random::<u64>()));
    let mut f = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&tmp)
        .with_context(|| format!("open temp {}", tmp.display()))?;
    f.write_all(contents.as_bytes())
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all()
        .with_context(|| format!("fsync {}", tmp.display()))?;
    drop(f);

    #[cfg(windows)]
    {
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("remove existing {}", path.display()))?;
        }
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))
}
