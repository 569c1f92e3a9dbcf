//! World backups as timestamped zip archives.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("backup source does not exist: {0}")]
    SourceMissing(PathBuf),
    #[error("backup archive not found: {0}")]
    ArchiveMissing(PathBuf),
    #[error("backup I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("invalid backup pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Local>,
}

/// Archive `source` into `backup_dir/<base>_backup_<YYYYmmdd_HHMMSS>.zip`.
///
/// `base` defaults to the source directory's file name. Entry names are
/// relative to `source`, so extracting into an empty directory reproduces it.
pub fn create_backup(
    source: &Path,
    backup_dir: &Path,
    base: Option<&str>,
) -> Result<PathBuf, BackupError> {
    if !source.is_dir() {
        return Err(BackupError::SourceMissing(source.to_path_buf()));
    }
    fs::create_dir_all(backup_dir)?;

    let base = match base {
        Some(b) => b.to_string(),
        None => source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "server".to_string()),
    };
    let archive_path = unique_archive_path(backup_dir, &base);

    tracing::info!("Creating backup {} from {}", archive_path.display(), source.display());
    if let Err(e) = write_archive(source, &archive_path) {
        // 실패한 부분 아카이브는 남기지 않음
        let _ = fs::remove_file(&archive_path);
        return Err(e);
    }
    Ok(archive_path)
}

fn unique_archive_path(backup_dir: &Path, base: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let mut path = backup_dir.join(format!("{}_backup_{}.zip", base, stamp));
    let mut n = 1;
    while path.exists() {
        path = backup_dir.join(format!("{}_backup_{}_{}.zip", base, stamp, n));
        n += 1;
    }
    path
}

fn write_archive(source: &Path, archive_path: &Path) -> Result<(), BackupError> {
    let file = File::create(archive_path)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut pending = vec![source.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries: Vec<_> = fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let Some(name) = entry_name(source, &path) else {
                continue;
            };
            if entry.file_type()?.is_dir() {
                zip.add_directory(format!("{}/", name), options)?;
                pending.push(path);
            } else {
                zip.start_file(name, options)?;
                let mut f = File::open(&path)?;
                io::copy(&mut f, &mut zip)?;
            }
        }
    }
    zip.finish()?;
    Ok(())
}

/// Forward-slash name of `path` relative to `root`.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Extract `archive` into `target`, creating it if needed. Returns the number of files written.
pub fn restore_backup(archive: &Path, target: &Path) -> Result<usize, BackupError> {
    if !archive.is_file() {
        return Err(BackupError::ArchiveMissing(archive.to_path_buf()));
    }
    tracing::info!("Restoring {} into {}", archive.display(), target.display());

    let mut zip = ZipArchive::new(File::open(archive)?)?;
    fs::create_dir_all(target)?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!("Skipping unsafe archive entry: {}", entry.name());
            continue;
        };
        let out_path = target.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
            files += 1;
        }
    }
    Ok(files)
}

/// Restore `archive` in place of `target`. An existing `target` is moved aside
/// to `<target>.pre-restore-<YYYYmmdd_HHMMSS>` first and that path is returned.
pub fn replace_with_backup(archive: &Path, target: &Path) -> Result<Option<PathBuf>, BackupError> {
    if !archive.is_file() {
        return Err(BackupError::ArchiveMissing(archive.to_path_buf()));
    }
    let previous = if target.exists() {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let mut aside = target.as_os_str().to_owned();
        aside.push(format!(".pre-restore-{}", stamp));
        let aside = PathBuf::from(aside);
        fs::rename(target, &aside)?;
        tracing::info!("Moved current {} to {}", target.display(), aside.display());
        Some(aside)
    } else {
        None
    };
    restore_backup(archive, target)?;
    Ok(previous)
}

/// `*.zip` files in `dir`, newest first. `filter` keeps names containing it.
pub fn list_backups(dir: &Path, filter: Option<&str>) -> Result<Vec<BackupEntry>, BackupError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let pattern = format!("{}/*.zip", glob::Pattern::escape(&dir.to_string_lossy()));

    let mut backups = Vec::new();
    for path in glob::glob(&pattern)?.flatten() {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => continue,
        };
        if filter.is_some_and(|f| !name.contains(f)) {
            continue;
        }
        let meta = fs::metadata(&path)?;
        let modified = meta.modified().map(DateTime::<Local>::from)?;
        backups.push(BackupEntry {
            name,
            path,
            size: meta.len(),
            modified,
        });
    }
    backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    Ok(backups)
}
