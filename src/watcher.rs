// SPDX-License-Identifier: Apache-2.0

//! Periodic discovery of files matching the include/exclude patterns.
//!
//! Each scan walks the roots derived from the include patterns, computes an
//! identity for every candidate file, and reconciles against the registry:
//! unseen identities are registered (`on_add`), tracked identities that no
//! longer appear are dropped (`on_remove`). Rotation needs no special
//! casing here: a rotated file simply stops producing its old identity and
//! starts producing a new one.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::FingerprintStrategy;
use crate::error::{Error, Result};
use crate::registry::FileRegistry;
use crate::shutdown::{shutdown_channel, ShutdownSignal};

pub(crate) type AddCallback = Box<dyn Fn(&str, &Path) + Send>;
pub(crate) type RemoveCallback = Box<dyn Fn(&str) + Send>;

pub(crate) struct WatcherConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub poll_interval: Duration,
    pub strategy: FingerprintStrategy,
}

pub(crate) struct Watcher {
    scanner: Option<Scanner>,
    poll_interval: Duration,
    signal: Option<ShutdownSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Watcher {
    pub(crate) fn new(
        config: WatcherConfig,
        registry: Arc<FileRegistry>,
        on_add: AddCallback,
        on_remove: RemoveCallback,
    ) -> Result<Self> {
        config.strategy.validate()?;

        // Include patterns are required to be valid; broken excludes are
        // dropped with a warning.
        for pattern in &config.include {
            glob::Pattern::new(pattern).map_err(|e| {
                Error::InvalidGlob(format!("invalid include pattern '{pattern}': {e}"))
            })?;
        }
        let exclude = config
            .exclude
            .iter()
            .filter_map(|pattern| match glob::Pattern::new(pattern) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("invalid exclude pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        let roots = derive_scan_roots(&config.include);
        for (i, root) in roots.iter().enumerate() {
            for (j, other) in roots.iter().enumerate() {
                if i != j && is_subpath(root, other) {
                    return Err(Error::Config(format!(
                        "overlapping scan roots: {} is a subpath of {}",
                        root.display(),
                        other.display()
                    )));
                }
            }
        }

        Ok(Self {
            scanner: Some(Scanner {
                include: config.include,
                exclude,
                strategy: config.strategy,
                registry,
                on_add,
                on_remove,
            }),
            poll_interval: config.poll_interval,
            signal: None,
            handle: None,
        })
    }

    /// Spawn the scan thread: one immediate pass, then one per poll tick.
    pub(crate) fn start(&mut self) {
        let Some(scanner) = self.scanner.take() else {
            return;
        };
        let (signal, shutdown) = shutdown_channel();
        let interval = self.poll_interval;

        let handle = std::thread::spawn(move || {
            scanner.scan();
            loop {
                if shutdown.sleep(interval) {
                    return;
                }
                scanner.scan();
            }
        });

        self.signal = Some(signal);
        self.handle = Some(handle);
    }

    /// Stop the scan thread. Returns only once any in-flight scan has
    /// finished, so callers may tear down shared state afterwards.
    pub(crate) fn stop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.shutdown();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) struct Scanner {
    include: Vec<String>,
    exclude: Vec<glob::Pattern>,
    strategy: FingerprintStrategy,
    registry: Arc<FileRegistry>,
    on_add: AddCallback,
    on_remove: RemoveCallback,
}

impl Scanner {
    /// One full discovery pass. Never retries within a pass; transient
    /// errors resolve on the next tick.
    pub(crate) fn scan(&self) {
        let mut seen: HashSet<String> = HashSet::new();
        let has_specific = has_specific_includes(&self.include);

        // Roots are re-derived every pass: a non-existent include may have
        // appeared since the last one.
        for root in derive_scan_roots(&self.include) {
            for entry in WalkDir::new(&root) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(root = %root.display(), %err, "failed to walk");
                        continue;
                    }
                };
                if entry.file_type().is_dir() {
                    continue;
                }
                let path = entry.path();

                if !self.include.is_empty() && !path_included(path, &self.include, has_specific) {
                    continue;
                }
                if self.path_excluded(path) {
                    continue;
                }

                // Zero-byte files are not ready to fingerprint.
                match entry.metadata() {
                    Ok(metadata) if metadata.len() == 0 => continue,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(path = %path.display(), %err, "failed to stat");
                        continue;
                    }
                }

                let id = match self.strategy.compute_at_path(path) {
                    Ok(id) => id,
                    Err(err) if err.is_skip() => continue,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "failed to fingerprint");
                        continue;
                    }
                };

                seen.insert(id.clone());

                match self.registry.get(&id) {
                    None => {
                        self.registry
                            .add(&id, path.to_path_buf(), self.strategy.clone(), 0);
                        debug!(id = %id, path = %path.display(), "file discovered");
                        (self.on_add)(&id, path);
                    }
                    // Same identity at a new path: the file was renamed.
                    Some(tracked) if tracked.path != path => {
                        debug!(id = %id, from = %tracked.path.display(),
                            to = %path.display(), "tracked file moved");
                        self.registry.add(
                            &id,
                            path.to_path_buf(),
                            self.strategy.clone(),
                            tracked.offset,
                        );
                    }
                    Some(_) => {}
                }
            }
        }

        for id in self.registry.snapshot().into_keys() {
            if !seen.contains(&id) {
                debug!(id = %id, "file no longer observed");
                (self.on_remove)(&id);
                self.registry.remove(&id);
            }
        }
    }

    fn path_excluded(&self, path: &Path) -> bool {
        let base = path.file_name().map(|n| n.to_string_lossy());
        self.exclude.iter().any(|pattern| {
            pattern.matches_path(path)
                || base
                    .as_deref()
                    .map(|b| pattern.matches(b))
                    .unwrap_or(false)
        })
    }
}

fn has_meta(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Lexical normalization: drops `.` components and redundant separators.
/// `..` is left alone.
fn clean_path(path: &str) -> PathBuf {
    let cleaned: PathBuf = Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

/// True when `a` lives strictly below `b`.
fn is_subpath(a: &Path, b: &Path) -> bool {
    a != b && a.starts_with(b)
}

/// Specific includes (globs, explicit files, or paths that do not exist
/// yet) act as filters; broad directory includes only drive the walk.
fn has_specific_includes(includes: &[String]) -> bool {
    includes.iter().any(|pattern| {
        if has_meta(pattern) {
            return true;
        }
        match std::fs::metadata(clean_path(pattern)) {
            Ok(metadata) => !metadata.is_dir(),
            Err(_) => true,
        }
    })
}

fn path_included(path: &Path, includes: &[String], has_specific: bool) -> bool {
    let clean = clean_path(&path.to_string_lossy());
    let base = path.file_name().map(|n| n.to_string_lossy());

    for pattern in includes {
        let clean_pattern = clean_path(pattern);

        if !has_meta(pattern) {
            let is_dir_include =
                clean_pattern.is_dir() || pattern.ends_with(std::path::MAIN_SEPARATOR);
            if is_dir_include {
                if !has_specific && is_subpath(&clean, &clean_pattern) {
                    return true;
                }
            } else {
                // Exact file include: full path or bare file name.
                let name_match = base
                    .as_deref()
                    .map(|b| Path::new(b) == clean_pattern)
                    .unwrap_or(false);
                if clean == clean_pattern || name_match {
                    return true;
                }
            }
            continue;
        }

        if let Ok(compiled) = glob::Pattern::new(&clean_pattern.to_string_lossy()) {
            if compiled.matches_path(path) {
                return true;
            }
            if base.as_deref().map(|b| compiled.matches(b)).unwrap_or(false) {
                return true;
            }
        }
    }
    false
}

/// Directory to start walking for one include pattern: the deepest
/// directory before the first glob segment, or the path/parent for literal
/// includes.
fn derive_glob_root(pattern: &str) -> PathBuf {
    let clean = clean_path(pattern);
    if !has_meta(&clean.to_string_lossy()) {
        return clean;
    }

    let mut root = PathBuf::new();
    for component in clean.components() {
        if has_meta(&component.as_os_str().to_string_lossy()) {
            break;
        }
        root.push(component);
    }
    if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    }
}

/// Normalize include patterns into deduplicated walk roots.
fn derive_scan_roots(includes: &[String]) -> Vec<PathBuf> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut roots: Vec<PathBuf> = Vec::new();

    for pattern in includes {
        let root = if has_meta(pattern) {
            derive_glob_root(pattern)
        } else {
            let clean = clean_path(pattern);
            match std::fs::metadata(&clean) {
                Ok(metadata) if metadata.is_dir() => clean,
                _ => match clean.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                    _ => PathBuf::from("."),
                },
            }
        };
        if seen.insert(root.clone()) {
            roots.push(root);
        }
    }

    if roots.is_empty() {
        roots.push(PathBuf::from("."));
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_derive_glob_root() {
        assert_eq!(derive_glob_root("/var/log/*.log"), PathBuf::from("/var/log"));
        assert_eq!(derive_glob_root("logs/**/*.txt"), PathBuf::from("logs"));
        assert_eq!(derive_glob_root("*.log"), PathBuf::from("."));
        assert_eq!(derive_glob_root("a/*/b"), PathBuf::from("a"));
    }

    #[test]
    fn test_derive_scan_roots_dedup_and_fallback() {
        let roots = derive_scan_roots(&[
            "/var/log/*.log".to_string(),
            "/var/log/*.txt".to_string(),
        ]);
        assert_eq!(roots, vec![PathBuf::from("/var/log")]);

        assert_eq!(derive_scan_roots(&[]), vec![PathBuf::from(".")]);
    }

    #[test]
    fn test_derive_scan_roots_literal_file_uses_parent() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.log");
        std::fs::write(&file, b"x").unwrap();

        let roots = derive_scan_roots(&[file.to_string_lossy().to_string()]);
        assert_eq!(roots, vec![dir.path().to_path_buf()]);

        // Directory include walks the directory itself.
        let roots = derive_scan_roots(&[dir.path().to_string_lossy().to_string()]);
        assert_eq!(roots, vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn test_overlapping_roots_rejected() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let config = WatcherConfig {
            include: vec![
                dir.path().to_string_lossy().to_string(),
                sub.to_string_lossy().to_string(),
            ],
            exclude: vec![],
            poll_interval: Duration::from_millis(100),
            strategy: FingerprintStrategy::Checksum { size: 1 },
        };
        let result = Watcher::new(
            config,
            Arc::new(FileRegistry::new()),
            Box::new(|_, _| {}),
            Box::new(|_| {}),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_include_pattern_rejected() {
        let config = WatcherConfig {
            include: vec!["logs/[".to_string()],
            exclude: vec![],
            poll_interval: Duration::from_millis(100),
            strategy: FingerprintStrategy::Checksum { size: 1 },
        };
        let result = Watcher::new(
            config,
            Arc::new(FileRegistry::new()),
            Box::new(|_, _| {}),
            Box::new(|_| {}),
        );
        assert!(matches!(result, Err(Error::InvalidGlob(_))));
    }

    struct Events {
        added: Mutex<Vec<(String, PathBuf)>>,
        removed: Mutex<Vec<String>>,
    }

    fn scanner_for(
        include: Vec<String>,
        exclude: Vec<String>,
    ) -> (Scanner, Arc<FileRegistry>, Arc<Events>) {
        let registry = Arc::new(FileRegistry::new());
        let events = Arc::new(Events {
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        });

        let add_events = events.clone();
        let remove_events = events.clone();
        let scanner = Scanner {
            include,
            exclude: exclude
                .iter()
                .map(|p| glob::Pattern::new(p).unwrap())
                .collect(),
            strategy: FingerprintStrategy::Checksum { size: 4 },
            registry: registry.clone(),
            on_add: Box::new(move |id, path| {
                add_events
                    .added
                    .lock()
                    .unwrap()
                    .push((id.to_string(), path.to_path_buf()));
            }),
            on_remove: Box::new(move |id| {
                remove_events.removed.lock().unwrap().push(id.to_string());
            }),
        };
        (scanner, registry, events)
    }

    #[test]
    fn test_scan_discovers_matching_files_once() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.log"), b"content beyond fingerprint").unwrap();
        std::fs::write(dir.path().join("other.txt"), b"text file content").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let (scanner, registry, events) = scanner_for(vec![pattern], vec![]);

        scanner.scan();
        scanner.scan();

        let added = events.added.lock().unwrap();
        assert_eq!(added.len(), 1, "second scan must not re-add");
        assert!(added[0].1.ends_with("app.log"));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_scan_respects_exclude() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.log"), b"application log data").unwrap();
        std::fs::write(dir.path().join("app_debug.log"), b"debug log data").unwrap();

        let include = format!("{}/*.log", dir.path().display());
        let exclude = format!("{}/*_debug.log", dir.path().display());
        let (scanner, registry, _events) = scanner_for(vec![include], vec![exclude]);

        scanner.scan();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.values().next().unwrap().path.ends_with("app.log"));
    }

    #[test]
    fn test_scan_skips_zero_byte_and_too_small_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty.log"), b"").unwrap();
        std::fs::write(dir.path().join("tiny.log"), b"ab").unwrap(); // below fingerprint size
        std::fs::write(dir.path().join("ready.log"), b"large enough").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let (scanner, registry, _events) = scanner_for(vec![pattern], vec![]);

        scanner.scan();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.values().next().unwrap().path.ends_with("ready.log"));
    }

    #[test]
    fn test_scan_reports_removal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"content beyond fingerprint").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let (scanner, registry, events) = scanner_for(vec![pattern], vec![]);

        scanner.scan();
        assert_eq!(registry.snapshot().len(), 1);

        std::fs::remove_file(&path).unwrap();
        scanner.scan();

        assert_eq!(registry.snapshot().len(), 0);
        assert_eq!(events.removed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rotation_produces_new_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"first generation content").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let (scanner, _registry, events) = scanner_for(vec![pattern], vec![]);

        scanner.scan();

        // Truncate-and-recreate with different leading bytes.
        std::fs::write(&path, b"second generation content").unwrap();
        scanner.scan();

        let added = events.added.lock().unwrap();
        let removed = events.removed.lock().unwrap();
        assert_eq!(added.len(), 2);
        assert_ne!(added[0].0, added[1].0);
        assert_eq!(removed.as_slice(), &[added[0].0.clone()]);
    }

    #[test]
    fn test_rename_rewrites_path_and_preserves_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"stable content for checksum").unwrap();

        let pattern = format!("{}/*.log*", dir.path().display());
        let (scanner, registry, events) = scanner_for(vec![pattern], vec![]);

        scanner.scan();
        let id = events.added.lock().unwrap()[0].0.clone();
        registry.update_offset(&id, 10);

        // Rename keeps the content, so the checksum identity is unchanged.
        let renamed = dir.path().join("app.log.1");
        std::fs::rename(&path, &renamed).unwrap();
        scanner.scan();

        let tracked = registry.get(&id).unwrap();
        assert_eq!(tracked.path, renamed);
        assert_eq!(tracked.offset, 10);
        assert_eq!(events.added.lock().unwrap().len(), 1);
        assert!(events.removed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_broad_directory_include_accepts_walked_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("one.log"), b"first file body").unwrap();
        std::fs::write(dir.path().join("two.txt"), b"second file body").unwrap();

        let include = dir.path().to_string_lossy().to_string();
        let (scanner, registry, _events) = scanner_for(vec![include], vec![]);

        scanner.scan();
        assert_eq!(registry.snapshot().len(), 2);
    }
}
