use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};

/// Per-build skip/warning metadata the UI renders alongside a context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtefactMetadata {
    pub warnings: Vec<String>,
    /// Paths that did not make it into the context (or made it truncated).
    pub skipped_files: Vec<String>,
    /// Path → reason ("outside project", "test", "too large",
    /// "truncated:tokens", "excluded:tokens", …).
    pub skipped_reasons: BTreeMap<String, String>,
}

/// A persisted, packaged context: `<id>.ctx` body plus this sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextArtefact {
    /// `stream_<n>`, monotonic within the process.
    pub id: String,
    pub name: String,
    pub project_path: String,
    /// Post-filter list of files actually included.
    pub files: Vec<String>,
    pub line_count: usize,
    pub total_bytes: u64,
    pub token_count: usize,
    /// RFC3339.
    pub created_at: String,
    pub metadata: ArtefactMetadata,
}

/// Filesystem-backed store for context artefacts.
///
/// Bodies are written atomically (temp + rename) and read as line streams;
/// concurrent reads are safe, writes are serialised.
pub struct ContextStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
    next: AtomicU64,
}

fn validate_id(id: &str) -> CoreResult<()> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(CoreError::InvalidInput(format!("malformed context id: {id}")));
    }
    Ok(())
}

impl ContextStore {
    /// Open (and create) the store directory. The id counter resumes past
    /// any artefacts already on disk.
    pub fn open(dir: PathBuf) -> CoreResult<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| CoreError::io("create_dir", dir.clone(), e))?;

        let mut highest = 0u64;
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(rest) = name.strip_prefix("stream_") {
                    if let Some(num) = rest.split('.').next().and_then(|n| n.parse::<u64>().ok()) {
                        highest = highest.max(num);
                    }
                }
            }
        }

        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            next: AtomicU64::new(highest + 1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_id(&self) -> String {
        format!("stream_{}", self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn body_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.ctx"))
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist a finished artefact: body first, sidecar second, both via
    /// temp-file + rename so a crash never leaves a half-written context.
    pub fn create(&self, artefact: &ContextArtefact, body: &str) -> CoreResult<()> {
        validate_id(&artefact.id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let body_path = self.body_path(&artefact.id);
        let tmp = body_path.with_extension("ctx.tmp");
        std::fs::write(&tmp, body).map_err(|e| CoreError::io("write", tmp.clone(), e))?;
        std::fs::rename(&tmp, &body_path)
            .map_err(|e| CoreError::io("rename", body_path.clone(), e))?;

        let sidecar = self.sidecar_path(&artefact.id);
        let tmp = sidecar.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(artefact)
            .map_err(|e| CoreError::InvalidInput(format!("unserialisable artefact: {e}")))?;
        std::fs::write(&tmp, json).map_err(|e| CoreError::io("write", tmp.clone(), e))?;
        std::fs::rename(&tmp, &sidecar).map_err(|e| CoreError::io("rename", sidecar, e))?;
        Ok(())
    }

    /// Lines `[start, end]` (1-indexed, inclusive) of a context body.
    /// Scans line by line; never buffers the whole file.
    pub fn get_lines(&self, id: &str, start: usize, end: usize) -> CoreResult<Vec<String>> {
        validate_id(id)?;
        if start == 0 || end < start {
            return Err(CoreError::InvalidInput(format!(
                "bad line range [{start}, {end}]"
            )));
        }

        let path = self.body_path(id);
        let file = std::fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(id.to_string()),
            _ => CoreError::io("read", path.clone(), e),
        })?;

        let mut out = Vec::with_capacity(end - start + 1);
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line_no = idx + 1;
            if line_no > end {
                break;
            }
            let line = line.map_err(|e| CoreError::io("read", path.clone(), e))?;
            if line_no >= start {
                out.push(line);
            }
        }
        Ok(out)
    }

    pub fn get_full_content(&self, id: &str) -> CoreResult<String> {
        validate_id(id)?;
        let path = self.body_path(id);
        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(id.to_string()),
            _ => CoreError::io("read", path, e),
        })
    }

    pub fn get_artefact(&self, id: &str) -> CoreResult<ContextArtefact> {
        validate_id(id)?;
        let path = self.sidecar_path(id);
        let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(id.to_string()),
            _ => CoreError::io("read", path.clone(), e),
        })?;
        serde_json::from_str(&text)
            .map_err(|e| CoreError::InvalidInput(format!("corrupt sidecar for {id}: {e}")))
    }

    /// Remove body and sidecar. Deleting an unknown id is `NotFound`.
    pub fn delete(&self, id: &str) -> CoreResult<()> {
        validate_id(id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let body = self.body_path(id);
        let sidecar = self.sidecar_path(id);
        let had_body = body.exists();
        let had_sidecar = sidecar.exists();
        if !had_body && !had_sidecar {
            return Err(CoreError::NotFound(id.to_string()));
        }
        if had_body {
            std::fs::remove_file(&body).map_err(|e| CoreError::io("delete", body.clone(), e))?;
        }
        if had_sidecar {
            std::fs::remove_file(&sidecar).map_err(|e| CoreError::io("delete", sidecar, e))?;
        }
        Ok(())
    }

    /// All artefacts, optionally filtered by project path, newest first.
    pub fn list(&self, project_path: Option<&str>) -> CoreResult<Vec<ContextArtefact>> {
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| CoreError::io("read_dir", self.dir.clone(), e))?;

        let mut out: Vec<ContextArtefact> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(artefact) = serde_json::from_str::<ContextArtefact>(&text) else {
                log::warn!("skipping corrupt sidecar {}", path.display());
                continue;
            };
            if project_path.is_none_or(|p| artefact.project_path == p) {
                out.push(artefact);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Apply the retention policy: keep at most `max_count` artefacts and
    /// drop anything older than `max_age_days`. Returns how many were
    /// removed.
    pub fn purge(&self, max_count: usize, max_age_days: u64) -> CoreResult<usize> {
        let artefacts = self.list(None)?;
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);

        let mut removed = 0;
        for (idx, artefact) in artefacts.iter().enumerate() {
            let too_many = idx >= max_count;
            let too_old = DateTime::parse_from_rfc3339(&artefact.created_at)
                .map(|t| t.with_timezone(&Utc) < cutoff)
                .unwrap_or(false);
            if too_many || too_old {
                self.delete(&artefact.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artefact(id: &str, created_at: &str) -> ContextArtefact {
        ContextArtefact {
            id: id.to_string(),
            name: "selection".into(),
            project_path: "/p".into(),
            files: vec!["a.rs".into()],
            line_count: 3,
            total_bytes: 12,
            token_count: 3,
            created_at: created_at.to_string(),
            metadata: ArtefactMetadata::default(),
        }
    }

    fn open_store() -> (tempfile::TempDir, ContextStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::open(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    #[test]
    fn ids_are_monotonic_and_resume_past_existing_artefacts() {
        let (dir, store) = open_store();
        let first = store.next_id();
        let second = store.next_id();
        assert_eq!(first, "stream_1");
        assert_eq!(second, "stream_2");

        store
            .create(&artefact("stream_7", "2026-01-01T00:00:00Z"), "x\n")
            .unwrap();
        drop(store);
        let reopened = ContextStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.next_id(), "stream_8");
    }

    #[test]
    fn line_pagination_is_one_indexed_and_inclusive() {
        let (_dir, store) = open_store();
        store
            .create(
                &artefact("stream_1", "2026-01-01T00:00:00Z"),
                "one\ntwo\nthree\nfour\n",
            )
            .unwrap();

        assert_eq!(store.get_lines("stream_1", 2, 3).unwrap(), vec!["two", "three"]);
        assert_eq!(store.get_lines("stream_1", 1, 99).unwrap().len(), 4);
        assert!(matches!(
            store.get_lines("stream_1", 0, 3),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            store.get_lines("stream_9", 1, 2),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn delete_removes_body_and_sidecar() {
        let (dir, store) = open_store();
        store
            .create(&artefact("stream_1", "2026-01-01T00:00:00Z"), "x\n")
            .unwrap();
        store.delete("stream_1").unwrap();
        assert!(!dir.path().join("stream_1.ctx").exists());
        assert!(!dir.path().join("stream_1.json").exists());
        assert!(matches!(
            store.delete("stream_1"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn list_filters_by_project_and_sorts_newest_first() {
        let (_dir, store) = open_store();
        store
            .create(&artefact("stream_1", "2026-01-01T00:00:00Z"), "a\n")
            .unwrap();
        store
            .create(&artefact("stream_2", "2026-02-01T00:00:00Z"), "b\n")
            .unwrap();
        let mut other = artefact("stream_3", "2026-03-01T00:00:00Z");
        other.project_path = "/q".into();
        store.create(&other, "c\n").unwrap();

        let listed = store.list(Some("/p")).unwrap();
        let ids: Vec<&str> = listed.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["stream_2", "stream_1"]);
    }

    #[test]
    fn purge_enforces_the_count_cap() {
        let (_dir, store) = open_store();
        for (id, ts) in [
            ("stream_1", "2026-01-01T00:00:00Z"),
            ("stream_2", "2026-02-01T00:00:00Z"),
            ("stream_3", "2026-03-01T00:00:00Z"),
        ] {
            store.create(&artefact(id, ts), "x\n").unwrap();
        }
        let removed = store.purge(2, 36500).unwrap();
        assert_eq!(removed, 1);
        let remaining = store.list(None).unwrap();
        let ids: Vec<&str> = remaining.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["stream_3", "stream_2"]);
    }

    #[test]
    fn malformed_ids_are_rejected_before_touching_disk() {
        let (_dir, store) = open_store();
        assert!(matches!(
            store.get_full_content("../escape"),
            Err(CoreError::InvalidInput(_))
        ));
    }
}
