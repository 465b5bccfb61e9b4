use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::info;

use crate::core::error::{EngineError, Result};
use crate::core::store::Store;
use crate::core::store::types::ScriptVersionRecord;

/// Content-addressed script versioning. Version rows are immutable; the
/// current pointer moves forward only.
pub struct VersionStore {
    store: Store,
    scripts_dir: PathBuf,
}

impl VersionStore {
    pub fn new(store: Store, scripts_dir: PathBuf) -> Self {
        Self { store, scripts_dir }
    }

    /// Publish a new body for a script. Idempotent on content: when the
    /// current version already carries this digest and `force` is unset, the
    /// existing version id comes back and nothing is written.
    pub async fn publish(
        &self,
        script_id: i64,
        body: &str,
        label: Option<&str>,
        force: bool,
    ) -> Result<i64> {
        let script = self
            .store
            .get_script(script_id)
            .await?
            .ok_or_else(|| EngineError::not_found("script", script_id))?;

        let digest = hex::encode(Sha256::digest(body.as_bytes()));
        if !force
            && let Some(current) = self.store.current_version(script_id).await?
            && current.content_hash == digest
        {
            info!("Script {script_id} body unchanged, keeping version {}", current.label);
            return Ok(current.id);
        }

        let label = match label {
            Some(label) => label.to_string(),
            None => next_label(self.store.latest_version_label(script_id).await?.as_deref()),
        };

        std::fs::create_dir_all(&self.scripts_dir)?;
        let file_name = format!("script{script_id}-v{label}.{}", script.interpreter.extension());
        let path = self.scripts_dir.join(file_name);
        std::fs::write(&path, body)?;

        let path_text = path.to_string_lossy().into_owned();
        let version_id = self
            .store
            .insert_version(script_id, &label, &digest, Some(body), &path_text)
            .await?;
        info!("Published version {label} of script {script_id} ({digest})");
        Ok(version_id)
    }

    pub async fn get_version(&self, version_id: i64) -> Result<ScriptVersionRecord> {
        self.store
            .get_version(version_id)
            .await?
            .ok_or_else(|| EngineError::not_found("script version", version_id))
    }

    pub async fn list_versions(&self, script_id: i64) -> Result<Vec<ScriptVersionRecord>> {
        self.store.list_versions(script_id).await
    }

    /// Body of a stored version: the inline copy when present, otherwise the
    /// file it was written to.
    pub async fn read_body(&self, version_id: i64) -> Result<String> {
        let version = self.get_version(version_id).await?;
        if let Some(body) = version.body {
            return Ok(body);
        }
        Ok(std::fs::read_to_string(&version.file_path)?)
    }

    /// Line diff of two stored versions, oldest-first semantics left to the
    /// caller.
    pub async fn diff_versions(&self, a: i64, b: i64) -> Result<String> {
        let left = self.read_body(a).await?;
        let right = self.read_body(b).await?;
        Ok(diff_lines(&left, &right))
    }
}

/// Next patch label: bump the last component of `major.minor.patch`. Anything
/// unparsable (including no prior version) starts over at 1.0.0.
fn next_label(latest: Option<&str>) -> String {
    let Some(latest) = latest else {
        return "1.0.0".to_string();
    };
    let parts: Vec<_> = latest.split('.').map(|p| p.parse::<u64>()).collect();
    match parts.as_slice() {
        [Ok(major), Ok(minor), Ok(patch)] => format!("{major}.{minor}.{}", patch + 1),
        _ => "1.0.0".to_string(),
    }
}

/// Plain line-based LCS diff: unchanged lines prefixed with two spaces,
/// removals with `- `, additions with `+ `.
pub fn diff_lines(left: &str, right: &str) -> String {
    let a: Vec<&str> = left.lines().collect();
    let b: Vec<&str> = right.lines().collect();

    // LCS length table.
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut out = String::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            out.push_str("  ");
            out.push_str(a[i]);
            out.push('\n');
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            out.push_str("- ");
            out.push_str(a[i]);
            out.push('\n');
            i += 1;
        } else {
            out.push_str("+ ");
            out.push_str(b[j]);
            out.push('\n');
            j += 1;
        }
    }
    for line in &a[i..] {
        out.push_str("- ");
        out.push_str(line);
        out.push('\n');
    }
    for line in &b[j..] {
        out.push_str("+ ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::interpreter::InterpreterKind;
    use crate::core::store::types::OutputMode;

    async fn fixture() -> (VersionStore, Store, i64, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let script_id = store
            .create_script("job", "", InterpreterKind::Python, OutputMode::Text, None)
            .await
            .unwrap();
        let versions = VersionStore::new(store.clone(), dir.path().join("scripts"));
        (versions, store, script_id, dir)
    }

    #[tokio::test]
    async fn republishing_the_same_body_is_idempotent() {
        let (versions, store, script_id, _dir) = fixture().await;

        let first = versions.publish(script_id, "print(1)\n", None, false).await.unwrap();
        let second = versions.publish(script_id, "print(1)\n", None, false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_versions(script_id).await.unwrap().len(), 1);

        // force bypasses the digest check.
        let third = versions.publish(script_id, "print(1)\n", None, true).await.unwrap();
        assert_ne!(first, third);
        assert_eq!(store.list_versions(script_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn labels_bump_the_patch_component() {
        let (versions, store, script_id, _dir) = fixture().await;

        versions.publish(script_id, "a\n", None, false).await.unwrap();
        versions.publish(script_id, "b\n", None, false).await.unwrap();
        let explicit = versions.publish(script_id, "c\n", Some("2.0.0"), false).await.unwrap();
        versions.publish(script_id, "d\n", None, false).await.unwrap();

        let current = store.current_version(script_id).await.unwrap().unwrap();
        assert_eq!(current.label, "2.0.1");
        assert_eq!(versions.get_version(explicit).await.unwrap().label, "2.0.0");
    }

    #[tokio::test]
    async fn read_body_falls_back_to_the_file() {
        let (versions, store, script_id, _dir) = fixture().await;
        let id = versions.publish(script_id, "print('x')\n", None, false).await.unwrap();
        assert_eq!(versions.read_body(id).await.unwrap(), "print('x')\n");

        // Blank out the inline copy; the file on disk still answers.
        {
            let db = store.db.lock().await;
            db.execute("UPDATE script_versions SET body = NULL WHERE id = ?1", [id]).unwrap();
        }
        assert_eq!(versions.read_body(id).await.unwrap(), "print('x')\n");
    }

    #[tokio::test]
    async fn publish_repoints_the_script() {
        let (versions, store, script_id, _dir) = fixture().await;
        versions.publish(script_id, "one\n", None, false).await.unwrap();
        let script = store.get_script(script_id).await.unwrap().unwrap();
        assert!(script.file_path.ends_with("script1-v1.0.0.py"));
        assert_eq!(std::fs::read_to_string(&script.file_path).unwrap(), "one\n");
    }

    #[test]
    fn next_label_defaults_and_bumps() {
        assert_eq!(next_label(None), "1.0.0");
        assert_eq!(next_label(Some("1.0.0")), "1.0.1");
        assert_eq!(next_label(Some("2.3.9")), "2.3.10");
        assert_eq!(next_label(Some("garbage")), "1.0.0");
    }

    #[test]
    fn diff_marks_changed_lines() {
        let diff = diff_lines("a\nb\nc\n", "a\nx\nc\n");
        assert_eq!(diff, "  a\n- b\n+ x\n  c\n");
        assert_eq!(diff_lines("same\n", "same\n"), "  same\n");
    }
}
