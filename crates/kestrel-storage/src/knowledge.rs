use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

pub const SUPPORTED_EXTENSIONS: &[&str] = &["py", "txt", "md", "json", "js"];

/// A directory of reference files fed verbatim into prompts.
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    dir: PathBuf,
}

impl KnowledgeBase {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn is_supported(file_name: &str) -> bool {
        Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// Names of supported files, sorted. A missing directory is empty.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.dir.display()))
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if Self::is_supported(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Renders up to `limit` files as "Example from {name}:" blocks.
    pub fn load(&self, limit: usize, per_file_chars: usize) -> String {
        let names = match self.list() {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("Knowledge base unavailable: {}", e);
                return String::new();
            }
        };

        let mut blocks = Vec::new();
        for name in names {
            if blocks.len() >= limit {
                break;
            }
            let path = self.dir.join(&name);
            let content = match std::fs::read(&path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    tracing::debug!(file = %path.display(), "Skipping unreadable file: {}", e);
                    continue;
                }
            };
            let excerpt: String = content.chars().take(per_file_chars).collect();
            blocks.push(format!("Example from {}:\n{}", name, excerpt));
        }
        blocks.join("\n\n")
    }

    /// Stores an uploaded file; returns the path written.
    pub fn save(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let name = sanitize_file_name(file_name);
        if name.is_empty() {
            bail!("file name '{}' is not usable", file_name);
        }
        if !Self::is_supported(&name) {
            bail!(
                "unsupported file type '{}' (accepted: {})",
                name,
                SUPPORTED_EXTENSIONS.join(", ")
            );
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(&name);
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(file = %path.display(), bytes = bytes.len(), "Stored knowledge file");
        Ok(path)
    }
}

fn sanitize_file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    base.trim()
        .trim_start_matches('.')
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("kestrel-kb-{}-{}", name, ts))
    }

    #[test]
    fn missing_directory_loads_as_empty() {
        let kb = KnowledgeBase::new(temp_dir("missing"));
        assert_eq!(kb.load(5, 500), "");
        assert!(kb.list().expect("list").is_empty());
    }

    #[test]
    fn load_is_sorted_limited_and_truncated() {
        let dir = temp_dir("load");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("b.md"), "bbbbbbbbbb").expect("write");
        std::fs::write(dir.join("a.py"), "print('a')").expect("write");
        std::fs::write(dir.join("c.txt"), "ccc").expect("write");
        std::fs::write(dir.join("skip.bin"), "zzz").expect("write");

        let kb = KnowledgeBase::new(&dir);
        assert_eq!(kb.list().expect("list"), vec!["a.py", "b.md", "c.txt"]);
        assert_eq!(
            kb.load(2, 4),
            "Example from a.py:\nprin\n\nExample from b.md:\nbbbb"
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn save_strips_path_components() {
        let dir = temp_dir("save");
        let kb = KnowledgeBase::new(&dir);
        let path = kb.save("../../.secret/notes.md", b"# notes").expect("save");
        assert_eq!(path, dir.join("notes.md"));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "# notes");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn save_rejects_unsupported_types() {
        let kb = KnowledgeBase::new(temp_dir("reject"));
        assert!(kb.save("payload.exe", b"MZ").is_err());
        assert!(kb.save("..", b"").is_err());
    }

    #[test]
    fn hidden_names_lose_leading_dots() {
        assert_eq!(sanitize_file_name(".env.md"), "env.md");
        assert_eq!(sanitize_file_name("C:\\docs\\api.JSON"), "api.JSON");
        assert!(KnowledgeBase::is_supported("api.JSON"));
    }
}
