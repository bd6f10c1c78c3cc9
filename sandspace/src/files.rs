//! Workspace file access.
//!
//! Every operation runs as the sandbox user inside the space, on a path that
//! has been normalized and clamped to the workspace root first.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sandspace_protocol::{FileContent, FileEntry, FileKind, WriteFileRequest, DEFAULT_READ_BUDGET};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::audit::AuditKind;
use crate::error::{SpaceError, SpaceResult};
use crate::exec::collect;
use crate::runtime::ExecSpec;
use crate::space::SpaceManager;

/// Upper bound for a single read, whatever the caller asks for.
pub const MAX_READ_BYTES: u64 = 16 * 1024 * 1024;
pub const MAX_WRITE_BYTES: usize = 16 * 1024 * 1024;

/// Base64 characters per exec argument. A multiple of 4 so every batch
/// decodes on its own.
const WRITE_CHUNK: usize = 96 * 1024;
const CHUNKS_PER_EXEC: usize = 8;

/// Exit code the scripts use for a missing or mistyped path.
const EXIT_BAD_PATH: i64 = 2;

const LIST_SCRIPT: &str = r#"[ -d "$1" ] || { echo "not a directory: $1" >&2; exit 2; }
for f in "$1"/* "$1"/.[!.]* "$1"/..?*; do
  [ -e "$f" ] || [ -L "$f" ] || continue
  stat -c '%F|%s|%Y|%n' "$f"
done
"#;

const READ_SCRIPT: &str = r#"[ -f "$1" ] || { echo "not a regular file: $1" >&2; exit 2; }
head -c "$2" "$1" | base64
"#;

const WRITE_BEGIN_SCRIPT: &str = r#"set -e
[ ! -d "$1" ] || { echo "is a directory: $1" >&2; exit 2; }
mkdir -p "$(dirname "$1")"
: > "$2"
"#;

const WRITE_APPEND_SCRIPT: &str = r#"set -e
f="$1"; shift
for c in "$@"; do printf '%s' "$c"; done | base64 -d >> "$f"
"#;

const WRITE_COMMIT_SCRIPT: &str = r#"set -e
mv -f "$2" "$1"
"#;

const WRITE_ABORT_SCRIPT: &str = r#"rm -f "$1"
"#;

/// Resolve `input` against `root` the way a shell would (`.` and empty
/// segments dropped, `..` pops a segment, absolute paths start from `/`). A
/// result outside the root collapses to the root itself.
pub fn resolve_workspace_path(root: &str, input: &str) -> String {
    let root = format!("/{}", root.trim_matches('/'));

    let mut parts: Vec<&str> = if input.starts_with('/') {
        Vec::new()
    } else {
        root.split('/').filter(|s| !s.is_empty()).collect()
    };
    for segment in input.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }

    let resolved = format!("/{}", parts.join("/"));
    let inside = resolved == root
        || root == "/"
        || resolved
            .strip_prefix(root.as_str())
            .is_some_and(|rest| rest.starts_with('/'));
    if inside {
        resolved
    } else {
        root
    }
}

/// Parse one `stat -c '%F|%s|%Y|%n'` line.
fn parse_stat_line(root: &str, line: &str) -> Option<FileEntry> {
    let mut fields = line.splitn(4, '|');
    let kind = match fields.next()? {
        "directory" => FileKind::Dir,
        "symbolic link" => FileKind::Symlink,
        "regular file" | "regular empty file" => FileKind::File,
        _ => FileKind::Other,
    };
    let size = fields.next()?.parse().ok()?;
    let mtime_secs: u64 = fields.next()?.parse().ok()?;
    let full = fields.next()?;
    let name = full.rsplit('/').next()?.to_string();
    let path = full
        .strip_prefix(root)
        .unwrap_or(full)
        .trim_start_matches('/')
        .to_string();
    Some(FileEntry {
        name,
        path,
        kind,
        size,
        mtime_ms: mtime_secs * 1000,
    })
}

/// Decode a read's base64 output and apply the byte budget.
fn decode_read(raw: &str, budget: u64) -> SpaceResult<(Vec<u8>, bool)> {
    let compact: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let mut bytes = STANDARD.decode(compact.as_bytes()).map_err(|e| {
        SpaceError::InvalidRequest(format!("workspace read returned invalid data: {}", e))
    })?;
    let budget = budget as usize;
    let truncated = bytes.len() > budget;
    bytes.truncate(budget);
    Ok((bytes, truncated))
}

fn bad_path(stderr: &str, fallback: &str) -> SpaceError {
    let msg = stderr.trim();
    SpaceError::InvalidRequest(if msg.is_empty() {
        fallback.to_string()
    } else {
        msg.to_string()
    })
}

#[derive(Clone)]
pub struct WorkspaceFiles {
    manager: Arc<SpaceManager>,
}

impl WorkspaceFiles {
    pub fn new(manager: Arc<SpaceManager>) -> Self {
        Self { manager }
    }

    fn root(&self) -> &str {
        &self.manager.config().runtime.workspace_mount
    }

    async fn run_script(
        &self,
        space: &str,
        script: &str,
        args: Vec<String>,
    ) -> SpaceResult<(String, String, i64)> {
        let info = self.manager.ensure_running(space).await?;
        let rt = &self.manager.config().runtime;
        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
        ];
        argv.extend(args);
        let spec = ExecSpec {
            argv,
            user: Some(rt.user.clone()),
            working_dir: Some(rt.workspace_mount.clone()),
            ..Default::default()
        };
        let (out, exit_code) = collect(self.manager.runtime(), &info.name, &spec)
            .await
            .map_err(|e| SpaceError::runtime(space, e))?;
        self.manager.activity().touch(space);
        Ok((out.stdout_lossy(), out.stderr_lossy(), exit_code))
    }

    /// Entries of a workspace directory, directories first then by name.
    #[instrument(skip(self))]
    pub async fn list(&self, space: &str, path: &str) -> SpaceResult<Vec<FileEntry>> {
        let dir = resolve_workspace_path(self.root(), path);
        let (stdout, stderr, code) = self.run_script(space, LIST_SCRIPT, vec![dir.clone()]).await?;
        if code == EXIT_BAD_PATH {
            return Err(bad_path(&stderr, "not a directory"));
        }
        if code != 0 {
            return Err(SpaceError::InvalidRequest(format!(
                "listing {} failed: {}",
                dir,
                stderr.trim()
            )));
        }

        let root = self.root();
        let mut entries: Vec<FileEntry> = stdout
            .lines()
            .filter_map(|line| parse_stat_line(root, line))
            .collect();
        entries.sort_by(|a, b| {
            (a.kind != FileKind::Dir)
                .cmp(&(b.kind != FileKind::Dir))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    /// Read up to `max_bytes` (default 256 KiB). Truncation is reported.
    #[instrument(skip(self))]
    pub async fn read(&self, space: &str, path: &str, max_bytes: Option<u64>) -> SpaceResult<FileContent> {
        let budget = max_bytes.unwrap_or(DEFAULT_READ_BUDGET).clamp(1, MAX_READ_BYTES);
        let file = resolve_workspace_path(self.root(), path);
        // One byte past the budget tells us whether the file is longer.
        let (stdout, stderr, code) = self
            .run_script(space, READ_SCRIPT, vec![file.clone(), (budget + 1).to_string()])
            .await?;
        if code == EXIT_BAD_PATH {
            return Err(bad_path(&stderr, "not a regular file"));
        }
        if code != 0 {
            return Err(SpaceError::InvalidRequest(format!(
                "reading {} failed: {}",
                file,
                stderr.trim()
            )));
        }

        let (bytes, truncated) = decode_read(&stdout, budget)?;
        debug!(space = %space, path = %file, bytes = bytes.len(), truncated, "file read");
        Ok(FileContent {
            path: file,
            content_base64: STANDARD.encode(&bytes),
            truncated,
        })
    }

    /// Write a file from base64 content, creating parent directories. The
    /// content lands in a temporary sibling and is renamed into place.
    #[instrument(skip(self, req), fields(path = %req.path))]
    pub async fn write(&self, space: &str, req: &WriteFileRequest) -> SpaceResult<u64> {
        let bytes = STANDARD
            .decode(req.content_base64.trim().as_bytes())
            .map_err(|e| SpaceError::InvalidRequest(format!("content_base64 is not valid base64: {}", e)))?;
        if bytes.len() > MAX_WRITE_BYTES {
            return Err(SpaceError::InvalidRequest(format!(
                "content is {} bytes, maximum is {}",
                bytes.len(),
                MAX_WRITE_BYTES
            )));
        }

        let root = self.root().to_string();
        let file = resolve_workspace_path(&root, &req.path);
        if file == root {
            return Err(SpaceError::InvalidRequest("path must name a file".into()));
        }
        let partial = format!("{}.sandspace-partial", file);

        let (_, stderr, code) = self
            .run_script(space, WRITE_BEGIN_SCRIPT, vec![file.clone(), partial.clone()])
            .await?;
        if code != 0 {
            return Err(bad_path(&stderr, "cannot create file"));
        }

        if let Err(e) = self.fill_and_commit(space, &file, &partial, &bytes).await {
            if let Err(e2) = self
                .run_script(space, WRITE_ABORT_SCRIPT, vec![partial.clone()])
                .await
            {
                warn!(space = %space, path = %partial, error = %e2, "failed to remove partial file");
            }
            return Err(e);
        }

        self.manager.audit().record(
            AuditKind::FileWrite,
            space,
            json!({ "path": file, "bytes": bytes.len() }),
        );
        Ok(bytes.len() as u64)
    }

    /// Append `bytes` to the staged `partial` file, then rename it onto `file`.
    async fn fill_and_commit(
        &self,
        space: &str,
        file: &str,
        partial: &str,
        bytes: &[u8],
    ) -> SpaceResult<()> {
        let encoded = STANDARD.encode(bytes);
        let chunks: Vec<&str> = encoded
            .as_bytes()
            .chunks(WRITE_CHUNK)
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect();
        for batch in chunks.chunks(CHUNKS_PER_EXEC) {
            let mut args = vec![partial.to_string()];
            args.extend(batch.iter().map(|c| c.to_string()));
            let (_, stderr, code) = self.run_script(space, WRITE_APPEND_SCRIPT, args).await?;
            if code != 0 {
                return Err(write_failed(file, &stderr));
            }
        }

        let (_, stderr, code) = self
            .run_script(
                space,
                WRITE_COMMIT_SCRIPT,
                vec![file.to_string(), partial.to_string()],
            )
            .await?;
        if code != 0 {
            return Err(write_failed(file, &stderr));
        }
        Ok(())
    }
}

fn write_failed(file: &str, stderr: &str) -> SpaceError {
    SpaceError::InvalidRequest(format!("writing {} failed: {}", file, stderr.trim()))
}
