use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;

use crate::error::{AppError, AppResult};
use crate::models::credentials::{Account, Credentials};

static EMAIL_SANITIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9@.]").expect("invalid sanitize regex"));

pub fn sanitized_email_file_name(email: &str) -> String {
    format!("{}.json", EMAIL_SANITIZE_RE.replace_all(email, "_"))
}

pub fn fallback_file_name(now_ms: i64) -> String {
    format!("oauth-{}.json", now_ms)
}

// Deletion goes through user-supplied names; anything that could escape the
// auth directory is rejected outright.
pub fn validate_file_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(format!("invalid account file name: {}", name));
    }
    if !name.ends_with(".json") {
        return Err(format!("account file must end in .json: {}", name));
    }
    Ok(())
}

pub fn ensure_auth_dir(dir: &Path) -> AppResult<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

// Scan the auth directory in sorted filename order so pool indices are
// deterministic across restarts. Inadmissible records are skipped, not fatal.
pub fn scan_accounts(dir: &Path) -> AppResult<Vec<Arc<Account>>> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut accounts = Vec::new();
    for path in paths {
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read credential file");
                continue;
            }
        };
        let creds: Credentials = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse credential file");
                continue;
            }
        };
        if !creds.is_admissible() {
            tracing::warn!(path = %path.display(), "credential record rejected on load");
            continue;
        }
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        accounts.push(Arc::new(Account::new(id, path, creds)));
    }
    Ok(accounts)
}

// Atomic with respect to readers: write a temp file in the same directory,
// then rename into place. 0600 where the OS supports it.
pub fn write_credentials(path: &Path, creds: &Credentials) -> AppResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Account(format!("credential path has no parent: {:?}", path)))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!("{}.tmp", file_name));

    let content = serde_json::to_string_pretty(creds)?;
    std::fs::write(&temp_path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600));
    }
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
