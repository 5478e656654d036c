use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// On-disk credential record, one JSON file per account. The file is always
// rewritten whole; partial updates never touch disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    // Absolute expiry, ms since epoch. Missing on disk means already stale.
    #[serde(default)]
    pub expiry_date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, rename = "projectId", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(
        default,
        rename = "projectIdResolvedAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_id_resolved_at: Option<String>,
}

impl Credentials {
    // Admission rule for records loaded from the auth directory.
    pub fn is_admissible(&self) -> bool {
        let has_type = self.token_type.as_deref().is_some_and(|s| !s.is_empty());
        let has_scope = self.scope.as_deref().is_some_and(|s| !s.is_empty());
        !self.access_token.is_empty() && !self.refresh_token.is_empty() && (has_type || has_scope)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_date <= now_ms
    }

    // A project id counts only when the resolved-at marker proves the core
    // obtained it itself; anything else is re-resolved before use.
    pub fn verified_project_id(&self) -> Option<&str> {
        let resolved = self
            .project_id_resolved_at
            .as_deref()
            .is_some_and(|s| !s.is_empty());
        match self.project_id.as_deref() {
            Some(id) if !id.is_empty() && resolved => Some(id),
            _ => None,
        }
    }

    pub fn has_verified_project_id(&self) -> bool {
        self.verified_project_id().is_some()
    }
}

// One slot in the rotation pool. The two async mutexes are the per-account
// single-flight slots: refresh and project-id resolution each admit one
// operation, queued callers re-check state after acquiring.
pub struct Account {
    pub id: String,
    pub path: PathBuf,
    creds: RwLock<Credentials>,
    pub(crate) refresh_lock: tokio::sync::Mutex<()>,
    pub(crate) project_lock: tokio::sync::Mutex<()>,
}

impl Account {
    pub fn new(id: String, path: PathBuf, creds: Credentials) -> Self {
        Self {
            id,
            path,
            creds: RwLock::new(creds),
            refresh_lock: tokio::sync::Mutex::new(()),
            project_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn credentials(&self) -> Credentials {
        self.creds.read().clone()
    }

    pub fn update_credentials(&self, update: impl FnOnce(&mut Credentials)) {
        update(&mut self.creds.write());
    }

    pub fn access_token(&self) -> String {
        self.creds.read().access_token.clone()
    }

    pub fn expiry_date(&self) -> i64 {
        self.creds.read().expiry_date
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_creds() -> Credentials {
        Credentials {
            access_token: "atk".to_string(),
            refresh_token: "rtk".to_string(),
            expiry_date: 1_700_000_000_000,
            token_type: Some("Bearer".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_admission_requires_tokens_and_type_or_scope() {
        assert!(base_creds().is_admissible());

        let mut no_type = base_creds();
        no_type.token_type = None;
        assert!(!no_type.is_admissible());
        no_type.scope = Some("cloud-platform".to_string());
        assert!(no_type.is_admissible());

        let mut no_access = base_creds();
        no_access.access_token.clear();
        assert!(!no_access.is_admissible());

        let mut empty_type = base_creds();
        empty_type.token_type = Some(String::new());
        assert!(!empty_type.is_admissible());
    }

    #[test]
    fn test_project_id_verification_requires_marker() {
        let mut creds = base_creds();
        creds.project_id = Some("useful-fuze-a1b2c".to_string());
        assert!(!creds.has_verified_project_id());

        creds.project_id_resolved_at = Some("2026-01-01T00:00:00Z".to_string());
        assert_eq!(creds.verified_project_id(), Some("useful-fuze-a1b2c"));

        creds.project_id = Some(String::new());
        assert!(!creds.has_verified_project_id());
    }

    #[test]
    fn test_round_trips_on_disk_field_names() {
        let mut creds = base_creds();
        creds.project_id = Some("p-1".to_string());
        creds.project_id_resolved_at = Some("2026-01-01T00:00:00Z".to_string());

        let json = serde_json::to_value(&creds).unwrap();
        assert!(json.get("projectId").is_some());
        assert!(json.get("projectIdResolvedAt").is_some());
        assert!(json.get("expiry_date").is_some());

        let back: Credentials = serde_json::from_value(json).unwrap();
        assert_eq!(back.project_id.as_deref(), Some("p-1"));
    }

    #[test]
    fn test_missing_expiry_date_is_stale() {
        let parsed: Credentials = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","token_type":"Bearer"}"#,
        )
        .unwrap();
        assert!(parsed.is_expired(1));
    }
}
