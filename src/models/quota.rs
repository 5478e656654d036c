use std::fmt;

// Quota groups partition the pool's current-index bookkeeping: claude and
// gemini requests rotate independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaGroup {
    Claude,
    Gemini,
}

impl QuotaGroup {
    // Model names containing "claude" belong to the claude group; everything
    // else (gemini models, unknown ids) falls back to gemini.
    pub fn infer(model: &str) -> Self {
        if model.to_ascii_lowercase().contains("claude") {
            QuotaGroup::Claude
        } else {
            QuotaGroup::Gemini
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuotaGroup::Claude => "claude",
            QuotaGroup::Gemini => "gemini",
        }
    }
}

impl fmt::Display for QuotaGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// One observation per (model, account). Entries are overwritten in place by
// sweeps and by the 429 path; they are never deleted.
#[derive(Debug, Clone, Default)]
pub struct QuotaEntry {
    pub remaining_fraction: Option<f64>,
    pub remaining_percent: Option<i32>,
    pub reset_time: Option<String>,
    pub reset_time_ms: Option<i64>,
    pub cooldown_until_ms: i64,
    pub updated_at_ms: i64,
}

impl QuotaEntry {
    pub fn is_known(&self) -> bool {
        self.remaining_percent.is_some()
    }

    pub fn is_known_zero(&self) -> bool {
        self.remaining_percent == Some(0)
    }

    pub fn cooldown_active(&self, now_ms: i64) -> bool {
        self.cooldown_until_ms > now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_inference() {
        assert_eq!(QuotaGroup::infer("claude-sonnet-4-5"), QuotaGroup::Claude);
        assert_eq!(QuotaGroup::infer("Claude-Opus"), QuotaGroup::Claude);
        assert_eq!(QuotaGroup::infer("gemini-3-pro"), QuotaGroup::Gemini);
        assert_eq!(QuotaGroup::infer("some-unknown-model"), QuotaGroup::Gemini);
    }

    #[test]
    fn test_entry_known_states() {
        let mut entry = QuotaEntry::default();
        assert!(!entry.is_known());
        assert!(!entry.is_known_zero());

        entry.remaining_percent = Some(0);
        assert!(entry.is_known());
        assert!(entry.is_known_zero());

        entry.remaining_percent = Some(40);
        assert!(!entry.is_known_zero());
    }

    #[test]
    fn test_cooldown_window() {
        let entry = QuotaEntry {
            cooldown_until_ms: 10_000,
            ..Default::default()
        };
        assert!(entry.cooldown_active(9_999));
        assert!(!entry.cooldown_active(10_000));
    }
}
