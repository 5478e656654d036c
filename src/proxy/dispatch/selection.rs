use std::cmp::Ordering;

// One account's standing for a given model at selection time.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub index: usize,
    pub account_id: String,
    pub remaining_percent: Option<i32>,
    pub reset_time_ms: Option<i64>,
    pub cooldown_until_ms: i64,
}

impl Candidate {
    pub fn cooldown_active(&self, now_ms: i64) -> bool {
        self.cooldown_until_ms > now_ms
    }
}

// Ranking:
//   1. accounts in active cooldown last
//   2. higher known remaining percent first (unknown ranks as -1)
//   3. sooner quota reset first (unknown ranks last)
//   4. lower account index first (stable, deterministic tie-break)
pub fn rank_candidates(mut candidates: Vec<Candidate>, now_ms: i64) -> Vec<Candidate> {
    candidates.sort_by(|a, b| compare_candidates(a, b, now_ms));
    candidates
}

fn compare_candidates(a: &Candidate, b: &Candidate, now_ms: i64) -> Ordering {
    a.cooldown_active(now_ms)
        .cmp(&b.cooldown_active(now_ms))
        .then_with(|| {
            b.remaining_percent
                .unwrap_or(-1)
                .cmp(&a.remaining_percent.unwrap_or(-1))
        })
        .then_with(|| {
            a.reset_time_ms
                .unwrap_or(i64::MAX)
                .cmp(&b.reset_time_ms.unwrap_or(i64::MAX))
        })
        .then_with(|| a.index.cmp(&b.index))
}
