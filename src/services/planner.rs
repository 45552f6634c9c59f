use crate::db::models::RollupRule;

/// Default allowance for clock skew and late writes before a bucket is closed.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 40;

/// Closed-open range `[start, end)` of seconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

/// Next window for `rule`, or `None` when there is nothing new to consolidate.
///
/// `end` is the start of the bucket containing `now - margin`, so the bucket
/// still receiving data is never closed. `start` is the watermark.
pub fn plan_window(rule: &RollupRule, watermark: i64, now: i64, margin_secs: i64) -> Option<Window> {
    if !rule.has_aggregates() {
        return None;
    }
    let end = (now - margin_secs).div_euclid(rule.period_secs) * rule.period_secs;
    (end > watermark).then_some(Window { start: watermark, end })
}
