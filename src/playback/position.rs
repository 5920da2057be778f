//! Resume-point computation for interrupted playback.
//!
//! Elapsed wall time is mapped linearly onto character offsets. Speech rate is
//! not uniform, so the interpolated offset usually lands mid-word; it is
//! snapped to a nearby sentence boundary instead.

use super::status::PlaybackStatus;

/// Tuning knobs for [`compute_resume_text`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResumePolicy {
    /// Texts shorter than this (in chars) always restart from the beginning.
    pub min_chars: usize,
    /// Past this elapsed ratio, restart from the beginning.
    pub max_ratio: f64,
    /// Boundary search starts this many chars before the interpolated offset.
    pub lookback: usize,
    /// Give up looking for a boundary this many chars past the offset.
    pub lookahead: usize,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            min_chars: 100,
            max_ratio: 0.95,
            lookback: 20,
            lookahead: 200,
        }
    }
}

/// Text that should be spoken if playback restarts at `now_epoch_secs`.
///
/// Falls back to `full_text` whenever the estimate is meaningless: no status
/// (synthesis never finished), a non-positive duration, nothing played yet,
/// short text, or a ratio past `max_ratio`.
pub fn compute_resume_text(
    full_text: &str,
    status: Option<&PlaybackStatus>,
    now_epoch_secs: f64,
    policy: &ResumePolicy,
) -> String {
    let Some(status) = status else {
        return full_text.to_string();
    };
    let duration = status.estimated_duration_secs;
    if !duration.is_finite() || duration <= 0.0 {
        return full_text.to_string();
    }

    let chars: Vec<char> = full_text.chars().collect();
    if chars.len() < policy.min_chars {
        return full_text.to_string();
    }

    let elapsed = now_epoch_secs - status.started_at_epoch_secs as f64;
    let ratio = (elapsed / duration).clamp(0.0, 1.0);
    if ratio <= 0.0 || ratio > policy.max_ratio {
        return full_text.to_string();
    }

    let approx = (chars.len() as f64 * ratio).floor() as usize;
    let resume_at = find_boundary(&chars, approx, policy).unwrap_or(approx);

    let rest: String = chars[resume_at.min(chars.len())..].iter().collect();
    let trimmed = rest.trim();
    if trimmed.is_empty() {
        full_text.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Index just past the first sentence boundary in
/// `[approx - lookback, approx + lookahead]`.
fn find_boundary(chars: &[char], approx: usize, policy: &ResumePolicy) -> Option<usize> {
    let start = approx.saturating_sub(policy.lookback);
    let end = (approx + policy.lookahead).min(chars.len());

    (start..end).find_map(|i| {
        let c = chars[i];
        let is_boundary = c == '\n'
            || (matches!(c, '.' | '!' | '?')
                && chars.get(i + 1).is_some_and(|next| next.is_whitespace()));
        is_boundary.then_some(i + 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(started_at: i64, duration: f64) -> PlaybackStatus {
        PlaybackStatus {
            started_at_epoch_secs: started_at,
            estimated_duration_secs: duration,
        }
    }

    fn no_min() -> ResumePolicy {
        ResumePolicy {
            min_chars: 0,
            ..ResumePolicy::default()
        }
    }

    const NOW: f64 = 1_000_000.0;

    #[test]
    fn snaps_to_sentence_boundary_not_mid_word() {
        let text = "Hello world. This is a test sentence.";
        let s = status(NOW as i64 - 2, 4.0);
        let resumed = compute_resume_text(text, Some(&s), NOW, &no_min());
        assert_eq!(resumed, "This is a test sentence.");
    }

    #[test]
    fn missing_status_returns_full_text() {
        let text = "Hello world. This is a test sentence.";
        assert_eq!(compute_resume_text(text, None, NOW, &no_min()), text);
    }

    #[test]
    fn non_positive_duration_returns_full_text() {
        let text = "Hello world. This is a test sentence.";
        for d in [0.0, -3.0, f64::NAN] {
            let s = status(NOW as i64 - 2, d);
            assert_eq!(compute_resume_text(text, Some(&s), NOW, &no_min()), text);
        }
    }

    #[test]
    fn short_text_restarts_from_beginning_by_default() {
        let text = "Hello world. This is a test sentence.";
        let s = status(NOW as i64 - 2, 4.0);
        assert_eq!(
            compute_resume_text(text, Some(&s), NOW, &ResumePolicy::default()),
            text
        );
    }

    #[test]
    fn nearly_finished_restarts_from_beginning() {
        let text = "One sentence here. ".repeat(10);
        let s = status(NOW as i64 - 99, 100.0);
        assert_eq!(compute_resume_text(&text, Some(&s), NOW, &no_min()), text);
    }

    #[test]
    fn not_started_yet_returns_full_text() {
        let text = "One sentence here. ".repeat(10);
        // Clock skew: status claims playback starts in the future.
        let s = status(NOW as i64 + 5, 10.0);
        assert_eq!(compute_resume_text(&text, Some(&s), NOW, &no_min()), text);
    }

    #[test]
    fn newline_counts_as_boundary() {
        let text = format!("{}\nSecond paragraph starts here", "a".repeat(40));
        let s = status(NOW as i64 - 5, 10.0);
        let resumed = compute_resume_text(&text, Some(&s), NOW, &no_min());
        assert_eq!(resumed, "Second paragraph starts here");
    }

    #[test]
    fn gives_up_after_lookahead_and_uses_raw_offset() {
        let text = "x".repeat(1000);
        let s = status(NOW as i64 - 5, 10.0);
        let resumed = compute_resume_text(&text, Some(&s), NOW, &ResumePolicy::default());
        assert_eq!(resumed.chars().count(), 500);
    }

    #[test]
    fn offsets_count_chars_not_bytes() {
        // Multi-byte text must not panic on a char boundary.
        let text = "Ünïcödé wörds. ".repeat(12);
        let s = status(NOW as i64 - 3, 10.0);
        let resumed = compute_resume_text(&text, Some(&s), NOW, &ResumePolicy::default());
        assert!(resumed.starts_with("Ünïcödé"));
        assert!(resumed.chars().count() < text.chars().count());
    }

    #[test]
    fn trailing_whitespace_only_falls_back_to_full_text() {
        let text = format!("{}.{}", "a".repeat(120), " ".repeat(10));
        let s = status(NOW as i64 - 9, 10.0);
        let policy = ResumePolicy {
            max_ratio: 1.0,
            ..ResumePolicy::default()
        };
        assert_eq!(compute_resume_text(&text, Some(&s), NOW, &policy), text);
    }
}
