use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Per-session counters, summarized once at finalization.
pub struct SessionMetrics {
    provider: String,
    session_id: String,
    start_time: DateTime<Utc>,
    state: Mutex<MetricState>,
}

#[derive(Default)]
struct MetricState {
    audio_bytes: usize,
    transcript_chars: usize,
    partial_count: usize,
    final_count: usize,
    first_result_at: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl SessionMetrics {
    pub fn new(provider: &str, session_id: &str) -> Self {
        Self {
            provider: provider.to_string(),
            session_id: session_id.to_string(),
            start_time: Utc::now(),
            state: Mutex::new(MetricState::default()),
        }
    }

    pub fn add_audio_bytes(&self, bytes: usize) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        state.audio_bytes += bytes;
    }

    pub fn add_result(&self, text: &str, is_final: bool) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        if state.first_result_at.is_none() {
            state.first_result_at = Some(Utc::now());
        }
        state.transcript_chars += text.len();
        if is_final {
            state.final_count += 1;
        } else {
            state.partial_count += 1;
        }
    }

    pub fn finalize(&self) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        state.end_time = Some(Utc::now());
    }

    /// One-line-per-field summary suitable for the session-end log.
    pub fn summary(&self) -> String {
        let state = self.state.lock().expect("metrics lock poisoned");
        let end = state.end_time.unwrap_or_else(Utc::now);
        let duration = (end - self.start_time).num_milliseconds() as f64 / 1000.0;
        let latency = state
            .first_result_at
            .map(|at| (at - self.start_time).num_milliseconds() as f64 / 1000.0);

        // 8 kHz, 16-bit mono on the wire.
        let audio_seconds = state.audio_bytes as f64 / (8000.0 * 2.0);
        let realtime_factor = if audio_seconds > 0.0 {
            duration / audio_seconds
        } else {
            0.0
        };

        format!(
            "Provider: {}\nSession: {}\nDuration: {:.2}s\nAudio Duration: {:.2}s\nAudio Bytes: {}\nTranscript Length: {} chars\nFirst Result Latency: {}\nPartial Results: {}\nFinal Results: {}\nReal-time Factor: {:.2}x",
            self.provider,
            self.session_id,
            duration,
            audio_seconds,
            state.audio_bytes,
            state.transcript_chars,
            latency
                .map(|l| format!("{:.2}s", l))
                .unwrap_or_else(|| "n/a".to_string()),
            state.partial_count,
            state.final_count,
            realtime_factor,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_results_by_finality() {
        let metrics = SessionMetrics::new("vosk", "abc");
        metrics.add_result("um", false);
        metrics.add_result("hello there", false);
        metrics.add_result("hello there operator", true);
        metrics.add_audio_bytes(16000);
        metrics.finalize();

        let summary = metrics.summary();
        assert!(summary.contains("Partial Results: 2"));
        assert!(summary.contains("Final Results: 1"));
        assert!(summary.contains("Audio Duration: 1.00s"));
    }
}
