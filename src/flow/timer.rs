use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Debounced single-shot timeout for question responses.
///
/// Partial transcripts arrive many times a second; resetting on each one
/// would keep the deadline forever out of reach. `reset` therefore no-ops
/// inside the debounce window, leaving the armed deadline untouched.
///
/// Expiries are delivered as generation numbers on the channel returned by
/// `new`. A receiver must pass the number to [`GlobalTimer::acknowledge`];
/// a stale generation (the timer was stopped or re-armed after the expiry
/// was queued) returns false and must be ignored.
pub struct GlobalTimer {
    duration: Duration,
    debounce: Duration,
    expiry_tx: mpsc::Sender<u64>,
    state: Mutex<TimerState>,
}

struct TimerState {
    generation: u64,
    armed: bool,
    handle: Option<JoinHandle<()>>,
    last_reset: Option<Instant>,
}

impl GlobalTimer {
    pub fn new(duration: Duration, debounce: Duration) -> (Self, mpsc::Receiver<u64>) {
        let (expiry_tx, expiry_rx) = mpsc::channel(4);
        let timer = Self {
            duration,
            debounce,
            expiry_tx,
            state: Mutex::new(TimerState {
                generation: 0,
                armed: false,
                handle: None,
                last_reset: None,
            }),
        };
        (timer, expiry_rx)
    }

    /// Arms the timer, replacing any armed instance.
    pub fn start(&self) {
        let mut state = self.state.lock().expect("timer lock poisoned");
        self.arm(&mut state);
    }

    /// Disarms the timer. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("timer lock poisoned");
        self.disarm(&mut state);
    }

    /// Restarts the timer unless a reset happened within the debounce window.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("timer lock poisoned");
        if let Some(last) = state.last_reset {
            if last.elapsed() < self.debounce {
                return;
            }
        }
        self.disarm(&mut state);
        self.arm(&mut state);
        state.last_reset = Some(Instant::now());
        debug!("Response timer reset");
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().expect("timer lock poisoned").armed
    }

    /// Claims an expiry. Returns true (and disarms) only when `generation`
    /// matches the currently armed instance.
    pub fn acknowledge(&self, generation: u64) -> bool {
        let mut state = self.state.lock().expect("timer lock poisoned");
        if state.armed && state.generation == generation {
            state.armed = false;
            state.handle = None;
            true
        } else {
            false
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn arm(&self, state: &mut TimerState) {
        self.disarm(state);
        state.generation += 1;
        state.armed = true;

        let generation = state.generation;
        let duration = self.duration;
        let expiry_tx = self.expiry_tx.clone();
        state.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = expiry_tx.send(generation).await;
        }));
    }

    fn disarm(&self, state: &mut TimerState) {
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn starts_stops_and_reports_armed_state() {
        let (timer, _rx) = GlobalTimer::new(Duration::from_secs(5), Duration::from_millis(50));
        assert!(!timer.is_active());

        timer.start();
        assert!(timer.is_active());

        timer.stop();
        assert!(!timer.is_active());
        timer.stop();
        assert!(!timer.is_active());
    }

    #[tokio::test]
    async fn delivers_expiry_when_not_stopped() {
        let (timer, mut rx) = GlobalTimer::new(Duration::from_millis(20), Duration::from_millis(5));
        timer.start();

        let generation = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timer should expire")
            .expect("channel open");
        assert!(timer.acknowledge(generation));
        assert!(!timer.is_active());
    }

    #[tokio::test]
    async fn stopped_timer_expiry_is_stale() {
        let (timer, mut rx) = GlobalTimer::new(Duration::from_millis(10), Duration::from_millis(5));
        timer.start();
        // Let the expiry land in the channel before stopping.
        tokio::time::sleep(Duration::from_millis(30)).await;
        timer.stop();

        let generation = rx.recv().await.expect("expiry was queued");
        assert!(!timer.acknowledge(generation));
    }

    #[tokio::test]
    async fn reset_within_debounce_keeps_the_deadline() {
        let (timer, mut rx) =
            GlobalTimer::new(Duration::from_millis(60), Duration::from_millis(500));
        timer.start();
        let started = Instant::now();

        // Immediate resets are debounced away, so the original deadline holds.
        timer.reset();
        timer.reset();

        let generation = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timer should expire")
            .expect("channel open");
        assert!(timer.acknowledge(generation));
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn reset_after_debounce_extends_the_deadline() {
        let (timer, mut rx) =
            GlobalTimer::new(Duration::from_millis(80), Duration::from_millis(10));
        timer.start();
        tokio::time::sleep(Duration::from_millis(40)).await;

        timer.reset();
        let reset_at = Instant::now();

        let generation = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timer should expire")
            .expect("channel open");
        assert!(timer.acknowledge(generation));
        assert!(reset_at.elapsed() >= Duration::from_millis(80));
    }
}
