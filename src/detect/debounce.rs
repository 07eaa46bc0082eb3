use chrono::{DateTime, Local};

/// Minimum spacing between accepted events.
///
/// Pure decision: the caller owns the last-event timestamp and records `now`
/// only when this returns true.
#[derive(Clone, Copy, Debug, Default)]
pub struct Debouncer;

impl Debouncer {
    pub fn new() -> Self {
        Self
    }

    pub fn should_accept(
        &self,
        now: DateTime<Local>,
        last_event: Option<DateTime<Local>>,
        cooldown_secs: f64,
    ) -> bool {
        match last_event {
            None => true,
            Some(last) => {
                let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
                elapsed >= cooldown_secs
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn first_event_is_always_accepted() {
        assert!(Debouncer::new().should_accept(Local::now(), None, 5.0));
    }

    #[test]
    fn one_acceptance_per_cooldown_window() {
        let debouncer = Debouncer::new();
        let start = Local::now();
        let mut last = None;
        let mut accepted = Vec::new();

        // Calls every 500ms for 12s with a 5s cooldown.
        for step in 0..24 {
            let now = start + Duration::milliseconds(step * 500);
            if debouncer.should_accept(now, last, 5.0) {
                last = Some(now);
                accepted.push(step);
            }
        }

        assert_eq!(accepted, vec![0, 10, 20]);
    }

    #[test]
    fn boundary_is_inclusive() {
        let debouncer = Debouncer::new();
        let last = Local::now();
        assert!(!debouncer.should_accept(last + Duration::milliseconds(4_999), Some(last), 5.0));
        assert!(debouncer.should_accept(last + Duration::seconds(5), Some(last), 5.0));
    }

    #[test]
    fn zero_cooldown_accepts_everything() {
        let debouncer = Debouncer::new();
        let now = Local::now();
        assert!(debouncer.should_accept(now, Some(now), 0.0));
    }
}
