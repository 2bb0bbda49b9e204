use std::collections::HashSet;
use std::time::Duration;

// Options used to control RPC failure injection.
#[derive(Debug, Clone)]
pub struct FailureOptions {
    // Probability with which intercepted RPCs should fail.
    pub failure_probability: f64,

    // Probability with which to add latency to intercepted calls.
    pub latency_probability: f64,

    // How much latency to add for calls with additional latency.
    pub latency_ms: u32,

    // Names of servers which can neither send nor receive any RPCs.
    pub disconnected: HashSet<String>,
}

// What should happen to a single intercepted call.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    // Deliver the call after the supplied delay.
    Deliver(Duration),

    // Fail the call with the supplied reason.
    Fail(String),
}

impl FailureOptions {
    // Returns failure injection options which don't add any failures.
    pub fn no_failures() -> Self {
        Self::fail_with_probability(0.0)
    }

    // Returns failure injection options which fail RPCs with the supplied probability.
    pub fn fail_with_probability(failure_probability: f64) -> Self {
        Self {
            failure_probability,
            latency_probability: 0.0,
            latency_ms: 0,
            disconnected: HashSet::new(),
        }
    }

    // Consumes this instance and returns one which adds latency to calls with
    // the supplied probability.
    pub fn with_latency(self, latency_probability: f64, latency_ms: u32) -> Self {
        Self {
            latency_probability,
            latency_ms,
            ..self
        }
    }

    // Cuts the supplied server off from all others.
    pub fn disconnect(&mut self, name: &str) {
        self.disconnected.insert(name.to_string());
    }

    // Undoes a previous disconnect for the supplied server.
    pub fn reconnect(&mut self, name: &str) {
        self.disconnected.remove(name);
    }

    pub fn is_disconnected(&self, name: &str) -> bool {
        self.disconnected.contains(name)
    }

    // Decides the fate of a call from "src" to "dst".
    pub fn verdict(&self, src: &str, dst: &str) -> Verdict {
        if self.is_disconnected(src) || self.is_disconnected(dst) {
            return Verdict::Fail(format!("Channel {} -> {} is disconnected", src, dst));
        }
        if rand::random::<f64>() < self.failure_probability {
            return Verdict::Fail(format!("Failure injection in channel {} -> {}", src, dst));
        }
        if rand::random::<f64>() < self.latency_probability {
            return Verdict::Deliver(Duration::from_millis(self.latency_ms as u64));
        }
        Verdict::Deliver(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_failures() {
        let options = FailureOptions::no_failures();
        for _ in 0..100 {
            assert_eq!(options.verdict("A", "B"), Verdict::Deliver(Duration::ZERO));
        }
    }

    #[test]
    fn test_always_fail() {
        let options = FailureOptions::fail_with_probability(1.0);
        assert!(matches!(options.verdict("A", "B"), Verdict::Fail(_)));
    }

    #[test]
    fn test_always_latency() {
        let options = FailureOptions::no_failures().with_latency(1.0, 40);
        assert_eq!(
            options.verdict("A", "B"),
            Verdict::Deliver(Duration::from_millis(40))
        );
    }

    #[test]
    fn test_disconnect_both_directions() {
        let mut options = FailureOptions::no_failures();
        options.disconnect("B");

        assert!(matches!(options.verdict("A", "B"), Verdict::Fail(_)));
        assert!(matches!(options.verdict("B", "C"), Verdict::Fail(_)));
        assert!(matches!(options.verdict("A", "C"), Verdict::Deliver(_)));

        options.reconnect("B");
        assert!(matches!(options.verdict("A", "B"), Verdict::Deliver(_)));
    }
}
