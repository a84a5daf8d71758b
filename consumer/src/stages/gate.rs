use common_health::HealthFlag;

/// Health gate middleware for stage flushes.
///
/// A closed gate means "do not flush": the batch stays in memory and the
/// stage keeps consuming, so the broker never rebalances the group while a
/// backend is down. Gates compose; the gate is open only when every flag
/// it wraps is healthy.
#[derive(Clone, Default)]
pub struct Gate {
    flags: Vec<HealthFlag>,
}

impl Gate {
    /// A gate with no flags, always open.
    pub fn open_gate() -> Self {
        Gate::default()
    }

    pub fn new(flag: HealthFlag) -> Self {
        Gate { flags: vec![flag] }
    }

    pub fn and(mut self, flag: HealthFlag) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn is_open(&self) -> bool {
        self.flags.iter().all(HealthFlag::healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_gate_is_open() {
        assert!(Gate::open_gate().is_open());
    }

    #[test]
    fn gate_follows_its_flag() {
        let flag = HealthFlag::new();
        let gate = Gate::new(flag.clone());
        assert!(gate.is_open());

        flag.set(false);
        assert!(!gate.is_open());

        flag.set(true);
        assert!(gate.is_open());
    }

    #[test]
    fn composed_gate_needs_every_flag_healthy() {
        let first = HealthFlag::new();
        let second = HealthFlag::new();
        let gate = Gate::new(first.clone()).and(second.clone());
        assert!(gate.is_open());

        second.set(false);
        assert!(!gate.is_open());

        second.set(true);
        first.set(false);
        assert!(!gate.is_open());
    }
}
