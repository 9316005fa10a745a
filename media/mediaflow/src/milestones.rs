/// Joins the completion of the independent subsystems of a flow into a single established transition
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Milestones {
    gathered: bool,
    pair_selected: bool,
    handshake_complete: bool,
    reported: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Milestone {
    Gathered,
    PairSelected,
    HandshakeComplete,
}

impl Milestones {
    /// Record a milestone, returns true exactly once when the last one was reached
    pub(crate) fn reach(&mut self, milestone: Milestone) -> bool {
        match milestone {
            Milestone::Gathered => self.gathered = true,
            Milestone::PairSelected => self.pair_selected = true,
            Milestone::HandshakeComplete => self.handshake_complete = true,
        }

        if self.reported || !(self.gathered && self.pair_selected && self.handshake_complete) {
            return false;
        }

        self.reported = true;
        true
    }

    pub(crate) fn gathered(&self) -> bool {
        self.gathered
    }

    pub(crate) fn pair_selected(&self) -> bool {
        self.pair_selected
    }

    pub(crate) fn is_established(&self) -> bool {
        self.reported
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn established_once_in_any_order() {
        let mut milestones = Milestones::default();

        assert!(!milestones.reach(Milestone::HandshakeComplete));
        assert!(!milestones.reach(Milestone::PairSelected));
        assert!(!milestones.is_established());
        assert!(milestones.reach(Milestone::Gathered));
        assert!(milestones.is_established());

        assert!(!milestones.reach(Milestone::Gathered));
        assert!(!milestones.reach(Milestone::PairSelected));
    }
}
