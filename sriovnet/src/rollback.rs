//! Inverse operations for partially completed setups.
//!
//! Every step the orchestrator completes pushes its own inverse; on failure
//! the stack is unwound last-in-first-out. Keeping the inverses as data
//! instead of nested cleanup closures makes the unwind order testable
//! without touching any device.

/// One inverse operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStep {
    /// Bring a link back from the target namespace into the root namespace.
    /// `names` are the names the link may currently carry inside the target
    /// namespace, most recent first.
    ReturnLink { names: Vec<String> },

    /// Clear a VLAN tag set during this attempt, mirrored to the shared
    /// sibling when the tag was.
    ResetVlan { pf: String, vf: u32, shared: bool },

    /// Rebind a VF handed to a userspace driver back to its kernel driver
    /// via the persisted record.
    RebindKernel {
        container_id: String,
        ifname: String,
    },
}

/// LIFO stack of inverse operations.
#[derive(Debug, Default)]
pub struct RollbackStack {
    steps: Vec<RollbackStep>,
}

impl RollbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: RollbackStep) {
        self.steps.push(step);
    }

    /// Record that the link pushed under `transient` now carries
    /// `new_name`; the unwind tries the newest name first.
    pub fn link_renamed(&mut self, transient: &str, new_name: &str) {
        for step in self.steps.iter_mut().rev() {
            if let RollbackStep::ReturnLink { names } = step
                && names.first().is_some_and(|name| name == transient)
            {
                names.insert(0, new_name.to_string());
                return;
            }
        }
    }

    /// Consume the stack in unwind order (most recent step first).
    pub fn unwind(self) -> impl Iterator<Item = RollbackStep> {
        self.steps.into_iter().rev()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwinds_in_reverse_order() {
        let mut stack = RollbackStack::new();
        stack.push(RollbackStep::ResetVlan {
            pf: "eth0".to_string(),
            vf: 3,
            shared: false,
        });
        stack.push(RollbackStep::ReturnLink {
            names: vec!["dev17".to_string()],
        });

        let steps: Vec<RollbackStep> = stack.unwind().collect();
        assert_eq!(
            steps,
            vec![
                RollbackStep::ReturnLink {
                    names: vec!["dev17".to_string()],
                },
                RollbackStep::ResetVlan {
                    pf: "eth0".to_string(),
                    vf: 3,
                    shared: false,
                },
            ]
        );
    }

    #[test]
    fn rename_tracks_newest_name_first() {
        let mut stack = RollbackStack::new();
        stack.push(RollbackStep::ReturnLink {
            names: vec!["dev17".to_string()],
        });
        stack.push(RollbackStep::ReturnLink {
            names: vec!["dev18".to_string()],
        });
        stack.link_renamed("dev18", "net1d1");

        let steps: Vec<RollbackStep> = stack.unwind().collect();
        assert_eq!(
            steps[0],
            RollbackStep::ReturnLink {
                names: vec!["net1d1".to_string(), "dev18".to_string()],
            }
        );
        assert_eq!(
            steps[1],
            RollbackStep::ReturnLink {
                names: vec!["dev17".to_string()],
            }
        );
    }

    #[test]
    fn rename_of_unknown_link_is_ignored() {
        let mut stack = RollbackStack::new();
        stack.push(RollbackStep::ReturnLink {
            names: vec!["dev17".to_string()],
        });
        stack.link_renamed("dev99", "net1");
        let steps: Vec<RollbackStep> = stack.unwind().collect();
        assert_eq!(
            steps[0],
            RollbackStep::ReturnLink {
                names: vec!["dev17".to_string()],
            }
        );
    }

    #[test]
    fn empty_stack_unwinds_nothing() {
        let stack = RollbackStack::new();
        assert!(stack.is_empty());
        assert_eq!(stack.unwind().count(), 0);
    }
}
