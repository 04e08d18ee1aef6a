use serde::{Deserialize, Serialize};

use crate::error::PlanningError;

/// Upper bound on generated plans; the planner also guarantees at least two
/// phases (work + delivery).
pub const MAX_PHASES: usize = 15;

/// An ordered, acyclic sequence of phases. Exactly one phase is current at a
/// time (the run's `current_phase` index).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
}

impl Plan {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 >= self.phases.len()
    }

    /// Structural validation: non-empty, bounded, unique phase ids, and
    /// dependencies referencing only earlier phases (acyclic by construction).
    pub fn validate(&self) -> Result<(), PlanningError> {
        if self.phases.is_empty() {
            return Err(PlanningError::Invalid {
                reason: "plan has no phases".into(),
            });
        }
        if self.phases.len() > MAX_PHASES {
            return Err(PlanningError::Invalid {
                reason: format!("plan has {} phases, max is {MAX_PHASES}", self.phases.len()),
            });
        }

        let mut seen: Vec<&str> = Vec::with_capacity(self.phases.len());
        for phase in &self.phases {
            if phase.id.trim().is_empty() {
                return Err(PlanningError::Invalid {
                    reason: "phase with empty id".into(),
                });
            }
            if seen.contains(&phase.id.as_str()) {
                return Err(PlanningError::Invalid {
                    reason: format!("duplicate phase id '{}'", phase.id),
                });
            }
            for dep in &phase.depends_on {
                if !seen.contains(&dep.as_str()) {
                    return Err(PlanningError::Invalid {
                        reason: format!(
                            "phase '{}' depends on '{dep}' which is not an earlier phase",
                            phase.id
                        ),
                    });
                }
            }
            seen.push(&phase.id);
        }
        Ok(())
    }
}

impl Phase {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            required_tools: Vec::new(),
            depends_on: Vec::new(),
            expected_outputs: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.required_tools = tools;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(phases: Vec<Phase>) -> Plan {
        Plan::new(phases)
    }

    #[test]
    fn valid_plan_passes() {
        let p = plan(vec![
            Phase::new("research", "Research", "Gather context"),
            Phase::new("deliver", "Deliver", "Synthesize results")
                .with_depends_on(vec!["research".into()]),
        ]);
        assert!(p.validate().is_ok());
        assert!(p.is_last(1));
        assert!(!p.is_last(0));
    }

    #[test]
    fn empty_plan_rejected() {
        assert!(plan(vec![]).validate().is_err());
    }

    #[test]
    fn forward_dependency_rejected() {
        let p = plan(vec![
            Phase::new("a", "A", "").with_depends_on(vec!["b".into()]),
            Phase::new("b", "B", ""),
        ]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn duplicate_phase_id_rejected() {
        let p = plan(vec![Phase::new("a", "A", ""), Phase::new("a", "A2", "")]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn oversized_plan_rejected() {
        let phases = (0..=MAX_PHASES)
            .map(|i| Phase::new(format!("p{i}"), format!("Phase {i}"), ""))
            .collect();
        assert!(plan(phases).validate().is_err());
    }
}
