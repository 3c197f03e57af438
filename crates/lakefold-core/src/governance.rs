//! Required partition specs per folder dataset.
//!
//! A rule pins the exact partition spec every write to a `(section, dataset)`
//! must supply. Matching is order-sensitive, and a write that supplies no
//! spec at all violates any rule. Datasets without a rule accept any spec.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    error::{EngineResult, PartitionGovernanceViolationSnafu},
    partition::PartitionSpec,
};

/// One governed dataset and the spec it requires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceRule {
    /// Section (top-level folder) of the dataset.
    pub section: String,
    /// Dataset name inside the section.
    pub dataset: String,
    /// Required partition spec.
    pub partition_by: PartitionSpec,
}

/// The set of governance rules known to a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GovernanceRules {
    rules: Vec<GovernanceRule>,
}

impl GovernanceRules {
    /// An empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the rule for `(section, dataset)`.
    pub fn with_rule(
        mut self,
        section: impl Into<String>,
        dataset: impl Into<String>,
        partition_by: PartitionSpec,
    ) -> Self {
        let section = section.into();
        let dataset = dataset.into();
        self.rules
            .retain(|r| !(r.section == section && r.dataset == dataset));
        self.rules.push(GovernanceRule {
            section,
            dataset,
            partition_by,
        });
        self
    }

    /// The spec required for a dataset, if any.
    pub fn required_for(&self, section: &str, dataset: &str) -> Option<&PartitionSpec> {
        self.rules
            .iter()
            .find(|r| r.section == section && r.dataset == dataset)
            .map(|r| &r.partition_by)
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check a write's partition spec against the dataset's rule.
    pub fn check(
        &self,
        section: &str,
        dataset: &str,
        supplied: Option<&PartitionSpec>,
    ) -> EngineResult<()> {
        let Some(required) = self.required_for(section, dataset) else {
            return Ok(());
        };
        ensure!(
            supplied == Some(required),
            PartitionGovernanceViolationSnafu {
                section,
                dataset,
                required: required.to_string(),
                supplied: supplied.map(ToString::to_string).unwrap_or_default(),
            }
        );
        Ok(())
    }
}
