//! Job definitions and the provider the coordinator reads them from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::job::JobKind;
use crate::recurrence::RecurrenceDefinition;

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    3600
}

/// Template for jobs: what to run, against what, and for how long at most.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub kind: JobKind,

    /// Content kind or scope the jobs act on
    pub target: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Added to the schedule time to obtain a job's limit time
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Source or sink plugin the job body should use
    #[serde(default)]
    pub plugin: Option<String>,

    /// Copied onto every job created from this definition
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, kind: JobKind, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            target: target.into(),
            enabled: true,
            timeout_secs: default_timeout_secs(),
            plugin: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Read access to job and recurrence definitions.
pub trait DefinitionProvider: Send + Sync {
    fn job_definition(&self, id: &str) -> Option<JobDefinition>;

    /// All job definitions, enabled or not.
    fn job_definitions(&self) -> Vec<JobDefinition>;

    fn recurrences(&self, jobdef_id: &str) -> Vec<RecurrenceDefinition>;
}

/// Definitions held in memory, typically loaded from settings.
#[derive(Debug, Clone, Default)]
pub struct StaticDefinitions {
    jobdefs: BTreeMap<String, JobDefinition>,
    recurrences: Vec<RecurrenceDefinition>,
}

impl StaticDefinitions {
    pub fn new(jobdefs: Vec<JobDefinition>, recurrences: Vec<RecurrenceDefinition>) -> Self {
        Self {
            jobdefs: jobdefs.into_iter().map(|d| (d.id.clone(), d)).collect(),
            recurrences,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.job_definitions.clone(),
            settings.recurrences.clone(),
        )
    }
}

impl DefinitionProvider for StaticDefinitions {
    fn job_definition(&self, id: &str) -> Option<JobDefinition> {
        self.jobdefs.get(id).cloned()
    }

    fn job_definitions(&self) -> Vec<JobDefinition> {
        self.jobdefs.values().cloned().collect()
    }

    fn recurrences(&self, jobdef_id: &str) -> Vec<RecurrenceDefinition> {
        self.recurrences
            .iter()
            .filter(|r| r.jobdef_id == jobdef_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::RecurrenceRule;

    #[test]
    fn test_static_definitions_lookup() {
        let defs = StaticDefinitions::new(
            vec![
                JobDefinition::new("import-users", JobKind::Import, "USER"),
                JobDefinition::new("rebuild", JobKind::Rebuild, "ALL").disabled(),
            ],
            vec![RecurrenceDefinition {
                id: 1,
                jobdef_id: "import-users".to_string(),
                priority: 0,
                rule: RecurrenceRule::Once {
                    at: "2024-03-01T00:00:00".parse().unwrap(),
                },
            }],
        );

        assert!(defs.job_definition("import-users").unwrap().enabled);
        assert!(!defs.job_definition("rebuild").unwrap().enabled);
        assert!(defs.job_definition("missing").is_none());
        assert_eq!(defs.job_definitions().len(), 2);
        assert_eq!(defs.recurrences("import-users").len(), 1);
        assert!(defs.recurrences("rebuild").is_empty());
    }

    #[test]
    fn test_definition_defaults() {
        let def: JobDefinition =
            serde_json::from_str(r#"{"id": "x", "kind": "EXPORT", "target": "GROUP"}"#).unwrap();
        assert!(def.enabled);
        assert_eq!(def.timeout_secs, 3600);
        assert!(def.plugin.is_none());
    }
}
