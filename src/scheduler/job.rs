//! Built-in job kinds, declarative job specs and firing arguments.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::trigger::JobTrigger;
use crate::error::{CoreError, CoreResult};

/// Every function a scheduled job may invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Account-category sync session over active instances
    SyncAccounts,
    /// Capacity-category sync session over active instances
    CollectCapacity,
    /// Run that rebuilds per-instance capacity rollups
    AggregateCapacity,
    /// Run that classifies each active instance
    AutoClassify,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::SyncAccounts,
        JobKind::CollectCapacity,
        JobKind::AggregateCapacity,
        JobKind::AutoClassify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyncAccounts => "sync_accounts",
            JobKind::CollectCapacity => "collect_capacity",
            JobKind::AggregateCapacity => "aggregate_capacity",
            JobKind::AutoClassify => "auto_classify",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            JobKind::SyncAccounts => "Account sync",
            JobKind::CollectCapacity => "Capacity collection",
            JobKind::AggregateCapacity => "Capacity aggregation",
            JobKind::AutoClassify => "Automatic classification",
        }
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("unknown job function '{s}'")))
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_max_instances() -> u32 {
    1
}

fn default_coalesce() -> bool {
    true
}

/// Declarative job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub function: JobKind,
    pub trigger: JobTrigger,
    #[serde(default)]
    pub kwargs: Option<Value>,
    /// Falls back to the scheduler default when unset
    #[serde(default)]
    pub misfire_grace_seconds: Option<u64>,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default = "default_coalesce")]
    pub coalesce: bool,
    #[serde(default)]
    pub jitter_seconds: Option<u32>,
    #[serde(default)]
    pub paused: bool,
}

impl JobSpec {
    pub fn new(id: impl Into<String>, function: JobKind, trigger: JobTrigger) -> Self {
        Self {
            id: id.into(),
            name: None,
            function,
            trigger,
            kwargs: None,
            misfire_grace_seconds: None,
            max_instances: default_max_instances(),
            coalesce: default_coalesce(),
            jitter_seconds: None,
            paused: false,
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.function.display_name().to_string())
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::Validation("job id must not be empty".into()));
        }
        if self.max_instances == 0 {
            return Err(CoreError::Validation(format!(
                "job '{}' needs max_instances >= 1",
                self.id
            )));
        }
        check_column_range(&self.id, "max_instances", self.max_instances.into())?;
        if let Some(grace) = self.misfire_grace_seconds {
            check_column_range(&self.id, "misfire_grace_seconds", grace)?;
        }
        if let Some(jitter) = self.jitter_seconds {
            check_column_range(&self.id, "jitter_seconds", jitter.into())?;
        }
        if let Some(kwargs) = &self.kwargs
            && !kwargs.is_object()
        {
            return Err(CoreError::Validation(format!(
                "job '{}' kwargs must be a table",
                self.id
            )));
        }
        self.trigger.validate()
    }
}

/// Stored job settings are `i32` columns.
pub(crate) fn check_column_range(job_id: &str, field: &str, value: u64) -> CoreResult<i32> {
    i32::try_from(value).map_err(|_| {
        CoreError::Validation(format!(
            "job '{job_id}' {field} must be at most {}, got {value}",
            i32::MAX
        ))
    })
}

#[derive(Debug, Default, Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

/// Parses a TOML jobs file (`[[jobs]]` tables).
pub fn parse_jobs_toml(contents: &str) -> CoreResult<Vec<JobSpec>> {
    let file: JobsFile = toml::from_str(contents)
        .map_err(|e| CoreError::Validation(format!("invalid jobs file: {e}")))?;

    let mut seen = HashSet::new();
    for spec in &file.jobs {
        spec.validate()?;
        if !seen.insert(spec.id.as_str()) {
            return Err(CoreError::Validation(format!(
                "duplicate job id '{}' in jobs file",
                spec.id
            )));
        }
    }
    Ok(file.jobs)
}

pub fn load_jobs_file(path: &Path) -> CoreResult<Vec<JobSpec>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        CoreError::Validation(format!("cannot read jobs file {}: {e}", path.display()))
    })?;
    parse_jobs_toml(&contents)
}

/// Built-in jobs registered when nothing else is configured.
pub fn default_jobs() -> Vec<JobSpec> {
    vec![
        JobSpec {
            jitter_seconds: Some(30),
            ..JobSpec::new(
                JobKind::SyncAccounts.as_str(),
                JobKind::SyncAccounts,
                JobTrigger::cron("0 0 * * * * *"),
            )
        },
        JobSpec {
            jitter_seconds: Some(60),
            ..JobSpec::new(
                JobKind::CollectCapacity.as_str(),
                JobKind::CollectCapacity,
                JobTrigger::cron("0 0 3 * * * *"),
            )
        },
        JobSpec::new(
            JobKind::AggregateCapacity.as_str(),
            JobKind::AggregateCapacity,
            JobTrigger::cron("0 30 4 * * * *"),
        ),
        JobSpec::new(
            JobKind::AutoClassify.as_str(),
            JobKind::AutoClassify,
            JobTrigger::every_seconds(6 * 3600),
        ),
    ]
}

/// Arguments a firing passes to its job function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArgs {
    #[serde(default)]
    pub manual_run: bool,
    #[serde(default)]
    pub created_by: Option<String>,
    /// Restrict fan-out to these instances
    #[serde(default)]
    pub instance_ids: Option<Vec<Uuid>>,
}

impl JobArgs {
    /// Stored kwargs with `overrides` layered on top.
    pub fn resolve(kwargs: Option<&Value>, overrides: Option<&Value>) -> CoreResult<Self> {
        let mut merged = Map::new();
        for layer in [kwargs, overrides].into_iter().flatten() {
            match layer {
                Value::Object(map) => merged.extend(map.clone()),
                Value::Null => {}
                other => {
                    return Err(CoreError::Validation(format!(
                        "job arguments must be an object, got {other}"
                    )));
                }
            }
        }
        serde_json::from_value(Value::Object(merged))
            .map_err(|e| CoreError::Validation(format!("invalid job arguments: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_function_is_a_validation_error() {
        assert_eq!("auto_classify".parse::<JobKind>().unwrap(), JobKind::AutoClassify);
        assert!(matches!(
            "drop_everything".parse::<JobKind>(),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn parses_jobs_file_with_defaults() {
        let jobs = parse_jobs_toml(
            r#"
            [[jobs]]
            id = "nightly_capacity"
            function = "collect_capacity"
            trigger = { type = "cron", expression = "0 0 2 * * * *" }
            jitter_seconds = 15

            [[jobs]]
            id = "classify"
            function = "auto_classify"
            trigger = { type = "interval", seconds = 900 }
            coalesce = false
            kwargs = { created_by = "ops" }
            "#,
        )
        .unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].function, JobKind::CollectCapacity);
        assert_eq!(jobs[0].max_instances, 1);
        assert!(jobs[0].coalesce);
        assert_eq!(jobs[1].trigger, JobTrigger::every_seconds(900));
        assert!(!jobs[1].coalesce);
    }

    #[test]
    fn rejects_duplicate_ids_and_unknown_functions() {
        let duplicate = r#"
            [[jobs]]
            id = "a"
            function = "sync_accounts"
            trigger = { type = "interval", seconds = 60 }
            [[jobs]]
            id = "a"
            function = "sync_accounts"
            trigger = { type = "interval", seconds = 60 }
        "#;
        assert!(matches!(parse_jobs_toml(duplicate), Err(CoreError::Validation(_))));

        let unknown = r#"
            [[jobs]]
            id = "a"
            function = "rm_rf"
            trigger = { type = "interval", seconds = 60 }
        "#;
        assert!(matches!(parse_jobs_toml(unknown), Err(CoreError::Validation(_))));
    }

    #[test]
    fn numeric_settings_must_fit_storage() {
        let base = JobSpec::new("capacity", JobKind::CollectCapacity, JobTrigger::every_seconds(60));

        let too_many = JobSpec {
            max_instances: u32::MAX,
            ..base.clone()
        };
        let err = too_many.validate().unwrap_err();
        assert!(err.to_string().contains("max_instances"));

        let long_grace = JobSpec {
            misfire_grace_seconds: Some(3_000_000_000),
            ..base.clone()
        };
        assert!(matches!(long_grace.validate(), Err(CoreError::Validation(_))));

        let wide_jitter = JobSpec {
            jitter_seconds: Some(u32::MAX),
            ..base.clone()
        };
        assert!(matches!(wide_jitter.validate(), Err(CoreError::Validation(_))));

        let at_limit = JobSpec {
            max_instances: i32::MAX as u32,
            misfire_grace_seconds: Some(i32::MAX as u64),
            jitter_seconds: Some(i32::MAX as u32),
            ..base
        };
        at_limit.validate().unwrap();
    }

    #[test]
    fn jobs_file_rejects_oversized_interval() {
        let oversized = r#"
            [[jobs]]
            id = "forever"
            function = "auto_classify"
            trigger = { type = "interval", seconds = 10000000000000 }
        "#;
        assert!(matches!(parse_jobs_toml(oversized), Err(CoreError::Validation(_))));
    }

    #[test]
    fn defaults_cover_every_builtin() {
        let jobs = default_jobs();
        for kind in JobKind::ALL {
            assert!(jobs.iter().any(|job| job.function == kind));
        }
        for job in &jobs {
            job.validate().unwrap();
        }
    }

    #[test]
    fn overrides_win_over_stored_kwargs() {
        let args = JobArgs::resolve(
            Some(&json!({"created_by": "scheduler-config"})),
            Some(&json!({"manual_run": true, "created_by": "alice"})),
        )
        .unwrap();
        assert!(args.manual_run);
        assert_eq!(args.created_by.as_deref(), Some("alice"));

        assert!(JobArgs::resolve(Some(&json!([1, 2])), None).is_err());
    }
}
