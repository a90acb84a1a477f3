//! Structural validation of job specs.
//!
//! A spec that fails here is rejected synchronously; no job record is
//! created and no state transition happens.

use std::str::FromStr;

use crate::error::ValidationError;
use crate::path;
use crate::types::{JobAction, JobSpec, ResourceKind, ResourceRef};

/// Decode a JSON job payload and validate it.
///
/// Unknown actions are reported as field errors rather than decode errors.
pub fn parse_job_spec(raw: &str) -> Result<JobSpec, ValidationError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;

    match value.get("action") {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::String(action)) => {
            if JobAction::from_str(action).is_err() {
                return Err(ValidationError::field(
                    "spec.action",
                    format!("unsupported value {action:?}"),
                ));
            }
        }
        Some(other) => {
            return Err(ValidationError::field(
                "spec.action",
                format!("expected a string, got {other}"),
            ));
        }
    }

    let spec: JobSpec =
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    validate_job_spec(&spec)?;
    Ok(spec)
}

/// Validate a decoded spec and return its action.
pub fn validate_job_spec(spec: &JobSpec) -> Result<JobAction, ValidationError> {
    if spec.repository.0.trim().is_empty() {
        return Err(ValidationError::field("spec.repository", "required value"));
    }
    let action = spec
        .action
        .ok_or_else(|| ValidationError::field("spec.action", "required value"))?;

    for populated in spec.populated_options() {
        if populated != action {
            return Err(ValidationError::field(
                format!("spec.{populated}"),
                format!("must not be set for {action} jobs"),
            ));
        }
    }

    match action {
        JobAction::Pull => {
            let options = spec
                .pull
                .as_ref()
                .ok_or_else(|| missing_options(action))?;
            if let Some(p) = &options.path {
                check_path("spec.pull.path", p)?;
            }
        }
        JobAction::Push => {
            let options = spec
                .push
                .as_ref()
                .ok_or_else(|| missing_options(action))?;
            if let Some(p) = options.path.as_deref().filter(|p| !p.is_empty()) {
                check_path("spec.push.path", p)?;
            }
            if let Some(branch) = &options.branch {
                check_branch("spec.push.branch", branch)?;
            }
            for (i, r) in options.resources.iter().enumerate() {
                let field = format!("spec.push.resources[{i}]");
                if check_ref(&field, r)? == ResourceKind::Folder {
                    return Err(ValidationError::field(field, "folders cannot be exported"));
                }
            }
        }
        JobAction::Delete => {
            let options = spec
                .delete
                .as_ref()
                .ok_or_else(|| missing_options(action))?;
            if options.paths.is_empty() && options.resources.is_empty() {
                return Err(ValidationError::field(
                    "spec.delete",
                    "at least one path or resource must be specified",
                ));
            }
            for (i, p) in options.paths.iter().enumerate() {
                check_path(&format!("spec.delete.paths[{i}]"), p)?;
            }
            for (i, r) in options.resources.iter().enumerate() {
                check_ref(&format!("spec.delete.resources[{i}]"), r)?;
            }
            if let Some(r) = &options.git_ref {
                check_branch("spec.delete.ref", r)?;
            }
        }
        JobAction::Move => {
            let options = spec
                .move_
                .as_ref()
                .ok_or_else(|| missing_options(action))?;
            let target = options
                .target_path
                .as_deref()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ValidationError::field("spec.move.targetPath", "required value"))?;
            check_path("spec.move.targetPath", target)?;
            if options.paths.is_empty() && options.resources.is_empty() {
                return Err(ValidationError::field(
                    "spec.move",
                    "at least one path or resource must be specified",
                ));
            }
            for (i, p) in options.paths.iter().enumerate() {
                check_path(&format!("spec.move.paths[{i}]"), p)?;
            }
            for (i, r) in options.resources.iter().enumerate() {
                check_ref(&format!("spec.move.resources[{i}]"), r)?;
            }
            if let Some(r) = &options.git_ref {
                check_branch("spec.move.ref", r)?;
            }
        }
        JobAction::Migrate => {
            spec.migrate
                .as_ref()
                .ok_or_else(|| missing_options(action))?;
        }
    }

    Ok(action)
}

fn missing_options(action: JobAction) -> ValidationError {
    ValidationError::field(
        format!("spec.{action}"),
        format!("{action} options are required for {action} jobs"),
    )
}

fn check_path(field: &str, p: &str) -> Result<(), ValidationError> {
    path::validate(p).map_err(|e| ValidationError::field(field, e.to_string()))
}

fn check_ref(field: &str, r: &ResourceRef) -> Result<ResourceKind, ValidationError> {
    if r.name.trim().is_empty() {
        return Err(ValidationError::field(format!("{field}.name"), "required value"));
    }
    r.resource_kind().ok_or_else(|| {
        ValidationError::field(
            format!("{field}.kind"),
            format!("unsupported resource {}/{}", r.group, r.kind),
        )
    })
}

/// Git-style ref name check.
fn check_branch(field: &str, name: &str) -> Result<(), ValidationError> {
    let invalid = name.is_empty()
        || name.starts_with('-')
        || name.starts_with('/')
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name.ends_with('.')
        || name.contains("..")
        || name.contains("//")
        || name.contains("@{")
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if invalid {
        return Err(ValidationError::field(field, format!("invalid ref name {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeleteOptions, MigrateOptions, MoveOptions, PullOptions, PushOptions};
    use rstest::rstest;

    fn field_of(err: ValidationError) -> String {
        match err {
            ValidationError::Field { field, .. } => field,
            other => panic!("expected field error, got {other}"),
        }
    }

    #[test]
    fn accepts_minimal_specs() {
        assert_eq!(
            validate_job_spec(&JobSpec::pull("r", PullOptions::default())),
            Ok(JobAction::Pull)
        );
        assert_eq!(
            validate_job_spec(&JobSpec::push("r", PushOptions::default())),
            Ok(JobAction::Push)
        );
        assert_eq!(
            validate_job_spec(&JobSpec::migrate("r", MigrateOptions::default())),
            Ok(JobAction::Migrate)
        );
    }

    #[test]
    fn missing_action_is_rejected() {
        let spec = JobSpec {
            repository: "r".into(),
            pull: Some(PullOptions::default()),
            ..JobSpec::default()
        };
        assert_eq!(field_of(validate_job_spec(&spec).unwrap_err()), "spec.action");
    }

    #[test]
    fn unknown_action_is_a_field_error() {
        let err = parse_job_spec(r#"{"action":"explode","repository":"r"}"#).unwrap_err();
        assert_eq!(err.to_string(), "spec.action: unsupported value \"explode\"");
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            parse_job_spec("{not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn pull_without_options_is_rejected() {
        let spec = JobSpec {
            action: Some(JobAction::Pull),
            repository: "r".into(),
            ..JobSpec::default()
        };
        assert_eq!(field_of(validate_job_spec(&spec).unwrap_err()), "spec.pull");
    }

    #[test]
    fn wrong_options_block_is_rejected() {
        let mut spec = JobSpec::pull("r", PullOptions::default());
        spec.push = Some(PushOptions::default());
        let err = validate_job_spec(&spec).unwrap_err();
        assert_eq!(err.to_string(), "spec.push: must not be set for pull jobs");
    }

    #[test]
    fn delete_requires_paths_or_resources() {
        let spec = JobSpec::delete("r", DeleteOptions::default());
        assert_eq!(field_of(validate_job_spec(&spec).unwrap_err()), "spec.delete");
    }

    #[test]
    fn move_requires_target_path() {
        let spec = JobSpec::relocate(
            "r",
            MoveOptions {
                paths: vec!["a.json".into()],
                ..MoveOptions::default()
            },
        );
        assert_eq!(
            field_of(validate_job_spec(&spec).unwrap_err()),
            "spec.move.targetPath"
        );
    }

    #[rstest]
    #[case(JobSpec::pull("r", PullOptions { incremental: false, path: Some("../x".into()) }), "spec.pull.path")]
    #[case(JobSpec::push("r", PushOptions { path: Some("a/../../b/".into()), ..PushOptions::default() }), "spec.push.path")]
    #[case(JobSpec::delete("r", DeleteOptions { paths: vec!["ok.json".into(), "../x.json".into()], ..DeleteOptions::default() }), "spec.delete.paths[1]")]
    #[case(JobSpec::relocate("r", MoveOptions { paths: vec!["a.json".into()], target_path: Some("../b.json".into()), ..MoveOptions::default() }), "spec.move.targetPath")]
    #[case(JobSpec::relocate("r", MoveOptions { paths: vec!["../a.json".into()], target_path: Some("b.json".into()), ..MoveOptions::default() }), "spec.move.paths[0]")]
    fn traversal_in_any_path_field_is_rejected(#[case] spec: JobSpec, #[case] field: &str) {
        assert_eq!(field_of(validate_job_spec(&spec).unwrap_err()), field);
    }

    #[test]
    fn push_rejects_folder_references() {
        let spec = JobSpec::push(
            "r",
            PushOptions {
                resources: vec![ResourceRef::new(ResourceKind::Folder, "f1")],
                ..PushOptions::default()
            },
        );
        let err = validate_job_spec(&spec).unwrap_err();
        assert_eq!(err.to_string(), "spec.push.resources[0]: folders cannot be exported");
    }

    #[test]
    fn unknown_resource_kind_is_rejected() {
        let spec = JobSpec::delete(
            "r",
            DeleteOptions {
                resources: vec![ResourceRef {
                    name: "x".into(),
                    kind: "Playlist".into(),
                    group: "playlist.grafana.app".into(),
                }],
                ..DeleteOptions::default()
            },
        );
        assert_eq!(
            field_of(validate_job_spec(&spec).unwrap_err()),
            "spec.delete.resources[0].kind"
        );
    }

    #[rstest]
    #[case("feature/x", true)]
    #[case("main", true)]
    #[case("bad..name", false)]
    #[case("-flag", false)]
    #[case("with space", false)]
    #[case("trailing/", false)]
    fn branch_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(check_branch("spec.push.branch", name).is_ok(), ok);
    }

    #[test]
    fn parse_accepts_wire_format() {
        let spec = parse_job_spec(
            r#"{"action":"delete","repository":"r","delete":{"paths":["folder/"],"ref":"main"}}"#,
        )
        .expect("valid");
        let delete = spec.delete.expect("delete options");
        assert_eq!(delete.paths, vec!["folder/".to_owned()]);
        assert_eq!(delete.git_ref.as_deref(), Some("main"));
    }
}
