use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::cloudflare::WorkersApi;
use crate::error::PublishResult;

/// One declared migration. Everything except `tag` is forwarded to the remote
/// as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub tag: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl MigrationStep {
    pub fn new(tag: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            tag: tag.into(),
            payload,
        }
    }
}

/// Steps that move a deployed worker from `old_tag` (or from nothing) to
/// `new_tag`. Serializes to the upload metadata's `migrations` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationPlan {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_tag: Option<String>,
    pub new_tag: String,
    pub steps: Vec<Map<String, Value>>,
}

fn untagged(steps: &[MigrationStep]) -> Vec<Map<String, Value>> {
    steps.iter().map(|step| step.payload.clone()).collect()
}

/// Compute the migrations still to apply given the tag the remote reports for
/// the previously deployed worker.
///
/// A remote tag that is not in the declared history is not fatal: every
/// declared step is resubmitted against it. Step handlers on the remote must
/// therefore tolerate being applied twice.
pub fn resolve(declared: &[MigrationStep], remote_tag: Option<&str>) -> Option<MigrationPlan> {
    let last = declared.last()?;
    let new_tag = last.tag.clone();

    let Some(remote_tag) = remote_tag else {
        return Some(MigrationPlan {
            old_tag: None,
            new_tag,
            steps: untagged(declared),
        });
    };

    match declared.iter().position(|step| step.tag == remote_tag) {
        Some(index) => Some(MigrationPlan {
            old_tag: Some(remote_tag.to_string()),
            new_tag,
            steps: untagged(&declared[index + 1..]),
        }),
        None => {
            warn!(
                remote_tag,
                "Deployed migration tag is not in the declared migrations; reapplying all {} step(s)",
                declared.len()
            );
            Some(MigrationPlan {
                old_tag: Some(remote_tag.to_string()),
                new_tag,
                steps: untagged(declared),
            })
        }
    }
}

/// Find the migration tag recorded against a deployed script, if any.
pub async fn lookup_migration_tag<A>(
    api: &A,
    account_id: &str,
    script_name: &str,
) -> PublishResult<Option<String>>
where
    A: WorkersApi + ?Sized,
{
    let scripts = api.list_scripts(account_id).await?;
    Ok(scripts
        .into_iter()
        .find(|script| script.id == script_name)
        .and_then(|script| script.migration_tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared() -> Vec<MigrationStep> {
        vec![
            MigrationStep::new("v1", json!({ "new_classes": ["Counter"] })),
            MigrationStep::new(
                "v2",
                json!({ "renamed_classes": [{ "from": "Counter", "to": "Tally" }] }),
            ),
            MigrationStep::new("v3", json!({ "deleted_classes": ["Legacy"] })),
        ]
    }

    #[test]
    fn test_no_declared_migrations_yields_no_plan() {
        assert_eq!(resolve(&[], None), None);
        assert_eq!(resolve(&[], Some("v1")), None);
    }

    #[test]
    fn test_first_deploy_applies_everything() {
        let steps = declared();
        let plan = resolve(&steps, None).unwrap();

        assert_eq!(plan.old_tag, None);
        assert_eq!(plan.new_tag, "v3");
        assert_eq!(plan.steps, untagged(&steps));
    }

    #[test]
    fn test_known_tag_yields_suffix_for_every_position() {
        let steps = declared();
        for (index, step) in steps.iter().enumerate() {
            let plan = resolve(&steps, Some(&step.tag)).unwrap();
            assert_eq!(plan.old_tag.as_deref(), Some(step.tag.as_str()));
            assert_eq!(plan.new_tag, "v3");
            assert_eq!(plan.steps, untagged(&steps[index + 1..]));
        }
    }

    #[test]
    fn test_up_to_date_tag_still_submits_empty_plan() {
        let plan = resolve(&declared(), Some("v3")).unwrap();
        assert_eq!(plan.old_tag.as_deref(), Some("v3"));
        assert_eq!(plan.new_tag, "v3");
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn test_diverged_history_reapplies_all_steps() {
        let steps = declared();
        let plan = resolve(&steps, Some("v0-edited-out")).unwrap();

        assert_eq!(plan.old_tag.as_deref(), Some("v0-edited-out"));
        assert_eq!(plan.new_tag, "v3");
        assert_eq!(plan.steps, untagged(&steps));
    }

    #[test]
    fn test_plan_serializes_without_tags() {
        let plan = resolve(&declared()[..1], None).unwrap();
        assert_eq!(
            serde_json::to_value(&plan).unwrap(),
            json!({
                "new_tag": "v1",
                "steps": [{ "new_classes": ["Counter"] }]
            })
        );
    }
}
