// action.yml / action.yaml parsing. Composite steps decode straight into
// the workflow model's Step type so the same step machinery runs them.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use gale_model::workflow::{ActionReference, Step, StepExec};

/// Parsed action manifest.
#[derive(Debug, Clone)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    /// Input name -> specification.
    pub inputs: Vec<(String, ActionInput)>,
    /// Output name -> value expression (composite) or description.
    pub outputs: Vec<(String, String)>,
    pub runs: RunsConfig,
    /// Inner steps, for composite actions.
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionInput {
    pub default: Option<String>,
    pub required: bool,
}

/// The `runs:` section.
#[derive(Debug, Clone)]
pub struct RunsConfig {
    /// "composite", "docker", or "node*".
    pub using: String,
    /// Entry point for node actions.
    pub main: Option<String>,
    /// Image for docker actions ("Dockerfile" or `docker://...`).
    pub image: Option<String>,
    pub entrypoint: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// The kind of handler an action dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Node,
    Docker,
    Composite,
}

impl RunsConfig {
    pub fn kind(&self) -> Result<ActionKind> {
        if self.using == "composite" {
            Ok(ActionKind::Composite)
        } else if self.using == "docker" {
            Ok(ActionKind::Docker)
        } else if self.using.starts_with("node") {
            Ok(ActionKind::Node)
        } else {
            anyhow::bail!("unsupported action runtime '{}'", self.using)
        }
    }
}

impl ActionDefinition {
    /// Load the manifest from an action directory; tries `action.yml`
    /// first, then `action.yaml`.
    pub fn load(action_directory: &Path) -> Result<Self> {
        let yml = action_directory.join("action.yml");
        let yaml = action_directory.join("action.yaml");
        let manifest = if yml.exists() {
            yml
        } else if yaml.exists() {
            yaml
        } else {
            anyhow::bail!(
                "no action manifest in {} (expected action.yml or action.yaml)",
                action_directory.display()
            );
        };
        let content = std::fs::read_to_string(&manifest)
            .with_context(|| format!("failed to read {}", manifest.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse {}", manifest.display()))
    }

    /// Parse manifest YAML.
    pub fn parse(content: &str) -> Result<Self> {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(content).context("action manifest is not valid YAML")?;

        let name = yaml
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unnamed action")
            .to_string();
        let description = yaml
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut inputs = Vec::new();
        if let Some(map) = yaml.get("inputs").and_then(|v| v.as_mapping()) {
            for (key, value) in map {
                let Some(input_name) = key.as_str() else {
                    continue;
                };
                inputs.push((
                    input_name.to_string(),
                    ActionInput {
                        default: value
                            .get("default")
                            .and_then(scalar_to_string),
                        required: value
                            .get("required")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                    },
                ));
            }
        }

        let mut outputs = Vec::new();
        if let Some(map) = yaml.get("outputs").and_then(|v| v.as_mapping()) {
            for (key, value) in map {
                let Some(output_name) = key.as_str() else {
                    continue;
                };
                // Composite outputs carry a `value:` expression; others just
                // a description.
                let value_expr = value
                    .get("value")
                    .and_then(scalar_to_string)
                    .unwrap_or_default();
                outputs.push((output_name.to_string(), value_expr));
            }
        }

        let runs_yaml = yaml
            .get("runs")
            .ok_or_else(|| anyhow::anyhow!("action manifest has no 'runs' section"))?;
        let using = runs_yaml
            .get("using")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("'runs' section has no 'using'"))?
            .to_string();

        let runs = RunsConfig {
            using: using.clone(),
            main: runs_yaml.get("main").and_then(scalar_to_string),
            image: runs_yaml.get("image").and_then(scalar_to_string),
            entrypoint: runs_yaml.get("entrypoint").and_then(scalar_to_string),
            args: runs_yaml
                .get("args")
                .and_then(|v| v.as_sequence())
                .map(|seq| seq.iter().filter_map(scalar_to_string).collect())
                .unwrap_or_default(),
            env: parse_string_map(runs_yaml.get("env")),
        };

        let steps = if using == "composite" {
            parse_composite_steps(runs_yaml)?
        } else {
            Vec::new()
        };

        Ok(Self {
            name,
            description,
            inputs,
            outputs,
            runs,
            steps,
        })
    }
}

/// Decode the `steps:` of a composite action into model steps.
fn parse_composite_steps(runs_yaml: &serde_yaml::Value) -> Result<Vec<Step>> {
    let Some(sequence) = runs_yaml.get("steps").and_then(|v| v.as_sequence()) else {
        return Ok(Vec::new());
    };

    let mut steps = Vec::new();
    for (index, step_yaml) in sequence.iter().enumerate() {
        let run = step_yaml.get("run").and_then(scalar_to_string);
        let uses = step_yaml.get("uses").and_then(|v| v.as_str());

        let exec = match (run, uses) {
            (Some(script), None) => StepExec::Run {
                script,
                shell: step_yaml.get("shell").and_then(scalar_to_string),
                working_directory: step_yaml
                    .get("working-directory")
                    .and_then(scalar_to_string),
            },
            (None, Some(uses)) => {
                if let Some(image) = uses.strip_prefix("docker://") {
                    StepExec::UsesDockerUrl {
                        image: image.to_string(),
                    }
                } else if uses.starts_with("./") {
                    StepExec::UsesLocalAction {
                        path: uses.to_string(),
                    }
                } else {
                    let reference = ActionReference::parse(uses).ok_or_else(|| {
                        anyhow::anyhow!("composite step {} has invalid 'uses' '{}'", index + 1, uses)
                    })?;
                    StepExec::UsesRemoteAction { reference }
                }
            }
            (Some(_), Some(_)) => {
                anyhow::bail!("composite step {} declares both 'run' and 'uses'", index + 1)
            }
            (None, None) => {
                anyhow::bail!("composite step {} declares neither 'run' nor 'uses'", index + 1)
            }
        };

        steps.push(Step {
            id: step_yaml
                .get("id")
                .and_then(|v| v.as_str())
                .map(String::from),
            name: step_yaml
                .get("name")
                .and_then(|v| v.as_str())
                .map(String::from),
            condition: step_yaml.get("if").and_then(scalar_to_string),
            with: parse_string_map(step_yaml.get("with")),
            env: parse_string_map(step_yaml.get("env")),
            continue_on_error: step_yaml
                .get("continue-on-error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            timeout_minutes: step_yaml.get("timeout-minutes").and_then(|v| v.as_u64()),
            exec,
        });
    }
    Ok(steps)
}

fn parse_string_map(value: Option<&serde_yaml::Value>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(mapping) = value.and_then(|v| v.as_mapping()) {
        for (key, value) in mapping {
            if let (Some(k), Some(v)) = (key.as_str(), scalar_to_string(value)) {
                map.insert(k.to_string(), v);
            }
        }
    }
    map
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_action() {
        let yaml = r#"
name: 'My Action'
description: 'Does things'
inputs:
  who:
    description: 'Who to greet'
    required: true
    default: 'world'
outputs:
  result:
    description: 'The result'
runs:
  using: 'node20'
  main: 'dist/index.js'
"#;
        let def = ActionDefinition::parse(yaml).unwrap();
        assert_eq!(def.name, "My Action");
        assert_eq!(def.runs.kind().unwrap(), ActionKind::Node);
        assert_eq!(def.runs.main.as_deref(), Some("dist/index.js"));
        let (input_name, input) = &def.inputs[0];
        assert_eq!(input_name, "who");
        assert!(input.required);
        assert_eq!(input.default.as_deref(), Some("world"));
    }

    #[test]
    fn test_parse_docker_action() {
        let yaml = r#"
name: 'Docker Action'
runs:
  using: 'docker'
  image: 'Dockerfile'
  entrypoint: '/entry.sh'
  args: ['--flag', 'v']
  env:
    KEY: val
"#;
        let def = ActionDefinition::parse(yaml).unwrap();
        assert_eq!(def.runs.kind().unwrap(), ActionKind::Docker);
        assert_eq!(def.runs.image.as_deref(), Some("Dockerfile"));
        assert_eq!(def.runs.args, vec!["--flag", "v"]);
        assert_eq!(def.runs.env.get("KEY").map(String::as_str), Some("val"));
    }

    #[test]
    fn test_parse_composite_action() {
        let yaml = r#"
name: 'Composite'
inputs:
  who-to-greet:
    default: 'World'
outputs:
  greeting:
    value: ${{ steps.greet.outputs.text }}
runs:
  using: 'composite'
  steps:
    - id: greet
      run: echo "text=Hello ${{ inputs.who-to-greet }}" >> $GITHUB_OUTPUT
      shell: bash
    - uses: ./nested
"#;
        let def = ActionDefinition::parse(yaml).unwrap();
        assert_eq!(def.runs.kind().unwrap(), ActionKind::Composite);
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].id.as_deref(), Some("greet"));
        assert!(matches!(&def.steps[0].exec, StepExec::Run { shell: Some(s), .. } if s == "bash"));
        assert!(matches!(&def.steps[1].exec, StepExec::UsesLocalAction { .. }));
        assert_eq!(def.outputs[0].0, "greeting");
        assert!(def.outputs[0].1.contains("steps.greet.outputs.text"));
    }

    #[test]
    fn test_missing_runs_is_error() {
        assert!(ActionDefinition::parse("name: x\n").is_err());
    }

    #[test]
    fn test_unknown_runtime_kind() {
        let yaml = "name: x\nruns:\n  using: 'ruby'\n";
        let def = ActionDefinition::parse(yaml).unwrap();
        assert!(def.runs.kind().is_err());
    }

    #[test]
    fn test_load_prefers_action_yml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("action.yml"),
            "name: from-yml\nruns:\n  using: node20\n  main: index.js\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("action.yaml"),
            "name: from-yaml\nruns:\n  using: node20\n  main: index.js\n",
        )
        .unwrap();
        let def = ActionDefinition::load(dir.path()).unwrap();
        assert_eq!(def.name, "from-yml");
    }

    #[test]
    fn test_load_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ActionDefinition::load(dir.path()).is_err());
    }
}
