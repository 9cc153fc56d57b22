//! Workflow model: stages, edge groups and materialized edges.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::Parameter;

/// Store-assigned id of an edge within its group.
pub type EdgeId = i64;

/// Store-assigned id of a configuration.
pub type ConfigId = i64;

/// One alternative implementation for a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeGroup {
    /// Unique name per stage, used as the storage key.
    pub name: String,
    /// Tunable parameters, in declaration order.
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Files required before the command runs.
    #[serde(default)]
    pub input_files: Vec<String>,
    /// Files produced by the command.
    #[serde(default)]
    pub output_files: Vec<String>,
    /// Command template with `$#param#$` placeholders.
    #[serde(default)]
    pub command: String,
}

impl EdgeGroup {
    /// Create a group without file lists.
    pub fn new(
        name: impl Into<String>,
        parameters: Vec<Parameter>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters,
            input_files: Vec::new(),
            output_files: Vec::new(),
            command: command.into(),
        }
    }

    /// Set input and output file lists.
    pub fn with_files(mut self, input_files: Vec<String>, output_files: Vec<String>) -> Self {
        self.input_files = input_files;
        self.output_files = output_files;
        self
    }

    /// Parameter names in declaration order.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(Parameter::name).collect()
    }

    /// Number of distinct edges this group can produce.
    pub fn possibilities(&self) -> u64 {
        self.parameters
            .iter()
            .map(Parameter::possibilities)
            .fold(1u64, u64::saturating_mul)
    }

    /// Materialize an edge from one value string per parameter.
    ///
    /// The returned edge has id 0 until the store assigns one.
    pub fn edge(&self, values: &[String]) -> Result<Edge, WorkflowError> {
        if values.len() != self.parameters.len() {
            return Err(WorkflowError::ValueCountMismatch {
                group: self.name.clone(),
                expected: self.parameters.len(),
                actual: values.len(),
            });
        }

        let mut command = self.command.clone();
        for (param, value) in self.parameters.iter().zip(values) {
            let placeholder = format!("$#{}#$", param.name());
            command = command.replace(&placeholder, value);
        }

        Ok(Edge {
            group: self.name.clone(),
            values: values.to_vec(),
            command,
            input_files: self.input_files.clone(),
            output_files: self.output_files.clone(),
            id: 0,
        })
    }

    /// Materialize an edge from one value id per parameter.
    pub fn edge_from_ids(&self, ids: &[u64]) -> Result<Edge, WorkflowError> {
        if ids.len() != self.parameters.len() {
            return Err(WorkflowError::ValueCountMismatch {
                group: self.name.clone(),
                expected: self.parameters.len(),
                actual: ids.len(),
            });
        }
        let values: Vec<String> = self
            .parameters
            .iter()
            .zip(ids)
            .map(|(param, &id)| param.value(id))
            .collect();
        self.edge(&values)
    }

    /// Edge built from every parameter's maximum value.
    pub fn max_edge(&self) -> Edge {
        let values: Vec<String> = self.parameters.iter().map(Parameter::max_value).collect();
        // Value count always matches here.
        self.edge(&values).unwrap_or_else(|_| Edge {
            group: self.name.clone(),
            values,
            command: self.command.clone(),
            input_files: self.input_files.clone(),
            output_files: self.output_files.clone(),
            id: 0,
        })
    }
}

/// A fully parameterized instance of an edge group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Name of the group this edge belongs to.
    pub group: String,
    /// Parameter values in the group's declaration order.
    pub values: Vec<String>,
    /// Command with all placeholders resolved.
    pub command: String,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
    /// Store id; 0 for parameterless groups.
    pub id: EdgeId,
}

impl Edge {
    /// The `(group, edge id)` pair identifying this edge in a configuration.
    pub fn choice(&self) -> StageChoice {
        StageChoice {
            group: self.group.clone(),
            edge_id: self.id,
        }
    }
}

/// One stage decision inside a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageChoice {
    pub group: String,
    pub edge_id: EdgeId,
}

impl StageChoice {
    pub fn new(group: impl Into<String>, edge_id: EdgeId) -> Self {
        Self {
            group: group.into(),
            edge_id,
        }
    }
}

/// Execution state of a stored configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigStatus {
    /// Never attempted or still running.
    Unknown,
    /// Completed the whole pipeline.
    Succeeded,
    /// Failed at the given 1-based stage.
    FailedAt(usize),
}

impl ConfigStatus {
    /// Decode the stored `failed` marker.
    pub fn from_marker(marker: i64) -> Self {
        match marker {
            m if m < 0 => ConfigStatus::Unknown,
            0 => ConfigStatus::Succeeded,
            m => ConfigStatus::FailedAt(m as usize),
        }
    }

    /// Encode as the stored `failed` marker. Failure markers are always
    /// positive, so `FailedAt(0)` is stored as a failure at stage 1.
    pub fn marker(self) -> i64 {
        match self {
            ConfigStatus::Unknown => -1,
            ConfigStatus::Succeeded => 0,
            ConfigStatus::FailedAt(stage) => i64::try_from(stage.max(1)).unwrap_or(i64::MAX),
        }
    }
}

/// A full selection of one edge per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: ConfigId,
    pub choices: Vec<StageChoice>,
    pub score: f64,
    pub status: ConfigStatus,
}

/// A position in the workflow holding its candidate edge groups.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    id: usize,
    groups: Vec<EdgeGroup>,
}

impl Stage {
    /// Position of this stage in the workflow.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Candidate groups in declaration order.
    pub fn groups(&self) -> &[EdgeGroup] {
        &self.groups
    }
}

/// Fixed, ordered sequence of stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    stages: Vec<Stage>,
}

impl Workflow {
    /// Build a workflow from per-stage group lists.
    ///
    /// Fails if there are no stages, a stage has no groups, names are not
    /// usable as storage identifiers, a stage lists the same group twice, or
    /// one group name is reused with different parameter lists. A parameter
    /// may not be called `id` in any letter case, since that column keys the
    /// group's edge table.
    pub fn new(stages: Vec<Vec<EdgeGroup>>) -> Result<Self, WorkflowError> {
        if stages.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut signatures: HashMap<String, Vec<String>> = HashMap::new();
        let mut built = Vec::with_capacity(stages.len());

        for (id, groups) in stages.into_iter().enumerate() {
            if groups.is_empty() {
                return Err(WorkflowError::EmptyStage(id));
            }
            for (i, group) in groups.iter().enumerate() {
                check_identifier(&group.name)?;
                for name in group.parameter_names() {
                    check_identifier(name)?;
                    if name.eq_ignore_ascii_case(EDGE_ID_COLUMN) {
                        return Err(WorkflowError::InvalidName(name.to_string()));
                    }
                }
                if groups[..i].iter().any(|g| g.name == group.name) {
                    return Err(WorkflowError::DuplicateGroup {
                        stage: id,
                        group: group.name.clone(),
                    });
                }

                let names: Vec<String> =
                    group.parameter_names().into_iter().map(String::from).collect();
                match signatures.get(&group.name) {
                    Some(existing) if *existing != names => {
                        return Err(WorkflowError::ConflictingGroup(group.name.clone()));
                    }
                    Some(_) => {}
                    None => {
                        signatures.insert(group.name.clone(), names);
                    }
                }
            }
            built.push(Stage { id, groups });
        }

        Ok(Self { stages: built })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a constructed workflow.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Size of the configuration space.
    pub fn possibilities(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.groups.iter().map(EdgeGroup::possibilities).sum::<u64>())
            .fold(1u64, u64::saturating_mul)
    }
}

/// Returns true if `name` can be used verbatim inside table and column names.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Primary key column of every edge table.
const EDGE_ID_COLUMN: &str = "id";

fn check_identifier(name: &str) -> Result<(), WorkflowError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(WorkflowError::InvalidName(name.to_string()))
    }
}

/// Workflow construction and materialization errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("No workflow stages are given, at least one stage must be defined")]
    Empty,
    #[error("Stage {0} has no edge groups")]
    EmptyStage(usize),
    #[error("Edge group '{group}' is listed twice in stage {stage}")]
    DuplicateGroup { stage: usize, group: String },
    #[error("Edge group '{0}' is reused with a different parameter list")]
    ConflictingGroup(String),
    #[error("'{0}' is not a valid name (use letters, digits and underscores)")]
    InvalidName(String),
    #[error("Edge group '{group}' expects {expected} values, got {actual}")]
    ValueCountMismatch {
        group: String,
        expected: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> EdgeGroup {
        EdgeGroup::new(
            name,
            vec![
                Parameter::integer("threads", 1, 8, 1).unwrap(),
                Parameter::string("mode", ["fast", "exact"]).unwrap(),
            ],
            "run --threads $#threads#$ --mode $#mode#$ --again $#threads#$",
        )
    }

    #[test]
    fn test_edge_substitutes_placeholders() {
        let edge = group("align").edge_from_ids(&[3, 1]).unwrap();
        assert_eq!(edge.command, "run --threads 4 --mode exact --again 4");
        assert_eq!(edge.values, vec!["4", "exact"]);
        assert_eq!(edge.id, 0);
    }

    #[test]
    fn test_edge_value_mismatch() {
        let err = group("align").edge(&["4".to_string()]).unwrap_err();
        assert_eq!(
            err,
            WorkflowError::ValueCountMismatch {
                group: "align".into(),
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_max_edge() {
        let edge = group("align").max_edge();
        assert_eq!(edge.values, vec!["8", "exact"]);
    }

    #[test]
    fn test_parameterless_edges_equal() {
        let g = EdgeGroup::new("sort", vec![], "sort input");
        assert_eq!(g.edge(&[]).unwrap().choice(), g.edge(&[]).unwrap().choice());
        assert_eq!(g.possibilities(), 1);
    }

    #[test]
    fn test_workflow_validation() {
        assert_eq!(Workflow::new(vec![]), Err(WorkflowError::Empty));
        assert_eq!(Workflow::new(vec![vec![]]), Err(WorkflowError::EmptyStage(0)));
        assert!(matches!(
            Workflow::new(vec![vec![group("a"), group("a")]]),
            Err(WorkflowError::DuplicateGroup { stage: 0, .. })
        ));
        assert!(matches!(
            Workflow::new(vec![vec![group("a")], vec![EdgeGroup::new("a", vec![], "")]]),
            Err(WorkflowError::ConflictingGroup(_))
        ));
        assert!(matches!(
            Workflow::new(vec![vec![group("bad name")]]),
            Err(WorkflowError::InvalidName(_))
        ));
    }

    #[test]
    fn test_parameter_named_id_rejected() {
        for name in ["id", "ID", "Id"] {
            let g = EdgeGroup::new("g", vec![Parameter::integer(name, 0, 1, 1).unwrap()], "");
            assert_eq!(
                Workflow::new(vec![vec![g]]),
                Err(WorkflowError::InvalidName(name.to_string()))
            );
        }
        let g = EdgeGroup::new("g", vec![Parameter::integer("ids", 0, 1, 1).unwrap()], "");
        assert!(Workflow::new(vec![vec![g]]).is_ok());
    }

    #[test]
    fn test_edge_carries_files() {
        let g = group("align").with_files(vec!["reads.fq".into()], vec!["aligned.bam".into()]);
        let edge = g.edge_from_ids(&[0, 0]).unwrap();
        assert_eq!(edge.input_files, vec!["reads.fq"]);
        assert_eq!(edge.output_files, vec!["aligned.bam"]);
        assert_eq!(g.max_edge().output_files, vec!["aligned.bam"]);
    }

    #[test]
    fn test_workflow_stage_ids() {
        let wf = Workflow::new(vec![vec![group("a")], vec![group("b"), group("c")]]).unwrap();
        assert_eq!(wf.len(), 2);
        assert_eq!(wf.stages()[1].id(), 1);
        assert_eq!(wf.possibilities(), 16 * 32);
    }

    #[test]
    fn test_status_marker() {
        assert_eq!(ConfigStatus::from_marker(-1), ConfigStatus::Unknown);
        assert_eq!(ConfigStatus::from_marker(0), ConfigStatus::Succeeded);
        assert_eq!(ConfigStatus::from_marker(2), ConfigStatus::FailedAt(2));
        assert_eq!(ConfigStatus::FailedAt(3).marker(), 3);
        assert_eq!(ConfigStatus::FailedAt(0).marker(), 1);
        assert_eq!(
            ConfigStatus::from_marker(ConfigStatus::FailedAt(0).marker()),
            ConfigStatus::FailedAt(1)
        );
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("step_1"));
        assert!(is_identifier("_x"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
