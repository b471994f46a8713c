//! Artifact lineage: which step and inputs an artifact came from

use crate::core::Artifact;
use crate::persistence::MetadataStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::warn;
use uuid::Uuid;

/// One artifact in a lineage graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageNode {
    pub artifact: Artifact,

    /// Step that computed the artifact; `None` for datasource snapshots
    pub step: Option<String>,

    /// `path@version` of the producing step
    pub source: Option<String>,

    /// Run that computed the artifact
    pub run_id: Option<Uuid>,

    /// Artifacts the producing execution consumed
    pub inputs: Vec<Uuid>,
}

/// Upstream graph of an artifact, root first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lineage {
    pub root: Uuid,
    pub nodes: Vec<LineageNode>,
}

impl Lineage {
    pub fn node(&self, artifact_id: Uuid) -> Option<&LineageNode> {
        self.nodes.iter().find(|n| n.artifact.id == artifact_id)
    }

    /// Every upstream artifact, excluding the root
    pub fn ancestors(&self) -> Vec<Uuid> {
        self.nodes
            .iter()
            .map(|n| n.artifact.id)
            .filter(|id| *id != self.root)
            .collect()
    }

    /// Datasource snapshots the root ultimately derives from
    pub fn datasources(&self) -> Vec<&Artifact> {
        self.nodes
            .iter()
            .map(|n| &n.artifact)
            .filter(|a| a.is_datasource())
            .collect()
    }
}

/// Walk producing executions breadth-first from an artifact
pub async fn trace_lineage(store: &dyn MetadataStore, artifact_id: Uuid) -> Result<Lineage> {
    if store.load_artifact(artifact_id).await?.is_none() {
        anyhow::bail!("Artifact {} not found", artifact_id);
    }

    let mut nodes = Vec::new();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([artifact_id]);

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }

        let Some(artifact) = store.load_artifact(id).await? else {
            warn!("Lineage of {} references unknown artifact {}", artifact_id, id);
            continue;
        };

        let producer = store.producer_of(id).await?;
        let node = match producer {
            Some(execution) => {
                for input in &execution.inputs {
                    if !visited.contains(input) {
                        queue.push_back(*input);
                    }
                }
                LineageNode {
                    artifact,
                    step: Some(execution.step_name),
                    source: Some(execution.source),
                    run_id: Some(execution.run_id),
                    inputs: execution.inputs,
                }
            }
            None => LineageNode {
                run_id: Some(artifact.run_id),
                artifact,
                step: None,
                source: None,
                inputs: Vec::new(),
            },
        };
        nodes.push(node);
    }

    Ok(Lineage {
        root: artifact_id,
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::fixtures::execution;
    use crate::persistence::InMemoryMetadataStore;

    fn artifact(name: &str, producer: &str) -> Artifact {
        Artifact::new(name, producer, Uuid::new_v4(), "fp", "hash", format!("memory://{}/{}", producer, name))
    }

    #[tokio::test]
    async fn test_trace_through_steps_to_datasource() {
        let store = InMemoryMetadataStore::new();

        let data = artifact("data", &Artifact::datasource_producer("iris"));
        let train = artifact("train", "split");
        let eval = artifact("eval", "split");
        let model = artifact("output", "trainer");
        let metrics = artifact("output", "evaluator");
        for a in [&data, &train, &eval, &model, &metrics] {
            store.record_artifact(a).await.unwrap();
        }

        store
            .record_step(&execution("split", "f1", vec![data.id], vec![train.id, eval.id], false))
            .await
            .unwrap();
        store
            .record_step(&execution("trainer", "f2", vec![train.id], vec![model.id], false))
            .await
            .unwrap();
        store
            .record_step(&execution("evaluator", "f3", vec![model.id, eval.id], vec![metrics.id], false))
            .await
            .unwrap();

        let lineage = trace_lineage(&store, metrics.id).await.unwrap();
        assert_eq!(lineage.nodes[0].artifact.id, metrics.id);
        assert_eq!(lineage.nodes[0].step.as_deref(), Some("evaluator"));

        let ancestors: HashSet<Uuid> = lineage.ancestors().into_iter().collect();
        assert_eq!(ancestors, HashSet::from([model.id, eval.id, train.id, data.id]));
        assert_eq!(lineage.ancestors().len(), 4);

        let datasources = lineage.datasources();
        assert_eq!(datasources.len(), 1);
        assert_eq!(datasources[0].id, data.id);
        assert!(lineage.node(data.id).unwrap().step.is_none());
    }

    #[tokio::test]
    async fn test_unknown_artifact() {
        let store = InMemoryMetadataStore::new();
        assert!(trace_lineage(&store, Uuid::new_v4()).await.is_err());
    }
}
