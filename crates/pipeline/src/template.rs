//! Loading the base job graph.

use std::path::Path;

use avagen_core::graph::JobGraph;

/// Load the template at `path`, falling back to the built-in SDXL+LoRA
/// graph when the file is missing, unreadable, or not in API format.
pub async fn load_or_builtin(path: Option<&Path>) -> JobGraph {
    let Some(path) = path else {
        tracing::info!("No workflow template configured, using built-in graph");
        return JobGraph::builtin();
    };

    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "Workflow template not found, using built-in graph");
            return JobGraph::builtin();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read workflow template, using built-in graph");
            return JobGraph::builtin();
        }
    };

    let parsed = serde_json::from_str::<serde_json::Value>(&text)
        .map_err(|e| e.to_string())
        .and_then(|json| JobGraph::from_wire(&json).map_err(|e| e.to_string()));

    match parsed {
        Ok(graph) => {
            let missing = graph.missing_roles();
            if !missing.is_empty() {
                tracing::warn!(path = %path.display(), ?missing, "Workflow template lacks node roles");
            }
            tracing::info!(path = %path.display(), nodes = graph.len(), "Loaded workflow template");
            graph
        }
        Err(reason) => {
            tracing::warn!(path = %path.display(), %reason, "Unusable workflow template, using built-in graph");
            JobGraph::builtin()
        }
    }
}

#[cfg(test)]
mod tests {
    use avagen_core::graph::NodeRole;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn missing_file_uses_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let graph = load_or_builtin(Some(&dir.path().join("avatar_ai.json"))).await;
        assert_eq!(graph, JobGraph::builtin());
    }

    #[tokio::test]
    async fn ui_export_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avatar_ai.json");
        let ui_export = json!({
            "last_node_id": 9,
            "nodes": [ { "id": 3, "type": "KSampler", "widgets_values": [0, "fixed", 25] } ],
            "links": []
        });
        tokio::fs::write(&path, ui_export.to_string()).await.unwrap();

        assert_eq!(load_or_builtin(Some(&path)).await, JobGraph::builtin());
    }

    #[tokio::test]
    async fn api_format_template_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avatar_ai.json");
        let mut wire = JobGraph::builtin().to_wire();
        wire["3"]["inputs"]["steps"] = json!(40);
        tokio::fs::write(&path, wire.to_string()).await.unwrap();

        let graph = load_or_builtin(Some(&path)).await;
        assert_eq!(graph.input("3", "steps"), Some(&json!(40)));
        assert_eq!(graph.nodes_for(NodeRole::SamplerSettings), ["3".to_string()]);
    }
}
