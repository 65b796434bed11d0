use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{success, timestamp, ApiError, ApiResult, AppState, CollectionQuery, GenericResponse, JsonMap};

type Reply = ApiResult<Json<GenericResponse<Value>>>;

pub async fn labels(State(state): State<AppState>, Query(q): Query<CollectionQuery>) -> Reply {
    let rag = state.collection(&q.collection_id).await?;
    let labels = rag.graph_labels()?;
    let total = labels.len();
    Ok(success(
        format!("Found {total} graph labels"),
        json!({"labels": labels, "total_labels": total}),
    ))
}

#[derive(Debug, Deserialize)]
pub struct GraphQuery {
    pub collection_id: String,
    pub label: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
}

fn default_max_depth() -> usize {
    3
}

fn default_max_nodes() -> usize {
    1000
}

pub async fn knowledge_graph(State(state): State<AppState>, Query(q): Query<GraphQuery>) -> Reply {
    if q.max_depth < 1 {
        return Err(ApiError::unprocessable("max_depth must be greater than or equal to 1"));
    }
    if q.max_nodes < 1 {
        return Err(ApiError::unprocessable("max_nodes must be greater than or equal to 1"));
    }
    let rag = state.collection(&q.collection_id).await?;
    let graph = rag.knowledge_graph(&q.label, q.max_depth, q.max_nodes)?;

    let nodes: Vec<Value> = graph
        .nodes
        .iter()
        .map(|n| json!({"id": n.id, "label": n.label, "properties": n.properties}))
        .collect();
    let edges: Vec<Value> = graph
        .edges
        .iter()
        .map(|e| {
            json!({
                "source": e.source,
                "target": e.target,
                "type": e.edge_type,
                "properties": e.properties,
            })
        })
        .collect();
    let (total_nodes, total_edges) = (nodes.len(), edges.len());
    Ok(success(
        format!("Retrieved knowledge graph with {total_nodes} nodes and {total_edges} edges"),
        json!({
            "nodes": nodes,
            "edges": edges,
            "total_nodes": total_nodes,
            "total_edges": total_edges,
            "max_depth_reached": graph.max_depth_reached,
            "is_truncated": graph.is_truncated,
            "query_label": q.label,
            "timestamp": timestamp(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct EntityQuery {
    pub collection_id: String,
    pub name: String,
}

pub async fn entity_exists(State(state): State<AppState>, Query(q): Query<EntityQuery>) -> Reply {
    let rag = state.collection(&q.collection_id).await?;
    let info = rag.entity_exists(&q.name)?;
    let message = if info.exists {
        format!("Entity '{}' exists", q.name)
    } else {
        format!("Entity '{}' does not exist", q.name)
    };
    Ok(success(
        message,
        json!({
            "exists": info.exists,
            "entity_name": q.name,
            "node_count": info.node_count,
            "edge_count": info.edge_count,
            "timestamp": timestamp(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct EntityUpdateRequest {
    pub entity_name: String,
    pub updated_data: JsonMap,
    #[serde(default)]
    pub allow_rename: bool,
}

pub async fn edit_entity(
    State(state): State<AppState>,
    Query(q): Query<CollectionQuery>,
    Json(req): Json<EntityUpdateRequest>,
) -> Reply {
    let rag = state.collection(&q.collection_id).await?;
    let edit = rag
        .edit_entity(&req.entity_name, req.updated_data, req.allow_rename)
        .await?;
    let was_renamed = edit.entity_name != req.entity_name;
    info!(collection_id = %q.collection_id, entity = %edit.entity_name, was_renamed, "Entity updated");
    Ok(success(
        format!("Entity '{}' updated successfully", edit.entity_name),
        json!({
            "entity_name": edit.entity_name,
            "updated_properties": edit.properties,
            "was_renamed": was_renamed,
            "old_name": req.entity_name,
            "new_name": edit.entity_name,
            "timestamp": timestamp(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RelationUpdateRequest {
    pub source_id: String,
    pub target_id: String,
    pub updated_data: JsonMap,
}

pub async fn edit_relation(
    State(state): State<AppState>,
    Query(q): Query<CollectionQuery>,
    Json(req): Json<RelationUpdateRequest>,
) -> Reply {
    let rag = state.collection(&q.collection_id).await?;
    let edit = rag
        .edit_relation(&req.source_id, &req.target_id, req.updated_data)
        .await?;
    info!(collection_id = %q.collection_id, src = %edit.src_id, tgt = %edit.tgt_id, "Relation updated");
    Ok(success(
        format!(
            "Relation from '{}' to '{}' updated successfully",
            edit.src_id, edit.tgt_id
        ),
        json!({
            "source_id": edit.src_id,
            "target_id": edit.tgt_id,
            "relation_type": edit.relation_type,
            "updated_properties": edit.properties,
            "timestamp": timestamp(),
        }),
    ))
}
