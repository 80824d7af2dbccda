use axum::Json;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelCapabilities {
    pub family: &'static str,
    pub object: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelDescriptor {
    pub capabilities: ModelCapabilities,
    pub id: &'static str,
    pub name: &'static str,
    pub object: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub data: &'static [ModelDescriptor],
    pub object: &'static str,
}

const fn model(
    id: &'static str,
    name: &'static str,
    family: &'static str,
    kind: &'static str,
    version: &'static str,
) -> ModelDescriptor {
    ModelDescriptor {
        capabilities: ModelCapabilities {
            family,
            object: "model_capabilities",
            kind,
        },
        id,
        name,
        object: "model",
        version,
    }
}

/// What the editor plugin is told is available. Independent of the configured upstreams.
pub const MODELS: &[ModelDescriptor] = &[
    model(
        "gpt-3.5-turbo",
        "GPT 3.5 Turbo",
        "gpt-3.5-turbo",
        "chat",
        "gpt-3.5-turbo-0613",
    ),
    model(
        "gpt-3.5-turbo-0613",
        "GPT 3.5 Turbo (2023-06-13)",
        "gpt-3.5-turbo",
        "chat",
        "gpt-3.5-turbo-0613",
    ),
    model("gpt-4", "GPT 4", "gpt-4", "chat", "gpt-4-0613"),
    model(
        "gpt-4-0613",
        "GPT 4 (2023-06-13)",
        "gpt-4",
        "chat",
        "gpt-4-0613",
    ),
    model(
        "gpt-4-0125-preview",
        "GPT 4 Turbo (2024-01-25 Preview)",
        "gpt-4-turbo",
        "chat",
        "gpt-4-0125-preview",
    ),
    model(
        "text-embedding-ada-002",
        "Embedding V2 Ada",
        "text-embedding-ada-002",
        "embeddings",
        "text-embedding-ada-002",
    ),
    model(
        "text-embedding-ada-002-index",
        "Embedding V2 Ada (Index)",
        "text-embedding-ada-002",
        "embeddings",
        "text-embedding-ada-002",
    ),
    model(
        "text-embedding-3-small",
        "Embedding V3 small",
        "text-embedding-3-small",
        "embeddings",
        "text-embedding-3-small",
    ),
    model(
        "text-embedding-3-small-inference",
        "Embedding V3 small (Inference)",
        "text-embedding-3-small",
        "embeddings",
        "text-embedding-3-small",
    ),
];

pub async fn models() -> Json<ModelList> {
    Json(ModelList {
        data: MODELS,
        object: "list",
    })
}
