use crate::config::Neo4jConfig;
use anyhow::{anyhow, Context, Result};
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

/// Dirección `host:puerto` del servidor Bolt a partir de la URI configurada.
pub fn bolt_address(uri: &str) -> Result<String> {
    let url = Url::parse(uri).with_context(|| format!("NEO4J_URI no válida: '{uri}'"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("NEO4J_URI sin host: '{uri}'"))?;
    let port = url.port().unwrap_or(7687);
    Ok(format!("{host}:{port}"))
}

pub async fn connect_from_config(cfg: &Neo4jConfig) -> Result<Graph> {
    let addr = bolt_address(&cfg.uri)?;

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.user, &cfg.password)
        .await
        .with_context(|| format!("No se pudo conectar a Neo4j en {addr}"))?;
    graph
        .run(query("RETURN 1"))
        .await
        .context("Neo4j no responde al health check")?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}
