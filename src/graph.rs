//! Weighted graph edges stored one row per node.
//!
//! An edge `a -[type]-> b` with weight `w` is the cell `a  type:b = "w"`, so
//! every neighbour of a node lives in that node's row.

use itertools::Itertools;
use tracing::warn;

use crate::batch::MutationBatcher;
use crate::config::ScanConfig;
use crate::data::{Cell, Mutation, Range};
use crate::error::Result;
use crate::store::{CellStream, KeyValueStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub node_a: String,
    pub edge_type: String,
    pub node_b: String,
    pub weight: i64,
}

impl Edge {
    pub fn new(
        node_a: impl Into<String>,
        edge_type: impl Into<String>,
        node_b: impl Into<String>,
        weight: i64,
    ) -> Self {
        Self {
            node_a: node_a.into(),
            edge_type: edge_type.into(),
            node_b: node_b.into(),
            weight,
        }
    }

    fn to_mutation(&self) -> Mutation {
        Mutation::new(self.node_a.as_str()).put(
            self.edge_type.as_str(),
            self.node_b.as_str(),
            self.weight.to_string(),
        )
    }

    fn reversed(&self) -> Self {
        Self::new(
            self.node_b.clone(),
            self.edge_type.clone(),
            self.node_a.clone(),
            self.weight,
        )
    }

    /// Parses a stored edge cell. Cells that are not UTF-8 or carry a
    /// non-numeric weight yield `None`.
    pub fn from_cell(cell: &Cell) -> Option<Self> {
        let weight = std::str::from_utf8(&cell.value).ok()?.parse().ok()?;
        Some(Self {
            node_a: String::from_utf8(cell.row().to_vec()).ok()?,
            edge_type: String::from_utf8(cell.family().to_vec()).ok()?,
            node_b: String::from_utf8(cell.qualifier().to_vec()).ok()?,
            weight,
        })
    }
}

/// Writes `edge`, and its reverse when the graph is undirected.
pub fn write_edge(batcher: &MutationBatcher, edge: &Edge, directed: bool) -> Result<()> {
    batcher.add(edge.to_mutation())?;
    if !directed {
        batcher.add(edge.reversed().to_mutation())?;
    }
    Ok(())
}

async fn collect_edges(mut cells: CellStream) -> Result<Vec<Edge>> {
    let mut edges = Vec::new();
    while let Some(cell) = cells.next().await {
        let cell = cell?;
        match Edge::from_cell(&cell) {
            Some(edge) => edges.push(edge),
            None => warn!(row = ?cell.row(), "Skipping malformed edge"),
        }
    }
    Ok(edges)
}

/// Edges leaving `node`.
pub async fn neighbors(
    store: &dyn KeyValueStore,
    table: &str,
    node: &str,
    config: &ScanConfig,
) -> Result<Vec<Edge>> {
    let cells = store.scan(table, Range::exact(node), config).await?;
    collect_edges(cells).await
}

/// Edges leaving the far end of each of `edges`, read with one batch scan.
pub async fn neighbors_of_neighbors(
    store: &dyn KeyValueStore,
    table: &str,
    edges: &[Edge],
    config: &ScanConfig,
) -> Result<Vec<Edge>> {
    let ranges: Vec<Range> = edges
        .iter()
        .map(|edge| Range::exact(edge.node_b.as_str()))
        .unique()
        .collect();
    if ranges.is_empty() {
        return Ok(Vec::new());
    }
    let cells = store.batch_scan(table, ranges, config).await?;
    collect_edges(cells).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfig;
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn graph(edges: &[Edge], directed: bool) -> Result<Arc<MemoryStore>> {
        let store = Arc::new(MemoryStore::new());
        store.create_table_if_absent("graph").await?;
        let batcher = MutationBatcher::open(
            store.clone(),
            "graph",
            WriterConfig::new().max_latency(Duration::from_secs(60)),
        )?;
        for edge in edges {
            write_edge(&batcher, edge, directed)?;
        }
        assert!(batcher.close().await?.is_applied());
        Ok(store)
    }

    fn targets(edges: &[Edge]) -> Vec<&str> {
        let mut targets: Vec<&str> = edges.iter().map(|e| e.node_b.as_str()).collect();
        targets.sort();
        targets
    }

    #[tokio::test]
    async fn test_directed_edges() -> Result<()> {
        let store = graph(
            &[
                Edge::new("alice", "follows", "bob", 1),
                Edge::new("alice", "follows", "carol", 3),
            ],
            true,
        )
        .await?;
        let config = ScanConfig::default();

        let out = neighbors(store.as_ref(), "graph", "alice", &config).await?;
        assert_eq!(targets(&out), vec!["bob", "carol"]);
        assert_eq!(out[1].weight, 3);
        assert!(neighbors(store.as_ref(), "graph", "bob", &config).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_undirected_edges_write_reverse() -> Result<()> {
        let store = graph(&[Edge::new("alice", "knows", "bob", 2)], false).await?;

        let back = neighbors(store.as_ref(), "graph", "bob", &ScanConfig::default()).await?;
        assert_eq!(back, vec![Edge::new("bob", "knows", "alice", 2)]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_neighbors_of_neighbors() -> Result<()> {
        let store = graph(
            &[
                Edge::new("a", "link", "b", 1),
                Edge::new("a", "link", "c", 1),
                Edge::new("b", "link", "d", 1),
                Edge::new("c", "link", "e", 1),
                Edge::new("d", "link", "f", 1),
            ],
            true,
        )
        .await?;
        let config = ScanConfig::default();

        let first = neighbors(store.as_ref(), "graph", "a", &config).await?;
        let second = neighbors_of_neighbors(store.as_ref(), "graph", &first, &config).await?;
        assert_eq!(targets(&second), vec!["d", "e"]);
        assert_eq!(store.probe().batch_scans(), 1);

        assert!(neighbors_of_neighbors(store.as_ref(), "graph", &[], &config)
            .await?
            .is_empty());
        assert_eq!(store.probe().batch_scans(), 1);
        Ok(())
    }
}
