/// CSV export of the currently loaded tree.
///
/// Walks only what is already in memory; exporting never starts a fetch.
use crate::model::AsyncTreeModel;
use crate::node::NodeId;
use crate::provider::DataProvider;
use anyhow::Context;
use std::io::Write;

/// Write one row per loaded node, depth-first from the root:
/// `depth,key,label,state,children`.
///
/// `key` renders a payload's identity and `label` renders it for humans;
/// both are written as plain cells. Returns the number of rows written.
pub fn export_csv<P, W, K, L>(
    model: &AsyncTreeModel<P>,
    writer: W,
    key: K,
    label: L,
) -> anyhow::Result<usize>
where
    P: DataProvider,
    W: Write,
    K: Fn(&P::Node) -> String,
    L: Fn(&P::Node) -> String,
{
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(["depth", "key", "label", "state", "children"])
        .context("writing CSV header")?;

    let mut rows = 0usize;
    let mut stack: Vec<(NodeId, usize)> = vec![(model.root(), 0)];
    while let Some((id, depth)) = stack.pop() {
        let Some(node) = model.node(id) else {
            continue;
        };
        let children = model.loaded_children(id);
        csv.write_record([
            depth.to_string(),
            key(node),
            label(node),
            model.load_state(id).label().to_owned(),
            children.len().to_string(),
        ])
        .context("writing CSV row")?;
        rows += 1;
        // Reverse so the first child is popped first.
        stack.extend(children.iter().rev().map(|&child| (child, depth + 1)));
    }
    csv.flush().context("flushing CSV output")?;
    Ok(rows)
}
