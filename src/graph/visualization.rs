//! Graphviz rendering of the fusion partition.

use std::fmt::Write;

use super::Graph;

/// Renders the graph in DOT format with one cluster per fusion group.
///
/// Nodes outside every group (before fusion has run) are drawn at the top
/// level.
pub fn groups_to_dot(graph: &Graph) -> String {
    let mut dot = String::from("digraph G {\n");
    dot.push_str("  rankdir=LR;\n");
    dot.push_str("  node [shape=box];\n\n");

    for input in graph.inputs() {
        let _ = writeln!(dot, "  \"{input}\" [shape=ellipse];");
    }

    let mut grouped = vec![false; graph.node_count()];
    for group in &graph.fusion_groups {
        let _ = writeln!(dot, "  subgraph cluster_{} {{", group.id.0);
        let _ = writeln!(dot, "    label=\"{} ({})\";", group.name(graph), group.pattern);
        for &n in &group.nodes {
            grouped[n.0] = true;
            let _ = writeln!(dot, "    {};", node_decl(graph, n.0));
        }
        dot.push_str("  }\n");
    }
    for node in graph.nodes() {
        if !grouped[node.id.0] {
            let _ = writeln!(dot, "  {};", node_decl(graph, node.id.0));
        }
    }
    dot.push('\n');

    for node in graph.nodes() {
        for input in &node.inputs {
            let from = match graph.producer(input) {
                Some(p) => format!("n{}", p.0),
                None => format!("\"{input}\""),
            };
            let _ = writeln!(dot, "  {from} -> n{} [label=\"{input}\"];", node.id.0);
        }
    }
    dot.push_str("}\n");
    dot
}

fn node_decl(graph: &Graph, index: usize) -> String {
    let node = &graph.nodes()[index];
    let shape = graph
        .shape_dict
        .get(node.output())
        .map(|s| format!("{s:?}"))
        .unwrap_or_else(|| "?".to_string());
    format!("n{index} [label=\"{}\\n{} {shape}\"]", node.name, node.pattern)
}
