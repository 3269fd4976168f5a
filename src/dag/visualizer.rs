use super::resource_graph::{DependencyEdge, ResourceGraph};

/// Render the resource graph in DOT format for `keel graph`.
///
/// Arrows point from a dependency to its dependent. Explicit `depends_on`
/// edges are solid, reference edges dashed.
pub fn to_dot(graph: &ResourceGraph, stack: &str) -> String {
    let mut lines = Vec::new();
    lines.push(format!("digraph \"{}\" {{", escape(stack)));
    lines.push("    rankdir=TB;".to_string());
    lines.push("    node [shape=box, style=filled, fillcolor=lightblue];".to_string());

    for resource in graph.resources() {
        lines.push(format!(
            "    \"{}\" [label=\"{}\\n{}\"];",
            escape(&resource.id),
            escape(&resource.id),
            escape(&resource.resource_type)
        ));
    }

    for (from, to, kind) in graph.edges() {
        let style = match kind {
            DependencyEdge::Explicit => "solid",
            DependencyEdge::Implicit => "dashed",
        };
        lines.push(format!(
            "    \"{}\" -> \"{}\" [style={}];",
            escape(from),
            escape(to),
            style
        ));
    }

    lines.push("}".to_string());
    lines.join("\n")
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
