use keel::config::types::{PropertyValue, Resource};
use keel::dag::resource_graph::{DependencyEdge, ResourceGraph};
use keel::dag::visualizer::to_dot;
use keel::error::EngineError;

fn web_stack() -> Vec<Resource> {
    vec![
        Resource::new("vpc", "network").with_property("cidr", "10.0.0.0/16"),
        Resource::new("subnet-a", "subnet")
            .with_property("network", "${ref.vpc.id}")
            .with_property("cidr", "10.0.1.0/24"),
        Resource::new("subnet-b", "subnet")
            .with_property("network", "${ref.vpc.id}")
            .with_property("cidr", "10.0.2.0/24"),
        Resource::new("sg", "security-group").with_property("network", "${ref.vpc.id}"),
        Resource::new("db", "managed-database")
            .with_property(
                "subnets",
                PropertyValue::List(vec!["${ref.subnet-a.id}".into(), "${ref.subnet-b.id}".into()]),
            )
            .with_property("security_groups", PropertyValue::List(vec!["${ref.sg.id}".into()])),
        Resource::new("web", "compute-instance")
            .with_property("subnet", "${ref.subnet-a.id}")
            .with_property("user_data", "DB_HOST=${ref.db.endpoint}")
            .with_dependency("sg"),
    ]
}

#[test]
fn test_topological_order_places_dependencies_first() {
    let resources = web_stack();
    let graph = ResourceGraph::build(resources.clone()).unwrap();
    let order = graph.topological_order();

    assert_eq!(order.len(), resources.len());
    for resource in &resources {
        assert_eq!(order.iter().filter(|id| **id == resource.id).count(), 1);
        let position = order.iter().position(|id| *id == resource.id).unwrap();
        for dep in resource.dependencies() {
            let dep_position = order.iter().position(|id| *id == dep).unwrap();
            assert!(dep_position < position, "{} must come before {}", dep, resource.id);
        }
    }
}

#[test]
fn test_topological_order_breaks_ties_by_id() {
    let graph = ResourceGraph::build(web_stack()).unwrap();
    assert_eq!(
        graph.topological_order(),
        vec!["vpc", "sg", "subnet-a", "subnet-b", "db", "web"]
    );
}

#[test]
fn test_order_ignores_declaration_order() {
    let mut reversed = web_stack();
    reversed.reverse();
    let a = ResourceGraph::build(web_stack()).unwrap();
    let b = ResourceGraph::build(reversed).unwrap();
    assert_eq!(a.topological_order(), b.topological_order());
}

#[test]
fn test_levels() {
    let graph = ResourceGraph::build(web_stack()).unwrap();
    assert_eq!(
        graph.levels(),
        vec![
            vec!["vpc"],
            vec!["sg", "subnet-a", "subnet-b"],
            vec!["db"],
            vec!["web"],
        ]
    );
}

#[test]
fn test_edge_kinds() {
    let graph = ResourceGraph::build(web_stack()).unwrap();
    let edges = graph.edges();
    assert!(edges.contains(&("sg", "web", DependencyEdge::Explicit)));
    assert!(edges.contains(&("db", "web", DependencyEdge::Implicit)));
    assert!(edges.contains(&("subnet-b", "db", DependencyEdge::Implicit)));
}

#[test]
fn test_dependents_and_transitive_dependents() {
    let graph = ResourceGraph::build(web_stack()).unwrap();
    assert_eq!(graph.dependencies("db"), vec!["sg", "subnet-a", "subnet-b"]);
    assert_eq!(graph.dependents("vpc"), vec!["sg", "subnet-a", "subnet-b"]);
    let all: Vec<String> = graph.transitive_dependents("subnet-b").into_iter().collect();
    assert_eq!(all, vec!["db", "web"]);
}

#[test]
fn test_cycle_names_every_member() {
    let resources = vec![
        Resource::new("a", "t").with_property("x", "${ref.b.id}"),
        Resource::new("b", "t").with_property("x", "${ref.c.id}"),
        Resource::new("c", "t").with_dependency("a"),
        Resource::new("d", "t"),
    ];
    match ResourceGraph::build(resources) {
        Err(EngineError::Cycle { members }) => assert_eq!(members, vec!["a", "b", "c"]),
        other => panic!("expected a cycle, got {:?}", other.map(|g| g.len())),
    }
}

#[test]
fn test_self_reference_is_a_cycle() {
    let resources = vec![Resource::new("sg", "security-group").with_property("source", "${ref.sg.id}")];
    let err = ResourceGraph::build(resources).unwrap_err();
    assert!(matches!(err, EngineError::Cycle { ref members } if members == &vec!["sg".to_string()]));
    assert_eq!(err.to_string(), "dependency cycle detected: sg -> sg");
}

#[test]
fn test_unresolved_reference_names_both_sides() {
    let resources = vec![Resource::new("vm", "compute-instance").with_property("subnet", "${ref.missing.id}")];
    match ResourceGraph::build(resources) {
        Err(EngineError::UnresolvedReference { resource, target }) => {
            assert_eq!(resource, "vm");
            assert_eq!(target, "missing");
        }
        other => panic!("expected unresolved reference, got {:?}", other.map(|g| g.len())),
    }
}

#[test]
fn test_unresolved_explicit_dependency() {
    let resources = vec![Resource::new("vm", "compute-instance").with_dependency("ghost")];
    assert!(matches!(
        ResourceGraph::build(resources),
        Err(EngineError::UnresolvedReference { .. })
    ));
}

#[test]
fn test_duplicate_ids_rejected() {
    let resources = vec![Resource::new("vpc", "network"), Resource::new("vpc", "network")];
    assert!(matches!(
        ResourceGraph::build(resources),
        Err(EngineError::DuplicateResource(ref id)) if id == "vpc"
    ));
}

#[test]
fn test_dot_output() {
    let graph = ResourceGraph::build(web_stack()).unwrap();
    let dot = to_dot(&graph, "web");
    assert!(dot.starts_with("digraph \"web\" {"));
    assert!(dot.contains("\"vpc\" [label=\"vpc\\nnetwork\"];"));
    assert!(dot.contains("\"sg\" -> \"web\" [style=solid];"));
    assert!(dot.contains("\"vpc\" -> \"sg\" [style=dashed];"));
    assert!(dot.ends_with('}'));
}
