pub mod resolver;
pub mod resource_graph;
pub mod visualizer;
pub mod walker;
