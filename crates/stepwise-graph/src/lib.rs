//! Static graph model and inspection for agent workflows.
//!
//! A workflow is a directed graph of [`Node`]s connected by [`Edge`]s. The
//! graph may contain cycles (retry edges). Everything in this crate is a
//! read-only view over a [`GraphModel`]: structural rendering, connectivity,
//! path enumeration, node inspection, and the log of routing decisions a
//! run actually took.

pub mod context;
pub mod edge;
pub mod inspector;
pub mod model;
pub mod node;
pub mod routes;
pub mod visualizer;

pub use context::ExecutionContext;
pub use edge::{evaluate_condition, Edge, EdgeTrigger};
pub use inspector::{KeyInspection, KeyStatus, NodeDetails, NodeExecutionInfo, NodeInspector};
pub use model::{GraphDefinition, GraphModel};
pub use node::Node;
pub use routes::{EdgeRouteVisualizer, EdgeUsageStats, RoutingDecision};
pub use visualizer::{Connectivity, GraphVisualizer, PathWalk};
