mod html;
mod node;
mod splice;
mod stripper;

pub use node::{Element, NodeData, NodeId, PositionMarker, RenderTree};
pub use splice::{splice, Boundary};
pub use stripper::{StripReport, TreeRangeStripper};
