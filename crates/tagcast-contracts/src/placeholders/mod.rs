mod resolver;
mod tiers;

pub use resolver::{PlaceholderResolver, ResolveRequest, Resolution};
pub use tiers::{Tier, TIERS};
