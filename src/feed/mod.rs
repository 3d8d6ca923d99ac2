pub mod builder;
pub mod store;

pub use builder::{build_feed, FeatureKind, ResolvedFeature};
pub use store::{FeedStore, PriceField};
