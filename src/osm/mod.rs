//! OSM object model and node cache

pub mod changeset;
pub mod nodecache;
pub mod objects;

pub use changeset::ChangeSet;
pub use nodecache::NodeCache;
pub use objects::{
    ChangeAction, OsmNode, OsmRelation, OsmRelationMember, OsmType, OsmWay, Tags,
};
