//! Strongly typed identifiers.
//!
//! Every id is a plain integer newtype. Collections keyed by these ids are
//! `BTreeMap`/`BTreeSet` so iteration order is always sorted and identical
//! across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// A single unit on the map.
    UnitId(u32),
    "u"
);
id_type!(
    /// A land territory or sea zone.
    TerritoryId(u32),
    "t"
);
id_type!(
    /// A player (nation).
    PlayerId(u32),
    "p"
);
id_type!(
    /// One battle instance, unique for the whole game.
    BattleId(u64),
    "b"
);
id_type!(
    /// Index into the unit type registry.
    UnitTypeId(u16),
    "type"
);
