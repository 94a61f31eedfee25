pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    AggregateSeed, AggregateTotals, AlertRecord, BoardPost, CounterEntry, CounterKind,
    HourlySplit, Outcome, Participant, ParticipantSource, PlayerStats, PurgedAlert,
};
pub use self::stores::AlertStore;

pub mod error;
pub mod manager;
pub mod models;
pub mod schema_sqlite;
pub mod sqlite;
pub mod stores;
