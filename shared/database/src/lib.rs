pub mod connection;
pub mod migrations;
pub mod outbox;

pub use connection::*;
pub use migrations::*;
pub use outbox::{
    enqueue, InMemoryOutboxStore, OutboxMessage, OutboxRelay, OutboxStatus, OutboxStore, PgOutboxStore,
    RelayReport,
};
