/// CDC envelope handling
///
/// Turns Debezium messages consumed from Kafka into sink mutations.
///
/// # Architecture
/// - **Models**: raw messages, normalized change events, mutations
/// - **Decoder**: JSON envelope parsing (wrapped, unwrapped, schema-wrapped)
/// - **Classifier**: operation to upsert/delete mapping and primary-key projection
pub mod classifier;
pub mod decoder;
pub mod models;

pub use classifier::{classify, project_key, table_name_for_topic, TableResolver};
pub use decoder::decode;
pub use models::{
    ChangeEvent, Mutation, MutationKind, Operation, PartitionId, RawMessage, RowImage, TableTarget,
};
