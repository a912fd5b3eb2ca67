pub mod broker;
pub mod cdc;
pub mod dead_letter;
pub mod pipeline;
pub mod sink;

pub use broker::{Broker, KafkaBroker, KafkaSettings};
pub use dead_letter::{
    DeadLetterRecord, DeadLetterSink, DeadLetterTarget, EncodedBytes, FileDeadLetter,
    KafkaDeadLetter,
};
pub use pipeline::{
    HaltedPartition, Orchestrator, PipelineConfig, PipelineState, PipelineStats, PipelineSummary,
};
pub use sink::{Applied, MemorySink, PostgresSink, SinkApplier, SinkStore};
