pub mod generate;
pub mod merge;
pub mod replay;
pub mod runner;

pub use generate::{
    GenerateError, GenerationEngine, GenerationReport, GenerationSettings, PartitionReport,
    PartitionStatus,
};
pub use merge::{FieldReducer, MergeReducer};
pub use replay::{
    ChunkAssembler, ChunkDescriptor, ChunkLimits, PendingChunk, ReplayEngine, ReplayError,
    ReplayOutput, ReplayRequest, ReplaySettings, ReplayStats, ReplayWarning,
};
pub use runner::{CachePipeline, EngineSettings, PipelineError, RunOutcome, SweepReport};
