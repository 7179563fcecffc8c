//! 轨迹：记录每次编排运行中的决策与能力调用

mod recorder;
mod sink;

pub use recorder::{
    Action, ReasoningStep, ToolOutcome, ToolStep, Trace, TraceEntry, TraceRecorder, TraceStatus,
};
pub use sink::{JsonlTraceSink, MemoryTraceSink, TraceSink};
