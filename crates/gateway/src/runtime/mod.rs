//! Generation runtime: blocks, context, tools, agents, streaming,
//! librarian scheduling and the per-request bookkeeping around them.

pub mod active;
pub mod agents;
pub mod blocks;
pub mod cancel;
pub mod context;
pub mod instructions;
pub mod librarian;
pub mod ndjson;
pub mod pipeline;
pub mod script;
pub mod tools;
