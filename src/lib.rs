//! Virtual-memory-backed KV cache management for paged attention inference.
//!
//! The crate covers the memory side of a single-device inference engine
//! serving many concurrent sequences:
//!
//! * a page allocator that reserves one large virtual range per cache tensor
//!   (keys and values) and backs it lazily with physical pages as sequences
//!   grow ([`vmm`], [`slots`]),
//! * a per-step metadata assembler turning scheduler output into the index
//!   tensors consumed by variable-length attention kernels ([`metadata`]),
//! * the bridge that scatters freshly computed K/V rows into the cache
//!   ([`write`]) and the in-place step advancer used between kernel graph
//!   replays ([`advance`]).
//!
//! Attention math, scheduling policy and model execution live outside this
//! crate; [`attention`] only constructs the kernel invocations.

pub mod advance;
pub mod attention;
pub mod config;
pub mod engine;
pub mod error;
#[cfg(feature = "cuda")]
pub mod kernels;
pub mod layout;
pub mod metadata;
pub mod slots;
pub mod vmm;
pub mod write;

pub use attention::{AttentionCall, AttentionPlanner, DecodeCacheArg};
pub use config::{AttentionKind, CacheConfig, CacheDType};
pub use engine::{Admission, CacheEngine, CacheView};
pub use error::{CacheError, Result};
pub use layout::CacheLayout;
pub use metadata::{
    CacheAddressing, Capture, EncoderMetadata, GraphBlockTables, RequestAddressing,
    RequestDescriptor, StepMetadata, StepMetadataBuilder, PAD_SLOT_ID,
};
pub use slots::SlotTable;
pub use vmm::{HostPageAllocator, PageAllocator, Reservation};
