//! Construction of the variable-length attention invocations.
//!
//! The fused kernels themselves are an external collaborator; this module
//! only decides which entry-point variant a step's metadata selects and
//! bundles the index tensors it needs. Prompts whose K/V are fully in-batch
//! take the no-cache variant; everything else reads the cache through block
//! tables (legacy) or per-slot batch indices (VMM). Decode uses the fast
//! single-query path whenever every decode query length is exactly 1.

use candle_core::Tensor;

use crate::config::{AttentionKind, CacheConfig};
use crate::error::{precondition, CacheError, Result};
use crate::metadata::{CacheAddressing, EncoderMetadata, StepMetadata};

/// How a cached-attention call addresses the cache.
#[derive(Debug)]
pub enum DecodeCacheArg<'a> {
    /// Legacy: per-sequence block tables into the pooled cache.
    BlockTables(&'a Tensor),
    /// VMM: per-sequence slot ids; the kernel reads the cache spaces
    /// truncated to `used_seq_len` token rows.
    CacheBatchIdx {
        idx: &'a Tensor,
        used_seq_len: usize,
    },
}

/// One planned kernel invocation. Q/K/V and the output buffer are supplied
/// by the model runner at launch time.
#[derive(Debug)]
pub enum AttentionCall<'a> {
    /// No-cache variant: K and V come straight from the batch.
    Varlen {
        cu_seqlens_q: &'a Tensor,
        cu_seqlens_k: &'a Tensor,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        causal: bool,
    },
    /// Variable-length attention over the cache (prefix-cache hits, chunked
    /// prefill, speculative decode).
    VarlenCached {
        block_tables: &'a Tensor,
        cu_seqlens_q: &'a Tensor,
        seqused_k: &'a Tensor,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        causal: bool,
    },
    /// One query per sequence against the cache.
    SingleQuery {
        cache: DecodeCacheArg<'a>,
        cache_seqlens: &'a Tensor,
        max_seqlen_k: usize,
        causal: bool,
    },
}

/// Chooses kernel variants for a fixed engine configuration.
pub struct AttentionPlanner {
    kind: AttentionKind,
    quantized: bool,
}

impl AttentionPlanner {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            kind: config.attn_type,
            quantized: config.cache_dtype.is_quantized(),
        }
    }

    /// Whether q/k/v descales must accompany every cached call. Quantized
    /// caches with kernels that cannot accept descales are already rejected
    /// at construction.
    pub fn descale_required(&self) -> bool {
        self.quantized
    }

    fn encoder<'a>(&self, meta: &'a StepMetadata) -> Result<&'a EncoderMetadata> {
        meta.encoder.as_ref().ok_or_else(|| {
            CacheError::PreconditionViolated(
                "encoder attention requires the encoder metadata to be set".to_string(),
            )
        })
    }

    fn cross_tables<'a>(&self, meta: &'a StepMetadata) -> Result<&'a Tensor> {
        self.encoder(meta)?
            .cross_block_tables
            .as_ref()
            .ok_or_else(|| {
                CacheError::PreconditionViolated(
                    "cross-attention requires the cross block tables to be set".to_string(),
                )
            })
    }

    /// Plans the prompt-side invocation for a prefill view.
    pub fn plan_prefill<'a>(&self, meta: &'a StepMetadata) -> Result<AttentionCall<'a>> {
        precondition!(meta.num_prefills > 0, "prefill plan over a decode-only step");

        if let CacheAddressing::Blocks {
            block_tables: Some(block_tables),
            ..
        } = &meta.addressing
        {
            if block_tables.elem_count() > 0 {
                // Prefix-enabled attention reads already-cached context.
                precondition!(
                    matches!(self.kind, AttentionKind::Decoder),
                    "only decoder models support prefix caching"
                );
                let max_seqlen_k = meta.seq_lens.iter().copied().max().unwrap_or(0);
                return Ok(AttentionCall::VarlenCached {
                    block_tables,
                    cu_seqlens_q: &meta.query_start_loc,
                    seqused_k: &meta.seq_lens_tensor,
                    max_seqlen_q: meta.max_query_len,
                    max_seqlen_k,
                    causal: true,
                });
            }
        }

        // Q and K cover the same in-batch prompt tokens.
        let (cu_seqlens_q, max_seqlen_q, cu_seqlens_k, max_seqlen_k) = match self.kind {
            AttentionKind::Decoder | AttentionKind::EncoderOnly => (
                &meta.seq_start_loc,
                meta.max_prefill_seq_len,
                &meta.seq_start_loc,
                meta.max_prefill_seq_len,
            ),
            AttentionKind::EncoderDecoder => {
                let encoder = self.encoder(meta)?;
                (
                    &meta.seq_start_loc,
                    meta.max_prefill_seq_len,
                    &encoder.seq_start_loc,
                    encoder.max_seq_len,
                )
            }
            AttentionKind::Encoder => {
                let encoder = self.encoder(meta)?;
                (
                    &encoder.seq_start_loc,
                    encoder.max_seq_len,
                    &encoder.seq_start_loc,
                    encoder.max_seq_len,
                )
            }
        };
        Ok(AttentionCall::Varlen {
            cu_seqlens_q,
            cu_seqlens_k,
            max_seqlen_q,
            max_seqlen_k,
            causal: self.kind.is_causal(),
        })
    }

    /// Plans the continuation-side invocation for a decode view.
    pub fn plan_decode<'a>(&self, meta: &'a StepMetadata) -> Result<AttentionCall<'a>> {
        precondition!(
            meta.num_decode_tokens > 0,
            "decode plan over a prefill-only step"
        );
        precondition!(
            matches!(
                self.kind,
                AttentionKind::Decoder | AttentionKind::EncoderDecoder
            ),
            "encoder-only models do not decode"
        );

        if meta.max_decode_query_len > 1 {
            // Speculative decoding: queries of different lengths need the
            // variable-length kernel.
            precondition!(
                matches!(self.kind, AttentionKind::Decoder),
                "only decoder models support speculative decoding"
            );
            let CacheAddressing::Blocks {
                block_tables: Some(block_tables),
                ..
            } = &meta.addressing
            else {
                return Err(CacheError::UnsupportedFeature(
                    "speculative decoding requires the block-addressed cache".to_string(),
                ));
            };
            return Ok(AttentionCall::VarlenCached {
                block_tables,
                cu_seqlens_q: &meta.query_start_loc,
                seqused_k: &meta.seq_lens_tensor,
                max_seqlen_q: meta.max_decode_query_len,
                max_seqlen_k: meta.max_decode_seq_len,
                causal: true,
            });
        }

        let (cache, cache_seqlens, max_seqlen_k) = match self.kind {
            AttentionKind::EncoderDecoder => {
                let encoder = self.encoder(meta)?;
                (
                    DecodeCacheArg::BlockTables(self.cross_tables(meta)?),
                    &encoder.seq_lens_tensor,
                    encoder.max_seq_len,
                )
            }
            _ => match &meta.addressing {
                CacheAddressing::Blocks {
                    block_tables: Some(block_tables),
                    ..
                } => (
                    DecodeCacheArg::BlockTables(block_tables),
                    &meta.seq_lens_tensor,
                    meta.max_decode_seq_len,
                ),
                CacheAddressing::Blocks {
                    block_tables: None, ..
                } => {
                    return Err(CacheError::PreconditionViolated(
                        "decode step without block tables".to_string(),
                    ))
                }
                CacheAddressing::Slots {
                    cache_batch_idx, ..
                } => (
                    DecodeCacheArg::CacheBatchIdx {
                        idx: cache_batch_idx,
                        used_seq_len: meta.max_decode_seq_len,
                    },
                    &meta.seq_lens_tensor,
                    meta.max_decode_seq_len,
                ),
            },
        };
        Ok(AttentionCall::SingleQuery {
            cache,
            cache_seqlens,
            max_seqlen_k,
            causal: true,
        })
    }
}
