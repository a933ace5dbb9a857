//! Per-step attention metadata and its assembler.
//!
//! The scheduler hands over one descriptor per request; the builder turns
//! them into the device-resident index tensors and host scalars the cache
//! write and attention kernels consume for the upcoming step.
//!
//! Definition of the three lengths, per request:
//!
//! ```text
//! |---------- N-1 iteration --------|
//! |---------------- N iteration ---------------------|
//! |- tokenA -|......................|-- newTokens ---|
//! |---------- context_len ----------|
//! |-------------------- seq_len ---------------------|
//!                                   |-- query_len ---|
//! ```
//!
//! Prefill requests come first in the flattened token dimension.

use candle_core::{Device, Tensor};

use crate::error::{precondition, CacheError, Result};

/// Sentinel for slot-mapping entries that must not be written (sliding
/// window mask, graph padding, profile runs).
pub const PAD_SLOT_ID: i64 = -1;

/// How one request addresses its cache storage.
#[derive(Debug, Clone)]
pub enum RequestAddressing {
    /// VMM mode: the sequence slot owning a contiguous cache sub-range.
    Slot(usize),
    /// Legacy mode: ordered physical block ids for this sequence.
    Blocks(Vec<u32>),
}

/// One scheduled request's share of the upcoming step.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub is_prompt: bool,
    /// Context already present plus new tokens this step.
    pub seq_len: usize,
    /// New tokens this step.
    pub query_len: usize,
    pub sliding_window: Option<usize>,
    pub prefix_cache_hit: bool,
    pub addressing: RequestAddressing,
}

impl RequestDescriptor {
    pub fn context_len(&self) -> usize {
        self.seq_len - self.query_len
    }
}

/// Cache addressing for a whole step; the metadata carries exactly one
/// variant and the write/attention paths match on it.
#[derive(Debug, Clone)]
pub enum CacheAddressing {
    /// Legacy pooled cache: flat cell index per new token, padded block
    /// tables per request. `block_tables` is `None` when every row is empty
    /// (fresh prompts with no prefix hit), selecting the kernels' no-cache
    /// variant.
    Blocks {
        block_tables: Option<Tensor>,
        slot_mapping: Tensor,
    },
    /// VMM cache spaces: per-request slot id plus the `(slot, token)`
    /// coordinates at which each new K/V row is written.
    Slots {
        cache_batch_idx: Tensor,
        row_mapping: Tensor,
        col_mapping: Tensor,
    },
}

impl CacheAddressing {
    pub fn is_slot_addressed(&self) -> bool {
        matches!(self, Self::Slots { .. })
    }
}

/// Encoder / cross-attention metadata, produced by a separate assembler
/// path. The decoder core never inspects it.
#[derive(Debug, Clone)]
pub struct EncoderMetadata {
    pub seq_lens: Vec<usize>,
    pub seq_lens_tensor: Tensor,
    pub seq_start_loc: Tensor,
    pub max_seq_len: usize,
    pub cross_slot_mapping: Option<Tensor>,
    pub cross_block_tables: Option<Tensor>,
}

impl EncoderMetadata {
    pub fn build(
        seq_lens: Vec<usize>,
        cross_slot_mapping: Option<Tensor>,
        cross_block_tables: Option<Tensor>,
        device: &Device,
    ) -> Result<Self> {
        precondition!(!seq_lens.is_empty(), "encoder metadata without sequences");
        let max_seq_len = seq_lens.iter().copied().max().unwrap_or(0);
        let lens_u32: Vec<u32> = seq_lens.iter().map(|&l| l as u32).collect();
        let start_loc = cumulative(&seq_lens);
        Ok(Self {
            seq_lens_tensor: Tensor::from_vec(lens_u32, seq_lens.len(), device)?,
            seq_start_loc: Tensor::from_vec(start_loc.clone(), start_loc.len(), device)?,
            seq_lens,
            max_seq_len,
            cross_slot_mapping,
            cross_block_tables,
        })
    }
}

/// Everything the cache-write bridge and the attention kernels need for one
/// step.
///
/// Host-side scalars are plain fields; anything a captured kernel graph
/// reads lives in a tensor so replays observe in-place updates.
#[derive(Debug)]
pub struct StepMetadata {
    pub num_prefills: usize,
    pub num_prefill_tokens: usize,
    pub num_decode_tokens: usize,
    /// Per-request sequence lengths; padded rows carry 1 under graph
    /// capture.
    pub seq_lens: Vec<usize>,
    /// Host mirror of `query_start_loc`, kept for view rebasing and step
    /// advancing.
    pub query_start_loc_host: Vec<u32>,
    pub max_query_len: usize,
    /// Largest decode query length; 1 when the batch has no decodes, above
    /// 1 only under speculative decoding.
    pub max_decode_query_len: usize,
    pub max_prefill_seq_len: usize,
    pub max_decode_seq_len: usize,
    pub query_start_loc: Tensor,
    pub seq_start_loc: Tensor,
    pub seq_lens_tensor: Tensor,
    pub context_lens_tensor: Option<Tensor>,
    pub addressing: CacheAddressing,
    pub use_cuda_graph: bool,
    pub encoder: Option<EncoderMetadata>,
    cached_prefill: Option<Box<StepMetadata>>,
    cached_decode: Option<Box<StepMetadata>>,
}

impl StepMetadata {
    pub fn num_requests(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.num_prefill_tokens + self.num_decode_tokens
    }

    /// Drops the memoized sub-views; called before any in-place mutation.
    pub fn invalidate_views(&mut self) {
        self.cached_prefill = None;
        self.cached_decode = None;
    }

    /// The prefill slice of this step, memoized on first access. `None`
    /// when the step carries no prefills.
    pub fn prefill_view(&mut self) -> Result<Option<&StepMetadata>> {
        if self.num_prefills == 0 {
            return Ok(None);
        }
        if self.cached_prefill.is_none() {
            let view = self.build_prefill_view()?;
            self.cached_prefill = Some(Box::new(view));
        }
        Ok(self.cached_prefill.as_deref())
    }

    /// The decode slice, with `query_start_loc` rebased so decode indices
    /// start at 0. `None` when the step carries no decode tokens.
    pub fn decode_view(&mut self) -> Result<Option<&StepMetadata>> {
        if self.num_decode_tokens == 0 {
            return Ok(None);
        }
        if self.cached_decode.is_none() {
            let view = self.build_decode_view()?;
            self.cached_decode = Some(Box::new(view));
        }
        Ok(self.cached_decode.as_deref())
    }

    fn build_prefill_view(&self) -> Result<StepMetadata> {
        let np = self.num_prefills;
        let npt = self.num_prefill_tokens;
        let addressing = match &self.addressing {
            CacheAddressing::Blocks {
                block_tables,
                slot_mapping,
            } => CacheAddressing::Blocks {
                block_tables: block_tables
                    .as_ref()
                    .map(|bt| bt.narrow(0, 0, np))
                    .transpose()?,
                slot_mapping: slot_mapping.narrow(0, 0, npt)?,
            },
            CacheAddressing::Slots {
                cache_batch_idx,
                row_mapping,
                col_mapping,
            } => CacheAddressing::Slots {
                cache_batch_idx: cache_batch_idx.narrow(0, 0, np)?,
                row_mapping: row_mapping.narrow(0, 0, npt)?,
                col_mapping: col_mapping.narrow(0, 0, npt)?,
            },
        };
        Ok(StepMetadata {
            num_prefills: np,
            num_prefill_tokens: npt,
            num_decode_tokens: 0,
            seq_lens: self.seq_lens[..np].to_vec(),
            query_start_loc_host: self.query_start_loc_host[..np + 1].to_vec(),
            max_query_len: self.max_query_len,
            max_decode_query_len: 0,
            max_prefill_seq_len: self.max_prefill_seq_len,
            max_decode_seq_len: 0,
            query_start_loc: self.query_start_loc.narrow(0, 0, np + 1)?,
            seq_start_loc: self.seq_start_loc.narrow(0, 0, np + 1)?,
            seq_lens_tensor: self.seq_lens_tensor.narrow(0, 0, np)?,
            context_lens_tensor: self
                .context_lens_tensor
                .as_ref()
                .map(|t| t.narrow(0, 0, np))
                .transpose()?,
            addressing,
            use_cuda_graph: false,
            encoder: self.encoder.clone(),
            cached_prefill: None,
            cached_decode: None,
        })
    }

    fn build_decode_view(&self) -> Result<StepMetadata> {
        let np = self.num_prefills;
        let npt = self.num_prefill_tokens;
        let num_seqs = self.seq_lens_tensor.dim(0)?;
        let decode_seqs = num_seqs - np;

        // The batch is laid out prefills|decodes; rebase the cumulative
        // query offsets so decode indices start at 0. E.g. with tokens
        // [3 prefill | 6 decode], query_start_loc [0,3,9] becomes [0,6].
        let base = self.query_start_loc_host[np];
        let rebased: Vec<u32> = self.query_start_loc_host[np..]
            .iter()
            .map(|&v| v - base)
            .collect();
        let query_start_loc =
            Tensor::from_vec(rebased.clone(), rebased.len(), self.query_start_loc.device())?;

        let addressing = match &self.addressing {
            CacheAddressing::Blocks {
                block_tables,
                slot_mapping,
            } => {
                let total = slot_mapping.dim(0)?;
                CacheAddressing::Blocks {
                    block_tables: block_tables
                        .as_ref()
                        .map(|bt| bt.narrow(0, np, bt.dim(0)? - np))
                        .transpose()?,
                    slot_mapping: slot_mapping.narrow(0, npt, total - npt)?,
                }
            }
            CacheAddressing::Slots {
                cache_batch_idx,
                row_mapping,
                col_mapping,
            } => {
                let total = row_mapping.dim(0)?;
                CacheAddressing::Slots {
                    cache_batch_idx: cache_batch_idx.narrow(0, np, decode_seqs)?,
                    row_mapping: row_mapping.narrow(0, npt, total - npt)?,
                    col_mapping: col_mapping.narrow(0, npt, total - npt)?,
                }
            }
        };
        // Graphs only replay over the block-addressed cache.
        let use_cuda_graph = self.use_cuda_graph && !addressing.is_slot_addressed();
        Ok(StepMetadata {
            num_prefills: 0,
            num_prefill_tokens: 0,
            num_decode_tokens: self.num_decode_tokens,
            seq_lens: self.seq_lens[np..].to_vec(),
            query_start_loc_host: rebased,
            max_query_len: self.max_query_len,
            max_decode_query_len: self.max_decode_query_len,
            max_prefill_seq_len: 0,
            max_decode_seq_len: self.max_decode_seq_len,
            query_start_loc,
            seq_start_loc: self.seq_start_loc.narrow(0, np, num_seqs + 1 - np)?,
            seq_lens_tensor: self.seq_lens_tensor.narrow(0, np, decode_seqs)?,
            context_lens_tensor: None,
            addressing,
            use_cuda_graph,
            encoder: self.encoder.clone(),
            cached_prefill: None,
            cached_decode: None,
        })
    }
}

fn cumulative(lens: &[usize]) -> Vec<u32> {
    let mut out = Vec::with_capacity(lens.len() + 1);
    let mut acc = 0u32;
    out.push(0);
    for &len in lens {
        acc += len as u32;
        out.push(acc);
    }
    out
}

/// Pre-allocated `[max_batch, max_blocks]` block-table buffer reused across
/// captured decode steps so replays keep a stable shape.
pub struct GraphBlockTables {
    data: Vec<u32>,
    max_batch: usize,
    max_blocks: usize,
}

impl GraphBlockTables {
    pub fn new(max_batch: usize, max_blocks: usize) -> Self {
        Self {
            data: vec![0; max_batch * max_blocks],
            max_batch,
            max_blocks,
        }
    }

    /// Copies the step's block tables into the first `num_rows` rows,
    /// truncating rows that exceed the buffer width. Extra lookahead blocks
    /// are legal and discarded. Returns the `[num_rows, max_blocks]` tensor.
    fn fill(&mut self, rows: &[Vec<u32>], num_rows: usize, device: &Device) -> Result<Tensor> {
        precondition!(
            num_rows <= self.max_batch,
            "captured batch of {num_rows} exceeds the maximum batch size {}",
            self.max_batch
        );
        for (i, chunk) in self.data.chunks_mut(self.max_blocks).take(num_rows).enumerate() {
            chunk.fill(0);
            if let Some(row) = rows.get(i) {
                let used = row.len().min(self.max_blocks);
                chunk[..used].copy_from_slice(&row[..used]);
            }
        }
        let flat = self.data[..num_rows * self.max_blocks].to_vec();
        Ok(Tensor::from_vec(flat, (num_rows, self.max_blocks), device)?)
    }
}

/// Graph-capture context for one build: the padded batch size and, in
/// legacy mode, the engine's pre-allocated block-table buffer.
pub struct Capture<'a> {
    pub batch_size: usize,
    pub graph_block_tables: Option<&'a mut GraphBlockTables>,
}

/// Assembles one [`StepMetadata`] from the scheduler's request descriptors.
pub struct StepMetadataBuilder<'a> {
    device: &'a Device,
    block_size: usize,
    use_vmm: bool,
    chunked_prefill_enabled: bool,
    seen_decode: bool,

    seq_lens: Vec<usize>,
    query_lens: Vec<usize>,
    context_lens: Vec<u32>,
    prefill_seq_lens: Vec<usize>,
    curr_seq_lens: Vec<usize>,
    num_prefills: usize,
    num_prefill_tokens: usize,
    num_decode_tokens: usize,

    slot_mapping: Vec<i64>,
    block_tables: Vec<Vec<u32>>,
    cache_batch_idx: Vec<u32>,
    row_mapping: Vec<u32>,
    col_mapping: Vec<u32>,

    encoder: Option<EncoderMetadata>,
}

impl<'a> StepMetadataBuilder<'a> {
    pub fn new(
        device: &'a Device,
        block_size: usize,
        use_vmm: bool,
        chunked_prefill_enabled: bool,
    ) -> Self {
        Self {
            device,
            block_size,
            use_vmm,
            chunked_prefill_enabled,
            seen_decode: false,
            seq_lens: Vec::new(),
            query_lens: Vec::new(),
            context_lens: Vec::new(),
            prefill_seq_lens: Vec::new(),
            curr_seq_lens: Vec::new(),
            num_prefills: 0,
            num_prefill_tokens: 0,
            num_decode_tokens: 0,
            slot_mapping: Vec::new(),
            block_tables: Vec::new(),
            cache_batch_idx: Vec::new(),
            row_mapping: Vec::new(),
            col_mapping: Vec::new(),
            encoder: None,
        }
    }

    pub fn attach_encoder(&mut self, encoder: EncoderMetadata) {
        self.encoder = Some(encoder);
    }

    pub fn add_request(&mut self, request: &RequestDescriptor) -> Result<()> {
        precondition!(
            request.query_len > 0 && request.query_len <= request.seq_len,
            "query length {} out of range for sequence length {}",
            request.query_len,
            request.seq_len
        );
        precondition!(
            !(request.is_prompt && self.seen_decode),
            "prefill requests must precede decodes in the batch"
        );
        let context_len = request.context_len();
        self.seen_decode |= !request.is_prompt;
        self.seq_lens.push(request.seq_len);
        self.query_lens.push(request.query_len);
        self.context_lens.push(context_len as u32);
        if request.is_prompt {
            self.num_prefills += 1;
            self.num_prefill_tokens += request.query_len;
            self.prefill_seq_lens.push(request.seq_len);
        } else {
            self.num_decode_tokens += request.query_len;
            self.curr_seq_lens.push(request.seq_len);
        }

        match (&request.addressing, self.use_vmm) {
            (RequestAddressing::Slot(slot), true) => {
                self.cache_batch_idx.push(*slot as u32);
                for token in context_len..request.seq_len {
                    self.row_mapping.push(*slot as u32);
                    self.col_mapping.push(token as u32);
                }
            }
            (RequestAddressing::Blocks(blocks), false) => {
                self.add_block_addressed(request, blocks)?;
            }
            _ => {
                return Err(CacheError::PreconditionViolated(
                    "request addressing does not match the engine's cache mode".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn add_block_addressed(
        &mut self,
        request: &RequestDescriptor,
        blocks: &[u32],
    ) -> Result<()> {
        let context_len = request.context_len();

        // Block tables handed to the attention kernel. A fresh prompt with
        // no prefix hit gets an empty row, which downstream selects the
        // no-cache kernel variant.
        let attn_row = if request.prefix_cache_hit
            || self.chunked_prefill_enabled
            || !request.is_prompt
        {
            blocks.to_vec()
        } else {
            Vec::new()
        };
        self.block_tables.push(attn_row);

        if blocks.is_empty() {
            precondition!(
                request.is_prompt,
                "decode request without an allocated block table"
            );
            // Profile run: nothing is written.
            self.slot_mapping
                .extend(std::iter::repeat(PAD_SLOT_ID).take(request.query_len));
            return Ok(());
        }

        precondition!(
            (request.seq_len - 1) / self.block_size < blocks.len(),
            "block table with {} entries cannot cover {} tokens",
            blocks.len(),
            request.seq_len
        );

        // Tokens below the sliding-window start are masked out of the
        // cache write.
        let start_idx = if request.is_prompt {
            request
                .sliding_window
                .map(|window| request.query_len.saturating_sub(window))
                .unwrap_or(0)
        } else {
            0
        };
        let masked = start_idx.saturating_sub(context_len);
        self.slot_mapping
            .extend(std::iter::repeat(PAD_SLOT_ID).take(masked));
        for token in context_len.max(start_idx)..request.seq_len {
            let block = blocks[token / self.block_size] as i64;
            self.slot_mapping
                .push(block * self.block_size as i64 + (token % self.block_size) as i64);
        }
        Ok(())
    }

    /// Finishes the step. Returns `None` for an empty batch: the whole step
    /// is a no-op.
    pub fn build(mut self, capture: Option<Capture<'_>>) -> Result<Option<StepMetadata>> {
        if self.seq_lens.is_empty() {
            return Ok(None);
        }
        let max_query_len = self.query_lens.iter().copied().max().unwrap_or(0);
        precondition!(max_query_len > 0, "query lengths must be positive");
        let max_decode_query_len = self.query_lens[self.num_prefills..]
            .iter()
            .copied()
            .max()
            .unwrap_or(1);
        let max_prefill_seq_len = self.prefill_seq_lens.iter().copied().max().unwrap_or(0);
        let max_decode_seq_len = self.curr_seq_lens.iter().copied().max().unwrap_or(0);
        let mut num_decode_tokens = self.num_decode_tokens;
        let use_cuda_graph = capture.is_some();
        let device = self.device;

        let addressing = if self.use_vmm {
            let num_tokens = self.row_mapping.len();
            CacheAddressing::Slots {
                cache_batch_idx: Tensor::from_vec(
                    std::mem::take(&mut self.cache_batch_idx),
                    self.seq_lens.len(),
                    device,
                )?,
                row_mapping: Tensor::from_vec(
                    std::mem::take(&mut self.row_mapping),
                    num_tokens,
                    device,
                )?,
                col_mapping: Tensor::from_vec(
                    std::mem::take(&mut self.col_mapping),
                    num_tokens,
                    device,
                )?,
            }
        } else {
            let block_tables = if let Some(capture) = capture {
                let num_seqs = self.seq_lens.len();
                precondition!(
                    capture.batch_size >= num_seqs,
                    "captured batch size {} below the {num_seqs} scheduled requests",
                    capture.batch_size
                );
                let graph_tables = capture.graph_block_tables.ok_or_else(|| {
                    CacheError::PreconditionViolated(
                        "graph capture in legacy mode requires the block-table buffer"
                            .to_string(),
                    )
                })?;
                // Pad to the captured shape: sentinel slots, dummy unit
                // sequences, and the decode-token count the graph expects.
                let pad = capture.batch_size - num_seqs;
                self.slot_mapping
                    .extend(std::iter::repeat(PAD_SLOT_ID).take(pad));
                self.seq_lens.extend(std::iter::repeat(1).take(pad));
                num_decode_tokens = capture.batch_size - self.num_prefill_tokens;
                Some(graph_tables.fill(&self.block_tables, capture.batch_size, device)?)
            } else if self.block_tables.iter().all(|row| row.is_empty()) {
                None
            } else {
                Some(padded_block_tables(&self.block_tables, device)?)
            };
            let num_tokens = self.slot_mapping.len();
            CacheAddressing::Blocks {
                block_tables,
                slot_mapping: Tensor::from_vec(
                    std::mem::take(&mut self.slot_mapping),
                    num_tokens,
                    device,
                )?,
            }
        };

        let query_start_loc_host = cumulative(&self.query_lens);
        let seq_start_loc_host = cumulative(&self.seq_lens);
        let seq_lens_u32: Vec<u32> = self.seq_lens.iter().map(|&l| l as u32).collect();

        Ok(Some(StepMetadata {
            num_prefills: self.num_prefills,
            num_prefill_tokens: self.num_prefill_tokens,
            num_decode_tokens,
            max_query_len,
            max_decode_query_len,
            max_prefill_seq_len,
            max_decode_seq_len,
            query_start_loc: Tensor::from_vec(
                query_start_loc_host.clone(),
                query_start_loc_host.len(),
                device,
            )?,
            seq_start_loc: Tensor::from_vec(
                seq_start_loc_host.clone(),
                seq_start_loc_host.len(),
                device,
            )?,
            seq_lens_tensor: Tensor::from_vec(seq_lens_u32, self.seq_lens.len(), device)?,
            context_lens_tensor: Some(Tensor::from_vec(
                self.context_lens.clone(),
                self.context_lens.len(),
                device,
            )?),
            seq_lens: self.seq_lens,
            query_start_loc_host,
            addressing,
            use_cuda_graph,
            encoder: self.encoder,
            cached_prefill: None,
            cached_decode: None,
        }))
    }
}

fn padded_block_tables(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(rows.len() * width);
    for row in rows {
        flat.extend_from_slice(row);
        flat.extend(std::iter::repeat(0).take(width - row.len()));
    }
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(seq_len: usize, addressing: RequestAddressing) -> RequestDescriptor {
        RequestDescriptor {
            is_prompt: true,
            seq_len,
            query_len: seq_len,
            sliding_window: None,
            prefix_cache_hit: false,
            addressing,
        }
    }

    fn decode(seq_len: usize, addressing: RequestAddressing) -> RequestDescriptor {
        RequestDescriptor {
            is_prompt: false,
            seq_len,
            query_len: 1,
            sliding_window: None,
            prefix_cache_hit: false,
            addressing,
        }
    }

    fn build_vmm(requests: &[RequestDescriptor]) -> StepMetadata {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, true, false);
        for request in requests {
            builder.add_request(request).unwrap();
        }
        builder.build(None).unwrap().unwrap()
    }

    #[test]
    fn empty_batch_builds_nothing() {
        let device = Device::Cpu;
        let builder = StepMetadataBuilder::new(&device, 16, true, false);
        assert!(builder.build(None).unwrap().is_none());
    }

    #[test]
    fn single_prompt_slot_addressed() {
        let meta = build_vmm(&[prompt(5, RequestAddressing::Slot(0))]);
        assert_eq!(meta.num_prefills, 1);
        assert_eq!(meta.num_prefill_tokens, 5);
        assert_eq!(meta.num_decode_tokens, 0);
        assert_eq!(meta.max_query_len, 5);
        assert_eq!(meta.max_decode_query_len, 1);
        assert_eq!(meta.max_prefill_seq_len, 5);
        assert_eq!(meta.max_decode_seq_len, 0);
        assert_eq!(
            meta.query_start_loc.to_vec1::<u32>().unwrap(),
            vec![0, 5]
        );
        assert_eq!(meta.seq_start_loc.to_vec1::<u32>().unwrap(), vec![0, 5]);
        match &meta.addressing {
            CacheAddressing::Slots {
                cache_batch_idx,
                row_mapping,
                col_mapping,
            } => {
                assert_eq!(cache_batch_idx.to_vec1::<u32>().unwrap(), vec![0]);
                assert_eq!(
                    row_mapping.to_vec1::<u32>().unwrap(),
                    vec![0, 0, 0, 0, 0]
                );
                assert_eq!(
                    col_mapping.to_vec1::<u32>().unwrap(),
                    vec![0, 1, 2, 3, 4]
                );
            }
            CacheAddressing::Blocks { .. } => panic!("expected slot addressing"),
        }
    }

    #[test]
    fn mixed_batch_accounting_and_decode_rebase() {
        let mut meta = build_vmm(&[
            prompt(4, RequestAddressing::Slot(0)),
            decode(10, RequestAddressing::Slot(1)),
            decode(7, RequestAddressing::Slot(2)),
        ]);
        assert_eq!(meta.num_prefills, 1);
        assert_eq!(meta.num_prefill_tokens, 4);
        assert_eq!(meta.num_decode_tokens, 2);
        assert_eq!(
            meta.query_start_loc.to_vec1::<u32>().unwrap(),
            vec![0, 4, 5, 6]
        );
        assert_eq!(
            meta.seq_start_loc.to_vec1::<u32>().unwrap(),
            vec![0, 4, 14, 21]
        );
        assert_eq!(meta.max_prefill_seq_len, 4);
        assert_eq!(meta.max_decode_seq_len, 10);
        assert_eq!(meta.max_query_len, 4);
        assert_eq!(meta.max_decode_query_len, 1);

        let decode_view = meta.decode_view().unwrap().unwrap();
        assert_eq!(
            decode_view.query_start_loc.to_vec1::<u32>().unwrap(),
            vec![0, 1, 2]
        );
        assert_eq!(decode_view.num_decode_tokens, 2);
        assert_eq!(decode_view.num_prefills, 0);
        assert_eq!(decode_view.max_prefill_seq_len, 0);
        assert_eq!(
            decode_view.seq_lens_tensor.to_vec1::<u32>().unwrap(),
            vec![10, 7]
        );
        match &decode_view.addressing {
            CacheAddressing::Slots {
                cache_batch_idx,
                row_mapping,
                col_mapping,
            } => {
                assert_eq!(cache_batch_idx.to_vec1::<u32>().unwrap(), vec![1, 2]);
                assert_eq!(row_mapping.to_vec1::<u32>().unwrap(), vec![1, 2]);
                assert_eq!(col_mapping.to_vec1::<u32>().unwrap(), vec![9, 6]);
            }
            CacheAddressing::Blocks { .. } => panic!("expected slot addressing"),
        }

        let prefill_view = meta.prefill_view().unwrap().unwrap();
        assert_eq!(prefill_view.num_prefills, 1);
        assert_eq!(prefill_view.num_decode_tokens, 0);
        assert_eq!(prefill_view.max_decode_seq_len, 0);
        assert!(!prefill_view.use_cuda_graph);
        assert_eq!(
            prefill_view.query_start_loc.to_vec1::<u32>().unwrap(),
            vec![0, 4]
        );
    }

    #[test]
    fn views_are_memoized() {
        let mut meta = build_vmm(&[
            prompt(4, RequestAddressing::Slot(0)),
            decode(10, RequestAddressing::Slot(1)),
        ]);
        let first = meta.decode_view().unwrap().unwrap() as *const StepMetadata;
        let second = meta.decode_view().unwrap().unwrap() as *const StepMetadata;
        assert_eq!(first, second);
    }

    #[test]
    fn cumulative_offsets_match_lengths() {
        let meta = build_vmm(&[
            prompt(3, RequestAddressing::Slot(0)),
            prompt(6, RequestAddressing::Slot(1)),
            decode(9, RequestAddressing::Slot(2)),
        ]);
        let query_lens = [3usize, 6, 1];
        let qsl = meta.query_start_loc.to_vec1::<u32>().unwrap();
        let ssl = meta.seq_start_loc.to_vec1::<u32>().unwrap();
        for (i, &qlen) in query_lens.iter().enumerate() {
            assert_eq!((qsl[i + 1] - qsl[i]) as usize, qlen);
            assert_eq!((ssl[i + 1] - ssl[i]) as usize, meta.seq_lens[i]);
        }
        // Token accounting: one mapping entry per new token.
        match &meta.addressing {
            CacheAddressing::Slots {
                row_mapping,
                col_mapping,
                ..
            } => {
                assert_eq!(row_mapping.dim(0).unwrap(), meta.num_tokens());
                assert_eq!(col_mapping.dim(0).unwrap(), meta.num_tokens());
            }
            CacheAddressing::Blocks { .. } => unreachable!(),
        }
    }

    #[test]
    fn legacy_slot_mapping_walks_the_block_table() {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, false, false);
        builder
            .add_request(&prompt(20, RequestAddressing::Blocks(vec![7, 3])))
            .unwrap();
        let meta = builder.build(None).unwrap().unwrap();
        match &meta.addressing {
            CacheAddressing::Blocks {
                slot_mapping,
                block_tables,
            } => {
                let mut expected: Vec<i64> = (112..128).collect();
                expected.extend(48..52);
                assert_eq!(slot_mapping.to_vec1::<i64>().unwrap(), expected);
                // Fresh prompt, no prefix hit: no block tables for the kernel.
                assert!(block_tables.is_none());
            }
            CacheAddressing::Slots { .. } => panic!("expected block addressing"),
        }
    }

    #[test]
    fn sliding_window_masks_early_prompt_tokens() {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, false, false);
        let mut request = prompt(20, RequestAddressing::Blocks(vec![7, 3]));
        request.sliding_window = Some(4);
        builder.add_request(&request).unwrap();
        let meta = builder.build(None).unwrap().unwrap();
        match &meta.addressing {
            CacheAddressing::Blocks { slot_mapping, .. } => {
                let mapping = slot_mapping.to_vec1::<i64>().unwrap();
                assert_eq!(mapping.len(), 20);
                assert!(mapping[..16].iter().all(|&s| s == PAD_SLOT_ID));
                assert_eq!(&mapping[16..], &[48, 49, 50, 51]);
            }
            CacheAddressing::Slots { .. } => panic!("expected block addressing"),
        }
    }

    #[test]
    fn decode_keeps_full_block_table_for_the_kernel() {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, false, false);
        builder
            .add_request(&decode(17, RequestAddressing::Blocks(vec![5, 9])))
            .unwrap();
        let meta = builder.build(None).unwrap().unwrap();
        match &meta.addressing {
            CacheAddressing::Blocks {
                slot_mapping,
                block_tables,
            } => {
                // Token 16 lives in block 9 at offset 0.
                assert_eq!(slot_mapping.to_vec1::<i64>().unwrap(), vec![144]);
                let tables = block_tables.as_ref().unwrap();
                assert_eq!(tables.to_vec2::<u32>().unwrap(), vec![vec![5, 9]]);
            }
            CacheAddressing::Slots { .. } => panic!("expected block addressing"),
        }
    }

    #[test]
    fn graph_capture_pads_to_the_captured_batch() {
        let device = Device::Cpu;
        let mut graph_tables = GraphBlockTables::new(4, 3);
        let mut builder = StepMetadataBuilder::new(&device, 16, false, false);
        builder
            .add_request(&decode(17, RequestAddressing::Blocks(vec![5, 9])))
            .unwrap();
        builder
            .add_request(&decode(3, RequestAddressing::Blocks(vec![2, 6, 8, 11])))
            .unwrap();
        let meta = builder
            .build(Some(Capture {
                batch_size: 4,
                graph_block_tables: Some(&mut graph_tables),
            }))
            .unwrap()
            .unwrap();
        assert!(meta.use_cuda_graph);
        assert_eq!(meta.num_decode_tokens, 4);
        assert_eq!(meta.seq_lens, vec![17, 3, 1, 1]);
        match &meta.addressing {
            CacheAddressing::Blocks {
                slot_mapping,
                block_tables,
            } => {
                let mapping = slot_mapping.to_vec1::<i64>().unwrap();
                assert_eq!(mapping.len(), 4);
                assert_eq!(mapping[2], PAD_SLOT_ID);
                assert_eq!(mapping[3], PAD_SLOT_ID);
                let tables = block_tables.as_ref().unwrap().to_vec2::<u32>().unwrap();
                assert_eq!(tables.len(), 4);
                assert_eq!(tables[0], vec![5, 9, 0]);
                // Lookahead blocks beyond the buffer width are discarded.
                assert_eq!(tables[1], vec![2, 6, 8]);
                assert_eq!(tables[2], vec![0, 0, 0]);
            }
            CacheAddressing::Slots { .. } => panic!("expected block addressing"),
        }
    }

    #[test]
    fn prefill_after_decode_is_rejected() {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, true, false);
        builder
            .add_request(&decode(5, RequestAddressing::Slot(0)))
            .unwrap();
        assert!(matches!(
            builder.add_request(&prompt(3, RequestAddressing::Slot(1))),
            Err(CacheError::PreconditionViolated(_))
        ));
    }

    #[test]
    fn addressing_must_match_the_cache_mode() {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, true, false);
        assert!(matches!(
            builder.add_request(&prompt(3, RequestAddressing::Blocks(vec![0]))),
            Err(CacheError::PreconditionViolated(_))
        ));
    }
}
