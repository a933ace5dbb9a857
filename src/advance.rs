//! In-place metadata updates between decode steps.
//!
//! A captured kernel graph replays with fixed tensor addresses, so the next
//! decode step must be described by mutating the existing metadata rather
//! than rebuilding it. Host scalars are updated here; tensor contents are
//! rewritten through the device-side helper (or rebuilt directly on CPU).

use candle_core::{Device, Tensor};

use crate::error::{precondition, CacheError, Result};
use crate::metadata::{CacheAddressing, StepMetadata, PAD_SLOT_ID};

impl StepMetadata {
    /// Advances this metadata by one decode step.
    ///
    /// `num_seqs` may exceed `num_queries` when the batch is padded to a
    /// captured graph size; only the first `num_queries` sequences are live.
    /// With `turn_prefills_into_decodes` set (multi-step scheduling after
    /// chunked prefill), the step's prefills are first converted into
    /// decodes. All shape preconditions are programmer errors and surface
    /// as `PreconditionViolated`.
    pub fn advance_step(
        &mut self,
        sampled_token_ids: Option<&Tensor>,
        block_size: usize,
        num_seqs: usize,
        num_queries: usize,
        turn_prefills_into_decodes: bool,
    ) -> Result<()> {
        precondition!(num_seqs > 0, "cannot advance an empty batch");
        precondition!(
            num_queries <= num_seqs,
            "{num_queries} live queries exceed the {num_seqs}-sequence batch"
        );
        if num_seqs != num_queries {
            precondition!(
                self.use_cuda_graph,
                "padded batches only occur under graph capture"
            );
        }
        precondition!(
            !self.addressing.is_slot_addressed(),
            "step advancing requires block-addressed metadata; slot-addressed decode \
             rebuilds its descriptors each step"
        );
        self.invalidate_views();

        if turn_prefills_into_decodes {
            precondition!(
                self.num_decode_tokens + self.num_prefills == num_seqs,
                "prefill conversion expects one token per sequence"
            );
            self.num_decode_tokens += self.num_prefills;
            self.num_prefills = 0;
            self.num_prefill_tokens = 0;
            self.max_prefill_seq_len = 0;
            self.max_query_len = 1;
            if let CacheAddressing::Blocks { slot_mapping, .. } = &mut self.addressing {
                *slot_mapping = slot_mapping.narrow(0, 0, num_seqs)?;
            }
        } else {
            precondition!(
                self.max_decode_seq_len == self.seq_lens.iter().copied().max().unwrap_or(0),
                "max_decode_seq_len is stale"
            );
        }

        precondition!(
            self.num_prefills == 0 && self.num_prefill_tokens == 0,
            "step advancing is decode-only"
        );
        precondition!(
            self.num_decode_tokens == num_seqs,
            "decode token count {} disagrees with the {num_seqs}-sequence batch",
            self.num_decode_tokens
        );
        precondition!(
            self.max_query_len == 1 && self.max_prefill_seq_len == 0,
            "decode queries must be single-token"
        );
        precondition!(
            self.seq_lens.len() == num_seqs && self.seq_lens_tensor.dim(0)? == num_seqs,
            "sequence length shapes disagree with num_seqs"
        );
        precondition!(
            self.query_start_loc.dim(0)? == num_queries + 1,
            "query_start_loc must cover the live queries"
        );
        precondition!(
            self.seq_start_loc.dim(0)? == num_seqs + 1,
            "seq_start_loc must cover the batch"
        );
        if let Some(context_lens) = &self.context_lens_tensor {
            precondition!(
                context_lens.dim(0)? == num_queries,
                "context_lens_tensor must cover the live queries"
            );
        }
        match &self.addressing {
            CacheAddressing::Blocks {
                slot_mapping,
                block_tables,
            } => {
                precondition!(
                    slot_mapping.dim(0)? == num_seqs,
                    "slot mapping must hold one entry per sequence"
                );
                let block_tables = block_tables.as_ref().ok_or_else(|| {
                    CacheError::PreconditionViolated(
                        "decode metadata without block tables cannot be advanced".to_string(),
                    )
                })?;
                precondition!(
                    block_tables.dim(0)? == num_seqs,
                    "block tables must hold one row per sequence"
                );
            }
            CacheAddressing::Slots { .. } => unreachable!(),
        }

        // Only the live queries advance; padded tail sequences keep their
        // dummy length.
        for len in self.seq_lens.iter_mut().take(num_queries) {
            *len += 1;
        }
        self.max_decode_seq_len = self.seq_lens.iter().copied().max().unwrap_or(0);

        let device = self.seq_lens_tensor.device().clone();
        match device {
            Device::Cpu => self.advance_tensors_host(block_size, num_seqs, num_queries, &device),
            #[cfg(feature = "cuda")]
            Device::Cuda(_) => self.advance_tensors_device(
                sampled_token_ids,
                block_size,
                num_seqs,
                num_queries,
            ),
            _ => {
                let _ = sampled_token_ids;
                Err(CacheError::UnsupportedFeature(
                    "step advancing is only implemented for CPU and CUDA devices".to_string(),
                ))
            }
        }
    }

    /// CPU equivalent of the fused advance kernel: rebuilds the sequence
    /// lengths and next-token slot mapping in place.
    fn advance_tensors_host(
        &mut self,
        block_size: usize,
        num_seqs: usize,
        num_queries: usize,
        device: &Device,
    ) -> Result<()> {
        let seq_lens_u32: Vec<u32> = self.seq_lens.iter().map(|&l| l as u32).collect();
        self.seq_lens_tensor = Tensor::from_vec(seq_lens_u32, num_seqs, device)?;

        if let CacheAddressing::Blocks {
            block_tables,
            slot_mapping,
        } = &mut self.addressing
        {
            let tables = block_tables
                .as_ref()
                .expect("checked above")
                .to_vec2::<u32>()?;
            let mut mapping = vec![PAD_SLOT_ID; num_seqs];
            for (i, entry) in mapping.iter_mut().enumerate().take(num_queries) {
                let pos = self.seq_lens[i] - 1;
                let block_idx = pos / block_size;
                precondition!(
                    block_idx < tables[i].len(),
                    "sequence {i} grew past its block table"
                );
                *entry =
                    tables[i][block_idx] as i64 * block_size as i64 + (pos % block_size) as i64;
            }
            *slot_mapping = Tensor::from_vec(mapping, num_seqs, device)?;
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn advance_tensors_device(
        &mut self,
        sampled_token_ids: Option<&Tensor>,
        block_size: usize,
        num_seqs: usize,
        num_queries: usize,
    ) -> Result<()> {
        use candle_core::Storage;

        let sampled = sampled_token_ids.ok_or_else(|| {
            CacheError::PreconditionViolated(
                "device-side step advancing needs the sampled token ids".to_string(),
            )
        })?;
        let CacheAddressing::Blocks {
            block_tables,
            slot_mapping,
        } = &self.addressing
        else {
            unreachable!()
        };
        let block_tables = block_tables.as_ref().expect("checked above");
        let max_blocks = block_tables.dim(1)?;

        let (sampled_storage, sampled_layout) = sampled.storage_and_layout();
        let (seq_lens_storage, seq_lens_layout) = self.seq_lens_tensor.storage_and_layout();
        let (slot_storage, slot_layout) = slot_mapping.storage_and_layout();
        let (tables_storage, tables_layout) = block_tables.storage_and_layout();
        let (sampled, seq_lens, slots, tables) = match (
            &*sampled_storage,
            &*seq_lens_storage,
            &*slot_storage,
            &*tables_storage,
        ) {
            (
                Storage::Cuda(sampled),
                Storage::Cuda(seq_lens),
                Storage::Cuda(slots),
                Storage::Cuda(tables),
            ) => (sampled, seq_lens, slots, tables),
            _ => {
                return Err(CacheError::PreconditionViolated(
                    "device-side step advancing expects CUDA tensors".to_string(),
                ))
            }
        };
        let sampled = sampled.as_cuda_slice::<u32>()?.slice(sampled_layout.start_offset()..);
        let seq_lens = seq_lens
            .as_cuda_slice::<u32>()?
            .slice(seq_lens_layout.start_offset()..);
        let slots = slots.as_cuda_slice::<i64>()?.slice(slot_layout.start_offset()..);
        let tables = tables
            .as_cuda_slice::<u32>()?
            .slice(tables_layout.start_offset()..);

        use cudarc::driver::DevicePtr;
        unsafe {
            crate::kernels::ffi::advance_decode_step(
                num_seqs as i32,
                num_queries as i32,
                block_size as i32,
                *sampled.device_ptr() as *const core::ffi::c_void,
                *seq_lens.device_ptr() as *mut core::ffi::c_void,
                *slots.device_ptr() as *mut core::ffi::c_void,
                *tables.device_ptr() as *const core::ffi::c_void,
                max_blocks as i32,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{RequestAddressing, RequestDescriptor, StepMetadataBuilder};

    fn decode(seq_len: usize, blocks: Vec<u32>) -> RequestDescriptor {
        RequestDescriptor {
            is_prompt: false,
            seq_len,
            query_len: 1,
            sliding_window: None,
            prefix_cache_hit: false,
            addressing: RequestAddressing::Blocks(blocks),
        }
    }

    #[test]
    fn pure_decode_step_advances_lengths_and_slots() {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, false, false);
        builder.add_request(&decode(10, vec![4])).unwrap();
        builder.add_request(&decode(7, vec![2])).unwrap();
        let mut meta = builder.build(None).unwrap().unwrap();

        meta.advance_step(None, 16, 2, 2, false).unwrap();
        assert_eq!(meta.seq_lens, vec![11, 8]);
        assert_eq!(meta.max_decode_seq_len, 11);
        assert_eq!(
            meta.seq_lens_tensor.to_vec1::<u32>().unwrap(),
            vec![11, 8]
        );
        match &meta.addressing {
            CacheAddressing::Blocks { slot_mapping, .. } => {
                // Next write positions: 4*16+10 and 2*16+7.
                assert_eq!(slot_mapping.to_vec1::<i64>().unwrap(), vec![74, 39]);
                assert_eq!(slot_mapping.dim(0).unwrap(), 2);
            }
            CacheAddressing::Slots { .. } => unreachable!(),
        }

        // A second step keeps advancing from the updated state.
        meta.advance_step(None, 16, 2, 2, false).unwrap();
        assert_eq!(meta.seq_lens, vec![12, 9]);
        assert_eq!(meta.max_decode_seq_len, 12);
    }

    #[test]
    fn prefill_conversion_zeroes_prefill_accounting() {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, false, true);
        for seq_len in [5, 9] {
            builder
                .add_request(&RequestDescriptor {
                    is_prompt: true,
                    seq_len,
                    query_len: 1,
                    sliding_window: None,
                    prefix_cache_hit: false,
                    addressing: RequestAddressing::Blocks(vec![3]),
                })
                .unwrap();
        }
        let mut meta = builder.build(None).unwrap().unwrap();
        assert_eq!(meta.num_prefills, 2);

        meta.advance_step(None, 16, 2, 2, true).unwrap();
        assert_eq!(meta.num_prefills, 0);
        assert_eq!(meta.num_prefill_tokens, 0);
        assert_eq!(meta.num_decode_tokens, 2);
        assert_eq!(meta.max_prefill_seq_len, 0);
        assert_eq!(meta.max_query_len, 1);
        assert_eq!(meta.seq_lens, vec![6, 10]);
        assert_eq!(meta.max_decode_seq_len, 10);
    }

    #[test]
    fn slot_addressed_metadata_cannot_be_advanced() {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, true, false);
        builder
            .add_request(&RequestDescriptor {
                is_prompt: false,
                seq_len: 4,
                query_len: 1,
                sliding_window: None,
                prefix_cache_hit: false,
                addressing: RequestAddressing::Slot(0),
            })
            .unwrap();
        let mut meta = builder.build(None).unwrap().unwrap();
        assert!(matches!(
            meta.advance_step(None, 16, 1, 1, false),
            Err(CacheError::PreconditionViolated(_))
        ));
    }

    #[test]
    fn stale_shapes_are_rejected() {
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, false, false);
        builder.add_request(&decode(10, vec![4])).unwrap();
        let mut meta = builder.build(None).unwrap().unwrap();
        // Wrong batch size for the tensors at hand.
        assert!(matches!(
            meta.advance_step(None, 16, 2, 2, false),
            Err(CacheError::PreconditionViolated(_))
        ));
    }
}
