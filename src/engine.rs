//! The cache engine: slot lifecycle, cache storage, and the per-step entry
//! points the model runner calls.
//!
//! In VMM mode the engine owns the two lazily-backed reservations through a
//! [`SlotTable`]; in legacy mode it owns the pooled
//! `[2, num_blocks, block_size, num_kv_heads, head_dim]` cache. The two
//! modes are mutually exclusive for one engine instance.

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::config::CacheConfig;
use crate::error::{precondition, CacheError, Result};
use crate::layout::CacheLayout;
use crate::metadata::{
    Capture, GraphBlockTables, RequestDescriptor, StepMetadata, StepMetadataBuilder,
};
use crate::slots::SlotTable;
use crate::vmm::{HostPageAllocator, PageAllocator, Reservation};
use crate::write;

/// What the scheduler receives when a request is admitted.
#[derive(Debug)]
pub enum Admission {
    /// VMM mode: the sequence slot now owned by the request.
    Slot(usize),
    /// Legacy mode: a fresh, empty block list for the scheduler to fill.
    BlockList(Vec<u32>),
}

/// Host-memory pooled cache for legacy mode on `Device::Cpu`: one
/// (key, value) buffer pair per layer.
pub struct HostBlockPool {
    layers: Vec<(Vec<u8>, Vec<u8>)>,
    num_blocks: usize,
    block_size: usize,
    row_elems: usize,
    elem_bytes: usize,
}

impl HostBlockPool {
    fn new(
        num_layers: usize,
        num_blocks: usize,
        block_size: usize,
        row_elems: usize,
        elem_bytes: usize,
    ) -> Self {
        let layer_bytes = num_blocks * block_size * row_elems * elem_bytes;
        let layers = (0..num_layers)
            .map(|_| (vec![0u8; layer_bytes], vec![0u8; layer_bytes]))
            .collect();
        Self {
            layers,
            num_blocks,
            block_size,
            row_elems,
            elem_bytes,
        }
    }

    pub fn num_cells(&self) -> usize {
        self.num_blocks * self.block_size
    }

    pub fn layer(&self, layer: usize) -> (&[u8], &[u8]) {
        let (key, value) = &self.layers[layer];
        (key, value)
    }

    fn copy_block(&mut self, src: usize, dst: usize) {
        let block_bytes = self.block_size * self.row_elems * self.elem_bytes;
        for (key, value) in &mut self.layers {
            key.copy_within(src * block_bytes..(src + 1) * block_bytes, dst * block_bytes);
            value.copy_within(src * block_bytes..(src + 1) * block_bytes, dst * block_bytes);
        }
    }
}

enum CacheBacking {
    Slots {
        table: SlotTable,
        free_slots: Vec<usize>,
    },
    HostBlocks(HostBlockPool),
    #[cfg(feature = "cuda")]
    DeviceBlocks(Vec<Tensor>),
}

/// Base pointer + shape + stride of one layer's slice of a cache space, for
/// the external pointer-to-tensor wrapper. The view never owns the memory;
/// it must not outlive the engine.
#[derive(Debug, Clone, Copy)]
pub struct CacheView {
    pub key_addr: u64,
    pub value_addr: u64,
    /// Element offset of the layer slice within each space.
    pub elem_offset: usize,
    /// `[max_batch_size, max_seq_len, num_kv_heads, head_dim]`.
    pub shape: [usize; 4],
    /// Strides in elements, matching `shape`.
    pub strides: [usize; 4],
    pub elem_bytes: usize,
}

pub struct CacheEngine {
    config: CacheConfig,
    device: Device,
    backing: CacheBacking,
    graph_block_tables: GraphBlockTables,
    kv_scales: (f32, f32),
}

impl CacheEngine {
    pub fn new(config: CacheConfig, model_dtype: DType, device: Device) -> Result<Self> {
        let config = config.validated(model_dtype)?;
        let backing = if config.use_vmm {
            let allocator: Box<dyn PageAllocator> = match &device {
                Device::Cpu => Box::new(HostPageAllocator::new(config.block_bytes_size)?),
                #[cfg(feature = "cuda")]
                Device::Cuda(_) => {
                    let candle_core::DeviceLocation::Cuda { gpu_id } = device.location() else {
                        unreachable!()
                    };
                    Box::new(crate::vmm::CudaPageAllocator::new(
                        gpu_id as i32,
                        config.block_bytes_size,
                    )?)
                }
                _ => {
                    return Err(CacheError::UnsupportedFeature(
                        "the VMM cache requires a CPU or CUDA device".to_string(),
                    ))
                }
            };
            let layout = CacheLayout::for_config(&config, allocator.page_bytes())?;
            info!(
                max_batch_size = config.max_batch_size,
                max_seq_len = config.max_seq_len,
                num_layers = config.num_layers,
                num_kv_heads = config.num_kv_heads,
                head_dim = config.head_dim,
                page_bytes = layout.page_bytes(),
                pages_per_slot = layout.pages_per_slot(),
                reservation_bytes = layout.reservation_bytes(),
                "initializing VMM cache spaces"
            );
            let table = SlotTable::new(layout, allocator)?;
            CacheBacking::Slots {
                table,
                free_slots: (0..config.max_batch_size).rev().collect(),
            }
        } else {
            match &device {
                Device::Cpu => CacheBacking::HostBlocks(HostBlockPool::new(
                    config.num_layers,
                    config.num_blocks,
                    config.block_size,
                    config.num_kv_heads * config.head_dim,
                    config.elem_bytes()?,
                )),
                #[cfg(feature = "cuda")]
                Device::Cuda(_) => {
                    let dtype = config.cache_dtype.as_candle_dtype()?;
                    let shape = (
                        2,
                        config.num_blocks,
                        config.block_size,
                        config.num_kv_heads,
                        config.head_dim,
                    );
                    let layers = (0..config.num_layers)
                        .map(|_| Tensor::zeros(shape, dtype, &device))
                        .collect::<candle_core::Result<Vec<_>>>()?;
                    CacheBacking::DeviceBlocks(layers)
                }
                _ => {
                    return Err(CacheError::UnsupportedFeature(
                        "the pooled cache requires a CPU or CUDA device".to_string(),
                    ))
                }
            }
        };
        let graph_block_tables =
            GraphBlockTables::new(config.max_batch_size, config.max_blocks_per_seq());
        Ok(Self {
            config,
            device,
            backing,
            graph_block_tables,
            kv_scales: (1.0, 1.0),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Scales applied when writing into a quantized cache.
    pub fn set_kv_scales(&mut self, k_scale: f32, v_scale: f32) {
        self.kv_scales = (k_scale, v_scale);
    }

    /// Hands a free sequence slot (VMM) or a fresh block list (legacy) to a
    /// newly scheduled request.
    pub fn admit(&mut self) -> Result<Admission> {
        match &mut self.backing {
            CacheBacking::Slots { free_slots, .. } => free_slots
                .pop()
                .map(Admission::Slot)
                .ok_or_else(|| {
                    CacheError::ResourceExhausted("no free sequence slots".to_string())
                }),
            _ => Ok(Admission::BlockList(Vec::new())),
        }
    }

    /// Grows a slot's physical backing to cover `tokens`. Called before
    /// step assembly; a failure means the step cannot be admitted. No-op in
    /// legacy mode, where the scheduler owns block allocation.
    pub fn extend(&self, slot: usize, tokens: usize) -> Result<()> {
        match &self.backing {
            CacheBacking::Slots { table, .. } => table.ensure_capacity(&[(slot, tokens)]),
            _ => Ok(()),
        }
    }

    /// Releases a terminated request's slot. The slot is reusable
    /// immediately.
    pub fn terminate(&mut self, slot: usize) -> Result<()> {
        match &mut self.backing {
            CacheBacking::Slots { table, free_slots } => {
                precondition!(
                    slot < self.config.max_batch_size,
                    "slot {slot} out of range"
                );
                precondition!(
                    !free_slots.contains(&slot),
                    "slot {slot} released twice"
                );
                table.release(&[slot])?;
                free_slots.push(slot);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Assembles the step metadata for the scheduled requests. Returns
    /// `None` for an empty batch.
    pub fn build_step(
        &mut self,
        requests: &[RequestDescriptor],
        chunked_prefill_enabled: bool,
        capture_batch_size: Option<usize>,
    ) -> Result<Option<StepMetadata>> {
        let mut builder = StepMetadataBuilder::new(
            &self.device,
            self.config.block_size,
            self.config.use_vmm,
            chunked_prefill_enabled,
        );
        for request in requests {
            builder.add_request(request)?;
        }
        let capture = capture_batch_size.map(|batch_size| Capture {
            batch_size,
            graph_block_tables: if self.config.use_vmm {
                None
            } else {
                Some(&mut self.graph_block_tables)
            },
        });
        builder.build(capture)
    }

    /// Writes one layer's freshly computed K/V rows into the cache.
    pub fn write_kv(
        &mut self,
        layer: usize,
        key: &Tensor,
        value: &Tensor,
        meta: &StepMetadata,
    ) -> Result<()> {
        precondition!(
            layer < self.config.num_layers,
            "layer {layer} out of range for {} layers",
            self.config.num_layers
        );
        match &mut self.backing {
            CacheBacking::Slots { table, .. } => {
                let layout = *table.layout();
                if matches!(self.device, Device::Cpu) {
                    table.with_reservations_mut(|key_space, value_space| {
                        write::write_kv_slots_host(
                            layer, key, value, meta, &layout, key_space, value_space,
                        )
                    })
                } else {
                    #[cfg(feature = "cuda")]
                    {
                        let (key_base, value_base) = table.base_addrs();
                        write::write_kv_slots_device(
                            layer, key, value, meta, &layout, key_base, value_base,
                        )
                    }
                    #[cfg(not(feature = "cuda"))]
                    Err(CacheError::UnsupportedFeature(
                        "built without CUDA support".to_string(),
                    ))
                }
            }
            CacheBacking::HostBlocks(pool) => {
                let num_cells = pool.num_cells();
                let row_elems = pool.row_elems;
                let elem_bytes = pool.elem_bytes;
                let (key_pool, value_pool) = &mut pool.layers[layer];
                write::write_kv_blocks_host(
                    key, value, meta, row_elems, elem_bytes, num_cells, key_pool, value_pool,
                )
            }
            #[cfg(feature = "cuda")]
            CacheBacking::DeviceBlocks(layers) => {
                write::write_kv_blocks_device(key, value, meta, &layers[layer], self.kv_scales)
            }
        }
    }

    /// Advances pure-decode metadata in place for the next step.
    pub fn advance_step(
        &self,
        meta: &mut StepMetadata,
        sampled_token_ids: Option<&Tensor>,
        num_seqs: usize,
        num_queries: usize,
        turn_prefills_into_decodes: bool,
    ) -> Result<()> {
        meta.advance_step(
            sampled_token_ids,
            self.config.block_size,
            num_seqs,
            num_queries,
            turn_prefills_into_decodes,
        )
    }

    /// One layer's slice of the VMM cache spaces, for the external
    /// pointer-to-tensor wrapper.
    pub fn kv_view(&self, layer: usize) -> Result<CacheView> {
        let CacheBacking::Slots { table, .. } = &self.backing else {
            return Err(CacheError::PreconditionViolated(
                "pointer views exist only for the VMM cache".to_string(),
            ));
        };
        precondition!(
            layer < self.config.num_layers,
            "layer {layer} out of range for {} layers",
            self.config.num_layers
        );
        let (key_addr, value_addr) = table.base_addrs();
        let heads = self.config.num_kv_heads;
        let dim = self.config.head_dim;
        let layers = self.config.num_layers;
        Ok(CacheView {
            key_addr,
            value_addr,
            elem_offset: layer * heads * dim,
            shape: [
                self.config.max_batch_size,
                self.config.max_seq_len,
                heads,
                dim,
            ],
            strides: [
                self.config.max_seq_len * layers * heads * dim,
                layers * heads * dim,
                dim,
                1,
            ],
            elem_bytes: self.config.elem_bytes()?,
        })
    }

    /// The reservation layout, VMM mode only.
    pub fn cache_layout(&self) -> Result<CacheLayout> {
        match &self.backing {
            CacheBacking::Slots { table, .. } => Ok(*table.layout()),
            _ => Err(CacheError::PreconditionViolated(
                "the pooled cache has no reservation layout".to_string(),
            )),
        }
    }

    /// Pages currently backing a slot, in each reservation.
    pub fn mapped_pages(&self, slot: usize) -> Result<usize> {
        match &self.backing {
            CacheBacking::Slots { table, .. } => Ok(table.mapped_pages(slot)),
            _ => Err(CacheError::PreconditionViolated(
                "the pooled cache has no per-slot pages".to_string(),
            )),
        }
    }

    /// Shared access to the (key, value) reservations, VMM mode only.
    pub fn with_cache_spaces<R>(
        &self,
        f: impl FnOnce(&Reservation, &Reservation) -> R,
    ) -> Result<R> {
        match &self.backing {
            CacheBacking::Slots { table, .. } => Ok(table.with_reservations(f)),
            _ => Err(CacheError::PreconditionViolated(
                "cache spaces exist only for the VMM cache".to_string(),
            )),
        }
    }

    /// The host pooled cache, legacy mode on `Device::Cpu` only.
    pub fn host_block_pool(&self) -> Option<&HostBlockPool> {
        match &self.backing {
            CacheBacking::HostBlocks(pool) => Some(pool),
            _ => None,
        }
    }

    #[cfg(feature = "cuda")]
    pub fn device_block_cache(&self, layer: usize) -> Result<&Tensor> {
        match &self.backing {
            CacheBacking::DeviceBlocks(layers) => layers.get(layer).ok_or_else(|| {
                CacheError::PreconditionViolated(format!("layer {layer} out of range"))
            }),
            _ => Err(CacheError::PreconditionViolated(
                "no pooled device cache in this mode".to_string(),
            )),
        }
    }

    /// Copies whole blocks within the pooled cache (copy-on-write fork of a
    /// sequence). Legacy mode only.
    pub fn copy_blocks(&mut self, mapping: &[(u32, u32)]) -> Result<()> {
        match &mut self.backing {
            CacheBacking::Slots { .. } => Err(CacheError::PreconditionViolated(
                "block copies do not apply to the VMM cache".to_string(),
            )),
            CacheBacking::HostBlocks(pool) => {
                for &(src, dst) in mapping {
                    precondition!(
                        (src as usize) < pool.num_blocks && (dst as usize) < pool.num_blocks,
                        "block copy ({src}, {dst}) out of range"
                    );
                    pool.copy_block(src as usize, dst as usize);
                }
                Ok(())
            }
            #[cfg(feature = "cuda")]
            CacheBacking::DeviceBlocks(layers) => {
                use candle_core::cuda_backend::cudarc::driver::DevicePtr;
                use candle_core::Storage;

                let mut key_ptrs = Vec::with_capacity(layers.len());
                let mut value_ptrs = Vec::with_capacity(layers.len());
                for cache in layers.iter() {
                    let (storage, layout) = cache.storage_and_layout();
                    let storage = match &*storage {
                        Storage::Cuda(storage) => storage,
                        _ => {
                            return Err(CacheError::PreconditionViolated(
                                "pooled device cache must live on the CUDA device".to_string(),
                            ))
                        }
                    };
                    let slice = storage.as_cuda_slice::<half::f16>();
                    // The kernel treats the caches as untyped bytes; any
                    // element view gives the same base address.
                    let base = match slice {
                        Ok(slice) => *slice.slice(layout.start_offset()..).device_ptr(),
                        Err(_) => {
                            return Err(CacheError::UnsupportedFeature(
                                "block copies on device require an f16 cache".to_string(),
                            ))
                        }
                    };
                    let layer_elems: usize = cache.dims().iter().skip(1).product();
                    key_ptrs.push(base);
                    value_ptrs.push(base + (layer_elems * self.config.elem_bytes()?) as u64);
                }
                let pairs: Vec<i64> = mapping
                    .iter()
                    .flat_map(|&(src, dst)| [src as i64, dst as i64])
                    .collect();
                let block_elems = self.config.block_size
                    * self.config.num_kv_heads
                    * self.config.head_dim;
                unsafe {
                    crate::kernels::ffi::copy_blocks(
                        key_ptrs.as_ptr() as *const *const core::ffi::c_void,
                        value_ptrs.as_ptr() as *const *const core::ffi::c_void,
                        pairs.as_ptr() as *const core::ffi::c_void,
                        layers.len() as i32,
                        mapping.len() as i32,
                        block_elems as i64,
                    );
                }
                Ok(())
            }
        }
    }

    /// CPU-side swap is not available for this cache.
    pub fn swap_in(&mut self, _mapping: &[(u32, u32)]) -> Result<()> {
        Err(CacheError::NotImplemented(
            "swap_in is not implemented for the VMM cache",
        ))
    }

    pub fn swap_out(&mut self, _mapping: &[(u32, u32)]) -> Result<()> {
        Err(CacheError::NotImplemented(
            "swap_out is not implemented for the VMM cache",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttentionKind, CacheDType};

    fn vmm_config() -> CacheConfig {
        CacheConfig {
            max_batch_size: 2,
            max_seq_len: 64,
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 32,
            cache_dtype: CacheDType::Auto,
            block_size: 16,
            block_bytes_size: 4096,
            num_blocks: 0,
            use_vmm: true,
            attn_type: AttentionKind::Decoder,
            sliding_window: None,
            flash_attn_version: 2,
        }
    }

    #[test]
    fn admit_exhausts_and_recycles_slots() {
        let mut engine = CacheEngine::new(vmm_config(), DType::F32, Device::Cpu).unwrap();
        let Admission::Slot(first) = engine.admit().unwrap() else {
            panic!("expected a slot")
        };
        let Admission::Slot(second) = engine.admit().unwrap() else {
            panic!("expected a slot")
        };
        assert_ne!(first, second);
        assert!(matches!(
            engine.admit(),
            Err(CacheError::ResourceExhausted(_))
        ));

        engine.terminate(first).unwrap();
        let Admission::Slot(recycled) = engine.admit().unwrap() else {
            panic!("expected a slot")
        };
        assert_eq!(recycled, first);
    }

    #[test]
    fn double_release_is_rejected() {
        let mut engine = CacheEngine::new(vmm_config(), DType::F32, Device::Cpu).unwrap();
        let Admission::Slot(slot) = engine.admit().unwrap() else {
            panic!("expected a slot")
        };
        engine.terminate(slot).unwrap();
        assert!(matches!(
            engine.terminate(slot),
            Err(CacheError::PreconditionViolated(_))
        ));
    }

    #[test]
    fn extend_maps_pages_lazily_and_idempotently() {
        // token_bytes = 2 layers * 2 heads * 32 dims * 4 bytes = 512;
        // one 4 KiB page covers 8 tokens.
        let engine = CacheEngine::new(vmm_config(), DType::F32, Device::Cpu).unwrap();
        engine.extend(0, 5).unwrap();
        assert_eq!(engine.mapped_pages(0).unwrap(), 1);
        engine.extend(0, 9).unwrap();
        assert_eq!(engine.mapped_pages(0).unwrap(), 2);
        engine.extend(0, 9).unwrap();
        assert_eq!(engine.mapped_pages(0).unwrap(), 2);
        assert_eq!(engine.mapped_pages(1).unwrap(), 0);
    }

    #[test]
    fn kv_view_exposes_the_layer_slice() {
        let engine = CacheEngine::new(vmm_config(), DType::F32, Device::Cpu).unwrap();
        let view = engine.kv_view(1).unwrap();
        assert_eq!(view.shape, [2, 64, 2, 32]);
        assert_eq!(view.strides, [64 * 2 * 2 * 32, 2 * 2 * 32, 32, 1]);
        assert_eq!(view.elem_offset, 2 * 32);
        assert_eq!(view.elem_bytes, 4);
        assert_ne!(view.key_addr, view.value_addr);
    }

    #[test]
    fn swap_is_not_implemented() {
        let mut engine = CacheEngine::new(vmm_config(), DType::F32, Device::Cpu).unwrap();
        assert!(matches!(
            engine.swap_in(&[(0, 1)]),
            Err(CacheError::NotImplemented(_))
        ));
        assert!(matches!(
            engine.swap_out(&[(0, 1)]),
            Err(CacheError::NotImplemented(_))
        ));
    }

    #[test]
    fn legacy_copy_blocks_duplicates_cells() {
        let mut config = vmm_config();
        config.use_vmm = false;
        config.num_blocks = 4;
        let mut engine = CacheEngine::new(config, DType::F32, Device::Cpu).unwrap();

        // Write a recognizable byte into block 1 of layer 0 directly through
        // the write bridge, then fork it into block 3.
        let device = Device::Cpu;
        let mut builder = StepMetadataBuilder::new(&device, 16, false, false);
        builder
            .add_request(&RequestDescriptor {
                is_prompt: true,
                seq_len: 1,
                query_len: 1,
                sliding_window: None,
                prefix_cache_hit: false,
                addressing: crate::metadata::RequestAddressing::Blocks(vec![1]),
            })
            .unwrap();
        let meta = builder.build(None).unwrap().unwrap();
        let key = Tensor::ones((1, 2, 32), DType::F32, &device).unwrap();
        let value = (Tensor::ones((1, 2, 32), DType::F32, &device).unwrap() * 2.0).unwrap();
        engine.write_kv(0, &key, &value, &meta).unwrap();

        engine.copy_blocks(&[(1, 3)]).unwrap();
        let pool = engine.host_block_pool().unwrap();
        let (key_bytes, _) = pool.layer(0);
        let row_bytes = 2 * 32 * 4;
        let block_bytes = 16 * row_bytes;
        assert_eq!(
            &key_bytes[block_bytes..block_bytes + row_bytes],
            &key_bytes[3 * block_bytes..3 * block_bytes + row_bytes]
        );
        assert!(key_bytes[block_bytes..block_bytes + 4].iter().any(|&b| b != 0));
    }
}
