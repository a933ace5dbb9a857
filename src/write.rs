//! Cache-write bridge: scatters freshly computed K/V rows into the cache.
//!
//! One call per layer per step. The destination cells come from the step
//! metadata: `(slot, token)` coordinates in VMM mode, flat cell indices in
//! legacy mode. On CUDA devices the scatter is a single fused kernel; the
//! host path below implements the same semantics for `Device::Cpu` engines.
//!
//! Every cell written in a step is backed by a mapped page (VMM, guaranteed
//! by `ensure_capacity`) or a valid block cell (legacy); the host path
//! checks this instead of leaving it undefined.

use candle_core::{DType, Storage, Tensor, WithDType};
use half::{bf16, f16};

use crate::error::{precondition, CacheError, Result};
use crate::layout::CacheLayout;
use crate::metadata::{CacheAddressing, StepMetadata};
use crate::vmm::Reservation;

/// Validates the `[N_new, num_kv_heads, head_dim]` input pair.
fn check_kv_shapes(key: &Tensor, value: &Tensor, num_tokens: usize, row_elems: usize) -> Result<()> {
    let key_dims = key.dims3()?;
    let value_dims = value.dims3()?;
    precondition!(
        key_dims == value_dims,
        "key and value shapes disagree: {key_dims:?} vs {value_dims:?}"
    );
    precondition!(
        key.dtype() == value.dtype(),
        "key and value dtypes disagree"
    );
    precondition!(
        key_dims.0 == num_tokens,
        "got {} K/V rows for {num_tokens} new tokens",
        key_dims.0
    );
    precondition!(
        key_dims.1 * key_dims.2 == row_elems,
        "K/V row of {}x{} elements does not match the cache row of {row_elems}",
        key_dims.1,
        key_dims.2
    );
    Ok(())
}

fn with_host_rows<T: WithDType, R>(
    tensor: &Tensor,
    f: impl FnOnce(&[T]) -> Result<R>,
) -> Result<R> {
    let tensor = tensor.contiguous()?;
    let (storage, layout) = tensor.storage_and_layout();
    match &*storage {
        Storage::Cpu(storage) => {
            let data = storage.as_slice::<T>()?;
            f(&data[layout.start_offset()..])
        }
        _ => Err(CacheError::PreconditionViolated(
            "host cache writes expect CPU tensors".to_string(),
        )),
    }
}

/// Copies each source row to its byte offset; `None` offsets are masked
/// rows (sliding window, graph padding) and are skipped.
fn scatter_rows<T: WithDType>(
    src: &Tensor,
    offsets: &[Option<usize>],
    row_elems: usize,
    dst: &mut [u8],
) -> Result<()> {
    let row_bytes = row_elems * std::mem::size_of::<T>();
    with_host_rows::<T, _>(src, |data| {
        for (i, offset) in offsets.iter().enumerate() {
            let Some(offset) = offset else { continue };
            let row = &data[i * row_elems..(i + 1) * row_elems];
            let row_bytes_view =
                unsafe { std::slice::from_raw_parts(row.as_ptr() as *const u8, row_bytes) };
            dst[*offset..*offset + row_bytes].copy_from_slice(row_bytes_view);
        }
        Ok(())
    })
}

fn scatter_dispatch(
    key: &Tensor,
    value: &Tensor,
    offsets: &[Option<usize>],
    row_elems: usize,
    elem_bytes: usize,
    key_dst: &mut [u8],
    value_dst: &mut [u8],
) -> Result<()> {
    let write = |expected: usize| {
        precondition!(
            expected == elem_bytes,
            "K/V dtype width {expected} does not match the cache element width {elem_bytes}"
        );
        Ok(())
    };
    match key.dtype() {
        DType::F16 => {
            write(2)?;
            scatter_rows::<f16>(key, offsets, row_elems, key_dst)?;
            scatter_rows::<f16>(value, offsets, row_elems, value_dst)
        }
        DType::BF16 => {
            write(2)?;
            scatter_rows::<bf16>(key, offsets, row_elems, key_dst)?;
            scatter_rows::<bf16>(value, offsets, row_elems, value_dst)
        }
        DType::F32 => {
            write(4)?;
            scatter_rows::<f32>(key, offsets, row_elems, key_dst)?;
            scatter_rows::<f32>(value, offsets, row_elems, value_dst)
        }
        // Quantized caches arrive as pre-scaled bytes.
        DType::U8 => {
            write(1)?;
            scatter_rows::<u8>(key, offsets, row_elems, key_dst)?;
            scatter_rows::<u8>(value, offsets, row_elems, value_dst)
        }
        dtype => Err(CacheError::UnsupportedFeature(format!(
            "unsupported K/V dtype {dtype:?} for cache writes"
        ))),
    }
}

/// Host scatter into the two VMM reservations.
pub fn write_kv_slots_host(
    layer: usize,
    key: &Tensor,
    value: &Tensor,
    meta: &StepMetadata,
    layout: &CacheLayout,
    key_space: &mut Reservation,
    value_space: &mut Reservation,
) -> Result<()> {
    let CacheAddressing::Slots {
        row_mapping,
        col_mapping,
        ..
    } = &meta.addressing
    else {
        return Err(CacheError::PreconditionViolated(
            "slot-addressed write over block-addressed metadata".to_string(),
        ));
    };
    precondition!(
        layer < layout.num_layers(),
        "layer {layer} out of range for {} layers",
        layout.num_layers()
    );
    let rows = row_mapping.to_vec1::<u32>()?;
    let cols = col_mapping.to_vec1::<u32>()?;
    check_kv_shapes(key, value, rows.len(), layout.row_elems())?;

    let row_bytes = layout.row_elems() * layout.elem_bytes();
    let page_bytes = layout.page_bytes();
    let mut offsets = Vec::with_capacity(rows.len());
    for (&slot, &token) in rows.iter().zip(cols.iter()) {
        precondition!(
            (slot as usize) < layout.max_batch_size() && (token as usize) < layout.max_seq_len(),
            "cache coordinate ({slot}, {token}) out of range"
        );
        let offset = layout.cell_offset(slot as usize, token as usize, layer);
        let first_page = offset / page_bytes;
        let last_page = (offset + row_bytes - 1) / page_bytes;
        for page in first_page..=last_page {
            precondition!(
                key_space.is_mapped(page) && value_space.is_mapped(page),
                "cache write to unmapped page {page} of slot {slot}"
            );
        }
        offsets.push(Some(offset));
    }

    scatter_dispatch(
        key,
        value,
        &offsets,
        layout.row_elems(),
        layout.elem_bytes(),
        key_space.host_bytes_mut()?,
        value_space.host_bytes_mut()?,
    )
}

/// Host scatter into one layer of the pooled legacy cache.
#[allow(clippy::too_many_arguments)]
pub fn write_kv_blocks_host(
    key: &Tensor,
    value: &Tensor,
    meta: &StepMetadata,
    row_elems: usize,
    elem_bytes: usize,
    num_cells: usize,
    key_pool: &mut [u8],
    value_pool: &mut [u8],
) -> Result<()> {
    let CacheAddressing::Blocks { slot_mapping, .. } = &meta.addressing else {
        return Err(CacheError::PreconditionViolated(
            "block-addressed write over slot-addressed metadata".to_string(),
        ));
    };
    let mapping = slot_mapping.to_vec1::<i64>()?;
    check_kv_shapes(key, value, mapping.len(), row_elems)?;

    let row_bytes = row_elems * elem_bytes;
    let mut offsets = Vec::with_capacity(mapping.len());
    for &cell in &mapping {
        if cell < 0 {
            offsets.push(None);
            continue;
        }
        precondition!(
            (cell as usize) < num_cells,
            "cache cell {cell} out of range for the {num_cells}-cell pool"
        );
        offsets.push(Some(cell as usize * row_bytes));
    }
    scatter_dispatch(
        key,
        value,
        &offsets,
        row_elems,
        elem_bytes,
        key_pool,
        value_pool,
    )
}

#[cfg(feature = "cuda")]
mod device {
    use std::ffi::c_int;

    use candle_core::cuda_backend::cudarc::driver::{DevicePtr, DeviceRepr};
    use candle_core::cuda_backend::CudaDType;
    use candle_core::{DType, Storage, Tensor};
    use half::{bf16, f16};

    use super::*;

    fn dtype_code(dtype: DType) -> Result<u32> {
        match dtype {
            DType::F32 => Ok(0),
            DType::F16 => Ok(1),
            DType::BF16 => Ok(2),
            dtype => Err(CacheError::UnsupportedFeature(format!(
                "unsupported K/V dtype {dtype:?} for the fused cache write"
            ))),
        }
    }

    fn cuda_ptr<T: CudaDType + DeviceRepr>(tensor: &Tensor) -> Result<u64> {
        let (storage, layout) = tensor.storage_and_layout();
        let storage = match &*storage {
            Storage::Cuda(storage) => storage,
            _ => {
                return Err(CacheError::PreconditionViolated(
                    "device cache writes expect CUDA tensors".to_string(),
                ))
            }
        };
        let slice = storage.as_cuda_slice::<T>()?;
        let view = slice.slice(layout.start_offset()..);
        Ok(*view.device_ptr())
    }

    fn index_ptr(tensor: &Tensor) -> Result<u64> {
        match tensor.dtype() {
            DType::U32 => cuda_ptr::<u32>(tensor),
            DType::I64 => cuda_ptr::<i64>(tensor),
            dtype => Err(CacheError::PreconditionViolated(format!(
                "unexpected index dtype {dtype:?}"
            ))),
        }
    }

    fn kv_ptrs(key: &Tensor, value: &Tensor) -> Result<(u64, u64, u32)> {
        let code = dtype_code(key.dtype())?;
        let (k, v) = match key.dtype() {
            DType::F32 => (cuda_ptr::<f32>(key)?, cuda_ptr::<f32>(value)?),
            DType::F16 => (cuda_ptr::<f16>(key)?, cuda_ptr::<f16>(value)?),
            DType::BF16 => (cuda_ptr::<bf16>(key)?, cuda_ptr::<bf16>(value)?),
            _ => unreachable!(),
        };
        Ok((k, v, code))
    }

    /// Fused scatter into the VMM reservations for one layer.
    pub fn write_kv_slots_device(
        layer: usize,
        key: &Tensor,
        value: &Tensor,
        meta: &StepMetadata,
        layout: &CacheLayout,
        key_base: u64,
        value_base: u64,
    ) -> Result<()> {
        let CacheAddressing::Slots {
            row_mapping,
            col_mapping,
            ..
        } = &meta.addressing
        else {
            return Err(CacheError::PreconditionViolated(
                "slot-addressed write over block-addressed metadata".to_string(),
            ));
        };
        let num_tokens = row_mapping.dim(0)?;
        check_kv_shapes(key, value, num_tokens, layout.row_elems())?;
        let (_, num_heads, head_size) = key.dims3()?;
        let (k_ptr, v_ptr, dtype) = kv_ptrs(key, value)?;
        let row_bytes = layout.row_elems() * layout.elem_bytes();
        let layer_offset = (layer * row_bytes) as u64;
        unsafe {
            crate::kernels::ffi::reshape_and_cache_vmm(
                k_ptr as *const core::ffi::c_void,
                v_ptr as *const core::ffi::c_void,
                (key_base + layer_offset) as *const core::ffi::c_void,
                (value_base + layer_offset) as *const core::ffi::c_void,
                index_ptr(row_mapping)? as *const core::ffi::c_void,
                index_ptr(col_mapping)? as *const core::ffi::c_void,
                num_tokens as c_int,
                num_heads as c_int,
                head_size as c_int,
                key.stride()[0] as c_int,
                value.stride()[0] as c_int,
                (layout.slot_stride_bytes() / layout.elem_bytes()) as i64,
                (layout.token_bytes() / layout.elem_bytes()) as i64,
                dtype,
            );
        }
        Ok(())
    }

    /// Fused scatter into one layer of the pooled legacy cache.
    pub fn write_kv_blocks_device(
        key: &Tensor,
        value: &Tensor,
        meta: &StepMetadata,
        cache: &Tensor,
        kv_scales: (f32, f32),
    ) -> Result<()> {
        use candle_core::IndexOp;

        let CacheAddressing::Blocks { slot_mapping, .. } = &meta.addressing else {
            return Err(CacheError::PreconditionViolated(
                "block-addressed write over slot-addressed metadata".to_string(),
            ));
        };
        let num_tokens = slot_mapping.dim(0)?;
        let (_, _, _, num_heads, head_size) = cache.dims5()?;
        check_kv_shapes(key, value, num_tokens, num_heads * head_size)?;
        let key_cache = cache.i(0)?;
        let value_cache = cache.i(1)?;
        let (k_ptr, v_ptr, dtype) = kv_ptrs(key, value)?;
        let (kc_ptr, vc_ptr, _) = kv_ptrs(&key_cache, &value_cache)?;
        unsafe {
            crate::kernels::ffi::reshape_and_cache_flash(
                k_ptr as *const core::ffi::c_void,
                v_ptr as *const core::ffi::c_void,
                kc_ptr as *const core::ffi::c_void,
                vc_ptr as *const core::ffi::c_void,
                index_ptr(slot_mapping)? as *const core::ffi::c_void,
                num_tokens as c_int,
                num_heads as c_int,
                head_size as c_int,
                key.stride()[0] as c_int,
                value.stride()[0] as c_int,
                key_cache.stride()[0] as i64,
                dtype,
                kv_scales.0,
                kv_scales.1,
            );
        }
        Ok(())
    }
}

#[cfg(feature = "cuda")]
pub use device::{write_kv_blocks_device, write_kv_slots_device};
