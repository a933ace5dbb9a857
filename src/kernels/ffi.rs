use core::ffi::{c_int, c_void};

extern "C" {
    /// Scatters new K/V rows into the VMM cache spaces at the
    /// `(row_mapping[i], col_mapping[i])` coordinates of one layer slice.
    /// `dtype` selects the element type: 0 = f32, 1 = f16, 2 = bf16.
    pub fn reshape_and_cache_vmm(
        key: *const c_void,
        value: *const c_void,
        key_cache: *const c_void,
        value_cache: *const c_void,
        row_mapping: *const c_void,
        col_mapping: *const c_void,
        num_tokens: c_int,
        num_heads: c_int,
        head_size: c_int,
        key_stride: c_int,
        value_stride: c_int,
        cache_batch_stride: i64,
        cache_token_stride: i64,
        dtype: u32,
    );

    /// Scatters new K/V rows into the pooled cache at the flat cells of
    /// `slot_mapping`, skipping negative sentinel entries. Scales apply
    /// when the cache is quantized.
    pub fn reshape_and_cache_flash(
        key: *const c_void,
        value: *const c_void,
        key_cache: *const c_void,
        value_cache: *const c_void,
        slot_mapping: *const c_void,
        num_tokens: c_int,
        num_heads: c_int,
        head_size: c_int,
        key_stride: c_int,
        value_stride: c_int,
        block_stride: i64,
        dtype: u32,
        k_scale: f32,
        v_scale: f32,
    );

    /// Copies whole blocks within the pooled caches of every layer;
    /// `block_pairs` holds `num_pairs` (src, dst) block id pairs.
    pub fn copy_blocks(
        key_cache_ptrs: *const *const c_void,
        value_cache_ptrs: *const *const c_void,
        block_pairs: *const c_void,
        num_layers: c_int,
        num_pairs: c_int,
        block_elems: i64,
    );

    /// Advances a pure-decode step in place: bumps the device sequence
    /// lengths and recomputes each live sequence's next write slot from its
    /// block table, consuming the freshly sampled token ids.
    pub fn advance_decode_step(
        num_seqs: c_int,
        num_queries: c_int,
        block_size: c_int,
        sampled_token_ids: *const c_void,
        seq_lens: *mut c_void,
        slot_mapping: *mut c_void,
        block_tables: *const c_void,
        max_blocks: c_int,
    );
}
