use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Offset arithmetic for one cache reservation.
///
/// Each of the two reservations (keys, values) is a flat byte range viewed as
/// `[max_batch_size, max_seq_len, num_layers, num_kv_heads, head_dim]` in
/// row-major order. Every sequence slot owns one stride of that view, and the
/// stride is an exact page multiple so pages are never shared across slots
/// and growing a slot never relocates data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    max_batch_size: usize,
    max_seq_len: usize,
    num_layers: usize,
    num_kv_heads: usize,
    head_dim: usize,
    elem_bytes: usize,
    page_bytes: usize,
}

impl CacheLayout {
    pub fn new(
        max_batch_size: usize,
        max_seq_len: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        elem_bytes: usize,
        page_bytes: usize,
    ) -> Result<Self> {
        let layout = Self {
            max_batch_size,
            max_seq_len,
            num_layers,
            num_kv_heads,
            head_dim,
            elem_bytes,
            page_bytes,
        };
        if page_bytes == 0 {
            return Err(CacheError::ConfigInvalid(
                "page size must be non-zero".to_string(),
            ));
        }
        if layout.slot_stride_bytes() % page_bytes != 0 {
            return Err(CacheError::ConfigInvalid(format!(
                "per-slot stride of {} bytes is not a multiple of the {} byte page size",
                layout.slot_stride_bytes(),
                page_bytes
            )));
        }
        Ok(layout)
    }

    pub fn for_config(config: &CacheConfig, page_bytes: usize) -> Result<Self> {
        Self::new(
            config.max_batch_size,
            config.max_seq_len,
            config.num_layers,
            config.num_kv_heads,
            config.head_dim,
            config.elem_bytes()?,
            page_bytes,
        )
    }

    /// Bytes occupied by one token across all layers and heads.
    pub fn token_bytes(&self) -> usize {
        self.num_layers * self.num_kv_heads * self.head_dim * self.elem_bytes
    }

    /// Bytes owned by one sequence slot.
    pub fn slot_stride_bytes(&self) -> usize {
        self.max_seq_len * self.token_bytes()
    }

    /// Total reservation size in bytes.
    pub fn reservation_bytes(&self) -> usize {
        self.max_batch_size * self.slot_stride_bytes()
    }

    pub fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    pub fn pages_per_slot(&self) -> usize {
        self.slot_stride_bytes() / self.page_bytes
    }

    pub fn total_pages(&self) -> usize {
        self.max_batch_size * self.pages_per_slot()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn elem_bytes(&self) -> usize {
        self.elem_bytes
    }

    /// Elements in one `[num_kv_heads, head_dim]` cache row.
    pub fn row_elems(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Byte offset of the first cell owned by `slot`.
    pub fn slot_base(&self, slot: usize) -> usize {
        debug_assert!(slot < self.max_batch_size);
        slot * self.slot_stride_bytes()
    }

    /// Byte offset of the `[num_kv_heads, head_dim]` cell for one token of
    /// one layer.
    pub fn cell_offset(&self, slot: usize, token: usize, layer: usize) -> usize {
        debug_assert!(token < self.max_seq_len);
        debug_assert!(layer < self.num_layers);
        self.slot_base(slot)
            + (token * self.num_layers + layer) * self.row_elems() * self.elem_bytes
    }

    /// Number of pages needed to back the first `tokens` tokens of a slot.
    pub fn pages_for_tokens(&self, tokens: usize) -> usize {
        let bytes = tokens * self.token_bytes();
        bytes.div_ceil(self.page_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1 << 20;

    #[test]
    fn slot_stride_must_be_page_multiple() {
        // 16 tokens * 2 layers * 1 head * 8 dims * 2 bytes = 512 B per slot,
        // far below a 2 MiB page.
        let layout = CacheLayout::new(2, 16, 2, 1, 8, 2, 2 * MB);
        assert!(matches!(layout, Err(CacheError::ConfigInvalid(_))));

        // Growing the head dim until the stride reaches a page multiple
        // makes the same shape valid.
        let layout = CacheLayout::new(2, 16, 2, 1, 32_768, 2, 2 * MB).unwrap();
        assert_eq!(layout.slot_stride_bytes(), 2 * MB);
        assert_eq!(layout.pages_per_slot(), 1);
        assert_eq!(layout.total_pages(), 2);
    }

    #[test]
    fn cell_offsets_are_row_major_and_in_bounds() {
        let layout = CacheLayout::new(4, 64, 4, 2, 32, 2, 1024).unwrap();
        let row_bytes = 2 * 32 * 2;
        assert_eq!(layout.cell_offset(0, 0, 0), 0);
        assert_eq!(layout.cell_offset(0, 0, 1), row_bytes);
        assert_eq!(layout.cell_offset(0, 1, 0), 4 * row_bytes);
        assert_eq!(layout.slot_base(1), layout.slot_stride_bytes());

        for slot in 0..4 {
            for token in [0, 1, 63] {
                for layer in 0..4 {
                    assert!(layout.cell_offset(slot, token, layer) < layout.reservation_bytes());
                }
            }
        }
    }

    #[test]
    fn pages_for_tokens_rounds_up() {
        // token_bytes = 4 * 2 * 32 * 2 = 512; page = 1024 -> 2 tokens/page.
        let layout = CacheLayout::new(4, 64, 4, 2, 32, 2, 1024).unwrap();
        assert_eq!(layout.pages_for_tokens(0), 0);
        assert_eq!(layout.pages_for_tokens(1), 1);
        assert_eq!(layout.pages_for_tokens(2), 1);
        assert_eq!(layout.pages_for_tokens(3), 2);
        assert_eq!(layout.pages_for_tokens(64), layout.pages_per_slot());
    }

    #[test]
    fn mapped_pages_cover_ensured_tokens() {
        let layout = CacheLayout::new(2, 64, 4, 2, 32, 2, 1024).unwrap();
        for tokens in 1..=64 {
            let pages = layout.pages_for_tokens(tokens);
            for token in 0..tokens {
                for layer in 0..4 {
                    let offset = layout.cell_offset(0, token, layer) - layout.slot_base(0);
                    // The last byte of the cell must land in a mapped page.
                    let last = offset + layout.row_elems() * layout.elem_bytes() - 1;
                    assert!(last / layout.page_bytes() < pages);
                }
            }
        }
    }
}
