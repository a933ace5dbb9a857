use candle_core::DType;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CacheError, Result};

/// Head sizes the fused attention kernels are compiled for.
pub const SUPPORTED_HEAD_SIZES: [usize; 8] = [32, 64, 96, 128, 160, 192, 224, 256];

/// Element type of the KV cache storage.
///
/// `Auto` resolves to the model dtype at engine construction. The quantized
/// variant stores raw bytes and is only usable with the v3 attention kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDType {
    Auto,
    F16,
    Bf16,
    F32,
    Fp8E4m3,
}

impl CacheDType {
    /// Resolves `Auto` against the model dtype.
    pub fn resolve(self, model_dtype: DType) -> Result<Self> {
        match self {
            Self::Auto => match model_dtype {
                DType::F16 => Ok(Self::F16),
                DType::BF16 => Ok(Self::Bf16),
                DType::F32 => Ok(Self::F32),
                dtype => Err(CacheError::UnsupportedFeature(format!(
                    "cannot derive a cache dtype from model dtype {dtype:?}"
                ))),
            },
            other => Ok(other),
        }
    }

    pub fn elem_bytes(&self) -> Result<usize> {
        match self {
            Self::Auto => Err(CacheError::ConfigInvalid(
                "cache dtype must be resolved before sizing the cache".to_string(),
            )),
            Self::F16 | Self::Bf16 => Ok(2),
            Self::F32 => Ok(4),
            Self::Fp8E4m3 => Ok(1),
        }
    }

    /// Storage dtype for cache tensors; quantized caches are byte-viewed.
    pub fn as_candle_dtype(&self) -> Result<DType> {
        match self {
            Self::Auto => Err(CacheError::ConfigInvalid(
                "cache dtype must be resolved before allocating tensors".to_string(),
            )),
            Self::F16 => Ok(DType::F16),
            Self::Bf16 => Ok(DType::BF16),
            Self::F32 => Ok(DType::F32),
            Self::Fp8E4m3 => Ok(DType::U8),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Fp8E4m3)
    }
}

/// Which attention pattern the served model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    Decoder,
    Encoder,
    EncoderOnly,
    EncoderDecoder,
}

impl AttentionKind {
    /// Encoder-side attention never applies a causal mask.
    pub fn is_causal(&self) -> bool {
        matches!(self, Self::Decoder)
    }
}

/// Engine-wide cache configuration, fixed at construction.
///
/// `block_size` is the legacy pooled-cache cell granularity and also the unit
/// `max_seq_len` is rounded up to. `block_bytes_size` is the physical page
/// size requested from the driver in VMM mode and must divide the per-slot
/// stride.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_batch_size: usize,
    pub max_seq_len: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub cache_dtype: CacheDType,
    pub block_size: usize,
    /// VMM only: requested physical page size in bytes.
    pub block_bytes_size: usize,
    /// Legacy only: number of blocks in the pooled cache.
    pub num_blocks: usize,
    pub use_vmm: bool,
    pub attn_type: AttentionKind,
    pub sliding_window: Option<usize>,
    /// Fused attention kernel generation (2 or 3).
    pub flash_attn_version: u8,
}

impl CacheConfig {
    /// Validates the configuration, resolving the cache dtype against the
    /// model dtype and rounding `max_seq_len` up to a block multiple.
    pub fn validated(mut self, model_dtype: DType) -> Result<Self> {
        if self.max_batch_size == 0 || self.num_layers == 0 || self.num_kv_heads == 0 {
            return Err(CacheError::ConfigInvalid(
                "batch size, layer count and head count must be non-zero".to_string(),
            ));
        }
        if self.block_size == 0 || self.block_size % 16 != 0 {
            return Err(CacheError::ConfigInvalid(format!(
                "block size must be a non-zero multiple of 16, got {}",
                self.block_size
            )));
        }
        if !SUPPORTED_HEAD_SIZES.contains(&self.head_dim) {
            return Err(CacheError::ConfigInvalid(format!(
                "head size {} is not supported, expected one of {:?}",
                self.head_dim, SUPPORTED_HEAD_SIZES
            )));
        }
        if !matches!(self.flash_attn_version, 2 | 3) {
            return Err(CacheError::ConfigInvalid(format!(
                "unknown fused attention kernel version {}",
                self.flash_attn_version
            )));
        }
        self.cache_dtype = self.cache_dtype.resolve(model_dtype)?;
        if self.cache_dtype.is_quantized() && self.flash_attn_version < 3 {
            return Err(CacheError::UnsupportedFeature(
                "quantized KV caches require the v3 attention kernels".to_string(),
            ));
        }
        if self.max_seq_len % self.block_size != 0 {
            let rounded = (self.max_seq_len / self.block_size + 1) * self.block_size;
            warn!(
                max_seq_len = self.max_seq_len,
                rounded, "max_seq_len is not a block multiple, rounding up"
            );
            self.max_seq_len = rounded;
        }
        if self.use_vmm {
            if self.block_bytes_size == 0 {
                return Err(CacheError::ConfigInvalid(
                    "block_bytes_size must be non-zero in VMM mode".to_string(),
                ));
            }
        } else if self.num_blocks == 0 {
            return Err(CacheError::ConfigInvalid(
                "num_blocks must be non-zero in legacy mode".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn elem_bytes(&self) -> Result<usize> {
        self.cache_dtype.elem_bytes()
    }

    /// Width of the pre-allocated graph block-table buffer.
    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_seq_len / self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> CacheConfig {
        CacheConfig {
            max_batch_size: 4,
            max_seq_len: 256,
            num_layers: 2,
            num_kv_heads: 4,
            head_dim: 64,
            cache_dtype: CacheDType::Auto,
            block_size: 16,
            block_bytes_size: 4096,
            num_blocks: 32,
            use_vmm: false,
            attn_type: AttentionKind::Decoder,
            sliding_window: None,
            flash_attn_version: 2,
        }
    }

    #[test]
    fn auto_dtype_follows_model() {
        let config = base_config().validated(DType::BF16).unwrap();
        assert_eq!(config.cache_dtype, CacheDType::Bf16);
        assert_eq!(config.elem_bytes().unwrap(), 2);
    }

    #[test]
    fn block_size_must_be_multiple_of_16() {
        let mut config = base_config();
        config.block_size = 24;
        assert!(matches!(
            config.validated(DType::F16),
            Err(CacheError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn head_size_outside_supported_set_is_rejected() {
        let mut config = base_config();
        config.head_dim = 80;
        assert!(matches!(
            config.validated(DType::F16),
            Err(CacheError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn odd_max_seq_len_rounds_up_to_block_multiple() {
        let mut config = base_config();
        config.max_seq_len = 250;
        let config = config.validated(DType::F16).unwrap();
        assert_eq!(config.max_seq_len, 256);
    }

    #[test]
    fn quantized_cache_requires_v3_kernels() {
        let mut config = base_config();
        config.cache_dtype = CacheDType::Fp8E4m3;
        assert!(matches!(
            config.validated(DType::BF16),
            Err(CacheError::UnsupportedFeature(_))
        ));
        let mut config = base_config();
        config.cache_dtype = CacheDType::Fp8E4m3;
        config.flash_attn_version = 3;
        assert!(config.validated(DType::BF16).is_ok());
    }
}
