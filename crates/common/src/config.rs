//! Model configuration for Kokomi.
//!
//! Serialised as JSON next to every checkpoint. Every field has a default so
//! a minimal `{}` JSON produces the reference model.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Hyper-parameters of the decoder-only transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    // ── Core dimensions ─────────────────────────────────────────────────────
    /// Vocabulary size (must match the tokeniser).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Model dimension.
    #[serde(default = "default_dim")]
    pub dim: usize,
    /// Number of decoder layers.
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,
    /// Number of attention heads.
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    /// SwiGLU intermediate dimension. `None` derives it from `dim`, see
    /// [`LlmConfig::ffn_hidden_dim`].
    #[serde(default)]
    pub hidden_dim: Option<usize>,
    /// Maximum sequence length seen by the model (and by the dataset).
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    // ── Numerics ────────────────────────────────────────────────────────────
    /// RMSNorm epsilon.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// RoPE base frequency.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_vocab_size() -> usize {
    6400
}
fn default_dim() -> usize {
    512
}
fn default_n_layers() -> usize {
    8
}
fn default_n_heads() -> usize {
    16
}
fn default_max_seq_len() -> usize {
    512
}
fn default_norm_eps() -> f64 {
    1e-5
}
fn default_rope_theta() -> f64 {
    1e4
}

/// SwiGLU widths are rounded up to this multiple.
const FFN_MULTIPLE_OF: usize = 64;

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            dim: default_dim(),
            n_layers: default_n_layers(),
            n_heads: default_n_heads(),
            hidden_dim: None,
            max_seq_len: default_max_seq_len(),
            norm_eps: default_norm_eps(),
            rope_theta: default_rope_theta(),
        }
    }
}

impl LlmConfig {
    /// Head dimension (`dim / n_heads`). Panics if not divisible; see
    /// [`LlmConfig::validate`].
    pub fn head_dim(&self) -> usize {
        assert!(
            self.dim % self.n_heads == 0,
            "dim ({}) must be divisible by n_heads ({})",
            self.dim,
            self.n_heads,
        );
        self.dim / self.n_heads
    }

    /// SwiGLU intermediate width: the explicit `hidden_dim`, or `4·dim·2/3`
    /// rounded up to a multiple of 64.
    pub fn ffn_hidden_dim(&self) -> usize {
        if let Some(h) = self.hidden_dim {
            return h;
        }
        let h = 4 * self.dim * 2 / 3;
        FFN_MULTIPLE_OF * h.div_ceil(FFN_MULTIPLE_OF)
    }

    /// Reject shapes the model cannot be built with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.vocab_size == 0 || self.n_layers == 0 || self.max_seq_len == 0 {
            anyhow::bail!(
                "vocab_size ({}), n_layers ({}) and max_seq_len ({}) must all be > 0",
                self.vocab_size,
                self.n_layers,
                self.max_seq_len
            );
        }
        if self.n_heads == 0 {
            anyhow::bail!("n_heads must be > 0");
        }
        if self.dim % self.n_heads != 0 {
            anyhow::bail!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim,
                self.n_heads
            );
        }
        // RoPE rotates the two halves of each head.
        let head_dim = self.dim / self.n_heads;
        if head_dim == 0 || head_dim % 2 != 0 {
            anyhow::bail!("head_dim ({head_dim}) must be even and non-zero");
        }
        if self.hidden_dim == Some(0) {
            anyhow::bail!("hidden_dim must be > 0 when set");
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Load and validate config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&json).with_context(|| format!("parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid model config {}", path.display()))?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let loaded: LlmConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded, LlmConfig::default());
        assert_eq!(loaded.vocab_size, 6400);
        assert_eq!(loaded.max_seq_len, 512);
    }

    #[test]
    fn head_dim_divides_dim() {
        let config = LlmConfig {
            dim: 512,
            n_heads: 16,
            ..Default::default()
        };
        assert_eq!(config.head_dim(), 32);
    }

    #[test]
    fn ffn_hidden_dim_rounds_up() {
        let config = LlmConfig::default();
        // 4 * 512 * 2 / 3 = 1365 → next multiple of 64
        assert_eq!(config.ffn_hidden_dim(), 1408);

        let explicit = LlmConfig {
            hidden_dim: Some(100),
            ..Default::default()
        };
        assert_eq!(explicit.ffn_hidden_dim(), 100);
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = LlmConfig {
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            max_seq_len: 128,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(LlmConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(LlmConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unbuildable_shapes() {
        let bad = [
            LlmConfig { dim: 30, n_heads: 4, ..Default::default() },
            LlmConfig { n_heads: 0, ..Default::default() },
            LlmConfig { dim: 12, n_heads: 4, ..Default::default() },
            LlmConfig { vocab_size: 0, ..Default::default() },
            LlmConfig { n_layers: 0, ..Default::default() },
            LlmConfig { max_seq_len: 0, ..Default::default() },
            LlmConfig { hidden_dim: Some(0), ..Default::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn load_rejects_indivisible_heads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"dim":30,"n_heads":4}"#).unwrap();
        let err = LlmConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("divisible"), "{err:#}");
    }

    #[test]
    fn load_missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = LlmConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("absent.json"), "{err}");
    }
}
