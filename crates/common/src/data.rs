//! Data pipeline: JSONL loading, tokenisation, padding and batching.
//!
//! Every record becomes one fixed-length training window:
//! `[bos] + tokens + [eos]`, truncated to `max_length` and right-padded. The
//! model input is the window minus its last token, the target is the window
//! shifted left by one, and the loss mask drops padded target positions.
//!
//! * **[`PretrainDataset`]** — record-indexed dataset; tokenises on [`get`](PretrainDataset::get).
//! * **[`DataLoader`]** — sequential batching with optional prefetch workers.
//! * **[`batch_to_tensors`]** — raw [`Batch`] → Candle tensors.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use rayon::prelude::*;
use tokenizers::Tokenizer;

/// Number of collated batches a worker may run ahead of the training loop.
const PREFETCH_BUFFER: usize = 8;

// ── TextEncoder ─────────────────────────────────────────────────────────────

/// Turns raw text into token ids and names the special ids the dataset needs.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str) -> AnyhowResult<Vec<u32>>;
    fn bos_id(&self) -> u32;
    fn eos_id(&self) -> u32;
    fn pad_id(&self) -> u32;
}

/// [`TextEncoder`] backed by a HuggingFace `tokenizer.json`.
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
}

impl HfTokenizer {
    pub const BOS: &'static str = "<s>";
    pub const EOS: &'static str = "</s>";

    /// Load a tokeniser. `<s>` and `</s>` must be in the vocabulary; the pad
    /// id is `<pad>`, falling back to `<unk>`, falling back to 0.
    pub fn from_file(path: &Path) -> AnyhowResult<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", path.display()))?;
        let bos_id = tokenizer
            .token_to_id(Self::BOS)
            .with_context(|| format!("tokenizer has no {} token", Self::BOS))?;
        let eos_id = tokenizer
            .token_to_id(Self::EOS)
            .with_context(|| format!("tokenizer has no {} token", Self::EOS))?;
        let pad_id = tokenizer
            .token_to_id("<pad>")
            .or_else(|| tokenizer.token_to_id("<unk>"))
            .unwrap_or(0);
        Ok(Self {
            tokenizer,
            bos_id,
            eos_id,
            pad_id,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl TextEncoder for HfTokenizer {
    fn encode(&self, text: &str) -> AnyhowResult<Vec<u32>> {
        let enc = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn bos_id(&self) -> u32 {
        self.bos_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

// ── Samples & batches ───────────────────────────────────────────────────────

/// One training window. All three vectors have length `max_length - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub x: Vec<u32>,
    pub y: Vec<u32>,
    pub loss_mask: Vec<f32>,
}

/// Row-major stack of [`Sample`]s, `batch_size × seq_len`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Vec<u32>,
    pub y: Vec<u32>,
    pub loss_mask: Vec<f32>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    fn collate(samples: Vec<Sample>) -> Self {
        let batch_size = samples.len();
        let seq_len = samples.first().map(|s| s.x.len()).unwrap_or(0);
        let mut x = Vec::with_capacity(batch_size * seq_len);
        let mut y = Vec::with_capacity(batch_size * seq_len);
        let mut loss_mask = Vec::with_capacity(batch_size * seq_len);
        for s in samples {
            x.extend(s.x);
            y.extend(s.y);
            loss_mask.extend(s.loss_mask);
        }
        Self {
            x,
            y,
            loss_mask,
            batch_size,
            seq_len,
        }
    }

    /// Number of target positions that contribute to the loss.
    pub fn num_valid_tokens(&self) -> usize {
        self.loss_mask.iter().filter(|&&m| m > 0.0).count()
    }
}

// ── PretrainDataset ─────────────────────────────────────────────────────────

/// JSONL pretraining corpus: one record per non-empty line.
pub struct PretrainDataset {
    texts: Vec<String>,
    encoder: Arc<dyn TextEncoder>,
    max_length: usize,
}

impl PretrainDataset {
    /// Read every record under `path` (a file, or a directory of
    /// `.jsonl` / `.json` / `.txt` files read in sorted order).
    pub fn open(
        path: &Path,
        encoder: Arc<dyn TextEncoder>,
        max_length: usize,
    ) -> AnyhowResult<Self> {
        if max_length < 2 {
            anyhow::bail!("max_length must be at least 2, got {max_length}");
        }
        let files = collect_files(path)?;
        if files.is_empty() {
            anyhow::bail!("no data files at {}", path.display());
        }
        let mut texts = Vec::new();
        for file in &files {
            let reader = BufReader::new(
                File::open(file).with_context(|| format!("open {}", file.display()))?,
            );
            for line in reader.lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                texts.push(extract_text(line));
            }
        }
        tracing::debug!(files = files.len(), records = texts.len(), "dataset loaded");
        Ok(Self::from_texts(texts, encoder, max_length))
    }

    /// Build a dataset from in-memory records.
    pub fn from_texts(
        texts: Vec<String>,
        encoder: Arc<dyn TextEncoder>,
        max_length: usize,
    ) -> Self {
        Self {
            texts,
            encoder,
            max_length,
        }
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Sequence length of every sample (`max_length - 1`).
    pub fn seq_len(&self) -> usize {
        self.max_length - 1
    }

    /// Tokenise record `index` into a shifted `(x, y, loss_mask)` window.
    pub fn get(&self, index: usize) -> AnyhowResult<Sample> {
        let text = self
            .texts
            .get(index)
            .with_context(|| format!("index {index} out of range ({})", self.texts.len()))?;
        let pad = self.encoder.pad_id();

        let mut ids = Vec::with_capacity(self.max_length);
        ids.push(self.encoder.bos_id());
        ids.extend(self.encoder.encode(text)?);
        ids.push(self.encoder.eos_id());
        ids.truncate(self.max_length);
        ids.resize(self.max_length, pad);

        let x = ids[..self.max_length - 1].to_vec();
        let y = ids[1..].to_vec();
        let loss_mask = y
            .iter()
            .map(|&id| if id != pad { 1.0 } else { 0.0 })
            .collect();
        Ok(Sample { x, y, loss_mask })
    }
}

// ── DataLoader ──────────────────────────────────────────────────────────────

/// Sequential batcher over a [`PretrainDataset`]. No shuffling; the last
/// batch keeps whatever records remain.
pub struct DataLoader {
    dataset: Arc<PretrainDataset>,
    batch_size: usize,
    num_workers: usize,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<PretrainDataset>,
        batch_size: usize,
        num_workers: usize,
    ) -> AnyhowResult<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        Ok(Self {
            dataset,
            batch_size,
            num_workers,
        })
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// One pass over the dataset. With `num_workers > 0` a producer thread
    /// collates ahead of the consumer on a rayon pool of that many threads.
    pub fn iter(&self) -> AnyhowResult<BatchIter> {
        if self.num_workers == 0 {
            return Ok(BatchIter::Inline {
                dataset: self.dataset.clone(),
                batch_size: self.batch_size,
                next: 0,
                len: self.len(),
            });
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_workers)
            .thread_name(|i| format!("kokomi-data-{i}"))
            .build()
            .context("build data loader pool")?;
        let (tx, rx) = mpsc::sync_channel(PREFETCH_BUFFER);
        let dataset = self.dataset.clone();
        let batch_size = self.batch_size;
        let len = self.len();
        let producer = thread::Builder::new()
            .name("kokomi-prefetch".into())
            .spawn(move || {
                for index in 0..len {
                    let batch = pool.install(|| collate_parallel(&dataset, index, batch_size));
                    if tx.send(batch).is_err() {
                        return;
                    }
                }
            })
            .context("spawn prefetch thread")?;

        Ok(BatchIter::Prefetch {
            rx: Some(rx),
            producer: Some(producer),
        })
    }
}

/// Iterator returned by [`DataLoader::iter`].
pub enum BatchIter {
    Inline {
        dataset: Arc<PretrainDataset>,
        batch_size: usize,
        next: usize,
        len: usize,
    },
    Prefetch {
        rx: Option<Receiver<AnyhowResult<Batch>>>,
        producer: Option<JoinHandle<()>>,
    },
}

impl Iterator for BatchIter {
    type Item = AnyhowResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            BatchIter::Inline {
                dataset,
                batch_size,
                next,
                len,
            } => {
                if *next >= *len {
                    return None;
                }
                let batch = collate_range(dataset, *next, *batch_size);
                *next += 1;
                Some(batch)
            }
            BatchIter::Prefetch { rx, .. } => rx.as_ref()?.recv().ok(),
        }
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let BatchIter::Prefetch { rx, producer } = self {
            // Closing the channel first unblocks a producer parked on `send`.
            drop(rx.take());
            if let Some(handle) = producer.take() {
                let _ = handle.join();
            }
        }
    }
}

fn batch_bounds(dataset: &PretrainDataset, index: usize, batch_size: usize) -> (usize, usize) {
    let start = index * batch_size;
    let end = (start + batch_size).min(dataset.len());
    (start, end)
}

fn collate_range(
    dataset: &PretrainDataset,
    index: usize,
    batch_size: usize,
) -> AnyhowResult<Batch> {
    let (start, end) = batch_bounds(dataset, index, batch_size);
    let samples = (start..end)
        .map(|i| dataset.get(i))
        .collect::<AnyhowResult<Vec<_>>>()?;
    Ok(Batch::collate(samples))
}

fn collate_parallel(
    dataset: &PretrainDataset,
    index: usize,
    batch_size: usize,
) -> AnyhowResult<Batch> {
    let (start, end) = batch_bounds(dataset, index, batch_size);
    let samples = (start..end)
        .into_par_iter()
        .map(|i| dataset.get(i))
        .collect::<AnyhowResult<Vec<_>>>()?;
    Ok(Batch::collate(samples))
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a [`Batch`] to `(x, y, loss_mask)` tensors of shape
/// `(batch_size, seq_len)`; ids are `u32`, the mask is `f32`.
pub fn batch_to_tensors(batch: &Batch, device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
    let shape = (batch.batch_size, batch.seq_len);
    let x = Tensor::from_slice(&batch.x, shape, device)?;
    let y = Tensor::from_slice(&batch.y, shape, device)?;
    let mask = Tensor::from_slice(&batch.loss_mask, shape, device)?;
    Ok((x, y, mask))
}

/// Collect data files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> AnyhowResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    if path.is_file() {
        out.push(path.to_path_buf());
    } else if path.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .map(|e| e == "jsonl" || e == "json" || e == "txt")
                        .unwrap_or(false)
            })
            .collect();
        entries.sort();
        out = entries;
    } else {
        anyhow::bail!("path is neither file nor directory: {}", path.display());
    }
    Ok(out)
}

/// Extract the `"text"` field from a JSONL record; other lines are used as-is.
fn extract_text(line: &str) -> String {
    if line.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(t) = v.get("text").and_then(|t| t.as_str()) {
                return t.to_string();
            }
        }
    }
    line.to_string()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Byte-level encoder: pad 0, bos 1, eos 2, byte b → b + 3.
    struct ByteEncoder;

    impl TextEncoder for ByteEncoder {
        fn encode(&self, text: &str) -> AnyhowResult<Vec<u32>> {
            Ok(text.bytes().map(|b| b as u32 + 3).collect())
        }
        fn bos_id(&self) -> u32 {
            1
        }
        fn eos_id(&self) -> u32 {
            2
        }
        fn pad_id(&self) -> u32 {
            0
        }
    }

    fn dataset(texts: &[&str], max_length: usize) -> PretrainDataset {
        PretrainDataset::from_texts(
            texts.iter().map(|s| s.to_string()).collect(),
            Arc::new(ByteEncoder),
            max_length,
        )
    }

    #[test]
    fn sample_is_shifted_and_padded() {
        let ds = dataset(&["ab"], 8);
        let s = ds.get(0).unwrap();
        // window: [1, 'a', 'b', 2, 0, 0, 0, 0]
        let a = b'a' as u32 + 3;
        let b = b'b' as u32 + 3;
        assert_eq!(s.x, vec![1, a, b, 2, 0, 0, 0]);
        assert_eq!(s.y, vec![a, b, 2, 0, 0, 0, 0]);
        assert_eq!(s.loss_mask, vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn long_record_is_truncated() {
        let ds = dataset(&["abcdefghij"], 4);
        let s = ds.get(0).unwrap();
        assert_eq!(s.x.len(), 3);
        assert_eq!(s.y.len(), 3);
        assert_eq!(s.x[0], 1);
        // eos is cut off, nothing is padding
        assert!(!s.y.contains(&2));
        assert_eq!(s.loss_mask, vec![1.0; 3]);
    }

    #[test]
    fn get_out_of_range_errors() {
        let ds = dataset(&["a"], 4);
        assert!(ds.get(1).is_err());
    }

    #[test]
    fn open_reads_jsonl_text_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pretrain.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, r#"{{"text": "hello"}}"#).unwrap();
        writeln!(f).unwrap();
        writeln!(f, "plain line").unwrap();
        drop(f);

        let ds = PretrainDataset::open(&path, Arc::new(ByteEncoder), 16).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.seq_len(), 15);
        let s = ds.get(0).unwrap();
        assert_eq!(s.x[1], b'h' as u32 + 3);
        let valid: f32 = s.loss_mask.iter().sum();
        // "hello" + eos
        assert_eq!(valid, 6.0);
    }

    #[test]
    fn open_missing_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.jsonl");
        assert!(PretrainDataset::open(&missing, Arc::new(ByteEncoder), 16).is_err());
    }

    #[test]
    fn loader_keeps_last_short_batch() {
        let ds = Arc::new(dataset(&["a", "b", "c", "d", "e"], 6));
        let loader = DataLoader::new(ds, 2, 0).unwrap();
        assert_eq!(loader.len(), 3);
        let sizes: Vec<usize> = loader
            .iter()
            .unwrap()
            .map(|b| b.unwrap().batch_size)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn prefetch_matches_inline() {
        let texts = ["one", "two", "three", "four", "five", "six", "seven"];
        let ds = Arc::new(dataset(&texts, 10));
        let inline: Vec<Batch> = DataLoader::new(ds.clone(), 3, 0)
            .unwrap()
            .iter()
            .unwrap()
            .collect::<AnyhowResult<_>>()
            .unwrap();
        let prefetched: Vec<Batch> = DataLoader::new(ds, 3, 2)
            .unwrap()
            .iter()
            .unwrap()
            .collect::<AnyhowResult<_>>()
            .unwrap();
        assert_eq!(inline, prefetched);
        assert_eq!(inline.len(), 3);
        assert_eq!(inline[0].x.len(), 3 * 9);
    }

    #[test]
    fn dropping_prefetch_iter_early_does_not_hang() {
        let texts: Vec<String> = (0..100).map(|i| format!("record {i}")).collect();
        let ds = Arc::new(PretrainDataset::from_texts(texts, Arc::new(ByteEncoder), 8));
        let loader = DataLoader::new(ds, 1, 1).unwrap();
        let mut it = loader.iter().unwrap();
        assert!(it.next().is_some());
        drop(it);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let ds = Arc::new(dataset(&["a"], 4));
        assert!(DataLoader::new(ds, 0, 0).is_err());
    }

    #[test]
    fn batch_tensors_have_expected_shapes() {
        let ds = Arc::new(dataset(&["ab", "cd"], 5));
        let batch = DataLoader::new(ds, 2, 0)
            .unwrap()
            .iter()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(batch.num_valid_tokens(), 6);
        let (x, y, mask) = batch_to_tensors(&batch, &Device::Cpu).unwrap();
        assert_eq!(x.dims(), &[2, 4]);
        assert_eq!(y.dims(), &[2, 4]);
        assert_eq!(mask.dims(), &[2, 4]);
        assert_eq!(mask.sum_all().unwrap().to_scalar::<f32>().unwrap(), 6.0);
    }

    #[test]
    fn hf_tokenizer_loads_word_level_json() {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"<unk>": 0, "<s>": 1, "</s>": 2, "hello": 3, "world": 4},
                "unk_token": "<unk>"
            }
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, json).unwrap();

        let tok = HfTokenizer::from_file(&path).unwrap();
        assert_eq!(tok.bos_id(), 1);
        assert_eq!(tok.eos_id(), 2);
        assert_eq!(tok.pad_id(), 0);
        assert_eq!(tok.encode("hello world").unwrap(), vec![3, 4]);
    }
}
