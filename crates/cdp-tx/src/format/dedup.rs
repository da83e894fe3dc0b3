//! Corpus-scale near-duplicate elimination.
//!
//! Paragraph-granular MinHash over word shingles, banded LSH, and a banded
//! Bloom filter. The `[bands x bits]` matrix is owned by a single
//! coordinator task servicing a request channel, so duplicate decisions are
//! serialized paragraph-by-paragraph: when two workers ask about colliding
//! paragraphs concurrently, exactly one insert wins and every later ask sees
//! the occupied bits. Bloom bits only ever transition 0 -> 1 for the
//! lifetime of a run.
//!
//! BloomLSH filtering per <https://arxiv.org/pdf/2411.04257v1>.

use std::collections::HashSet;

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Stable prime for the universal-hash permutations.
pub const LSH_PRIME: u64 = 4_294_967_311;

/// Default seed for the permutation vectors.
pub const DEFAULT_SEED: u64 = 1_854_201_893;

const MOD32: u64 = 1 << 32;

fn mmh3(bytes: &[u8], seed: u32) -> u32 {
    murmur3::murmur3_32(&mut std::io::Cursor::new(bytes), seed)
        .expect("reading from an in-memory cursor cannot fail")
}

/// Choose `(bands, rows_per_band)` with `bands * rows = num_permutations`
/// minimizing `|threshold - (1/bands)^(1/rows)|`; ties resolve to the
/// smallest band count.
pub fn band_geometry(num_permutations: usize, threshold: f64) -> (usize, usize) {
    let mut best = (1, num_permutations);
    let mut best_error = f64::INFINITY;
    for bands in 1..=num_permutations {
        if num_permutations % bands != 0 {
            continue;
        }
        let rows = num_permutations / bands;
        let estimated = (1.0 / bands as f64).powf(1.0 / rows as f64);
        let error = (estimated - threshold).abs();
        if error < best_error {
            best_error = error;
            best = (bands, rows);
        }
    }
    best
}

/// MinHash + banded-LSH signature computation.
///
/// The signature of a paragraph is a `bands`-length vector of u32 band
/// hashes; two paragraphs collide when at least one band matches exactly.
pub struct SignatureScheme {
    num_bands: usize,
    band_size: usize,
    ngram_size: usize,
    a: Vec<u64>,
    b: Vec<u64>,
}

impl SignatureScheme {
    pub fn new(num_permutations: usize, ngram_size: usize, threshold: f64, seed: u64) -> Self {
        let (num_bands, band_size) = band_geometry(num_permutations, threshold);
        let mut rng = StdRng::seed_from_u64(seed);
        let a = (0..num_permutations).map(|_| rng.gen_range(1..MOD32)).collect();
        let b = (0..num_permutations).map(|_| rng.gen_range(0..MOD32)).collect();
        Self { num_bands, band_size, ngram_size, a, b }
    }

    pub fn num_bands(&self) -> usize {
        self.num_bands
    }

    pub fn band_size(&self) -> usize {
        self.band_size
    }

    /// Word shingles: every `ngram_size`-word window joined by single
    /// spaces, or the whole (space-joined) token list when shorter.
    fn shingles(&self, text: &str) -> HashSet<String> {
        let words: Vec<&str> = text.split_ascii_whitespace().collect();
        if words.len() < self.ngram_size {
            return HashSet::from([words.join(" ")]);
        }
        words.windows(self.ngram_size).map(|w| w.join(" ")).collect()
    }

    /// Component-wise minimum of the permuted shingle hashes, initialized to
    /// `2^32 - 1`. An empty shingle set yields the zero vector.
    fn minhash(&self, shingles: &HashSet<String>) -> Vec<u64> {
        if shingles.is_empty() {
            return vec![0; self.a.len()];
        }
        let mut signature = vec![MOD32 - 1; self.a.len()];
        for shingle in shingles {
            let h = u64::from(mmh3(shingle.as_bytes(), 0));
            for (slot, (a, b)) in signature.iter_mut().zip(self.a.iter().zip(&self.b)) {
                // a, h < 2^32 so a * h + b cannot overflow u64
                let value = ((a * h + b) % LSH_PRIME) % MOD32;
                if value < *slot {
                    *slot = value;
                }
            }
        }
        signature
    }

    /// Fold each band of the minhash vector into one u32 by summing the
    /// murmur hashes of its values (little-endian bytes) mod 2^32.
    fn bands(&self, minhash: &[u64]) -> Vec<u32> {
        minhash
            .chunks(self.band_size)
            .map(|band| {
                let mut acc = 0u64;
                for value in band {
                    acc = acc.wrapping_add(u64::from(mmh3(&value.to_le_bytes(), 0)));
                }
                (acc % MOD32) as u32
            })
            .collect()
    }

    /// The banded LSH signature for a paragraph.
    pub fn signature(&self, text: &str) -> Vec<u32> {
        self.bands(&self.minhash(&self.shingles(text)))
    }
}

/// A Bloom filter with one bit array per LSH band.
///
/// A paragraph is a duplicate iff some band has all of its probe positions
/// set; a unique paragraph sets its positions in every band.
pub struct BandedBloomFilter {
    scheme: SignatureScheme,
    bloom_bits: usize,
    bloom_hashes: u32,
    words_per_band: usize,
    state: Vec<u64>,
}

impl BandedBloomFilter {
    pub fn new(scheme: SignatureScheme, bloom_bits: usize, bloom_hashes: u32) -> Self {
        let words_per_band = bloom_bits.div_ceil(64);
        let state = vec![0u64; words_per_band * scheme.num_bands()];
        Self { scheme, bloom_bits, bloom_hashes, words_per_band, state }
    }

    fn probes(&self, band_value: u32) -> impl Iterator<Item = usize> + '_ {
        let bytes = band_value.to_le_bytes();
        (0..self.bloom_hashes).map(move |seed| mmh3(&bytes, seed) as usize % self.bloom_bits)
    }

    fn bit(&self, band: usize, index: usize) -> bool {
        let word = band * self.words_per_band + index / 64;
        self.state[word] & (1u64 << (index % 64)) != 0
    }

    fn set_bit(&mut self, band: usize, index: usize) {
        let word = band * self.words_per_band + index / 64;
        self.state[word] |= 1u64 << (index % 64);
    }

    /// Whether any band of the paragraph's signature fully matches.
    pub fn contains(&self, paragraph: &str) -> bool {
        let signature = self.scheme.signature(paragraph);
        signature
            .iter()
            .enumerate()
            .any(|(band, value)| self.probes(*value).all(|index| self.bit(band, index)))
    }

    /// Insert unless already present. Returns `true` iff the paragraph was
    /// newly inserted (first writer wins).
    pub fn insert_if_absent(&mut self, paragraph: &str) -> bool {
        let signature = self.scheme.signature(paragraph);
        let duplicate = signature
            .iter()
            .enumerate()
            .any(|(band, value)| self.probes(*value).all(|index| self.bit(band, index)));
        if duplicate {
            return false;
        }
        for (band, value) in signature.iter().enumerate() {
            let indices: Vec<usize> = self.probes(*value).collect();
            for index in indices {
                self.set_bit(band, index);
            }
        }
        true
    }

    /// Number of set bits; monotonically non-decreasing within a run.
    pub fn set_bit_count(&self) -> u64 {
        self.state.iter().map(|w| u64::from(w.count_ones())).sum()
    }
}

enum CoordinatorRequest {
    Contains { paragraph: String, reply: oneshot::Sender<bool> },
    InsertIfAbsent { paragraph: String, reply: oneshot::Sender<bool> },
}

/// Handle to the coordinator task owning the Bloom state.
///
/// Cloned into every worker; the coordinator stops when the last handle is
/// dropped.
#[derive(Clone)]
pub struct DedupCoordinator {
    tx: mpsc::Sender<CoordinatorRequest>,
}

impl DedupCoordinator {
    /// Spawn the owner task. Must be called within a tokio runtime.
    pub fn spawn(mut filter: BandedBloomFilter) -> Self {
        let (tx, mut rx) = mpsc::channel::<CoordinatorRequest>(1024);
        tokio::spawn(async move {
            info!(
                bands = filter.scheme.num_bands(),
                bits = filter.bloom_bits,
                hashes = filter.bloom_hashes,
                "dedup coordinator started"
            );
            while let Some(request) = rx.recv().await {
                match request {
                    CoordinatorRequest::Contains { paragraph, reply } => {
                        let _ = reply.send(filter.contains(&paragraph));
                    }
                    CoordinatorRequest::InsertIfAbsent { paragraph, reply } => {
                        let _ = reply.send(filter.insert_if_absent(&paragraph));
                    }
                }
            }
            debug!(set_bits = filter.set_bit_count(), "dedup coordinator stopped");
        });
        Self { tx }
    }

    async fn call(&self, request: CoordinatorRequest, reply: oneshot::Receiver<bool>) -> Result<bool, CdpError> {
        self.tx.send(request).await.map_err(|_| CdpError::Coordinator {
            detail: "coordinator task is gone".to_owned(),
            corrupted: false,
        })?;
        reply.await.map_err(|_| CdpError::Coordinator {
            detail: "coordinator dropped the reply".to_owned(),
            corrupted: false,
        })
    }

    pub async fn contains(&self, paragraph: &str) -> Result<bool, CdpError> {
        let (tx, rx) = oneshot::channel();
        self.call(CoordinatorRequest::Contains { paragraph: paragraph.to_owned(), reply: tx }, rx)
            .await
    }

    /// Atomic with respect to other inserts of the same paragraph contents:
    /// exactly one concurrent caller observes `true`.
    pub async fn insert_if_absent(&self, paragraph: &str) -> Result<bool, CdpError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            CoordinatorRequest::InsertIfAbsent { paragraph: paragraph.to_owned(), reply: tx },
            rx,
        )
        .await
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DedupParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    /// Bloom filter capacity in bits per band
    pub bloom_bits: usize,
    /// Probe positions per band value
    pub bloom_hashes: u32,
    /// Jaccard similarity threshold in (0, 1]
    pub lsh_threshold: f64,
    /// Total MinHash permutations
    pub num_permutations: usize,
    /// Shingle width in words
    pub ngram_size: usize,
    /// Paragraph delimiter; null treats the whole document as one paragraph
    pub split_char: Option<String>,
    pub seed: u64,
}

impl Default for DedupParams {
    fn default() -> Self {
        Self {
            name: "deduplication_formatter".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("text"),
            bloom_bits: 1_000_000,
            bloom_hashes: 3,
            lsh_threshold: 0.8,
            num_permutations: 256,
            ngram_size: 8,
            split_char: Some("\n".to_owned()),
            seed: DEFAULT_SEED,
        }
    }
}

/// Map stage that deletes near-duplicate paragraphs corpus-wide.
///
/// Splits the `on` field on `split_char`, asks the shared coordinator to
/// insert each paragraph in document order, and rejoins the paragraphs that
/// won their insert. A fully-duplicated document keeps an empty string.
pub struct DeduplicationFormatter {
    params: DedupParams,
    coordinator: tokio::sync::OnceCell<DedupCoordinator>,
}

impl DeduplicationFormatter {
    pub fn new(params: DedupParams) -> Result<Self, CdpError> {
        if !(params.lsh_threshold > 0.0 && params.lsh_threshold <= 1.0) {
            return Err(CdpError::config(
                "format.deduplication",
                "lsh_threshold must be in (0, 1]",
            ));
        }
        if params.num_permutations == 0 || params.bloom_bits == 0 || params.bloom_hashes == 0 || params.ngram_size == 0 {
            return Err(CdpError::config(
                "format.deduplication",
                "num_permutations, bloom_bits, bloom_hashes and ngram_size must be positive",
            ));
        }
        Ok(Self { params, coordinator: tokio::sync::OnceCell::new() })
    }

    /// The shared coordinator, spawned lazily on the first row.
    async fn coordinator(&self) -> &DedupCoordinator {
        self.coordinator
            .get_or_init(|| async {
                let scheme = SignatureScheme::new(
                    self.params.num_permutations,
                    self.params.ngram_size,
                    self.params.lsh_threshold,
                    self.params.seed,
                );
                let filter =
                    BandedBloomFilter::new(scheme, self.params.bloom_bits, self.params.bloom_hashes);
                DedupCoordinator::spawn(filter)
            })
            .await
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register(
        "format",
        "deduplication",
        "near-duplicate paragraph elimination (MinHash + banded LSH + Bloom)",
        |p| {
            Ok(cdp_core::Component::Map(Box::new(DeduplicationFormatter::new(
                parse_params("format", "deduplication", p)?,
            )?)))
        },
    );
}

#[async_trait]
impl MapFn for DeduplicationFormatter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let Some(text) = self.params.on.get_str(row).map(str::to_owned) else {
            return Ok(());
        };
        if text.is_empty() {
            return Ok(());
        }
        let coordinator = self.coordinator().await;
        let paragraphs: Vec<&str> = match &self.params.split_char {
            Some(sep) => text.split(sep.as_str()).collect(),
            None => vec![text.as_str()],
        };
        let mut retained: Vec<&str> = Vec::with_capacity(paragraphs.len());
        for paragraph in paragraphs {
            if coordinator.insert_if_absent(paragraph).await? {
                retained.push(paragraph);
            }
        }
        let deduplicated = if retained.is_empty() {
            String::new()
        } else {
            match &self.params.split_char {
                Some(sep) => retained.join(sep),
                None => retained.concat(),
            }
        };
        self.params.to.set(row, Value::String(deduplicated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: usize, text: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), json!(id.to_string()));
        r.insert("text".into(), json!(text));
        r
    }

    fn text(r: &Row) -> &str {
        r.get("text").and_then(Value::as_str).unwrap()
    }

    fn doc_level_formatter(ngram_size: usize) -> DeduplicationFormatter {
        DeduplicationFormatter::new(DedupParams {
            num_permutations: 64,
            ngram_size,
            lsh_threshold: 0.8,
            bloom_bits: 10_000,
            split_char: None,
            ..DedupParams::default()
        })
        .unwrap()
    }

    #[test]
    fn band_geometry_exact_product() {
        for (p, tau, expected) in [
            (64, 0.8, (8, 8)),
            (256, 0.8, (16, 16)),
            (10, 0.5, (5, 2)),
        ] {
            let (bands, rows) = band_geometry(p, tau);
            assert_eq!((bands, rows), expected, "P={p} tau={tau}");
            assert_eq!(bands * rows, p);
        }
    }

    #[test]
    fn band_geometry_is_global_minimum() {
        let p = 64;
        let tau = 0.8;
        let (bands, rows) = band_geometry(p, tau);
        let chosen = ((1.0 / bands as f64).powf(1.0 / rows as f64) - tau).abs();
        for b in 1..=p {
            if p % b != 0 {
                continue;
            }
            let r = p / b;
            let err = ((1.0 / b as f64).powf(1.0 / r as f64) - tau).abs();
            assert!(chosen <= err + 1e-12);
        }
    }

    #[test]
    fn shingles_word_windows() {
        let scheme = SignatureScheme::new(64, 3, 0.8, 420);
        let shingles = scheme.shingles("the quick brown fox jumps");
        assert_eq!(
            shingles,
            HashSet::from([
                "the quick brown".to_owned(),
                "quick brown fox".to_owned(),
                "brown fox jumps".to_owned(),
            ])
        );
        // Fewer tokens than the shingle width: one joined shingle
        assert_eq!(scheme.shingles("hi there"), HashSet::from(["hi there".to_owned()]));
        assert_eq!(scheme.shingles(""), HashSet::from(["".to_owned()]));
    }

    #[test]
    fn empty_shingle_set_is_zero_vector() {
        let scheme = SignatureScheme::new(64, 3, 0.8, 420);
        assert_eq!(scheme.minhash(&HashSet::new()), vec![0u64; 64]);
    }

    #[test]
    fn signature_shape_and_determinism() {
        let scheme = SignatureScheme::new(64, 3, 0.8, 42);
        let text = "the quick brown fox jumps over the lazy dog";
        let sig = scheme.signature(text);
        assert_eq!(sig.len(), scheme.num_bands());
        assert_eq!(sig, scheme.signature(text));

        // Same seed, fresh scheme: identical signatures
        let again = SignatureScheme::new(64, 3, 0.8, 42);
        assert_eq!(sig, again.signature(text));

        // Different seed: different signature
        let other = SignatureScheme::new(64, 3, 0.8, 12345);
        assert_ne!(sig, other.signature(text));
    }

    #[test]
    fn disjoint_texts_share_no_bands() {
        let scheme = SignatureScheme::new(64, 3, 0.8, 42);
        let a = scheme.signature("machine learning is a subset of artificial intelligence");
        let b = scheme.signature("completely different words about cooking pasta tonight");
        assert!(a.iter().zip(&b).all(|(x, y)| x != y));
    }

    #[test]
    fn bloom_bits_are_monotonic() {
        let scheme = SignatureScheme::new(64, 3, 0.8, 42);
        let mut filter = BandedBloomFilter::new(scheme, 10_000, 3);
        let mut last = 0;
        for text in ["one two three four", "five six seven eight", "one two three four"] {
            filter.insert_if_absent(text);
            let now = filter.set_bit_count();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn exact_duplicate_detected_by_filter() {
        let scheme = SignatureScheme::new(64, 3, 0.8, 42);
        let mut filter = BandedBloomFilter::new(scheme, 10_000, 3);
        assert!(!filter.contains("alpha beta gamma delta"));
        assert!(filter.insert_if_absent("alpha beta gamma delta"));
        assert!(filter.contains("alpha beta gamma delta"));
        assert!(!filter.insert_if_absent("alpha beta gamma delta"));
    }

    fn numbered_words(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("token{i}")).collect()
    }

    #[tokio::test]
    async fn document_level_dedup() {
        let dedup = doc_level_formatter(3);
        let base = [
            "machine learning is a subset of artificial intelligence",
            "deep learning uses neural networks with multiple layers",
            "natural language processing helps computers understand text",
            "computer vision enables machines to interpret visual information",
            "reinforcement learning trains agents through rewards and penalties",
        ];
        // A long document and a near-identical variant with one word changed
        let long_doc = numbered_words(150).join(" ");
        let mut variant_words = numbered_words(150);
        variant_words[75] = "changed".to_owned();
        let near_duplicate = variant_words.join(" ");
        // A rewrite of base[1] sharing words but no 3-word shingle
        let rewrite = "deep learning systems use layered neural architectures with many stacked layers";

        let mut rows = Vec::new();
        for (i, t) in base.iter().enumerate() {
            rows.push(row(i, t));
        }
        for (i, t) in base.iter().take(3).enumerate() {
            rows.push(row(5 + i, t)); // exact duplicates of 0..2
        }
        rows.push(row(8, &long_doc));
        rows.push(row(9, &near_duplicate));
        rows.push(row(10, rewrite));

        for r in rows.iter_mut() {
            dedup.apply(r).await.unwrap();
        }
        let surviving: HashSet<usize> = rows
            .iter()
            .filter(|r| !text(r).is_empty())
            .map(|r| r.get("id").and_then(Value::as_str).unwrap().parse().unwrap())
            .collect();
        assert_eq!(surviving, HashSet::from([0, 1, 2, 3, 4, 8, 10]));
    }

    #[tokio::test]
    async fn paragraph_level_dedup() {
        let dedup = DeduplicationFormatter::new(DedupParams {
            num_permutations: 64,
            ngram_size: 8,
            lsh_threshold: 0.8,
            bloom_bits: 10_000,
            split_char: Some("\n".to_owned()),
            ..DedupParams::default()
        })
        .unwrap();

        let a = "machine learning is a subset of artificial intelligence";
        let b = " deep learning uses neural networks with multiple layers";
        let c = "graph databases index entities and relations for retrieval";
        let docs = [
            a.to_owned(),                                        // 0: single paragraph
            format!("{a}\n{b}"),                                 // 1: dup first paragraph
            format!("{a}\n{b}"),                                 // 2: full duplicate
            format!("{}\n {a}", b.trim_start()),                 // 3: full duplicate, reversed order
            format!("{c}\n{b}"),                                 // 4: fresh first paragraph
        ];
        let mut rows: Vec<Row> = docs.iter().enumerate().map(|(i, t)| row(i, t)).collect();
        for r in rows.iter_mut() {
            dedup.apply(r).await.unwrap();
        }

        assert_eq!(text(&rows[0]), a);
        // Document 1 keeps only its second paragraph
        assert_eq!(text(&rows[1]), b);
        assert_eq!(text(&rows[2]), "");
        // Same paragraphs, different leading whitespace: still duplicates
        assert_eq!(text(&rows[3]), "");
        assert_eq!(text(&rows[4]), c);
    }

    #[tokio::test]
    async fn dedup_is_idempotent_on_its_own_output() {
        let docs = [
            "machine learning is a subset of artificial intelligence",
            "machine learning is a subset of artificial intelligence\n deep learning uses neural networks with multiple layers",
            "natural language processing helps computers understand text\n machine learning is a subset of artificial intelligence",
        ];
        let first_pass = DeduplicationFormatter::new(DedupParams {
            num_permutations: 64,
            ngram_size: 8,
            bloom_bits: 10_000,
            ..DedupParams::default()
        })
        .unwrap();
        let mut rows: Vec<Row> = docs.iter().enumerate().map(|(i, t)| row(i, t)).collect();
        for r in rows.iter_mut() {
            first_pass.apply(r).await.unwrap();
        }
        let after_first: Vec<String> = rows.iter().map(|r| text(r).to_owned()).collect();

        let second_pass = DeduplicationFormatter::new(DedupParams {
            num_permutations: 64,
            ngram_size: 8,
            bloom_bits: 10_000,
            ..DedupParams::default()
        })
        .unwrap();
        for r in rows.iter_mut() {
            second_pass.apply(r).await.unwrap();
        }
        let after_second: Vec<String> = rows.iter().map(|r| text(r).to_owned()).collect();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn first_writer_wins_under_concurrency() {
        let scheme = SignatureScheme::new(64, 3, 0.8, 42);
        let coordinator = DedupCoordinator::spawn(BandedBloomFilter::new(scheme, 10_000, 3));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move {
                c.insert_if_absent("the same paragraph every time").await.unwrap()
            }));
        }
        let mut inserted = 0;
        for h in handles {
            if h.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn missing_or_empty_text_passes_through() {
        let dedup = doc_level_formatter(3);
        let mut no_text = Row::new();
        no_text.insert("id".into(), json!("0"));
        dedup.apply(&mut no_text).await.unwrap();
        assert!(no_text.get("text").is_none());

        let mut empty = row(1, "");
        dedup.apply(&mut empty).await.unwrap();
        assert_eq!(text(&empty), "");
    }

    #[test]
    fn invalid_params_rejected() {
        assert!(DeduplicationFormatter::new(DedupParams {
            lsh_threshold: 0.0,
            ..DedupParams::default()
        })
        .is_err());
        assert!(DeduplicationFormatter::new(DedupParams {
            num_permutations: 0,
            ..DedupParams::default()
        })
        .is_err());
    }
}
